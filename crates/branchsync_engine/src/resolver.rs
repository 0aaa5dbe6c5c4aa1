//! Stateful conflict resolution: strategy application, manual-resolution
//! tickets, and bounded batch processing.
//!
//! Strategy application itself is pure (see `branchsync_protocol`); this
//! type adds the ticket registry, the per-entity exclusion set, and the
//! audit trail of resolution attempts.

use crate::config::now_millis;
use crate::error::{SyncError, SyncResult};
use branchsync_protocol::{
    resolve_conflict, ChangeKey, Conflict, ConflictKind, ResolutionOutcome, ResolutionPolicy,
    ResolutionStrategy, ResolvedChange,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A conflict parked for external resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionTicket {
    /// Ticket identifier.
    pub ticket_id: Uuid,
    /// The unresolved conflict, both versions embedded.
    pub conflict: Conflict,
    /// Epoch milliseconds of ticket creation.
    pub created_at: u64,
}

/// One logged resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionAttempt {
    /// Entity type.
    pub entity_type: String,
    /// Entity identifier.
    pub entity_id: String,
    /// Conflict classification.
    pub kind: ConflictKind,
    /// Strategy applied.
    pub strategy: ResolutionStrategy,
    /// Whether the attempt converged.
    pub success: bool,
    /// Error message, if any.
    pub error: Option<String>,
    /// Epoch milliseconds of the attempt.
    pub created_at: u64,
}

/// Verdict for a single conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolverVerdict {
    /// The conflict converged; apply the carried change.
    Resolved(ResolvedChange),
    /// A ticket was opened; the entity is excluded from auto-sync.
    Manual(Uuid),
}

/// Result of resolving a batch of conflicts.
#[derive(Debug, Default)]
pub struct BatchResolution {
    /// Converged changes to apply.
    pub resolved: Vec<ResolvedChange>,
    /// Tickets opened for manual resolution.
    pub tickets: Vec<Uuid>,
}

/// Applies resolution strategies and tracks manual-resolution tickets.
pub struct ConflictResolver {
    policy: ResolutionPolicy,
    resolved_by: String,
    batch_size: usize,
    pause: Duration,
    tickets: RwLock<BTreeMap<Uuid, ResolutionTicket>>,
    excluded: RwLock<BTreeSet<ChangeKey>>,
    attempts: Mutex<Vec<ResolutionAttempt>>,
}

impl ConflictResolver {
    /// Creates a resolver. The policy is validated here, once.
    pub fn new(
        policy: ResolutionPolicy,
        resolved_by: impl Into<String>,
        batch_size: usize,
        pause: Duration,
    ) -> SyncResult<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            resolved_by: resolved_by.into(),
            batch_size: batch_size.max(1),
            pause,
            tickets: RwLock::new(BTreeMap::new()),
            excluded: RwLock::new(BTreeSet::new()),
            attempts: Mutex::new(Vec::new()),
        })
    }

    /// The installed policy.
    pub fn policy(&self) -> &ResolutionPolicy {
        &self.policy
    }

    /// Resolves one conflict with the configured strategy for its entity
    /// type (delete/schema conflicts never merge).
    pub fn resolve(&self, conflict: &Conflict) -> ResolverVerdict {
        let strategy = self
            .policy
            .effective_strategy(&conflict.entity_type, conflict.kind);
        self.resolve_with(conflict, strategy)
    }

    /// Resolves one conflict with an explicit strategy.
    pub fn resolve_with(&self, conflict: &Conflict, strategy: ResolutionStrategy) -> ResolverVerdict {
        let now = now_millis();
        let outcome = resolve_conflict(conflict, strategy, &self.policy, &self.resolved_by, now);

        match outcome {
            ResolutionOutcome::Resolved(change) => {
                debug!(
                    entity_type = %conflict.entity_type,
                    entity_id = %conflict.entity_id,
                    kind = %conflict.kind,
                    strategy = %strategy,
                    version = change.record.version,
                    "conflict resolved"
                );
                self.log_attempt(conflict, strategy, true, None, now);
                ResolverVerdict::Resolved(change)
            }
            ResolutionOutcome::Manual => {
                let ticket_id = self.open_ticket(conflict, now);
                warn!(
                    entity_type = %conflict.entity_type,
                    entity_id = %conflict.entity_id,
                    kind = %conflict.kind,
                    %ticket_id,
                    "conflict requires manual resolution"
                );
                self.log_attempt(
                    conflict,
                    strategy,
                    false,
                    Some("manual resolution required".to_string()),
                    now,
                );
                ResolverVerdict::Manual(ticket_id)
            }
        }
    }

    /// Resolves a batch of conflicts, grouped by entity type and processed
    /// in bounded-size chunks with a small pause between chunks so the
    /// resolver does not starve other engine work.
    pub fn resolve_batch(&self, conflicts: Vec<Conflict>) -> BatchResolution {
        let mut grouped: BTreeMap<String, Vec<Conflict>> = BTreeMap::new();
        for conflict in conflicts {
            grouped
                .entry(conflict.entity_type.clone())
                .or_default()
                .push(conflict);
        }

        let mut result = BatchResolution::default();
        let mut first_chunk = true;
        for (entity_type, conflicts) in grouped {
            info!(entity_type = %entity_type, count = conflicts.len(), "resolving conflicts");
            for chunk in conflicts.chunks(self.batch_size) {
                if !first_chunk && !self.pause.is_zero() {
                    std::thread::sleep(self.pause);
                }
                first_chunk = false;

                for conflict in chunk {
                    match self.resolve(conflict) {
                        ResolverVerdict::Resolved(change) => result.resolved.push(change),
                        ResolverVerdict::Manual(ticket) => result.tickets.push(ticket),
                    }
                }
            }
        }
        result
    }

    /// Open tickets, oldest first (pull-based resolution API).
    pub fn pending_tickets(&self) -> Vec<ResolutionTicket> {
        let mut tickets: Vec<ResolutionTicket> = self.tickets.read().values().cloned().collect();
        tickets.sort_by_key(|t| t.created_at);
        tickets
    }

    /// Submits an external decision for a ticket.
    ///
    /// The strategy must not be `Manual`. On success the ticket is closed
    /// and the entity re-enters automatic sync.
    pub fn submit_resolution(
        &self,
        ticket_id: Uuid,
        strategy: ResolutionStrategy,
    ) -> SyncResult<ResolvedChange> {
        if strategy == ResolutionStrategy::Manual {
            return Err(SyncError::Protocol(
                "a submitted resolution must pick a concrete strategy".to_string(),
            ));
        }

        let ticket = self
            .tickets
            .read()
            .get(&ticket_id)
            .cloned()
            .ok_or_else(|| SyncError::Protocol(format!("unknown ticket {ticket_id}")))?;

        let now = now_millis();
        let outcome = resolve_conflict(
            &ticket.conflict,
            strategy,
            &self.policy,
            &self.resolved_by,
            now,
        );

        match outcome {
            ResolutionOutcome::Resolved(change) => {
                self.tickets.write().remove(&ticket_id);
                self.excluded
                    .write()
                    .remove(&ChangeKey::new(
                        ticket.conflict.entity_type.clone(),
                        ticket.conflict.entity_id.clone(),
                    ));
                self.log_attempt(&ticket.conflict, strategy, true, None, now);
                info!(%ticket_id, strategy = %strategy, "manual resolution submitted");
                Ok(change)
            }
            ResolutionOutcome::Manual => Err(SyncError::Protocol(format!(
                "strategy {strategy} could not converge ticket {ticket_id}"
            ))),
        }
    }

    /// True if the entity is excluded from automatic sync.
    pub fn is_excluded(&self, key: &ChangeKey) -> bool {
        self.excluded.read().contains(key)
    }

    /// Number of open tickets.
    pub fn open_ticket_count(&self) -> usize {
        self.tickets.read().len()
    }

    /// Snapshot of logged resolution attempts.
    pub fn attempts(&self) -> Vec<ResolutionAttempt> {
        self.attempts.lock().clone()
    }

    fn open_ticket(&self, conflict: &Conflict, now: u64) -> Uuid {
        let key = ChangeKey::new(conflict.entity_type.clone(), conflict.entity_id.clone());

        // One ticket per entity: a re-detected conflict reuses it.
        if let Some(existing) = self
            .tickets
            .read()
            .values()
            .find(|t| t.conflict.entity_type == key.entity_type && t.conflict.entity_id == key.entity_id)
        {
            return existing.ticket_id;
        }

        let ticket_id = Uuid::new_v4();
        self.tickets.write().insert(
            ticket_id,
            ResolutionTicket {
                ticket_id,
                conflict: conflict.clone(),
                created_at: now,
            },
        );
        self.excluded.write().insert(key);
        ticket_id
    }

    fn log_attempt(
        &self,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
        success: bool,
        error: Option<String>,
        now: u64,
    ) {
        self.attempts.lock().push(ResolutionAttempt {
            entity_type: conflict.entity_type.clone(),
            entity_id: conflict.entity_id.clone(),
            kind: conflict.kind,
            strategy,
            success,
            error,
            created_at: now,
        });
    }
}
