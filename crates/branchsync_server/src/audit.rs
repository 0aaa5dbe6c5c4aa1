//! Audit trail: session events and conflict-resolution rows.

use branchsync_protocol::{ConflictKind, ResolutionStrategy};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Kind of audited session event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A full snapshot was served.
    FullSync,
    /// An incremental delta was served.
    IncrementalSync,
    /// A change batch was received.
    Push,
    /// Conflict resolutions were submitted.
    ResolveConflicts,
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEventType::FullSync => write!(f, "full_sync"),
            AuditEventType::IncrementalSync => write!(f, "incremental_sync"),
            AuditEventType::Push => write!(f, "push"),
            AuditEventType::ResolveConflicts => write!(f, "resolve_conflicts"),
        }
    }
}

/// One accepted session event.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Branch that ran the session.
    pub branch_id: String,
    /// Event kind.
    pub event_type: AuditEventType,
    /// Epoch milliseconds.
    pub timestamp: u64,
}

/// One persisted conflict-resolution outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionRow {
    /// Entity type.
    pub entity_type: String,
    /// Entity identifier.
    pub entity_id: String,
    /// Conflict classification.
    pub conflict_type: ConflictKind,
    /// Strategy applied.
    pub strategy: ResolutionStrategy,
    /// Whether the resolution converged.
    pub success: bool,
    /// Error message, if any.
    pub error_message: Option<String>,
    /// Epoch milliseconds.
    pub created_at: u64,
}

/// Aggregated session metrics.
#[derive(Debug, Clone, Serialize)]
pub struct AuditMetrics {
    /// Total audited events.
    pub total: u64,
    /// Events per type.
    pub by_type: BTreeMap<String, u64>,
    /// Events per branch.
    pub by_branch: BTreeMap<String, u64>,
}

/// Bounded in-memory audit log.
pub struct AuditLog {
    capacity: usize,
    events: RwLock<VecDeque<AuditEvent>>,
    resolutions: RwLock<VecDeque<ResolutionRow>>,
}

impl AuditLog {
    /// Creates a log retaining up to `capacity` entries per table.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: RwLock::new(VecDeque::new()),
            resolutions: RwLock::new(VecDeque::new()),
        }
    }

    /// Records a session event.
    pub fn record_event(&self, branch_id: &str, event_type: AuditEventType, timestamp: u64) {
        let mut events = self.events.write();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(AuditEvent {
            branch_id: branch_id.to_string(),
            event_type,
            timestamp,
        });
    }

    /// Records a conflict-resolution outcome.
    pub fn record_resolution(&self, row: ResolutionRow) {
        let mut resolutions = self.resolutions.write();
        if resolutions.len() == self.capacity {
            resolutions.pop_front();
        }
        resolutions.push_back(row);
    }

    /// Snapshot of retained events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.read().iter().cloned().collect()
    }

    /// Snapshot of retained resolution rows.
    pub fn resolutions(&self) -> Vec<ResolutionRow> {
        self.resolutions.read().iter().cloned().collect()
    }

    /// Aggregates events into `total / by_type / by_branch`.
    pub fn metrics(&self) -> AuditMetrics {
        let events = self.events.read();
        let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_branch: BTreeMap<String, u64> = BTreeMap::new();
        for event in events.iter() {
            *by_type.entry(event.event_type.to_string()).or_default() += 1;
            *by_branch.entry(event.branch_id.clone()).or_default() += 1;
        }
        AuditMetrics {
            total: events.len() as u64,
            by_type,
            by_branch,
        }
    }
}
