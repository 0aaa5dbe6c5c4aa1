//! Durable queue of changes awaiting confirmation.
//!
//! A pending change lives here until the counterpart side confirms it was
//! durably applied: outbound entries are re-sent by the next push, inbound
//! entries are re-applied by `sweep`. Entries that exhaust their retry
//! budget move to a permanent-failure bucket and surface as operator
//! events, never silent deletion.

use crate::adapter::AdapterRegistry;
use crate::config::now_millis;
use crate::error::{SyncError, SyncResult};
use branchsync_protocol::{ChangeKey, ChangeRecord};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, warn};

/// Which side still has to confirm the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingDirection {
    /// Waiting for the authority to acknowledge a push.
    Outbound,
    /// Waiting for the local adapter to apply an incoming record.
    Inbound,
}

/// A change that could not yet be confirmed as applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    /// The queued record.
    pub record: ChangeRecord,
    /// Branch that owns the queue entry.
    pub branch_id: String,
    /// Direction of the pending confirmation.
    pub direction: PendingDirection,
    /// Re-application attempts so far.
    pub retries: u32,
    /// Epoch milliseconds of the last attempt.
    pub last_attempt: Option<u64>,
}

/// Operator-visible events emitted by the store.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingEvent {
    /// An entry exhausted its retry budget.
    PermanentFailure {
        /// Affected entity.
        key: ChangeKey,
        /// Retries attempted.
        retries: u32,
    },
    /// A sweep finished.
    SweepCompleted {
        /// Entries attempted.
        retried: usize,
        /// Entries confirmed and removed.
        recovered: usize,
        /// Entries moved to the permanent-failure bucket.
        failed: usize,
    },
}

/// Outcome of a sweep call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another sweep is already running for this store.
    AlreadyRunning,
    /// The sweep ran.
    Completed {
        /// Entries attempted.
        retried: usize,
        /// Entries confirmed and removed.
        recovered: usize,
        /// Entries moved to the permanent-failure bucket.
        failed: usize,
    },
}

/// Durable queue of pending changes, keyed by `(entity_type, entity_id)`.
pub struct PendingStore {
    max_retries: u32,
    active: RwLock<BTreeMap<ChangeKey, PendingChange>>,
    failed: RwLock<BTreeMap<ChangeKey, PendingChange>>,
    events: Mutex<VecDeque<PendingEvent>>,
    sweeping: AtomicBool,
}

impl PendingStore {
    /// Creates a store with the given retry cap.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            active: RwLock::new(BTreeMap::new()),
            failed: RwLock::new(BTreeMap::new()),
            events: Mutex::new(VecDeque::new()),
            sweeping: AtomicBool::new(false),
        }
    }

    /// Enqueues a change. Re-enqueueing the same key replaces the record
    /// but preserves the retry count.
    pub fn enqueue(
        &self,
        record: ChangeRecord,
        branch_id: impl Into<String>,
        direction: PendingDirection,
    ) {
        let key = record.key();
        let mut active = self.active.write();
        let retries = active.get(&key).map(|p| p.retries).unwrap_or(0);
        active.insert(
            key,
            PendingChange {
                record,
                branch_id: branch_id.into(),
                direction,
                retries,
                last_attempt: None,
            },
        );
    }

    /// Removes an entry once the counterpart confirmed application.
    pub fn confirm(&self, key: &ChangeKey) -> bool {
        self.active.write().remove(key).is_some()
    }

    /// Snapshot of outbound entries, for inclusion in the next push.
    pub fn outbound_snapshot(&self) -> Vec<ChangeRecord> {
        self.active
            .read()
            .values()
            .filter(|p| p.direction == PendingDirection::Outbound)
            .map(|p| p.record.clone())
            .collect()
    }

    /// Re-applies inbound entries through the adapter registry.
    ///
    /// Only one sweep can run per store at a time; a concurrent call
    /// returns [`SweepOutcome::AlreadyRunning`] immediately.
    pub fn sweep(&self, registry: &AdapterRegistry) -> SweepOutcome {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return SweepOutcome::AlreadyRunning;
        }

        let snapshot: Vec<(ChangeKey, PendingChange)> = self
            .active
            .read()
            .iter()
            .filter(|(_, p)| p.direction == PendingDirection::Inbound)
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect();

        let mut recovered = 0usize;
        let mut failed = 0usize;

        for (key, entry) in &snapshot {
            let result = match registry.get(&key.entity_type) {
                Some(adapter) => adapter.apply_incoming(std::slice::from_ref(&entry.record)),
                None => Err(SyncError::UnknownEntityType(key.entity_type.clone())),
            };

            match result {
                Ok(()) => {
                    self.active.write().remove(key);
                    recovered += 1;
                    debug!(key = %key, "pending change recovered");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "pending change re-application failed");
                    if self.note_failed_attempt(key) {
                        failed += 1;
                    }
                }
            }
        }

        self.sweeping.store(false, Ordering::SeqCst);

        let outcome = SweepOutcome::Completed {
            retried: snapshot.len(),
            recovered,
            failed,
        };
        if !snapshot.is_empty() {
            self.push_event(PendingEvent::SweepCompleted {
                retried: snapshot.len(),
                recovered,
                failed,
            });
        }
        outcome
    }

    /// Number of active entries.
    pub fn len(&self) -> usize {
        self.active.read().len()
    }

    /// True when no entries are active.
    pub fn is_empty(&self) -> bool {
        self.active.read().is_empty()
    }

    /// Number of permanently-failed entries.
    pub fn failed_len(&self) -> usize {
        self.failed.read().len()
    }

    /// True if the key is queued.
    pub fn contains(&self, key: &ChangeKey) -> bool {
        self.active.read().contains_key(key)
    }

    /// Keys of permanently-failed entries.
    pub fn failed_keys(&self) -> Vec<ChangeKey> {
        self.failed.read().keys().cloned().collect()
    }

    /// Moves a permanently-failed entry back into rotation with a fresh
    /// retry budget (operator action).
    pub fn requeue_failed(&self, key: &ChangeKey) -> bool {
        let Some(mut entry) = self.failed.write().remove(key) else {
            return false;
        };
        entry.retries = 0;
        entry.last_attempt = None;
        self.active.write().insert(key.clone(), entry);
        true
    }

    /// Records a failed delivery/application attempt for a key.
    ///
    /// Increments the retry counter and stamps `last_attempt`; an entry
    /// that reaches the retry cap moves to the permanent-failure bucket.
    /// Returns true when the entry was permanently failed by this call.
    pub fn note_failed_attempt(&self, key: &ChangeKey) -> bool {
        let mut active = self.active.write();
        let Some(entry) = active.get_mut(key) else {
            return false;
        };
        entry.retries += 1;
        entry.last_attempt = Some(now_millis());
        let retries = entry.retries;

        if retries < self.max_retries {
            return false;
        }

        if let Some(entry) = active.remove(key) {
            drop(active);
            self.failed.write().insert(key.clone(), entry);
            self.push_event(PendingEvent::PermanentFailure {
                key: key.clone(),
                retries,
            });
            error!(key = %key, retries, "pending change permanently failed");
            return true;
        }
        false
    }

    /// Drains queued operator events.
    pub fn drain_events(&self) -> Vec<PendingEvent> {
        self.events.lock().drain(..).collect()
    }

    /// Persists the store (active and failed buckets) as JSON.
    pub fn save_to(&self, path: &Path) -> SyncResult<()> {
        let state = StoreState {
            active: self.active.read().values().cloned().collect(),
            failed: self.failed.read().values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| SyncError::Protocol(format!("pending store serialization: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| SyncError::Protocol(format!("pending store write: {e}")))?;
        Ok(())
    }

    /// Loads a store persisted with [`Self::save_to`].
    pub fn load_from(path: &Path, max_retries: u32) -> SyncResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Protocol(format!("pending store read: {e}")))?;
        let state: StoreState = serde_json::from_str(&json)
            .map_err(|e| SyncError::Protocol(format!("pending store parse: {e}")))?;

        let store = Self::new(max_retries);
        {
            let mut active = store.active.write();
            for entry in state.active {
                active.insert(entry.record.key(), entry);
            }
            let mut failed = store.failed.write();
            for entry in state.failed {
                failed.insert(entry.record.key(), entry);
            }
        }
        Ok(store)
    }

    fn push_event(&self, event: PendingEvent) {
        self.events.lock().push_back(event);
    }
}

#[derive(Serialize, Deserialize)]
struct StoreState {
    active: Vec<PendingChange>,
    failed: Vec<PendingChange>,
}
