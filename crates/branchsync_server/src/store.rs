//! Authoritative entity rows and per-branch sync state.
//!
//! Rows are only ever mutated through version-checked compare-and-set
//! writes, so two sessions racing on the same `(entity_type, entity_id)`
//! cannot silently overwrite each other.

use crate::error::{ServerError, ServerResult};
use branchsync_protocol::{ChangeKey, ChangeRecord, SyncKind};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Per-branch bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct BranchState {
    /// Epoch milliseconds of the last served sync.
    pub last_sync: Option<u64>,
    /// Kind of the last served sync.
    pub last_sync_kind: Option<SyncKind>,
    /// Whether a request for this branch is currently being processed.
    pub in_progress: bool,
}

/// A change the authority could not apply, parked for a later attempt.
#[derive(Debug, Clone)]
pub struct ParkedChange {
    /// The record that failed application.
    pub record: ChangeRecord,
    /// Failure message.
    pub reason: String,
}

/// The authority's copy of every entity, plus branch state.
#[derive(Default)]
pub struct AuthorityStore {
    rows: RwLock<BTreeMap<ChangeKey, ChangeRecord>>,
    branches: RwLock<BTreeMap<String, BranchState>>,
    parked: RwLock<BTreeMap<String, Vec<ParkedChange>>>,
}

impl AuthorityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the authoritative row for an entity.
    pub fn get(&self, key: &ChangeKey) -> Option<ChangeRecord> {
        self.rows.read().get(key).cloned()
    }

    /// Number of rows (tombstones included).
    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Version-checked write.
    ///
    /// `expected_version` is the version the writer saw: `None` for
    /// "row must not exist", `Some(v)` for "row must still be at v".
    /// Rejection means a concurrent mutation won the race.
    pub fn apply_checked(
        &self,
        expected_version: Option<u64>,
        record: ChangeRecord,
    ) -> ServerResult<()> {
        let key = record.key();
        let mut rows = self.rows.write();
        let actual = rows.get(&key).map(|r| r.version);

        if actual != expected_version {
            return Err(ServerError::VersionConflict {
                entity_type: key.entity_type,
                entity_id: key.entity_id,
                expected: expected_version,
                actual,
            });
        }

        rows.insert(key, record);
        Ok(())
    }

    /// Unconditional insert, for seeding test fixtures and imports.
    pub fn seed(&self, record: ChangeRecord) {
        self.rows.write().insert(record.key(), record);
    }

    /// Complete per-table snapshot, tombstones included.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<ChangeRecord>> {
        let rows = self.rows.read();
        let mut tables: BTreeMap<String, Vec<ChangeRecord>> = BTreeMap::new();
        for record in rows.values() {
            tables
                .entry(record.entity_type.clone())
                .or_default()
                .push(record.clone());
        }
        tables
    }

    /// Per-table records with `updated_at > since`.
    pub fn changes_since(&self, since: u64) -> BTreeMap<String, Vec<ChangeRecord>> {
        let rows = self.rows.read();
        let mut tables: BTreeMap<String, Vec<ChangeRecord>> = BTreeMap::new();
        for record in rows.values().filter(|r| r.updated_at > since) {
            tables
                .entry(record.entity_type.clone())
                .or_default()
                .push(record.clone());
        }
        tables
    }

    /// Highest `updated_at` across all rows.
    pub fn max_updated_at(&self) -> u64 {
        self.rows
            .read()
            .values()
            .map(|r| r.updated_at)
            .max()
            .unwrap_or(0)
    }

    /// Snapshot of a branch's state.
    pub fn branch_state(&self, branch_id: &str) -> BranchState {
        self.branches
            .read()
            .get(branch_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Records a served sync for a branch.
    pub fn touch_last_sync(&self, branch_id: &str, timestamp: u64, kind: SyncKind) {
        let mut branches = self.branches.write();
        let state = branches.entry(branch_id.to_string()).or_default();
        state.last_sync = Some(timestamp);
        state.last_sync_kind = Some(kind);
    }

    /// Marks a branch request as in flight (or done).
    pub fn set_in_progress(&self, branch_id: &str, in_progress: bool) {
        let mut branches = self.branches.write();
        branches.entry(branch_id.to_string()).or_default().in_progress = in_progress;
    }

    /// Parks a change that failed application.
    pub fn park(&self, branch_id: &str, record: ChangeRecord, reason: impl Into<String>) {
        self.parked
            .write()
            .entry(branch_id.to_string())
            .or_default()
            .push(ParkedChange {
                record,
                reason: reason.into(),
            });
    }

    /// Number of parked changes for a branch.
    pub fn parked_count(&self, branch_id: &str) -> usize {
        self.parked
            .read()
            .get(branch_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Takes all parked changes for a branch, removing them.
    pub fn drain_parked(&self, branch_id: &str) -> Vec<ParkedChange> {
        self.parked
            .write()
            .remove(branch_id)
            .unwrap_or_default()
    }
}
