//! Entity sync adapters and their registry.
//!
//! All entity-specific logic lives behind [`EntitySyncAdapter`]; the engine
//! never branches on entity-type strings outside the registry.

use crate::error::{SyncError, SyncResult};
use branchsync_protocol::ChangeRecord;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Capability each entity domain registers with the engine.
///
/// `apply_incoming` must be transactional: either the whole batch it is
/// given applies, or none of it does.
pub trait EntitySyncAdapter: Send + Sync {
    /// Enumerates locally-pending changes for this entity type.
    fn collect_pending(&self) -> SyncResult<Vec<ChangeRecord>>;

    /// Applies incoming authoritative records to the local store.
    fn apply_incoming(&self, records: &[ChangeRecord]) -> SyncResult<()>;
}

/// Result of applying an inbound batch through the registry.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Records durably applied.
    pub applied: u64,
    /// Records skipped because their entity type has no adapter.
    pub skipped_unknown: u64,
    /// Records that failed application, with the failure message.
    pub failures: Vec<(ChangeRecord, String)>,
}

/// Table of per-entity-type adapters.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Arc<dyn EntitySyncAdapter>>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an adapter for an entity type, replacing any prior one.
    pub fn register(&self, entity_type: impl Into<String>, adapter: Arc<dyn EntitySyncAdapter>) {
        self.adapters.write().insert(entity_type.into(), adapter);
    }

    /// Looks up the adapter for an entity type.
    pub fn get(&self, entity_type: &str) -> Option<Arc<dyn EntitySyncAdapter>> {
        self.adapters.read().get(entity_type).cloned()
    }

    /// Registered entity types, sorted.
    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.adapters.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Collects pending changes from every registered adapter.
    pub fn collect_all_pending(&self) -> SyncResult<Vec<ChangeRecord>> {
        let adapters: Vec<(String, Arc<dyn EntitySyncAdapter>)> = self
            .adapters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut all = Vec::new();
        for (entity_type, adapter) in adapters {
            let mut pending = adapter
                .collect_pending()
                .map_err(|e| SyncError::adapter(&entity_type, e.to_string()))?;
            all.append(&mut pending);
        }
        // Deterministic transmission order.
        all.sort_by(|a, b| {
            (&a.entity_type, &a.entity_id, a.version).cmp(&(
                &b.entity_type,
                &b.entity_id,
                b.version,
            ))
        });
        Ok(all)
    }

    /// Applies an inbound batch, grouped per entity type.
    ///
    /// Each adapter call is a local transaction. When a group fails, the
    /// records are retried one by one so a single poison record cannot take
    /// its whole entity type down; individual failures are reported back
    /// rather than aborting the batch. Unknown entity types are logged and
    /// skipped, not fatal.
    pub fn apply_batch(&self, records: &[ChangeRecord]) -> ApplyReport {
        let mut report = ApplyReport::default();

        let mut groups: Vec<(String, Vec<&ChangeRecord>)> = Vec::new();
        for record in records {
            match groups.iter_mut().find(|(t, _)| t == &record.entity_type) {
                Some((_, group)) => group.push(record),
                None => groups.push((record.entity_type.clone(), vec![record])),
            }
        }

        for (entity_type, group) in groups {
            let Some(adapter) = self.get(&entity_type) else {
                warn!(entity_type = %entity_type, count = group.len(),
                      "no adapter registered; skipping incoming records");
                report.skipped_unknown += group.len() as u64;
                continue;
            };

            let owned: Vec<ChangeRecord> = group.iter().map(|r| (*r).clone()).collect();
            match adapter.apply_incoming(&owned) {
                Ok(()) => report.applied += owned.len() as u64,
                Err(group_err) => {
                    warn!(entity_type = %entity_type, error = %group_err,
                          "group application failed; isolating records");
                    for record in owned {
                        match adapter.apply_incoming(std::slice::from_ref(&record)) {
                            Ok(()) => report.applied += 1,
                            Err(e) => report.failures.push((record, e.to_string())),
                        }
                    }
                }
            }
        }

        report
    }
}

/// An in-memory adapter for tests.
///
/// Tracks applied records by entity id and serves a hand-fed pending queue.
/// Specific entity ids can be poisoned to simulate application failures.
#[derive(Default)]
pub struct MemoryAdapter {
    entity_type: String,
    applied: RwLock<HashMap<String, ChangeRecord>>,
    pending: RwLock<Vec<ChangeRecord>>,
    poisoned: RwLock<std::collections::HashSet<String>>,
}

impl MemoryAdapter {
    /// Creates an adapter for one entity type.
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            applied: RwLock::new(HashMap::new()),
            pending: RwLock::new(Vec::new()),
            poisoned: RwLock::new(std::collections::HashSet::new()),
        }
    }

    /// Queues a pending local change.
    pub fn add_pending(&self, record: ChangeRecord) {
        self.pending.write().push(record);
    }

    /// Makes application of the given entity id fail.
    pub fn poison(&self, entity_id: impl Into<String>) {
        self.poisoned.write().insert(entity_id.into());
    }

    /// Clears a poisoned entity id.
    pub fn heal(&self, entity_id: &str) {
        self.poisoned.write().remove(entity_id);
    }

    /// Returns the applied record for an entity id, if any.
    pub fn applied(&self, entity_id: &str) -> Option<ChangeRecord> {
        self.applied.read().get(entity_id).cloned()
    }

    /// Number of applied records.
    pub fn applied_count(&self) -> usize {
        self.applied.read().len()
    }
}

impl EntitySyncAdapter for MemoryAdapter {
    fn collect_pending(&self) -> SyncResult<Vec<ChangeRecord>> {
        Ok(self.pending.read().clone())
    }

    fn apply_incoming(&self, records: &[ChangeRecord]) -> SyncResult<()> {
        // Transactional: check the whole batch before touching state.
        {
            let poisoned = self.poisoned.read();
            if let Some(bad) = records.iter().find(|r| poisoned.contains(&r.entity_id)) {
                return Err(SyncError::adapter(
                    &self.entity_type,
                    format!("simulated failure applying {}", bad.entity_id),
                ));
            }
        }

        let mut applied = self.applied.write();
        let mut pending = self.pending.write();
        for record in records {
            applied.insert(record.entity_id.clone(), record.clone());
            // An applied incoming record supersedes any queued local copy
            // at the same or lower version.
            pending.retain(|p| p.entity_id != record.entity_id || p.version > record.version);
        }
        Ok(())
    }
}
