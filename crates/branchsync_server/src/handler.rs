//! Request handlers for the sync endpoints.
//!
//! Every inbound record runs through the same conflict detector and
//! strategy application the branches use, against the authoritative copy.
//! Individual-record failures are parked and retried on the branch's next
//! push; only integrity and auth failures abort a whole batch.

use crate::audit::{AuditEventType, AuditLog, ResolutionRow};
use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::AuthorityStore;
use branchsync_protocol::{
    batch_checksum, classify, resolve_conflict, silent_merge, ChangeRecord, Classification,
    Conflict, ConflictKind, LocalRevision, PullRequest, PullResponse, PushRequest, PushResponse,
    ResolutionOutcome, ResolutionPolicy, ResolutionStrategy, ResolveRequest, ResolveResponse,
    StatusResponse, SyncKind,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Source id stamped on records the authority converges itself.
const AUTHORITY_ID: &str = "authority";

enum IngestOutcome {
    Applied,
    Manual(Conflict),
    Parked,
}

/// Handler for sync requests.
pub struct RequestHandler {
    config: ServerConfig,
    store: Arc<AuthorityStore>,
    audit: Arc<AuditLog>,
    policy: ResolutionPolicy,
    verifier: Option<Arc<dyn TokenVerifier>>,
}

impl RequestHandler {
    /// Creates a handler. The resolution policy is validated here, once.
    pub fn new(
        config: ServerConfig,
        store: Arc<AuthorityStore>,
        audit: Arc<AuditLog>,
        policy: ResolutionPolicy,
        verifier: Option<Arc<dyn TokenVerifier>>,
    ) -> ServerResult<Self> {
        policy
            .validate()
            .map_err(|e| ServerError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            config,
            store,
            audit,
            policy,
            verifier,
        })
    }

    fn check_auth(&self, token: Option<&str>) -> ServerResult<()> {
        if !self.config.require_auth {
            return Ok(());
        }
        let Some(verifier) = &self.verifier else {
            return Err(ServerError::Internal(
                "authentication required but no verifier installed".into(),
            ));
        };
        match token {
            Some(token) if verifier.verify(token) => Ok(()),
            _ => Err(ServerError::AuthenticationFailed(
                "invalid or missing bearer token".into(),
            )),
        }
    }

    /// Handles `POST /sync/push`: verifies integrity, then applies each
    /// record through the detector/resolver against the authoritative copy.
    pub fn handle_push(
        &self,
        request: &PushRequest,
        token: Option<&str>,
    ) -> ServerResult<PushResponse> {
        self.check_auth(token)?;

        if request.changes.len() > self.config.max_push_batch {
            return Err(ServerError::InvalidRequest(format!(
                "too many changes: {} > {}",
                request.changes.len(),
                self.config.max_push_batch
            )));
        }

        let actual = batch_checksum(&request.changes)
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        if actual != request.checksum {
            warn!(branch = %request.branch_id, "push rejected: checksum mismatch");
            return Err(ServerError::ChecksumMismatch {
                expected: request.checksum.clone(),
                actual,
            });
        }

        self.store.set_in_progress(&request.branch_id, true);

        // Previously parked records get another attempt before the new batch.
        let replay: Vec<ChangeRecord> = self
            .store
            .drain_parked(&request.branch_id)
            .into_iter()
            .map(|p| p.record)
            .collect();

        let mut applied = 0u64;
        let mut manual: Vec<Conflict> = Vec::new();
        for record in replay.iter().chain(request.changes.iter()) {
            match self.ingest_one(&request.branch_id, record) {
                IngestOutcome::Applied => applied += 1,
                IngestOutcome::Manual(conflict) => manual.push(conflict),
                IngestOutcome::Parked => {}
            }
        }

        self.store.set_in_progress(&request.branch_id, false);
        self.audit
            .record_event(&request.branch_id, AuditEventType::Push, now_millis());
        info!(
            branch = %request.branch_id,
            received = request.changes.len(),
            applied,
            conflicts = manual.len(),
            "push processed"
        );

        Ok(if manual.is_empty() {
            PushResponse::success(applied)
        } else {
            PushResponse::with_conflicts(applied, manual)
        })
    }

    fn ingest_one(&self, branch_id: &str, record: &ChangeRecord) -> IngestOutcome {
        let row = self.store.get(&record.key());
        let row_version = row.as_ref().map(|r| r.version);
        let local = row.clone().map(LocalRevision::unsynced);

        match classify(local.as_ref(), record, &self.policy) {
            // Idempotent re-send or stale copy: acknowledged, no write.
            Classification::Identical | Classification::KeepLocal => {
                debug!(key = %record.key(), "record acknowledged without write");
                IngestOutcome::Applied
            }
            Classification::AdoptIncoming => {
                self.apply_or_park(branch_id, row_version, record.clone())
            }
            Classification::SilentMerge => match row {
                Some(row_record) => {
                    let merged = silent_merge(&row_record, record, &self.policy);
                    self.apply_or_park(branch_id, row_version, merged)
                }
                None => self.apply_or_park(branch_id, row_version, record.clone()),
            },
            classification @ (Classification::DataConflict
            | Classification::DeleteConflict
            | Classification::SchemaConflict) => {
                let kind = match classification {
                    Classification::DeleteConflict => ConflictKind::Delete,
                    Classification::SchemaConflict => ConflictKind::Schema,
                    _ => ConflictKind::Data,
                };
                // Orientation on the wire: `localData` is the branch's
                // copy, `serverData` the authoritative one.
                let conflict = Conflict::new(kind, Some(record.clone()), row);
                self.converge(branch_id, row_version, conflict)
            }
        }
    }

    fn converge(
        &self,
        branch_id: &str,
        row_version: Option<u64>,
        conflict: Conflict,
    ) -> IngestOutcome {
        let strategy = self
            .policy
            .effective_strategy(&conflict.entity_type, conflict.kind);
        let now = now_millis();

        match resolve_conflict(&conflict, strategy, &self.policy, AUTHORITY_ID, now) {
            ResolutionOutcome::Resolved(change) => {
                match self.store.apply_checked(row_version, change.record.clone()) {
                    Ok(()) => {
                        self.log_resolution(&conflict, strategy, true, None, now);
                        debug!(
                            key = %change.record.key(),
                            kind = %conflict.kind,
                            %strategy,
                            version = change.record.version,
                            "conflict converged"
                        );
                        IngestOutcome::Applied
                    }
                    Err(e) => {
                        self.log_resolution(&conflict, strategy, false, Some(e.to_string()), now);
                        warn!(key = %conflict_key(&conflict), error = %e, "converged record lost the write race; parked");
                        if let Some(record) = conflict.local_data.clone() {
                            self.store.park(branch_id, record, e.to_string());
                        }
                        IngestOutcome::Parked
                    }
                }
            }
            ResolutionOutcome::Manual => {
                self.log_resolution(
                    &conflict,
                    strategy,
                    false,
                    Some("manual resolution required".into()),
                    now,
                );
                IngestOutcome::Manual(conflict)
            }
        }
    }

    fn apply_or_park(
        &self,
        branch_id: &str,
        expected_version: Option<u64>,
        record: ChangeRecord,
    ) -> IngestOutcome {
        match self.store.apply_checked(expected_version, record.clone()) {
            Ok(()) => IngestOutcome::Applied,
            Err(e) => {
                warn!(key = %record.key(), error = %e, "record application failed; parked");
                self.store.park(branch_id, record, e.to_string());
                IngestOutcome::Parked
            }
        }
    }

    /// Handles `GET /sync/pull`: serves a full snapshot or an incremental
    /// delta with its checksum.
    pub fn handle_pull(
        &self,
        request: &PullRequest,
        token: Option<&str>,
    ) -> ServerResult<PullResponse> {
        self.check_auth(token)?;
        self.store.set_in_progress(&request.branch_id, true);

        let (kind, tables, event) = match request.since {
            None => (
                SyncKind::Full,
                self.store.snapshot(),
                AuditEventType::FullSync,
            ),
            Some(since) => (
                SyncKind::Incremental,
                self.store.changes_since(since),
                AuditEventType::IncrementalSync,
            ),
        };

        let last_timestamp = self
            .store
            .max_updated_at()
            .max(request.since.unwrap_or(0));
        let response = PullResponse::new(kind, tables, last_timestamp)
            .map_err(|e| ServerError::Internal(e.to_string()))?;

        self.store
            .touch_last_sync(&request.branch_id, now_millis(), kind);
        self.store.set_in_progress(&request.branch_id, false);
        self.audit
            .record_event(&request.branch_id, event, now_millis());
        info!(
            branch = %request.branch_id,
            %kind,
            records = response.record_count(),
            "pull served"
        );
        Ok(response)
    }

    /// Handles `POST /sync/resolve-conflicts`: applies an externally-chosen
    /// strategy to each carried conflict.
    pub fn handle_resolve(
        &self,
        request: &ResolveRequest,
        token: Option<&str>,
    ) -> ServerResult<ResolveResponse> {
        self.check_auth(token)?;

        let mut resolved = 0u64;
        for conflict in &request.conflicts {
            let strategy = request.resolution;
            let downgraded = matches!(
                conflict.kind,
                ConflictKind::Delete | ConflictKind::Schema
            ) && strategy == ResolutionStrategy::Merge;
            if strategy == ResolutionStrategy::Manual || downgraded {
                self.log_resolution(
                    conflict,
                    strategy,
                    false,
                    Some("strategy cannot converge this conflict".into()),
                    now_millis(),
                );
                continue;
            }

            let now = now_millis();
            match resolve_conflict(conflict, strategy, &self.policy, AUTHORITY_ID, now) {
                ResolutionOutcome::Resolved(change) => {
                    let row_version = self
                        .store
                        .get(&change.record.key())
                        .map(|r| r.version);
                    match self.store.apply_checked(row_version, change.record) {
                        Ok(()) => {
                            resolved += 1;
                            self.log_resolution(conflict, strategy, true, None, now);
                        }
                        Err(e) => {
                            self.log_resolution(
                                conflict,
                                strategy,
                                false,
                                Some(e.to_string()),
                                now,
                            );
                        }
                    }
                }
                ResolutionOutcome::Manual => {
                    self.log_resolution(
                        conflict,
                        strategy,
                        false,
                        Some("strategy could not converge".into()),
                        now,
                    );
                }
            }
        }

        self.audit.record_event(
            &request.branch_id,
            AuditEventType::ResolveConflicts,
            now_millis(),
        );
        Ok(ResolveResponse {
            success: resolved as usize == request.conflicts.len(),
            resolved_count: resolved,
        })
    }

    /// Handles `GET /sync/status`.
    pub fn handle_status(
        &self,
        branch_id: &str,
        token: Option<&str>,
    ) -> ServerResult<StatusResponse> {
        self.check_auth(token)?;
        let state = self.store.branch_state(branch_id);
        Ok(StatusResponse {
            in_progress: state.in_progress,
            last_sync: state.last_sync,
            last_sync_type: state.last_sync_kind,
            pending_changes: self.store.parked_count(branch_id) as u64,
        })
    }

    fn log_resolution(
        &self,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
        success: bool,
        error_message: Option<String>,
        created_at: u64,
    ) {
        self.audit.record_resolution(ResolutionRow {
            entity_type: conflict.entity_type.clone(),
            entity_id: conflict.entity_id.clone(),
            conflict_type: conflict.kind,
            strategy,
            success,
            error_message,
            created_at,
        });
    }
}

fn conflict_key(conflict: &Conflict) -> String {
    format!("{}/{}", conflict.entity_type, conflict.entity_id)
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchsync_protocol::EntityPolicy;
    use branchsync_protocol::MergeRule;
    use serde_json::json;

    fn policy() -> ResolutionPolicy {
        ResolutionPolicy::new(ResolutionStrategy::ServerWins)
            .entity(
                "product",
                EntityPolicy::new(ResolutionStrategy::Merge)
                    .key_field("price")
                    .key_field("stock")
                    .rule("price", MergeRule::Newest)
                    .rule("stock", MergeRule::Sum),
            )
            .entity("invoice", EntityPolicy::new(ResolutionStrategy::Manual))
    }

    fn handler() -> (RequestHandler, Arc<AuthorityStore>, Arc<AuditLog>) {
        let store = Arc::new(AuthorityStore::new());
        let audit = Arc::new(AuditLog::new(1_000));
        let handler = RequestHandler::new(
            ServerConfig::default(),
            Arc::clone(&store),
            Arc::clone(&audit),
            policy(),
            None,
        )
        .unwrap();
        (handler, store, audit)
    }

    fn change(entity_type: &str, id: &str, payload: serde_json::Value, version: u64, ts: u64) -> ChangeRecord {
        ChangeRecord::update(entity_type, id, payload, version, ts, "br-1")
    }

    fn push(changes: Vec<ChangeRecord>) -> PushRequest {
        PushRequest::new("br-1", changes, 1_000).unwrap()
    }

    #[test]
    fn push_applies_new_records() {
        let (handler, store, _) = handler();
        let request = push(vec![
            change("product", "p-1", json!({"price": 10, "stock": 1}), 1, 100),
            change("product", "p-2", json!({"price": 20, "stock": 2}), 1, 110),
        ]);

        let response = handler.handle_push(&request, None).unwrap();
        assert!(response.success);
        assert_eq!(response.applied_count, 2);
        assert!(response.conflicts.is_empty());
        assert_eq!(store.row_count(), 2);
    }

    #[test]
    fn push_rejects_checksum_mismatch_as_a_unit() {
        let (handler, store, _) = handler();
        let mut request = push(vec![change(
            "product",
            "p-1",
            json!({"price": 10, "stock": 1}),
            1,
            100,
        )]);
        // A byte flipped in transit.
        request.changes[0].payload = json!({"price": 11, "stock": 1});

        let err = handler.handle_push(&request, None).unwrap_err();
        assert!(matches!(err, ServerError::ChecksumMismatch { .. }));
        assert_eq!(err.http_status(), 422);
        assert_eq!(store.row_count(), 0);
    }

    #[test]
    fn push_is_idempotent() {
        let (handler, store, _) = handler();
        let request = push(vec![change(
            "product",
            "p-1",
            json!({"price": 10, "stock": 1}),
            1,
            100,
        )]);

        let first = handler.handle_push(&request, None).unwrap();
        let second = handler.handle_push(&request, None).unwrap();
        assert_eq!(first.applied_count, 1);
        // The re-send is acknowledged without changing state again.
        assert_eq!(second.applied_count, 1);
        assert_eq!(store.row_count(), 1);
        assert_eq!(
            store
                .get(&branchsync_protocol::ChangeKey::new("product", "p-1"))
                .unwrap()
                .version,
            1
        );
    }

    #[test]
    fn concurrent_edit_converges_through_merge_policy() {
        let (handler, store, audit) = handler();
        // Authority at version 7 with fresh stock.
        store.seed(ChangeRecord::update(
            "product",
            "p-1",
            json!({"price": 100, "stock": 9}),
            7,
            1_500,
            "hq",
        ));

        // Branch pushes an offline edit built on version 5: new price,
        // stock field carrying the local delta.
        let request = push(vec![change(
            "product",
            "p-1",
            json!({"price": 120, "stock": -2}),
            6,
            2_000,
        )]);
        let response = handler.handle_push(&request, None).unwrap();
        assert!(response.conflicts.is_empty());
        assert_eq!(response.applied_count, 1);

        let row = store
            .get(&branchsync_protocol::ChangeKey::new("product", "p-1"))
            .unwrap();
        assert_eq!(row.version, 8);
        assert_eq!(row.field("price"), Some(&json!(120)));
        assert_eq!(row.field("stock"), Some(&json!(7)));

        let rows = audit.resolutions();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].success);
        assert_eq!(rows[0].conflict_type, ConflictKind::Data);
    }

    #[test]
    fn manual_policy_returns_conflict_to_branch() {
        let (handler, store, audit) = handler();
        store.seed(ChangeRecord::update(
            "invoice",
            "i-1",
            json!({"total": 10}),
            4,
            1_500,
            "hq",
        ));

        let request = push(vec![change("invoice", "i-1", json!({"total": 99}), 3, 2_000)]);
        let response = handler.handle_push(&request, None).unwrap();

        assert_eq!(response.applied_count, 0);
        assert_eq!(response.conflicts.len(), 1);
        assert_eq!(response.conflicts[0].kind, ConflictKind::Data);
        // Authority row untouched.
        assert_eq!(
            store
                .get(&branchsync_protocol::ChangeKey::new("invoice", "i-1"))
                .unwrap()
                .version,
            4
        );
        assert!(audit.resolutions().iter().any(|r| !r.success));
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let store = Arc::new(AuthorityStore::new());
        let audit = Arc::new(AuditLog::new(10));
        let handler = RequestHandler::new(
            ServerConfig::default().with_max_push_batch(1),
            store,
            audit,
            policy(),
            None,
        )
        .unwrap();

        let request = push(vec![
            change("product", "p-1", json!({"price": 1, "stock": 1}), 1, 1),
            change("product", "p-2", json!({"price": 2, "stock": 1}), 1, 2),
        ]);
        let err = handler.handle_push(&request, None).unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }

    #[test]
    fn pull_full_then_incremental() {
        let (handler, store, audit) = handler();
        store.seed(change("product", "p-1", json!({"price": 1, "stock": 1}), 1, 100));
        store.seed(change("product", "p-2", json!({"price": 2, "stock": 1}), 1, 200));

        let full = handler
            .handle_pull(&PullRequest::full("br-1"), None)
            .unwrap();
        assert_eq!(full.kind, SyncKind::Full);
        assert_eq!(full.record_count(), 2);
        assert!(full.verify_checksum().unwrap());
        assert_eq!(full.last_timestamp, 200);

        let incremental = handler
            .handle_pull(&PullRequest::incremental("br-1", 100), None)
            .unwrap();
        assert_eq!(incremental.kind, SyncKind::Incremental);
        assert_eq!(incremental.record_count(), 1);

        let metrics = audit.metrics();
        assert_eq!(metrics.by_type["full_sync"], 1);
        assert_eq!(metrics.by_type["incremental_sync"], 1);
        assert_eq!(metrics.by_branch["br-1"], 2);
    }

    #[test]
    fn resolve_endpoint_applies_choice() {
        let (handler, store, _) = handler();
        store.seed(ChangeRecord::update(
            "invoice",
            "i-1",
            json!({"total": 10}),
            4,
            1_500,
            "hq",
        ));

        let conflict = Conflict::new(
            ConflictKind::Data,
            Some(change("invoice", "i-1", json!({"total": 99}), 3, 2_000)),
            Some(store.get(&branchsync_protocol::ChangeKey::new("invoice", "i-1")).unwrap()),
        );

        let request = ResolveRequest {
            branch_id: "br-1".into(),
            conflicts: vec![conflict],
            resolution: ResolutionStrategy::ClientWins,
        };
        let response = handler.handle_resolve(&request, None).unwrap();
        assert!(response.success);
        assert_eq!(response.resolved_count, 1);

        let row = store
            .get(&branchsync_protocol::ChangeKey::new("invoice", "i-1"))
            .unwrap();
        assert_eq!(row.version, 5);
        assert_eq!(row.field("total"), Some(&json!(99)));
    }

    #[test]
    fn status_reflects_parked_and_last_sync() {
        let (handler, store, _) = handler();
        store.park(
            "br-1",
            change("product", "p-1", json!({"price": 1, "stock": 1}), 1, 1),
            "version conflict",
        );
        store.touch_last_sync("br-1", 7_000, SyncKind::Incremental);

        let status = handler.handle_status("br-1", None).unwrap();
        assert!(!status.in_progress);
        assert_eq!(status.last_sync, Some(7_000));
        assert_eq!(status.last_sync_type, Some(SyncKind::Incremental));
        assert_eq!(status.pending_changes, 1);
    }

    #[test]
    fn auth_gate_rejects_missing_token() {
        let store = Arc::new(AuthorityStore::new());
        let audit = Arc::new(AuditLog::new(10));
        let handler = RequestHandler::new(
            ServerConfig::default().with_auth(b"secret".to_vec()),
            store,
            audit,
            policy(),
            Some(Arc::new(crate::auth::StaticTokenVerifier::new("tok-1"))),
        )
        .unwrap();

        let request = push(vec![]);
        let err = handler.handle_push(&request, None).unwrap_err();
        assert!(matches!(err, ServerError::AuthenticationFailed(_)));

        let err = handler.handle_push(&request, Some("wrong")).unwrap_err();
        assert!(matches!(err, ServerError::AuthenticationFailed(_)));

        assert!(handler.handle_push(&request, Some("tok-1")).is_ok());
    }

    #[test]
    fn invalid_policy_is_rejected() {
        let store = Arc::new(AuthorityStore::new());
        let audit = Arc::new(AuditLog::new(10));
        let bad = ResolutionPolicy::new(ResolutionStrategy::ServerWins)
            .entity("sale", EntityPolicy::new(ResolutionStrategy::Merge));
        assert!(RequestHandler::new(ServerConfig::default(), store, audit, bad, None).is_err());
    }
}
