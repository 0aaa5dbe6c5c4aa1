//! Per-branch sync orchestration.
//!
//! One orchestrator owns the push/pull protocol for a branch: the session
//! state machine, the single-flight guarantee, scheduling, and the
//! best-effort push attempted before shutdown. All shared state is held by
//! the orchestrator value; there are no module-level singletons.

use crate::adapter::AdapterRegistry;
use crate::config::{now_millis, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::pending::{PendingDirection, PendingStore};
use crate::resolver::ConflictResolver;
use crate::transport::SyncTransport;
use branchsync_protocol::{
    classify, detect, silent_merge, ChangeKey, ChangeRecord, Classification, Conflict,
    LocalRevision, PullRequest, PushRequest, ResolutionPolicy, ResolutionStrategy,
    ResolvedChange, SessionState, SyncKind, SyncSession,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Continuously observable sync status for a branch.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    /// Whether a session is running.
    pub in_progress: bool,
    /// Current session state.
    pub state: SessionState,
    /// Coarse numeric progress, 0–100.
    pub progress: u8,
    /// Human-readable phase message.
    pub message: String,
    /// Epoch milliseconds of the last completed sync.
    pub last_sync: Option<u64>,
    /// Kind of the last completed sync.
    pub last_sync_kind: Option<SyncKind>,
    /// Active pending changes.
    pub pending: usize,
    /// Permanently-failed pending changes.
    pub permanently_failed: usize,
    /// Open manual-resolution tickets.
    pub open_tickets: usize,
}

/// Cumulative statistics across sessions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    /// Sessions that reached `Completed`.
    pub sessions_completed: u64,
    /// Sessions that exited through a failure state.
    pub sessions_failed: u64,
    /// Records acknowledged by the authority.
    pub records_pushed: u64,
    /// Records received from the authority.
    pub records_pulled: u64,
    /// Records durably applied locally.
    pub records_applied: u64,
    /// Conflicts detected on either direction.
    pub conflicts_detected: u64,
    /// Conflicts converged automatically.
    pub conflicts_auto_resolved: u64,
    /// Manual-resolution tickets opened.
    pub manual_tickets: u64,
    /// Whole-session retries performed.
    pub retries: u64,
}

/// Result of one sync session.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Session identifier.
    pub session_id: Uuid,
    /// Snapshot kind of the session.
    pub kind: SyncKind,
    /// Records acknowledged by the authority.
    pub pushed: u64,
    /// Records received from the authority.
    pub pulled: u64,
    /// Records durably applied locally.
    pub applied: u64,
    /// Conflicts converged automatically.
    pub auto_resolved: usize,
    /// Manual-resolution tickets opened during the session.
    pub tickets: Vec<Uuid>,
    /// Incoming records skipped because their entity awaits manual
    /// resolution.
    pub skipped_excluded: usize,
    /// Final session state.
    pub state: SessionState,
    /// Wall-clock duration.
    pub duration: Duration,
}

/// Narrow scope for `sync_entities`.
#[derive(Debug, Clone)]
struct ScopeFilter {
    entity_type: String,
    ids: BTreeSet<String>,
}

impl ScopeFilter {
    fn matches(&self, record: &ChangeRecord) -> bool {
        record.entity_type == self.entity_type && self.ids.contains(&record.entity_id)
    }
}

struct StatusInner {
    state: SessionState,
    message: String,
}

struct Scheduler {
    stop_tx: mpsc::Sender<()>,
    // Detached on replacement; kept so an explicit shutdown can observe it.
    _handle: JoinHandle<()>,
}

/// Releases the single-flight slot when the session ends, however it ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The per-branch sync orchestrator.
pub struct SyncOrchestrator {
    config: SyncConfig,
    registry: Arc<AdapterRegistry>,
    pending: Arc<PendingStore>,
    resolver: Arc<ConflictResolver>,
    transport: Arc<dyn SyncTransport>,
    revisions: RwLock<HashMap<ChangeKey, LocalRevision>>,
    in_flight: AtomicBool,
    shutting_down: AtomicBool,
    status: RwLock<StatusInner>,
    last_sync: RwLock<Option<(u64, SyncKind)>>,
    stats: RwLock<SyncStats>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator for a branch. Validates the policy once.
    pub fn new(
        config: SyncConfig,
        policy: ResolutionPolicy,
        registry: Arc<AdapterRegistry>,
        transport: Arc<dyn SyncTransport>,
    ) -> SyncResult<Self> {
        let resolver = ConflictResolver::new(
            policy,
            config.branch_id.clone(),
            config.resolver_batch_size,
            config.resolver_pause,
        )?;

        Ok(Self {
            pending: Arc::new(PendingStore::new(config.max_retries)),
            resolver: Arc::new(resolver),
            config,
            registry,
            transport,
            revisions: RwLock::new(HashMap::new()),
            in_flight: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            status: RwLock::new(StatusInner {
                state: SessionState::Idle,
                message: "idle".to_string(),
            }),
            last_sync: RwLock::new(None),
            stats: RwLock::new(SyncStats::default()),
            scheduler: Mutex::new(None),
        })
    }

    /// The pending change store for this branch.
    pub fn pending(&self) -> &Arc<PendingStore> {
        &self.pending
    }

    /// The conflict resolver (ticket queries and submissions go here).
    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    /// Current observable status.
    pub fn status(&self) -> SyncStatus {
        let status = self.status.read();
        let last = *self.last_sync.read();
        SyncStatus {
            in_progress: self.in_flight.load(Ordering::SeqCst),
            state: status.state,
            progress: status.state.progress(),
            message: status.message.clone(),
            last_sync: last.map(|(ts, _)| ts),
            last_sync_kind: last.map(|(_, kind)| kind),
            pending: self.pending.len(),
            permanently_failed: self.pending.failed_len(),
            open_tickets: self.resolver.open_ticket_count(),
        }
    }

    /// Cumulative statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Runs a full push+pull cycle.
    ///
    /// Only one session may run per branch; a concurrent call is rejected
    /// immediately with [`SyncError::SyncInProgress`], never queued.
    pub fn synchronize_all(&self) -> SyncResult<SyncReport> {
        self.run_session(None)
    }

    /// Runs a cycle immediately, regardless of the schedule.
    pub fn force_sync_now(&self) -> SyncResult<SyncReport> {
        info!(branch = %self.config.branch_id, "forced sync");
        self.run_session(None)
    }

    /// Runs a cycle narrowed to specific entities of one type.
    pub fn sync_entities(&self, entity_type: &str, ids: &[String]) -> SyncResult<SyncReport> {
        let scope = ScopeFilter {
            entity_type: entity_type.to_string(),
            ids: ids.iter().cloned().collect(),
        };
        self.run_session(Some(scope))
    }

    /// Runs `synchronize_all` with the configured session retry budget.
    pub fn sync_with_retry(&self) -> SyncResult<SyncReport> {
        let retry = self.config.retry.clone();
        let mut last_error = None;

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                std::thread::sleep(retry.delay_for_attempt(attempt));
                self.stats.write().retries += 1;
            }

            match self.run_session(None) {
                Ok(report) => return Ok(report),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "sync attempt failed; will retry");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        self.status.write().state = SessionState::ExceededRetries;
        self.status.write().message = "retry budget exhausted".to_string();
        Err(last_error.unwrap_or_else(|| SyncError::Protocol("no sync attempts made".into())))
    }

    /// Applies an external decision for a manual-resolution ticket.
    ///
    /// The converged record is applied locally and queued for propagation
    /// on the next push; the entity re-enters automatic sync.
    pub fn submit_ticket_resolution(
        &self,
        ticket_id: Uuid,
        strategy: ResolutionStrategy,
    ) -> SyncResult<ChangeRecord> {
        let change = self.resolver.submit_resolution(ticket_id, strategy)?;

        let mut scratch = SyncReport {
            session_id: Uuid::new_v4(),
            kind: SyncKind::Incremental,
            pushed: 0,
            pulled: 0,
            applied: 0,
            auto_resolved: 0,
            tickets: Vec::new(),
            skipped_excluded: 0,
            state: SessionState::Idle,
            duration: Duration::ZERO,
        };
        self.apply_incoming(std::slice::from_ref(&change.record), &mut scratch);
        self.park_outbound(std::slice::from_ref(&change.record));
        Ok(change.record)
    }

    /// Re-arms the periodic trigger, replacing any prior timer.
    pub fn schedule(self: &Arc<Self>, interval: Duration) {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let me = Arc::clone(self);
        let handle = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => match me.synchronize_all() {
                    Ok(report) => debug!(
                        pushed = report.pushed,
                        pulled = report.pulled,
                        "scheduled sync completed"
                    ),
                    Err(SyncError::SyncInProgress) => {
                        debug!("scheduled sync skipped; session active")
                    }
                    Err(e) => warn!(error = %e, "scheduled sync failed"),
                },
            }
        });

        let mut slot = self.scheduler.lock();
        if let Some(prev) = slot.take() {
            // Signal the old timer; it exits at its next wakeup.
            let _ = prev.stop_tx.send(());
        }
        *slot = Some(Scheduler {
            stop_tx,
            _handle: handle,
        });
        info!(branch = %self.config.branch_id, ?interval, "sync schedule armed");
    }

    /// Stops the scheduler and attempts one last bounded-deadline push.
    ///
    /// Never blocks past `shutdown_push_deadline`; changes that could not
    /// be delivered stay in the pending store for an idempotent re-send on
    /// the next start.
    pub fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(prev) = self.scheduler.lock().take() {
            let _ = prev.stop_tx.send(());
        }

        let deadline = self.config.shutdown_push_deadline;
        let me = Arc::clone(self);
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(me.final_push());
        });

        match rx.recv_timeout(deadline) {
            Ok(Ok(pushed)) => info!(pushed, "shutdown push completed"),
            Ok(Err(e)) => warn!(error = %e, "shutdown push failed; changes remain pending"),
            Err(_) => warn!("shutdown push deadline exceeded; changes remain pending"),
        }
    }

    /// The best-effort push run at shutdown. Changes are parked in the
    /// outbound queue before the network call so a timeout cannot lose
    /// them; acknowledged keys are confirmed out again.
    fn final_push(&self) -> SyncResult<u64> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("session active at shutdown; skipping final push");
            return Ok(0);
        }
        let _guard = FlightGuard(&self.in_flight);

        let changes = self.collect_outgoing(None)?;
        if changes.is_empty() {
            return Ok(0);
        }
        for record in &changes {
            self.pending
                .enqueue(record.clone(), &self.config.branch_id, PendingDirection::Outbound);
        }

        let request = PushRequest::new(&self.config.branch_id, changes.clone(), now_millis())?;
        let response = self.transport.push(&request)?;
        if !response.success {
            return Err(SyncError::Protocol(
                response.error.unwrap_or_else(|| "push rejected".into()),
            ));
        }

        for record in &changes {
            self.pending.confirm(&record.key());
            self.mark_synced(record);
        }
        Ok(response.applied_count)
    }

    fn run_session(&self, scope: Option<ScopeFilter>) -> SyncResult<SyncReport> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::SyncInProgress);
        }
        let _guard = FlightGuard(&self.in_flight);

        let started = Instant::now();
        let (since, kind) = match *self.last_sync.read() {
            Some((ts, _)) => (Some(ts), SyncKind::Incremental),
            None => (None, SyncKind::Full),
        };
        let mut session =
            SyncSession::begin(&self.config.branch_id, kind, since, now_millis());
        info!(branch = %self.config.branch_id, session = %session.session_id, %kind, "sync session started");

        let mut report = SyncReport {
            session_id: session.session_id,
            kind,
            pushed: 0,
            pulled: 0,
            applied: 0,
            auto_resolved: 0,
            tickets: Vec::new(),
            skipped_excluded: 0,
            state: SessionState::Idle,
            duration: Duration::ZERO,
        };

        let result = self.run_phases(&mut session, scope.as_ref(), &mut report);
        report.duration = started.elapsed();
        report.state = session.state;

        let mut stats = self.stats.write();
        stats.records_pushed += report.pushed;
        stats.records_pulled += report.pulled;
        stats.records_applied += report.applied;
        stats.conflicts_auto_resolved += report.auto_resolved as u64;
        stats.manual_tickets += report.tickets.len() as u64;

        match result {
            Ok(()) => {
                stats.sessions_completed += 1;
                drop(stats);
                info!(
                    session = %session.session_id,
                    pushed = report.pushed,
                    pulled = report.pulled,
                    applied = report.applied,
                    "sync session completed"
                );
                Ok(report)
            }
            Err(e) => {
                stats.sessions_failed += 1;
                drop(stats);
                warn!(session = %session.session_id, error = %e, "sync session failed");
                Err(e)
            }
        }
    }

    fn run_phases(
        &self,
        session: &mut SyncSession,
        scope: Option<&ScopeFilter>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        // ---- push ----
        self.enter(session, SessionState::Pushing, "collecting local changes");
        let changes = match self.collect_outgoing(scope) {
            Ok(changes) => changes,
            Err(e) => {
                self.fail(session, &e);
                return Err(e);
            }
        };

        let mut push_conflicts: Vec<Conflict> = Vec::new();
        for chunk in changes.chunks(self.config.push_batch_size.max(1)) {
            let request =
                PushRequest::new(&self.config.branch_id, chunk.to_vec(), now_millis())?;
            session.checksum = Some(request.checksum.clone());
            self.enter(
                session,
                SessionState::IntegrityCheck,
                "awaiting checksum verification",
            );

            let response = match self.transport.push(&request) {
                Ok(response) => response,
                Err(e) => {
                    self.park_outbound(chunk);
                    self.fail(session, &e);
                    return Err(e);
                }
            };

            if !response.success {
                let message = response
                    .error
                    .unwrap_or_else(|| "push rejected".to_string());
                self.park_outbound(chunk);
                let err = SyncError::Protocol(message);
                self.fail(session, &err);
                return Err(err);
            }

            report.pushed += response.applied_count;
            for record in chunk {
                self.pending.confirm(&record.key());
                self.mark_synced(record);
            }
            push_conflicts.extend(response.conflicts);
        }

        // ---- conflicts returned by the authority ----
        self.enter(session, SessionState::ConflictCheck, "processing conflicts");
        self.stats.write().conflicts_detected += push_conflicts.len() as u64;
        let resolution = self.resolver.resolve_batch(push_conflicts);
        report.auto_resolved += resolution.resolved.len();
        report.tickets.extend(resolution.tickets.iter().copied());
        self.apply_resolutions(&resolution.resolved, report, true)?;

        let conflict_state = if report.tickets.is_empty() {
            SessionState::AutoResolved
        } else {
            SessionState::AwaitingManual
        };
        self.enter(session, conflict_state, "conflict check finished");

        // ---- pull ----
        self.enter(session, SessionState::Pulling, "fetching delta");
        let pull_request = match session.since_timestamp {
            Some(since) => PullRequest::incremental(&self.config.branch_id, since),
            None => PullRequest::full(&self.config.branch_id),
        };
        let pull = match self.transport.pull(&pull_request) {
            Ok(pull) => pull,
            Err(e) => {
                self.fail(session, &e);
                return Err(e);
            }
        };

        if !pull.verify_checksum()? {
            let recomputed =
                branchsync_protocol::tables_checksum(pull.tables.values())?;
            let err = SyncError::Integrity {
                expected: pull.checksum.clone(),
                actual: recomputed,
            };
            self.fail(session, &err);
            return Err(err);
        }
        report.pulled = pull.record_count() as u64;

        // ---- apply ----
        self.enter(session, SessionState::Applying, "applying incoming records");
        let mut to_apply: Vec<ChangeRecord> = Vec::new();
        let mut pull_conflicts: Vec<Conflict> = Vec::new();
        {
            let revisions = self.revisions.read();
            for record in pull.all_records() {
                if scope.is_some_and(|s| !s.matches(&record)) {
                    continue;
                }
                if self.resolver.is_excluded(&record.key()) {
                    report.skipped_excluded += 1;
                    debug!(key = %record.key(), "skipped; awaiting manual resolution");
                    continue;
                }

                let local = revisions.get(&record.key());
                match classify(local, &record, self.resolver.policy()) {
                    Classification::Identical | Classification::KeepLocal => {}
                    Classification::AdoptIncoming => to_apply.push(record),
                    Classification::SilentMerge => {
                        // local is present by construction for this arm
                        if let Some(local) = local {
                            to_apply.push(silent_merge(
                                &local.record,
                                &record,
                                self.resolver.policy(),
                            ));
                        }
                    }
                    Classification::DataConflict
                    | Classification::DeleteConflict
                    | Classification::SchemaConflict => {
                        if let Some(conflict) =
                            detect(local, &record, self.resolver.policy())
                        {
                            pull_conflicts.push(conflict);
                        }
                    }
                }
            }
        }

        self.stats.write().conflicts_detected += pull_conflicts.len() as u64;
        let resolution = self.resolver.resolve_batch(pull_conflicts);
        report.auto_resolved += resolution.resolved.len();
        report.tickets.extend(resolution.tickets.iter().copied());

        self.apply_incoming(&to_apply, report);
        self.apply_resolutions(&resolution.resolved, report, false)?;

        // Sweep after every inbound batch.
        self.pending.sweep(&self.registry);

        *self.last_sync.write() = Some((pull.last_timestamp, pull.kind));
        self.enter(session, SessionState::Completed, "sync completed");
        Ok(())
    }

    /// Collects outgoing changes: adapter-pending plus parked outbound,
    /// minus excluded entities and already-acknowledged versions. Parked
    /// outbound entries were explicitly queued for delivery and bypass
    /// the acknowledgement filter.
    fn collect_outgoing(&self, scope: Option<&ScopeFilter>) -> SyncResult<Vec<ChangeRecord>> {
        let adapter_changes = self.registry.collect_all_pending()?;

        let revisions = self.revisions.read();
        let mut filtered: HashMap<ChangeKey, ChangeRecord> = HashMap::new();
        for record in adapter_changes {
            if scope.is_some_and(|s| !s.matches(&record)) {
                continue;
            }
            let key = record.key();
            if self.resolver.is_excluded(&key) {
                continue;
            }
            if revisions
                .get(&key)
                .and_then(|rev| rev.last_synced_version)
                .is_some_and(|synced| synced >= record.version)
            {
                continue;
            }
            match filtered.get(&key) {
                Some(existing) if existing.version >= record.version => {}
                _ => {
                    filtered.insert(key, record);
                }
            }
        }
        drop(revisions);

        for record in self.pending.outbound_snapshot() {
            if scope.is_some_and(|s| !s.matches(&record)) {
                continue;
            }
            let key = record.key();
            if self.resolver.is_excluded(&key) {
                continue;
            }
            match filtered.get(&key) {
                Some(existing) if existing.version >= record.version => {}
                _ => {
                    filtered.insert(key, record);
                }
            }
        }

        let mut out: Vec<ChangeRecord> = filtered.into_values().collect();
        out.sort_by(|a, b| {
            (&a.entity_type, &a.entity_id).cmp(&(&b.entity_type, &b.entity_id))
        });
        for record in &out {
            self.observe_local(record);
        }
        Ok(out)
    }

    /// Applies incoming records through the registry, routing per-record
    /// failures to the pending store instead of aborting the batch.
    fn apply_incoming(&self, records: &[ChangeRecord], report: &mut SyncReport) {
        if records.is_empty() {
            return;
        }
        let apply = self.registry.apply_batch(records);
        report.applied += apply.applied;

        let failed_keys: Vec<ChangeKey> =
            apply.failures.iter().map(|(r, _)| r.key()).collect();
        for (record, message) in apply.failures {
            warn!(key = %record.key(), error = %message, "incoming record parked as pending");
            self.pending
                .enqueue(record, &self.config.branch_id, PendingDirection::Inbound);
        }

        for record in records {
            let key = record.key();
            if failed_keys.contains(&key) {
                continue;
            }
            if self.registry.get(&record.entity_type).is_some() {
                self.mark_synced(record);
            }
        }
    }

    /// Applies converged records locally and propagates client-side
    /// winners back to the authority.
    fn apply_resolutions(
        &self,
        resolved: &[ResolvedChange],
        report: &mut SyncReport,
        push_now: bool,
    ) -> SyncResult<()> {
        if resolved.is_empty() {
            return Ok(());
        }

        let records: Vec<ChangeRecord> = resolved.iter().map(|r| r.record.clone()).collect();
        self.apply_incoming(&records, report);

        let propagate: Vec<ChangeRecord> = resolved
            .iter()
            .filter(|r| r.propagate)
            .map(|r| r.record.clone())
            .collect();
        if propagate.is_empty() {
            return Ok(());
        }

        if push_now {
            let request =
                PushRequest::new(&self.config.branch_id, propagate.clone(), now_millis())?;
            match self.transport.push(&request) {
                Ok(response) if response.success => {
                    report.pushed += response.applied_count;
                    for record in &propagate {
                        self.mark_synced(record);
                    }
                }
                Ok(_) | Err(_) => {
                    // Non-fatal: converged records re-send next session.
                    warn!(count = propagate.len(), "propagation push failed; parked outbound");
                    self.park_outbound(&propagate);
                }
            }
        } else {
            self.park_outbound(&propagate);
        }
        Ok(())
    }

    fn park_outbound(&self, records: &[ChangeRecord]) {
        for record in records {
            self.pending.enqueue(
                record.clone(),
                &self.config.branch_id,
                PendingDirection::Outbound,
            );
        }
    }

    fn observe_local(&self, record: &ChangeRecord) {
        let mut revisions = self.revisions.write();
        match revisions.get_mut(&record.key()) {
            Some(rev) => {
                if record.version >= rev.record.version {
                    rev.record = record.clone();
                }
            }
            None => {
                revisions.insert(
                    record.key(),
                    LocalRevision {
                        record: record.clone(),
                        last_synced_version: None,
                    },
                );
            }
        }
    }

    fn mark_synced(&self, record: &ChangeRecord) {
        let mut revisions = self.revisions.write();
        let entry = revisions
            .entry(record.key())
            .or_insert_with(|| LocalRevision {
                record: record.clone(),
                last_synced_version: Some(record.version),
            });
        if record.version >= entry.record.version {
            entry.record = record.clone();
        }
        entry.last_synced_version = Some(
            entry
                .last_synced_version
                .map_or(record.version, |v| v.max(record.version)),
        );
    }

    fn enter(&self, session: &mut SyncSession, state: SessionState, message: &str) {
        session.advance(state);
        let mut status = self.status.write();
        status.state = state;
        status.message = message.to_string();
        debug!(session = %session.session_id, ?state, "{message}");
    }

    fn fail(&self, session: &mut SyncSession, error: &SyncError) {
        let state = match error {
            SyncError::Integrity { .. } => SessionState::IntegrityFailure,
            _ => SessionState::OfflineAborted,
        };
        self.enter(session, state, &error.to_string());
    }
}
