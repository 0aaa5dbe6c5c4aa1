//! Transport layer abstraction for sync round trips.

use crate::error::{SyncError, SyncResult};
use branchsync_protocol::{
    PullRequest, PullResponse, PushRequest, PushResponse, ResolveRequest, ResolveResponse,
    StatusResponse,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// A sync transport handles network communication with the authority.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, loopback, mock for testing).
pub trait SyncTransport: Send + Sync {
    /// Pushes a change batch.
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Pulls a snapshot or delta.
    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse>;

    /// Submits conflict resolutions.
    fn resolve(&self, request: &ResolveRequest) -> SyncResult<ResolveResponse>;

    /// Queries the authority-side status for a branch.
    fn status(&self, branch_id: &str) -> SyncResult<StatusResponse>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> SyncResult<()>;
}

/// Failure modes the mock transport can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Connection refused / offline.
    Offline,
    /// Request deadline exceeded.
    Timeout,
    /// Checksum rejected by the counterpart.
    Integrity,
    /// Token rejected.
    Auth,
}

impl MockFailure {
    fn to_error(self) -> SyncError {
        match self {
            MockFailure::Offline => SyncError::network_retryable("connection refused"),
            MockFailure::Timeout => SyncError::Timeout,
            MockFailure::Integrity => SyncError::Integrity {
                expected: "deadbeef".into(),
                actual: "badc0ffee".into(),
            },
            MockFailure::Auth => SyncError::Auth("token rejected".into()),
        }
    }
}

/// A mock transport for tests.
#[derive(Default)]
pub struct MockTransport {
    connected: AtomicBool,
    push_response: Mutex<Option<PushResponse>>,
    pull_response: Mutex<Option<PullResponse>>,
    resolve_response: Mutex<Option<ResolveResponse>>,
    status_response: Mutex<Option<StatusResponse>>,
    push_failures: Mutex<VecDeque<MockFailure>>,
    pull_failures: Mutex<VecDeque<MockFailure>>,
    pushed: Mutex<Vec<PushRequest>>,
}

impl MockTransport {
    /// Creates a connected mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Sets the sticky push response.
    pub fn set_push_response(&self, response: PushResponse) {
        *self.push_response.lock() = Some(response);
    }

    /// Sets the sticky pull response.
    pub fn set_pull_response(&self, response: PullResponse) {
        *self.pull_response.lock() = Some(response);
    }

    /// Sets the sticky resolve response.
    pub fn set_resolve_response(&self, response: ResolveResponse) {
        *self.resolve_response.lock() = Some(response);
    }

    /// Sets the sticky status response.
    pub fn set_status_response(&self, response: StatusResponse) {
        *self.status_response.lock() = Some(response);
    }

    /// Queues a one-shot push failure.
    pub fn fail_next_push(&self, failure: MockFailure) {
        self.push_failures.lock().push_back(failure);
    }

    /// Queues a one-shot pull failure.
    pub fn fail_next_pull(&self, failure: MockFailure) {
        self.pull_failures.lock().push_back(failure);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Push requests observed so far.
    pub fn pushed_requests(&self) -> Vec<PushRequest> {
        self.pushed.lock().clone()
    }
}

impl SyncTransport for MockTransport {
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        if let Some(failure) = self.push_failures.lock().pop_front() {
            return Err(failure.to_error());
        }
        self.pushed.lock().push(request.clone());
        self.push_response
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Protocol("no mock push response set".into()))
    }

    fn pull(&self, _request: &PullRequest) -> SyncResult<PullResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        if let Some(failure) = self.pull_failures.lock().pop_front() {
            return Err(failure.to_error());
        }
        self.pull_response
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Protocol("no mock pull response set".into()))
    }

    fn resolve(&self, _request: &ResolveRequest) -> SyncResult<ResolveResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.resolve_response
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Protocol("no mock resolve response set".into()))
    }

    fn status(&self, _branch_id: &str) -> SyncResult<StatusResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.status_response
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Protocol("no mock status response set".into()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
