//! Sync sessions and their state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of a sync round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    /// Complete per-table snapshot.
    Full,
    /// Only records newer than the last sync timestamp.
    Incremental,
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncKind::Full => write!(f, "full"),
            SyncKind::Incremental => write!(f, "incremental"),
        }
    }
}

/// State of a sync session.
///
/// The happy path runs `Idle → Pushing → IntegrityCheck → ConflictCheck →
/// (AutoResolved | AwaitingManual) → Pulling → Applying → Completed`;
/// failures exit to `OfflineAborted`, `IntegrityFailure`, or
/// `ExceededRetries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session active.
    Idle,
    /// Sending local changes.
    Pushing,
    /// Awaiting checksum verification by the counterpart.
    IntegrityCheck,
    /// Processing conflicts returned by the counterpart.
    ConflictCheck,
    /// All conflicts converged automatically.
    AutoResolved,
    /// Some conflicts await manual resolution.
    AwaitingManual,
    /// Fetching the counterpart's delta.
    Pulling,
    /// Applying the delta through entity adapters.
    Applying,
    /// Session finished.
    Completed,
    /// Connectivity lost; affected changes parked as pending.
    OfflineAborted,
    /// Checksum mismatch; the batch was rejected as a unit.
    IntegrityFailure,
    /// Retry budget exhausted.
    ExceededRetries,
}

impl SessionState {
    /// True while the session occupies the single-flight slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Pushing
                | SessionState::IntegrityCheck
                | SessionState::ConflictCheck
                | SessionState::AutoResolved
                | SessionState::AwaitingManual
                | SessionState::Pulling
                | SessionState::Applying
        )
    }

    /// True once the session has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::OfflineAborted
                | SessionState::IntegrityFailure
                | SessionState::ExceededRetries
        )
    }

    /// True for the failure exits.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SessionState::OfflineAborted
                | SessionState::IntegrityFailure
                | SessionState::ExceededRetries
        )
    }

    /// Coarse numeric progress for status surfaces, 0–100.
    pub fn progress(&self) -> u8 {
        match self {
            SessionState::Idle => 0,
            SessionState::Pushing => 15,
            SessionState::IntegrityCheck => 30,
            SessionState::ConflictCheck => 45,
            SessionState::AutoResolved | SessionState::AwaitingManual => 55,
            SessionState::Pulling => 70,
            SessionState::Applying => 85,
            SessionState::Completed => 100,
            SessionState::OfflineAborted
            | SessionState::IntegrityFailure
            | SessionState::ExceededRetries => 100,
        }
    }
}

/// One push-or-pull round trip between a branch and the authority.
/// Exists for the duration of the round trip and is not retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSession {
    /// Session identifier.
    pub session_id: Uuid,
    /// Branch running the session.
    pub branch_id: String,
    /// Snapshot kind.
    pub kind: SyncKind,
    /// Epoch milliseconds at session start.
    pub started_at: u64,
    /// Lower bound of the pull window, if incremental.
    pub since_timestamp: Option<u64>,
    /// Checksum of the last transmitted batch, once computed.
    pub checksum: Option<String>,
    /// Current state.
    pub state: SessionState,
}

impl SyncSession {
    /// Opens a new session.
    pub fn begin(
        branch_id: impl Into<String>,
        kind: SyncKind,
        since_timestamp: Option<u64>,
        started_at: u64,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            branch_id: branch_id.into(),
            kind,
            started_at,
            since_timestamp,
            checksum: None,
            state: SessionState::Idle,
        }
    }

    /// Moves the session to a new state.
    pub fn advance(&mut self, state: SessionState) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_predicates() {
        assert!(SessionState::Pushing.is_active());
        assert!(SessionState::Applying.is_active());
        assert!(!SessionState::Idle.is_active());
        assert!(!SessionState::Completed.is_active());

        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::IntegrityFailure.is_terminal());
        assert!(SessionState::IntegrityFailure.is_failure());
        assert!(!SessionState::Completed.is_failure());
    }

    #[test]
    fn progress_is_monotonic_on_happy_path() {
        let path = [
            SessionState::Idle,
            SessionState::Pushing,
            SessionState::IntegrityCheck,
            SessionState::ConflictCheck,
            SessionState::AutoResolved,
            SessionState::Pulling,
            SessionState::Applying,
            SessionState::Completed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].progress() < pair[1].progress());
        }
    }

    #[test]
    fn session_lifecycle() {
        let mut session = SyncSession::begin("br-1", SyncKind::Incremental, Some(5_000), 6_000);
        assert_eq!(session.state, SessionState::Idle);
        assert_eq!(session.since_timestamp, Some(5_000));

        session.advance(SessionState::Pushing);
        assert!(session.state.is_active());

        session.advance(SessionState::Completed);
        assert!(session.state.is_terminal());
    }

    #[test]
    fn sessions_get_unique_ids() {
        let a = SyncSession::begin("br-1", SyncKind::Full, None, 0);
        let b = SyncSession::begin("br-1", SyncKind::Full, None, 0);
        assert_ne!(a.session_id, b.session_id);
    }
}
