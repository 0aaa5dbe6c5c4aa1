//! Wire request/response bodies for the sync endpoints.
//!
//! Both sides serialize these with serde; checksums are computed over the
//! canonical serialization (see [`crate::canonical`]), which is a hard
//! compatibility requirement between branch and authority.

use crate::canonical::{batch_checksum, tables_checksum, CodecResult};
use crate::conflict::{Conflict, ResolutionStrategy};
use crate::record::ChangeRecord;
use crate::session::SyncKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of `POST /sync/push`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Originating branch.
    pub branch_id: String,
    /// Change batch.
    pub changes: Vec<ChangeRecord>,
    /// Epoch milliseconds at send time.
    pub timestamp: u64,
    /// Integrity checksum over `changes`.
    pub checksum: String,
}

impl PushRequest {
    /// Builds a push request, computing the batch checksum.
    pub fn new(
        branch_id: impl Into<String>,
        changes: Vec<ChangeRecord>,
        timestamp: u64,
    ) -> CodecResult<Self> {
        let checksum = batch_checksum(&changes)?;
        Ok(Self {
            branch_id: branch_id.into(),
            changes,
            timestamp,
            checksum,
        })
    }

    /// Recomputes the checksum over the carried changes and compares it
    /// with the declared one.
    pub fn verify_checksum(&self) -> CodecResult<bool> {
        Ok(batch_checksum(&self.changes)? == self.checksum)
    }
}

/// Body of the `POST /sync/push` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// Whether the batch was accepted.
    pub success: bool,
    /// Number of records durably applied.
    pub applied_count: u64,
    /// Conflicts the authority could not auto-resolve.
    pub conflicts: Vec<Conflict>,
    /// Error message when rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PushResponse {
    /// A fully-applied response.
    pub fn success(applied_count: u64) -> Self {
        Self {
            success: true,
            applied_count,
            conflicts: Vec::new(),
            error: None,
        }
    }

    /// An applied response carrying unresolved conflicts.
    pub fn with_conflicts(applied_count: u64, conflicts: Vec<Conflict>) -> Self {
        Self {
            success: true,
            applied_count,
            conflicts,
            error: None,
        }
    }

    /// A rejected response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            applied_count: 0,
            conflicts: Vec::new(),
            error: Some(message.into()),
        }
    }
}

/// Query of `GET /sync/pull`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Requesting branch.
    pub branch_id: String,
    /// Lower bound (exclusive) on `updated_at`; `None` requests a full
    /// snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
}

impl PullRequest {
    /// Requests a full snapshot.
    pub fn full(branch_id: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            since: None,
        }
    }

    /// Requests changes after `since`.
    pub fn incremental(branch_id: impl Into<String>, since: u64) -> Self {
        Self {
            branch_id: branch_id.into(),
            since: Some(since),
        }
    }
}

/// Body of the `GET /sync/pull` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    /// Snapshot kind.
    #[serde(rename = "type")]
    pub kind: SyncKind,
    /// Records grouped per entity type (table).
    #[serde(rename = "data")]
    pub tables: BTreeMap<String, Vec<ChangeRecord>>,
    /// Integrity checksum over all carried records.
    pub checksum: String,
    /// Highest `updated_at` carried; the branch's next `since`.
    pub last_timestamp: u64,
}

impl PullResponse {
    /// Builds a pull response, computing the checksum over all tables.
    pub fn new(
        kind: SyncKind,
        tables: BTreeMap<String, Vec<ChangeRecord>>,
        last_timestamp: u64,
    ) -> CodecResult<Self> {
        let checksum = tables_checksum(tables.values())?;
        Ok(Self {
            kind,
            tables,
            checksum,
            last_timestamp,
        })
    }

    /// Recomputes the checksum over the carried tables.
    pub fn verify_checksum(&self) -> CodecResult<bool> {
        Ok(tables_checksum(self.tables.values())? == self.checksum)
    }

    /// Total number of records across all tables.
    pub fn record_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// Flattens all tables into one record list.
    pub fn all_records(&self) -> Vec<ChangeRecord> {
        self.tables.values().flatten().cloned().collect()
    }
}

/// Body of `POST /sync/resolve-conflicts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    /// Submitting branch.
    pub branch_id: String,
    /// Conflicts to resolve.
    pub conflicts: Vec<Conflict>,
    /// Strategy to apply to every carried conflict.
    pub resolution: ResolutionStrategy,
}

/// Body of the `POST /sync/resolve-conflicts` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    /// Whether every conflict converged.
    pub success: bool,
    /// Number of conflicts resolved.
    pub resolved_count: u64,
}

/// Body of the `GET /sync/status` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Whether a session for the branch is currently active.
    pub in_progress: bool,
    /// Epoch milliseconds of the last completed sync.
    pub last_sync: Option<u64>,
    /// Kind of the last completed sync.
    pub last_sync_type: Option<SyncKind>,
    /// Changes parked for the branch awaiting re-application.
    pub pending_changes: u64,
}
