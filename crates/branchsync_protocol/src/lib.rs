//! # BranchSync Protocol
//!
//! Wire types, conflict model, and canonical JSON checksums for BranchSync.
//!
//! This crate provides:
//! - `ChangeRecord` for locally-originated mutations
//! - `Conflict` plus the resolution policy model
//! - Pure conflict detection and strategy application
//! - Request/response bodies for the sync endpoints
//! - Canonical JSON serialization and SHA-256 batch checksums
//!
//! This is a pure protocol crate with no I/O operations. Classification
//! and merging are deterministic functions so branch and authority can run
//! the same logic against their own copies.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod canonical;
mod conflict;
mod detect;
mod merge;
mod messages;
mod record;
mod session;

pub use canonical::{batch_checksum, canonical_json, canonical_record, tables_checksum, CodecError, CodecResult};
pub use conflict::{
    Conflict, ConflictKind, EntityPolicy, MergeRule, PolicyError, ResolutionPolicy,
    ResolutionStrategy,
};
pub use detect::{classify, detect, Classification, LocalRevision};
pub use merge::{
    merge_payloads, resolve_conflict, silent_merge, ResolutionOutcome, ResolvedChange, Winner,
};
pub use messages::{
    PullRequest, PullResponse, PushRequest, PushResponse, ResolveRequest, ResolveResponse,
    StatusResponse,
};
pub use record::{ChangeAction, ChangeKey, ChangeRecord};
pub use session::{SessionState, SyncKind, SyncSession};
