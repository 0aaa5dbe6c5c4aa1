//! # BranchSync Engine
//!
//! Branch-side synchronization engine for BranchSync.
//!
//! This crate provides:
//! - The per-branch sync orchestrator and its session state machine
//! - The entity sync adapter registry
//! - The pending-change store with retry bookkeeping
//! - Conflict resolution with manual-resolution tickets
//! - Transport abstraction with an HTTP implementation
//!
//! ## Architecture
//!
//! The engine implements a **push-then-pull** synchronization model:
//! 1. Push local changes with an integrity checksum
//! 2. Resolve conflicts the authority reports back
//! 3. Pull the authority's delta and apply it through entity adapters
//!
//! ## Key Invariants
//!
//! - One in-flight session per branch; concurrent triggers are rejected
//!   immediately, never queued
//! - A pending change leaves the store only once its application is
//!   confirmed; exhausted retries park it visibly, never silently
//! - Resolutions produce a version strictly greater than both inputs
//! - Applying the same record twice never changes state the second time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod adapter;
mod config;
mod error;
mod http;
mod orchestrator;
mod pending;
mod resolver;
mod transport;

pub use adapter::{AdapterRegistry, ApplyReport, EntitySyncAdapter, MemoryAdapter};
pub use config::{now_millis, RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use http::{ErrorBody, HttpClient, HttpResponse, HttpTransport, LoopbackAuthority, LoopbackClient};
pub use orchestrator::{SyncOrchestrator, SyncReport, SyncStats, SyncStatus};
pub use pending::{PendingChange, PendingDirection, PendingEvent, PendingStore, SweepOutcome};
pub use resolver::{
    BatchResolution, ConflictResolver, ResolutionAttempt, ResolutionTicket, ResolverVerdict,
};
pub use transport::{MockFailure, MockTransport, SyncTransport};
