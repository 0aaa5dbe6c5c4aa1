//! # BranchSync Server
//!
//! The central sync authority for BranchSync.
//!
//! This crate provides:
//! - Push ingestion with checksum verification
//! - Full and incremental snapshot serving
//! - Server-side conflict convergence against the authoritative copy
//! - Version-checked (compare-and-set) row writes
//! - Bearer-token authentication (HMAC-SHA256 tokens)
//! - An audit trail with `total / by_type / by_branch` metrics
//!
//! # Architecture
//!
//! The authority runs the same conflict detector and strategy application
//! as the branches (shared through `branchsync_protocol`), so both sides
//! converge on identical results for identical inputs. Per-record
//! failures are parked and retried on the branch's next push; only
//! integrity and auth failures reject a batch as a unit.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod audit;
mod auth;
mod config;
mod error;
mod handler;
mod server;
mod store;

pub use audit::{AuditEvent, AuditEventType, AuditLog, AuditMetrics, ResolutionRow};
pub use auth::{AuthConfig, HmacTokenVerifier, StaticTokenVerifier, TokenVerifier};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::RequestHandler;
pub use server::SyncAuthority;
pub use store::{AuthorityStore, BranchState, ParkedChange};
