//! The sync authority facade.

use crate::audit::{AuditLog, AuditMetrics};
use crate::auth::{AuthConfig, HmacTokenVerifier, TokenVerifier};
use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::handler::RequestHandler;
use crate::store::AuthorityStore;
use branchsync_protocol::{
    PullRequest, PullResponse, PushRequest, PushResponse, ResolutionPolicy, ResolveRequest,
    ResolveResponse, StatusResponse,
};
use std::sync::Arc;

/// The central sync authority.
///
/// Validates identity, serves full/incremental snapshots, receives change
/// batches, converges conflicts against its authoritative copy, and
/// records audit events. Different branches are processed concurrently;
/// every row mutation goes through a version-checked write.
///
/// # Example
///
/// ```
/// use branchsync_server::{ServerConfig, SyncAuthority};
///
/// let authority = SyncAuthority::new(ServerConfig::default()).unwrap();
///
/// // In a deployment, HTTP endpoints route to authority.handle_push(),
/// // handle_pull(), handle_resolve(), and handle_status().
/// ```
pub struct SyncAuthority {
    handler: RequestHandler,
    store: Arc<AuthorityStore>,
    audit: Arc<AuditLog>,
    token_issuer: Option<HmacTokenVerifier>,
}

impl SyncAuthority {
    /// Creates an authority with the default resolution policy.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        Self::with_policy(config, ResolutionPolicy::default())
    }

    /// Creates an authority with an explicit resolution policy.
    pub fn with_policy(config: ServerConfig, policy: ResolutionPolicy) -> ServerResult<Self> {
        let store = Arc::new(AuthorityStore::new());
        let audit = Arc::new(AuditLog::new(config.audit_capacity));

        let token_issuer = config
            .auth_secret
            .clone()
            .map(|secret| HmacTokenVerifier::new(AuthConfig::new(secret)));
        let verifier = token_issuer
            .clone()
            .map(|v| Arc::new(v) as Arc<dyn TokenVerifier>);

        let handler = RequestHandler::new(
            config,
            Arc::clone(&store),
            Arc::clone(&audit),
            policy,
            verifier,
        )?;

        Ok(Self {
            handler,
            store,
            audit,
            token_issuer,
        })
    }

    /// Issues a bearer token for a branch, when auth is configured.
    pub fn issue_token(&self, branch_id: &str) -> Option<String> {
        self.token_issuer.as_ref().map(|v| v.issue(branch_id))
    }

    /// Receives a change batch from a branch.
    pub fn handle_push(
        &self,
        request: &PushRequest,
        token: Option<&str>,
    ) -> ServerResult<PushResponse> {
        self.handler.handle_push(request, token)
    }

    /// Serves a full snapshot or incremental delta.
    pub fn handle_pull(
        &self,
        request: &PullRequest,
        token: Option<&str>,
    ) -> ServerResult<PullResponse> {
        self.handler.handle_pull(request, token)
    }

    /// Applies externally-chosen resolutions.
    pub fn handle_resolve(
        &self,
        request: &ResolveRequest,
        token: Option<&str>,
    ) -> ServerResult<ResolveResponse> {
        self.handler.handle_resolve(request, token)
    }

    /// Reports per-branch sync status.
    pub fn handle_status(
        &self,
        branch_id: &str,
        token: Option<&str>,
    ) -> ServerResult<StatusResponse> {
        self.handler.handle_status(branch_id, token)
    }

    /// The authoritative store.
    pub fn store(&self) -> &Arc<AuthorityStore> {
        &self.store
    }

    /// The audit log.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Aggregated session metrics.
    pub fn metrics(&self) -> AuditMetrics {
        self.audit.metrics()
    }
}
