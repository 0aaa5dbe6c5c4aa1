//! Integration tests wiring a branch engine to a real authority through
//! the JSON loopback transport.

use branchsync_engine::{
    AdapterRegistry, EntitySyncAdapter, HttpClient, HttpResponse, HttpTransport,
    LoopbackAuthority, LoopbackClient, MemoryAdapter, SyncConfig, SyncError, SyncOrchestrator,
    SyncTransport,
};
use branchsync_protocol::{
    ChangeKey, ChangeRecord, EntityPolicy, MergeRule, PullRequest, PushRequest,
    ResolutionPolicy, ResolutionStrategy, ResolveRequest, SessionState,
};
use branchsync_server::{ServerConfig, SyncAuthority};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Routes engine HTTP calls into an in-process authority.
struct AuthorityEndpoint {
    authority: Arc<SyncAuthority>,
}

fn respond<T: serde::Serialize>(
    result: Result<T, branchsync_server::ServerError>,
) -> HttpResponse {
    match result {
        Ok(value) => HttpResponse::new(
            200,
            serde_json::to_string(&value).expect("response serializes"),
        ),
        Err(e) => HttpResponse::new(e.http_status(), e.error_body().to_string()),
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

impl LoopbackAuthority for AuthorityEndpoint {
    fn handle_post(&self, path: &str, body: &str, bearer: Option<&str>) -> HttpResponse {
        match path {
            "/sync/push" => match serde_json::from_str::<PushRequest>(body) {
                Ok(request) => respond(self.authority.handle_push(&request, bearer)),
                Err(e) => HttpResponse::new(400, json!({ "error": e.to_string() }).to_string()),
            },
            "/sync/resolve-conflicts" => match serde_json::from_str::<ResolveRequest>(body) {
                Ok(request) => respond(self.authority.handle_resolve(&request, bearer)),
                Err(e) => HttpResponse::new(400, json!({ "error": e.to_string() }).to_string()),
            },
            _ => HttpResponse::new(404, json!({ "error": "not found" }).to_string()),
        }
    }

    fn handle_get(&self, path_and_query: &str, bearer: Option<&str>) -> HttpResponse {
        let (path, query) = path_and_query
            .split_once('?')
            .unwrap_or((path_and_query, ""));
        let branch_id = query_param(query, "branchId").unwrap_or_default();

        match path {
            "/sync/pull" => {
                let request = match query_param(query, "since").and_then(|s| s.parse().ok()) {
                    Some(since) => PullRequest::incremental(&branch_id, since),
                    None => PullRequest::full(&branch_id),
                };
                respond(self.authority.handle_pull(&request, bearer))
            }
            "/sync/status" => respond(self.authority.handle_status(&branch_id, bearer)),
            _ => HttpResponse::new(404, json!({ "error": "not found" }).to_string()),
        }
    }
}

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
        .entity(
            "category",
            EntityPolicy::new(ResolutionStrategy::ClientWins).key_field("name"),
        )
        .entity(
            "supplier",
            EntityPolicy::new(ResolutionStrategy::ServerWins).key_field("name"),
        )
        .entity("invoice", EntityPolicy::new(ResolutionStrategy::Manual))
}

struct Branch {
    orchestrator: Arc<SyncOrchestrator>,
    products: Arc<MemoryAdapter>,
    categories: Arc<MemoryAdapter>,
    suppliers: Arc<MemoryAdapter>,
    invoices: Arc<MemoryAdapter>,
}

fn branch_with_transport(
    branch_id: &str,
    transport: Arc<dyn SyncTransport>,
) -> Branch {
    let registry = Arc::new(AdapterRegistry::new());
    let products = Arc::new(MemoryAdapter::new("product"));
    let categories = Arc::new(MemoryAdapter::new("category"));
    let suppliers = Arc::new(MemoryAdapter::new("supplier"));
    let invoices = Arc::new(MemoryAdapter::new("invoice"));
    registry.register("product", Arc::clone(&products) as Arc<dyn EntitySyncAdapter>);
    registry.register(
        "category",
        Arc::clone(&categories) as Arc<dyn EntitySyncAdapter>,
    );
    registry.register(
        "supplier",
        Arc::clone(&suppliers) as Arc<dyn EntitySyncAdapter>,
    );
    registry.register("invoice", Arc::clone(&invoices) as Arc<dyn EntitySyncAdapter>);

    let config = SyncConfig::new(branch_id, "http://authority")
        .with_resolver_pause(Duration::ZERO);
    let orchestrator = Arc::new(
        SyncOrchestrator::new(config, policy(), registry, transport).expect("valid policy"),
    );

    Branch {
        orchestrator,
        products,
        categories,
        suppliers,
        invoices,
    }
}

fn branch(branch_id: &str, authority: &Arc<SyncAuthority>) -> Branch {
    let endpoint = AuthorityEndpoint {
        authority: Arc::clone(authority),
    };
    let transport = HttpTransport::new("http://authority", LoopbackClient::new(endpoint));
    branch_with_transport(branch_id, Arc::new(transport))
}

fn authority() -> Arc<SyncAuthority> {
    Arc::new(SyncAuthority::with_policy(ServerConfig::default(), policy()).expect("valid policy"))
}

#[test]
fn branch_and_authority_exchange_changes() {
    init_tracing();
    let authority = authority();
    let br1 = branch("br-1", &authority);
    let br2 = branch("br-2", &authority);

    br1.products.add_pending(ChangeRecord::create(
        "product",
        "p-1",
        json!({"price": 10, "stock": 5, "name": "Widget"}),
        1,
        1_000,
        "br-1",
    ));

    let report = br1.orchestrator.synchronize_all().unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.state, SessionState::Completed);
    assert_eq!(authority.store().row_count(), 1);

    // The second branch pulls a full snapshot and sees the record.
    let report = br2.orchestrator.synchronize_all().unwrap();
    assert_eq!(report.pulled, 1);
    let seen = br2.products.applied("p-1").unwrap();
    assert_eq!(seen.field("name"), Some(&json!("Widget")));

    // Both sessions were audited: br-1 pushed and pulled, br-2 pulled.
    let metrics = authority.metrics();
    assert_eq!(metrics.total, 3);
    assert_eq!(metrics.by_branch["br-1"], 2);
    assert_eq!(metrics.by_branch["br-2"], 1);
}

// Scenario A: branch edits the price offline while the authority moves
// stock; both are key fields, so a data conflict converges through the
// field-merge table (price=newest, stock=sum).
#[test]
fn offline_price_edit_merges_with_remote_stock_movement() {
    init_tracing();
    let authority = authority();
    let br = branch("br-1", &authority);

    authority.store().seed(ChangeRecord::update(
        "product",
        "p-1",
        json!({"price": 100, "stock": 9}),
        7,
        1_500,
        "hq",
    ));

    // Built on version 5, price edited, stock field carrying the local
    // delta accumulated offline.
    br.products.add_pending(ChangeRecord::update(
        "product",
        "p-1",
        json!({"price": 120, "stock": -2}),
        6,
        2_000,
        "br-1",
    ));

    let report = br.orchestrator.synchronize_all().unwrap();
    assert_eq!(report.state, SessionState::Completed);

    let row = authority
        .store()
        .get(&ChangeKey::new("product", "p-1"))
        .unwrap();
    assert_eq!(row.version, 8);
    assert_eq!(row.field("price"), Some(&json!(120)));
    assert_eq!(row.field("stock"), Some(&json!(7)));

    // The branch pulled the converged record back.
    let local = br.products.applied("p-1").unwrap();
    assert_eq!(local.version, 8);
    assert_eq!(local.field("price"), Some(&json!(120)));
    assert_eq!(local.field("stock"), Some(&json!(7)));

    // The resolution survives as an audit row.
    assert!(authority.audit().resolutions().iter().any(|r| r.success));
}

// Scenario B, client-wins: a local deletion beats a remote modification
// and propagates to the authority.
#[test]
fn client_wins_propagates_local_deletion() {
    init_tracing();
    let authority = authority();
    let br = branch("br-1", &authority);

    authority.store().seed(ChangeRecord::update(
        "category",
        "c-1",
        json!({"name": "Beverages (renamed)"}),
        7,
        1_500,
        "hq",
    ));
    br.categories
        .add_pending(ChangeRecord::delete("category", "c-1", 6, 2_000, "br-1"));

    br.orchestrator.synchronize_all().unwrap();

    let row = authority
        .store()
        .get(&ChangeKey::new("category", "c-1"))
        .unwrap();
    assert!(row.is_delete());
    assert_eq!(row.version, 8);
}

// Scenario B, server-wins: the remote modification survives and the
// local deletion marker is cleared.
#[test]
fn server_wins_restores_remotely_modified_entity() {
    init_tracing();
    let authority = authority();
    let br = branch("br-1", &authority);

    authority.store().seed(ChangeRecord::update(
        "supplier",
        "s-1",
        json!({"name": "Acme Wholesale"}),
        7,
        1_500,
        "hq",
    ));
    br.suppliers
        .add_pending(ChangeRecord::delete("supplier", "s-1", 6, 2_000, "br-1"));

    br.orchestrator.synchronize_all().unwrap();

    // The authority kept its copy (re-versioned by the convergence).
    let row = authority
        .store()
        .get(&ChangeKey::new("supplier", "s-1"))
        .unwrap();
    assert!(!row.is_delete());
    assert_eq!(row.field("name"), Some(&json!("Acme Wholesale")));
    assert!(row.version > 7);

    // The branch restored the entity and cleared its deletion marker.
    let local = br.suppliers.applied("s-1").unwrap();
    assert!(!local.is_delete());
    assert_eq!(local.field("name"), Some(&json!("Acme Wholesale")));
    assert!(br.suppliers.collect_pending().unwrap().is_empty());
}

// Scenario C: a byte mutated in transit fails the checksum; the whole
// batch is rejected, nothing is marked synced, and the changes stay in
// the pending store.
#[test]
fn corrupted_push_keeps_batch_pending() {
    init_tracing();
    let authority = authority();

    struct CorruptingClient<C> {
        inner: C,
    }
    impl<C: HttpClient> HttpClient for CorruptingClient<C> {
        fn post(
            &self,
            url: &str,
            body: &str,
            bearer: Option<&str>,
        ) -> Result<HttpResponse, String> {
            let tampered = if url.contains("/sync/push") {
                body.replacen("120", "121", 1)
            } else {
                body.to_string()
            };
            self.inner.post(url, &tampered, bearer)
        }
        fn get(&self, url: &str, bearer: Option<&str>) -> Result<HttpResponse, String> {
            self.inner.get(url, bearer)
        }
        fn is_healthy(&self) -> bool {
            self.inner.is_healthy()
        }
    }

    let endpoint = AuthorityEndpoint {
        authority: Arc::clone(&authority),
    };
    let transport = HttpTransport::new(
        "http://authority",
        CorruptingClient {
            inner: LoopbackClient::new(endpoint),
        },
    );
    let br = branch_with_transport("br-1", Arc::new(transport));

    br.products.add_pending(ChangeRecord::update(
        "product",
        "p-1",
        json!({"price": 120, "stock": 1}),
        3,
        1_000,
        "br-1",
    ));

    let err = br.orchestrator.synchronize_all().unwrap_err();
    assert!(matches!(err, SyncError::Integrity { .. }));

    let status = br.orchestrator.status();
    assert_eq!(status.state, SessionState::IntegrityFailure);
    assert_eq!(status.last_sync, None);
    assert_eq!(status.pending, 1);

    // Nothing landed on the authority.
    assert_eq!(authority.store().row_count(), 0);
}

// Scenario D: one record keeps failing local application; after
// max_retries it is reported as permanently failed while unrelated
// records synced normally.
#[test]
fn poisoned_record_fails_permanently_without_blocking_others() {
    init_tracing();
    let authority = authority();
    let br = branch("br-1", &authority);

    authority.store().seed(ChangeRecord::update(
        "product",
        "p-ok",
        json!({"price": 10, "stock": 1}),
        1,
        1_000,
        "hq",
    ));
    authority.store().seed(ChangeRecord::update(
        "product",
        "p-bad",
        json!({"price": 20, "stock": 2}),
        1,
        1_100,
        "hq",
    ));
    br.products.poison("p-bad");

    // Cycle 1: p-ok applies, p-bad is parked (first retry happens in the
    // post-batch sweep).
    br.orchestrator.synchronize_all().unwrap();
    assert!(br.products.applied("p-ok").is_some());
    assert!(br.products.applied("p-bad").is_none());
    assert_eq!(br.orchestrator.status().pending, 1);

    // Two more failing sweeps exhaust max_retries = 3.
    br.orchestrator.synchronize_all().unwrap();
    br.orchestrator.synchronize_all().unwrap();

    let status = br.orchestrator.status();
    assert_eq!(status.pending, 0);
    assert_eq!(status.permanently_failed, 1);
    assert!(br
        .orchestrator
        .pending()
        .failed_keys()
        .contains(&ChangeKey::new("product", "p-bad")));

    // The failure was surfaced as an operator event, not dropped.
    let events = br.orchestrator.pending().drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        branchsync_engine::PendingEvent::PermanentFailure { retries: 3, .. }
    )));
}

// Manual-resolution ticket flow: the conflict parks the entity, an
// external decision converges it, and the next session propagates the
// converged record to the authority.
#[test]
fn manual_ticket_roundtrip() {
    init_tracing();
    let authority = authority();
    let br = branch("br-1", &authority);

    authority.store().seed(ChangeRecord::update(
        "invoice",
        "i-1",
        json!({"total": 450}),
        4,
        1_500,
        "hq",
    ));
    br.invoices.add_pending(ChangeRecord::update(
        "invoice",
        "i-1",
        json!({"total": 475}),
        3,
        2_000,
        "br-1",
    ));

    let report = br.orchestrator.synchronize_all().unwrap();
    assert_eq!(report.tickets.len(), 1);
    assert_eq!(report.state, SessionState::Completed);

    // Authority row untouched while the ticket is open.
    assert_eq!(
        authority
            .store()
            .get(&ChangeKey::new("invoice", "i-1"))
            .unwrap()
            .version,
        4
    );

    let tickets = br.orchestrator.resolver().pending_tickets();
    assert_eq!(tickets.len(), 1);
    let converged = br
        .orchestrator
        .submit_ticket_resolution(tickets[0].ticket_id, ResolutionStrategy::ClientWins)
        .unwrap();
    assert_eq!(converged.version, 5);
    assert_eq!(converged.field("total"), Some(&json!(475)));

    // Next session pushes the converged record.
    br.orchestrator.synchronize_all().unwrap();
    let row = authority
        .store()
        .get(&ChangeKey::new("invoice", "i-1"))
        .unwrap();
    assert_eq!(row.version, 5);
    assert_eq!(row.field("total"), Some(&json!(475)));
}

#[test]
fn bearer_tokens_gate_the_authority() {
    init_tracing();
    let authority = Arc::new(
        SyncAuthority::with_policy(
            ServerConfig::default().with_auth(b"shared-secret".to_vec()),
            policy(),
        )
        .unwrap(),
    );

    // A branch without a token is refused.
    let unauthenticated = branch("br-1", &authority);
    unauthenticated.products.add_pending(ChangeRecord::create(
        "product",
        "p-1",
        json!({"price": 1, "stock": 1}),
        1,
        100,
        "br-1",
    ));
    let err = unauthenticated.orchestrator.synchronize_all().unwrap_err();
    assert!(matches!(err, SyncError::Auth(_)));

    // With an issued token the same sync succeeds.
    let endpoint = AuthorityEndpoint {
        authority: Arc::clone(&authority),
    };
    let token = authority.issue_token("br-2").unwrap();
    let transport = HttpTransport::new("http://authority", LoopbackClient::new(endpoint))
        .with_auth_token(token);
    let br = branch_with_transport("br-2", Arc::new(transport));
    br.products.add_pending(ChangeRecord::create(
        "product",
        "p-2",
        json!({"price": 2, "stock": 1}),
        1,
        200,
        "br-2",
    ));

    let report = br.orchestrator.synchronize_all().unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(authority.store().row_count(), 1);
}

#[test]
fn incremental_pull_only_carries_new_records() {
    init_tracing();
    let authority = authority();
    let br = branch("br-1", &authority);

    authority.store().seed(ChangeRecord::update(
        "product",
        "p-1",
        json!({"price": 1, "stock": 1}),
        1,
        1_000,
        "hq",
    ));

    let report = br.orchestrator.synchronize_all().unwrap();
    assert_eq!(report.pulled, 1);

    // Nothing new on the authority: the incremental pull is empty.
    let report = br.orchestrator.synchronize_all().unwrap();
    assert_eq!(report.pulled, 0);

    // A newer record appears; only it is pulled.
    authority.store().seed(ChangeRecord::update(
        "product",
        "p-2",
        json!({"price": 2, "stock": 1}),
        1,
        2_000,
        "hq",
    ));
    let report = br.orchestrator.synchronize_all().unwrap();
    assert_eq!(report.pulled, 1);
    assert!(br.products.applied("p-2").is_some());
}

#[test]
fn resolve_endpoint_roundtrip() {
    init_tracing();
    let authority = authority();

    authority.store().seed(ChangeRecord::update(
        "invoice",
        "i-1",
        json!({"total": 450}),
        4,
        1_500,
        "hq",
    ));

    let conflict = branchsync_protocol::Conflict::new(
        branchsync_protocol::ConflictKind::Data,
        Some(ChangeRecord::update(
            "invoice",
            "i-1",
            json!({"total": 475}),
            3,
            2_000,
            "br-1",
        )),
        authority.store().get(&ChangeKey::new("invoice", "i-1")),
    );

    let endpoint = AuthorityEndpoint {
        authority: Arc::clone(&authority),
    };
    let transport = HttpTransport::new("http://authority", LoopbackClient::new(endpoint));
    let response = transport
        .resolve(&ResolveRequest {
            branch_id: "br-1".into(),
            conflicts: vec![conflict],
            resolution: ResolutionStrategy::ClientWins,
        })
        .unwrap();

    assert!(response.success);
    assert_eq!(response.resolved_count, 1);
    let row = authority
        .store()
        .get(&ChangeKey::new("invoice", "i-1"))
        .unwrap();
    assert_eq!(row.version, 5);
    assert_eq!(row.field("total"), Some(&json!(475)));
}

#[test]
fn authority_status_endpoint_reflects_sessions() {
    init_tracing();
    let authority = authority();
    let br = branch("br-1", &authority);

    br.orchestrator.synchronize_all().unwrap();

    let endpoint = AuthorityEndpoint {
        authority: Arc::clone(&authority),
    };
    let transport = HttpTransport::new("http://authority", LoopbackClient::new(endpoint));
    let status = transport.status("br-1").unwrap();
    assert!(!status.in_progress);
    assert!(status.last_sync.is_some());
    assert_eq!(status.pending_changes, 0);
}
