//! HTTP transport implementation.
//!
//! The actual HTTP client is abstracted behind a trait so different
//! libraries (reqwest, ureq, a loopback for tests) can carry the JSON
//! bodies. Status codes map onto the error taxonomy: 401/403 is an auth
//! failure, 422 an integrity rejection, anything else non-2xx a protocol
//! error.

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use branchsync_protocol::{
    PullRequest, PullResponse, PushRequest, PushResponse, ResolveRequest, ResolveResponse,
    StatusResponse,
};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// A plain HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body text.
    pub body: String,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// HTTP client abstraction.
pub trait HttpClient: Send + Sync {
    /// Sends a POST with a JSON body.
    fn post(&self, url: &str, body: &str, bearer: Option<&str>) -> Result<HttpResponse, String>;

    /// Sends a GET.
    fn get(&self, url: &str, bearer: Option<&str>) -> Result<HttpResponse, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// Error body returned by the authority on rejections.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error message.
    pub error: String,
    /// Declared checksum, on integrity rejections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    /// Recomputed checksum, on integrity rejections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

/// HTTP-based sync transport speaking the JSON wire protocol.
pub struct HttpTransport<C: HttpClient> {
    base_url: String,
    auth_token: Option<String>,
    client: C,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport for the given authority base URL.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            client,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Sets the bearer token presented on every request.
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last transport error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn bearer(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    fn handle_response<Res: DeserializeOwned>(&self, response: HttpResponse) -> SyncResult<Res> {
        match response.status {
            200..=299 => serde_json::from_str(&response.body)
                .map_err(|e| SyncError::Protocol(format!("failed to decode response: {e}"))),
            401 | 403 => {
                let body: Option<ErrorBody> = serde_json::from_str(&response.body).ok();
                Err(SyncError::Auth(
                    body.map(|b| b.error)
                        .unwrap_or_else(|| "token rejected".to_string()),
                ))
            }
            422 => {
                let body: Option<ErrorBody> = serde_json::from_str(&response.body).ok();
                let (expected, actual) = body
                    .map(|b| {
                        (
                            b.expected.unwrap_or_else(|| "unknown".into()),
                            b.actual.unwrap_or_else(|| "unknown".into()),
                        )
                    })
                    .unwrap_or_else(|| ("unknown".into(), "unknown".into()));
                Err(SyncError::Integrity { expected, actual })
            }
            status => Err(SyncError::Protocol(format!(
                "unexpected status {status}: {}",
                response.body
            ))),
        }
    }

    fn post_json<Req: Serialize, Res: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: &Req,
    ) -> SyncResult<Res> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let body = serde_json::to_string(request)
            .map_err(|e| SyncError::Protocol(format!("failed to encode request: {e}")))?;
        let url = format!("{}{}", self.base_url, endpoint);

        let response = self.client.post(&url, &body, self.bearer()).map_err(|e| {
            *self.last_error.write() = Some(e.clone());
            self.connected.store(false, Ordering::SeqCst);
            SyncError::network_retryable(e)
        })?;

        *self.last_error.write() = None;
        self.handle_response(response)
    }

    fn get_json<Res: DeserializeOwned>(&self, path_and_query: &str) -> SyncResult<Res> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }

        let url = format!("{}{}", self.base_url, path_and_query);
        let response = self.client.get(&url, self.bearer()).map_err(|e| {
            *self.last_error.write() = Some(e.clone());
            self.connected.store(false, Ordering::SeqCst);
            SyncError::network_retryable(e)
        })?;

        *self.last_error.write() = None;
        self.handle_response(response)
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.post_json("/sync/push", request)
    }

    fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        let mut path = format!("/sync/pull?branchId={}", request.branch_id);
        if let Some(since) = request.since {
            path.push_str(&format!("&since={since}"));
        }
        self.get_json(&path)
    }

    fn resolve(&self, request: &ResolveRequest) -> SyncResult<ResolveResponse> {
        self.post_json("/sync/resolve-conflicts", request)
    }

    fn status(&self, branch_id: &str) -> SyncResult<StatusResponse> {
        self.get_json(&format!("/sync/status?branchId={branch_id}"))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Trait for authorities that can serve loopback requests in-process.
pub trait LoopbackAuthority: Send + Sync {
    /// Handles a POST request.
    fn handle_post(&self, path: &str, body: &str, bearer: Option<&str>) -> HttpResponse;

    /// Handles a GET request.
    fn handle_get(&self, path_and_query: &str, bearer: Option<&str>) -> HttpResponse;
}

/// An HTTP client that routes requests directly to an in-process
/// authority. Useful for tests without network overhead.
pub struct LoopbackClient<S: LoopbackAuthority> {
    authority: S,
}

impl<S: LoopbackAuthority> LoopbackClient<S> {
    /// Creates a loopback client for the given authority.
    pub fn new(authority: S) -> Self {
        Self { authority }
    }
}

fn strip_base(url: &str) -> &str {
    url.find("/sync/").map(|i| &url[i..]).unwrap_or(url)
}

impl<S: LoopbackAuthority> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, body: &str, bearer: Option<&str>) -> Result<HttpResponse, String> {
        Ok(self.authority.handle_post(strip_base(url), body, bearer))
    }

    fn get(&self, url: &str, bearer: Option<&str>) -> Result<HttpResponse, String> {
        Ok(self.authority.handle_get(strip_base(url), bearer))
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
