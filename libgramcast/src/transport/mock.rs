//! Scripted transport for tests and dry runs
//!
//! Available in all builds (not just `cfg(test)`) so integration tests and
//! downstream crates can drive the full pipeline without network access.
//!
//! Routes match on method and path, optionally narrowed by one request
//! parameter. Each route replays its replies in order and then keeps
//! repeating the last one. Requests that match no route get a 404 with a
//! Graph-style error payload.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use super::{ApiRequest, ApiResponse, GraphTransport, HttpMethod, TransportError};

#[derive(Debug, Clone)]
pub enum MockReply {
    Response(ApiResponse),
    Failure(TransportError),
}

impl MockReply {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        MockReply::Response(ApiResponse::new(status, body))
    }

    /// `200 {"id": id}`, the answer to create and publish calls
    pub fn id(id: &str) -> Self {
        Self::json(200, json!({ "id": id }))
    }

    /// `200 {"status_code": code}`, the answer to a container status check
    pub fn status(code: &str) -> Self {
        Self::json(200, json!({ "status_code": code, "status": code }))
    }

    pub fn permalink(url: &str) -> Self {
        Self::json(200, json!({ "permalink": url }))
    }

    /// A structured error payload
    pub fn api_error(http_status: u16, code: i64, subcode: Option<i64>, message: &str) -> Self {
        let mut error = json!({
            "message": message,
            "type": "OAuthException",
            "code": code,
            "fbtrace_id": "MOCKTRACE",
        });
        if let Some(subcode) = subcode {
            error["error_subcode"] = json!(subcode);
        }
        Self::json(http_status, json!({ "error": error }))
    }

    /// A rate-limit payload carrying an explicit `retry_after`
    pub fn rate_limited(http_status: u16, retry_after_secs: u64) -> Self {
        Self::json(
            http_status,
            json!({
                "error": {
                    "message": "Application request limit reached",
                    "code": 4,
                    "fbtrace_id": "MOCKTRACE",
                    "retry_after": retry_after_secs,
                }
            }),
        )
    }

    pub fn timeout() -> Self {
        MockReply::Failure(TransportError::Timeout("mock timeout".to_string()))
    }
}

#[derive(Debug)]
struct Route {
    method: HttpMethod,
    path: String,
    param: Option<(String, String)>,
    replies: VecDeque<MockReply>,
    last: Option<MockReply>,
}

impl Route {
    fn matches(&self, request: &ApiRequest) -> bool {
        if self.method != request.method || self.path != request.path {
            return false;
        }
        match &self.param {
            Some((key, value)) => request.get_param(key) == Some(value.as_str()),
            None => true,
        }
    }

    fn next_reply(&mut self) -> Option<MockReply> {
        match self.replies.pop_front() {
            Some(reply) => {
                self.last = Some(reply.clone());
                Some(reply)
            }
            None => self.last.clone(),
        }
    }
}

/// A call as the mock saw it
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub request: ApiRequest,
    /// Whether a non-empty access token accompanied the call
    pub authenticated: bool,
}

#[derive(Debug, Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply by `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Script replies for `method path`
    pub fn on(&self, method: HttpMethod, path: &str, replies: Vec<MockReply>) -> &Self {
        self.push_route(Route {
            method,
            path: path.to_string(),
            param: None,
            replies: replies.into(),
            last: None,
        });
        self
    }

    /// Script replies for `method path` when parameter `key` equals `value`
    ///
    /// Parameter routes take precedence over plain routes on the same path.
    pub fn on_param(
        &self,
        method: HttpMethod,
        path: &str,
        key: &str,
        value: &str,
        replies: Vec<MockReply>,
    ) -> &Self {
        self.push_route(Route {
            method,
            path: path.to_string(),
            param: Some((key.to_string(), value.to_string())),
            replies: replies.into(),
            last: None,
        });
        self
    }

    fn push_route(&self, route: Route) {
        self.routes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(route);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Requests sent to `method path`, in order
    pub fn requests_to(&self, method: HttpMethod, path: &str) -> Vec<ApiRequest> {
        self.calls()
            .into_iter()
            .filter(|c| c.request.method == method && c.request.path == path)
            .map(|c| c.request)
            .collect()
    }

    fn reply_for(&self, request: &ApiRequest) -> Option<MockReply> {
        let mut routes = self.routes.lock().unwrap_or_else(|p| p.into_inner());

        let specific = routes
            .iter()
            .position(|r| r.param.is_some() && r.matches(request));
        let index = specific.or_else(|| routes.iter().position(|r| r.param.is_none() && r.matches(request)))?;

        routes[index].next_reply()
    }
}

#[async_trait]
impl GraphTransport for MockTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        access_token: &SecretString,
    ) -> Result<ApiResponse, TransportError> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(RecordedCall {
                request: request.clone(),
                authenticated: !access_token.expose_secret().is_empty(),
            });

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.reply_for(request) {
            Some(MockReply::Response(response)) => Ok(response),
            Some(MockReply::Failure(error)) => Err(error),
            None => Ok(ApiResponse::new(
                404,
                json!({
                    "error": {
                        "message": format!("Unsupported {} request to {}", request.method, request.path),
                        "code": 100,
                        "fbtrace_id": "MOCKTRACE",
                    }
                }),
            )),
        }
    }
}
