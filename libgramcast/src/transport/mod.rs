//! HTTP seam between the publish pipeline and the remote API
//!
//! The pipeline never talks to `reqwest` directly. It builds an
//! [`ApiRequest`] and hands it to a [`GraphTransport`]; the production
//! implementation is [`http::HttpTransport`], tests use
//! [`mock::MockTransport`].

use async_trait::async_trait;
use secrecy::SecretString;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod http;
pub mod mock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
        }
    }
}

/// An outbound call, without credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: HttpMethod,
    /// Path relative to the versioned API root, starting with `/`
    pub path: String,
    pub params: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Raw response: status, parsed body, and the `Retry-After` hint if any
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    /// `Value::Null` when the body was empty or not JSON
    pub body: serde_json::Value,
    pub retry_after: Option<Duration>,
}

impl ApiResponse {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            body,
            retry_after: None,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failures below the HTTP layer; always treated as transient
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Other(String),
}

#[async_trait]
pub trait GraphTransport: Send + Sync {
    /// Send one request, appending `access_token` as a parameter
    ///
    /// A non-2xx status is not an error at this layer; the caller inspects
    /// [`ApiResponse::status`] and the body.
    async fn send(
        &self,
        request: &ApiRequest,
        access_token: &SecretString,
    ) -> Result<ApiResponse, TransportError>;
}
