//! Transport abstractions for quotacheck-runtime.
//!
//! This module defines the trait for signed request exchange with a
//! provider API and the connection configuration it is built from.
//!
//! ## Security
//!
//! Credentials are handled through the [`credentials`] module. See
//! [`Credentials`] for the redaction guarantees.

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::duration_str;
use crate::request::PreparedRequest;

pub mod credentials;
mod signer;

#[cfg(feature = "http")]
mod http;

pub use credentials::{CredentialSource, Credentials};
pub use signer::{RequestSigner, SigV4Signer, SigningError};

#[cfg(feature = "http")]
pub use http::{HttpTransport, HttpTransportFactory};

/// Errors from a transport exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    /// The provider answered with an error response.
    #[error("Provider returned HTTP {status}: {code}: {message}")]
    Provider {
        status: u16,
        code: String,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request signing failed: {0}")]
    Signing(String),

    #[error("Transport not configured: {0}")]
    NotConfigured(String),
}

impl TransportError {
    /// Provider error code, or a stand-in naming the failure kind.
    pub fn code(&self) -> &str {
        match self {
            TransportError::Provider { code, .. } => code,
            TransportError::HttpError(_) => "HttpError",
            TransportError::Timeout(_) => "Timeout",
            TransportError::Signing(_) => "SigningError",
            TransportError::NotConfigured(_) => "NotConfigured",
        }
    }

    /// Human-readable message without the code.
    pub fn message(&self) -> String {
        match self {
            TransportError::Provider { message, .. } => message.clone(),
            TransportError::HttpError(m)
            | TransportError::Signing(m)
            | TransportError::NotConfigured(m) => m.clone(),
            TransportError::Timeout(d) => format!("no response within {:?}", d),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Provider { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Delay the provider asked for before retrying, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::Provider { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Pass-through options for a single exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendOptions {
    /// Verify TLS certificates
    pub verify: bool,

    /// Request a streamed response body
    pub stream: bool,

    /// Proxy URLs, tried by the HTTP client
    pub proxies: Vec<String>,

    /// Per-request timeout
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            verify: true,
            stream: false,
            proxies: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// A successful provider response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: String,
    pub content_type: Option<String>,
}

impl ProviderResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            content_type: None,
        }
    }
}

/// Everything needed to reach one provider account in one region.
///
/// Built once from configuration and handed to the transport factory; no
/// credential or region state is read from the process after this point.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub region: String,
    pub credentials: Arc<Credentials>,

    /// Override for the standard endpoint URL
    pub endpoint_url: Option<String>,

    pub send: SendOptions,
}

impl ConnectionConfig {
    pub fn new(region: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            region: region.into(),
            credentials: Arc::new(credentials),
            endpoint_url: None,
            send: SendOptions::default(),
        }
    }

    pub fn with_endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    pub fn with_send_options(mut self, send: SendOptions) -> Self {
        self.send = send;
        self
    }
}

/// Signed request exchange with a provider.
///
/// Implementations return `Ok` only for success responses; every error
/// response becomes [`TransportError::Provider`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a signed request.
    async fn send(
        &self,
        request: &PreparedRequest,
        options: &SendOptions,
    ) -> Result<ProviderResponse, TransportError>;

    /// Transport name for logs.
    fn name(&self) -> &str;
}

/// Creates transport handles.
///
/// Each collection pass connects its own handle so passes never share
/// connection state.
pub trait TransportFactory: Send + Sync {
    /// Unique identifier for this transport type (e.g., "http").
    fn transport_type(&self) -> &'static str;

    /// Create a transport for a connection.
    fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Transport>, TransportError>;
}

lazy_static! {
    static ref XML_CODE: Regex = Regex::new(r"<Code>\s*([^<]+?)\s*</Code>").expect("valid code regex");
    static ref XML_MESSAGE: Regex =
        Regex::new(r"<Message>\s*([^<]*?)\s*</Message>").expect("valid message regex");
}

/// Extract `(code, message)` from a provider error body.
///
/// Handles the query-protocol XML envelope (`<Code>`/`<Message>`) and the
/// JSON protocols (`__type` / `code` with `message` / `Message`).
pub fn parse_error_body(body: &str) -> Option<(String, String)> {
    let trimmed = body.trim_start();

    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        let code = value
            .get("__type")
            .or_else(|| value.get("code"))
            .or_else(|| value.get("Code"))
            .and_then(|v| v.as_str())?;
        // "com.amazonaws.ec2#ThrottlingException" -> "ThrottlingException"
        let code = code.rsplit('#').next().unwrap_or(code);
        let message = value
            .get("message")
            .or_else(|| value.get("Message"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        return Some((code.to_string(), message.to_string()));
    }

    let code = XML_CODE.captures(body)?.get(1)?.as_str().to_string();
    let message = XML_MESSAGE
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();
    Some((code, message))
}

/// Parse a `Retry-After` header given in seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
