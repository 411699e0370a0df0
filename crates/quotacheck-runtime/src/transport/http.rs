//! HTTP transport over reqwest.

use async_trait::async_trait;
use std::sync::Arc;

use super::{
    parse_error_body, parse_retry_after, ConnectionConfig, ProviderResponse, SendOptions,
    Transport, TransportError, TransportFactory,
};
use crate::request::PreparedRequest;

/// Sends signed requests with a reqwest client.
///
/// TLS verification and proxies are fixed when the client is built; the
/// timeout is applied per request.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(options: &SendOptions) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(!options.verify)
            .timeout(options.timeout);

        for proxy in &options.proxies {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| TransportError::NotConfigured(format!("invalid proxy '{}': {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::NotConfigured(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &PreparedRequest,
        options: &SendOptions,
    ) -> Result<ProviderResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::HttpError(e.to_string()))?;

        let mut builder = self
            .client
            .request(method, request.url.clone())
            .timeout(options.timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(options.timeout)
            } else {
                TransportError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(options.timeout)
            } else {
                TransportError::HttpError(e.to_string())
            }
        })?;

        if !status.is_success() {
            let (code, message) = parse_error_body(&body).unwrap_or_else(|| {
                (
                    status.canonical_reason().unwrap_or("Unknown").replace(' ', ""),
                    body.chars().take(200).collect(),
                )
            });
            tracing::debug!(status = status.as_u16(), code = %code, "Provider error response");
            return Err(TransportError::Provider {
                status: status.as_u16(),
                code,
                message,
                retry_after,
            });
        }

        Ok(ProviderResponse {
            status: status.as_u16(),
            body,
            content_type,
        })
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Factory for [`HttpTransport`] handles.
pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn transport_type(&self) -> &'static str {
        "http"
    }

    fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(HttpTransport::new(&config.send)?))
    }
}
