//! Canonical requests for "describe resources" calls.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use crate::transport::TransportError;

/// Wire protocol of a service API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Form-encoded `Action`/`Version` body (EC2, ELB, IAM, ...)
    #[default]
    Query,

    /// JSON 1.0 body; the value is the `X-Amz-Target` prefix
    /// (e.g., "DynamoDB_20120810")
    Json(String),
}

/// An API call that enumerates one kind of resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuery {
    /// Service endpoint prefix (e.g., "ec2")
    pub service: String,

    /// API action (e.g., "DescribeVpcs")
    pub action: String,

    /// API version (e.g., "2015-10-01")
    pub version: String,

    /// Extra request parameters
    #[serde(default)]
    pub params: BTreeMap<String, String>,

    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub protocol: Protocol,
}

impl ResourceQuery {
    pub fn new(
        service: impl Into<String>,
        action: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            action: action.into(),
            version: version.into(),
            params: BTreeMap::new(),
            protocol: Protocol::Query,
        }
    }

    /// The EC2 `DescribeVpcs` call.
    pub fn describe_vpcs() -> Self {
        Self::new("ec2", "DescribeVpcs", "2015-10-01")
    }

    /// Add a request parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Use the JSON protocol with the given target prefix.
    pub fn json(mut self, target_prefix: impl Into<String>) -> Self {
        self.protocol = Protocol::Json(target_prefix.into());
        self
    }

    /// Form-encoded body: `Action` and `Version` first, then parameters
    /// sorted by key.
    pub fn form_body(&self) -> String {
        let mut form = url::form_urlencoded::Serializer::new(String::new());
        form.append_pair("Action", &self.action);
        form.append_pair("Version", &self.version);
        for (key, value) in &self.params {
            form.append_pair(key, value);
        }
        form.finish()
    }

    /// JSON body: parameters as a flat object, `{}` when there are none.
    pub fn json_body(&self) -> String {
        serde_json::Value::Object(
            self.params
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
        .to_string()
    }
}

/// Where requests for one service in one region go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub service: String,
    pub region: String,
    pub url: Url,
}

impl Endpoint {
    /// Standard endpoint: `https://{service}.{region}.amazonaws.com/`.
    pub fn resolve(service: &str, region: &str) -> Result<Self, TransportError> {
        let raw = format!("https://{}.{}.amazonaws.com/", service, region);
        Self::with_url(service, region, &raw)
    }

    /// Endpoint at a custom URL (local emulators, private endpoints).
    pub fn with_url(service: &str, region: &str, url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::NotConfigured(format!("invalid endpoint '{}': {}", url, e)))?;
        if url.host_str().is_none() {
            return Err(TransportError::NotConfigured(format!(
                "endpoint '{}' has no host",
                url
            )));
        }

        Ok(Self {
            service: service.to_string(),
            region: region.to_string(),
            url,
        })
    }

    /// Value for the `Host` header.
    pub fn host(&self) -> String {
        match (self.url.host_str(), self.url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        }
    }
}

/// A fully built, not yet signed, HTTP request.
///
/// One canonical request is built per pass; every attempt signs its own
/// clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    pub method: String,
    pub url: Url,
    pub service: String,
    pub region: String,

    /// Header names as set; signing lowercases them
    pub headers: BTreeMap<String, String>,

    pub body: String,
}

impl PreparedRequest {
    /// Build the POST request for a query against an endpoint.
    pub fn build(query: &ResourceQuery, endpoint: &Endpoint) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Host".to_string(), endpoint.host());

        let body = match &query.protocol {
            Protocol::Query => {
                headers.insert(
                    "Content-Type".to_string(),
                    "application/x-www-form-urlencoded; charset=utf-8".to_string(),
                );
                query.form_body()
            }
            Protocol::Json(target_prefix) => {
                headers.insert("Content-Type".to_string(), "application/x-amz-json-1.0".to_string());
                headers.insert(
                    "X-Amz-Target".to_string(),
                    format!("{}.{}", target_prefix, query.action),
                );
                query.json_body()
            }
        };

        Self {
            method: "POST".to_string(),
            url: endpoint.url.clone(),
            service: endpoint.service.clone(),
            region: endpoint.region.clone(),
            headers,
            body,
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a header, replacing any existing one regardless of case.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
        self.headers.insert(name.to_string(), value.into());
    }
}
