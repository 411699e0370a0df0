//! Checker configuration.
//!
//! Loaded from YAML or JSON. Durations are written the humantime way
//! (`"250ms"`, `"20s"`, `"1m 30s"`).
//!
//! ```yaml
//! region: us-east-1
//! retry:
//!   max_attempts: 5
//!   min_delay: 100ms
//! thresholds:
//!   warning: 75
//!   critical: 90
//! limits:
//!   - name: VPCs
//!     service: ec2
//!     action: DescribeVpcs
//!     version: "2015-10-01"
//!     extract:
//!       xml_set: vpcSet
//!     quota: 5
//!   - name: DynamoDB tables
//!     service: dynamodb
//!     action: ListTables
//!     version: "2012-08-10"
//!     protocol:
//!       json: DynamoDB_20120810
//!     extract:
//!       json_array: /TableNames
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use quotacheck_core::{JsonArrayCounter, Limit, Thresholds, UsageExtractor, XmlSetCounter};

use crate::collector::{Catalog, LimitSpec};
use crate::request::{Protocol, ResourceQuery};
use crate::resilience::RetryConfig;
use crate::transport::credentials::{resolve_region, CredentialsConfig};
use crate::transport::{ConnectionConfig, Credentials, SendOptions, TransportError};

/// Errors from loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config validation failed: {0}")]
    ValidationError(String),

    #[error("Connection settings incomplete: {0}")]
    Connection(#[from] TransportError),
}

/// How a limit's count is read from the response payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractConfig {
    /// Direct `<item>` children of the named XML set
    XmlSet(String),

    /// Array at a JSON pointer
    JsonArray(String),
}

impl ExtractConfig {
    pub fn build(&self) -> Arc<dyn UsageExtractor> {
        match self {
            ExtractConfig::XmlSet(set) => Arc::new(XmlSetCounter::new(set.clone())),
            ExtractConfig::JsonArray(pointer) => Arc::new(JsonArrayCounter::new(pointer.clone())),
        }
    }
}

/// One tracked limit and the call that measures it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    pub name: String,
    pub service: String,
    pub action: String,
    pub version: String,

    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// Wire protocol; `query` unless set to `{ json: <target prefix> }`
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub protocol: Protocol,

    #[serde(with = "serde_yaml::with::singleton_map")]
    pub extract: ExtractConfig,

    /// Provider-side quota
    #[serde(default)]
    pub quota: Option<u64>,
}

/// Client-side request rate per service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightConfig {
    pub requests_per_second: f64,

    #[serde(default = "default_burst")]
    pub burst: u32,
}

fn default_burst() -> u32 {
    1
}

fn default_concurrency() -> usize {
    4
}

/// Top-level checker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckerConfig {
    /// Region; falls back to `AWS_REGION` / `AWS_DEFAULT_REGION`
    #[serde(default)]
    pub region: Option<String>,

    /// Override for the standard endpoint URL
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Credentials; fall back to the `AWS_*` environment variables
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub send: SendOptions,

    #[serde(default)]
    pub thresholds: Thresholds,

    /// Abandon a pass that runs longer than this
    #[serde(default, deserialize_with = "duration_str::option::deserialize")]
    pub pass_timeout: Option<Duration>,

    /// Passes allowed to run at once
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,

    #[serde(default)]
    pub preflight: Option<PreflightConfig>,

    pub limits: Vec<LimitConfig>,
}

impl CheckerConfig {
    /// Parse and validate a YAML config.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file; `.json` is parsed as JSON, anything else as YAML.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.is_empty() {
            return Err(ConfigError::ValidationError("no limits configured".to_string()));
        }

        let mut seen = BTreeSet::new();
        for limit in &self.limits {
            if limit.name.trim().is_empty() {
                return Err(ConfigError::ValidationError("limit with empty name".to_string()));
            }
            if !seen.insert(limit.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate limit name '{}'",
                    limit.name
                )));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.min_delay > self.retry.max_delay {
            return Err(ConfigError::ValidationError(
                "retry.min_delay must not exceed retry.max_delay".to_string(),
            ));
        }

        let Thresholds { warning, critical } = self.thresholds;
        if warning > 100 || critical > 100 {
            return Err(ConfigError::ValidationError(
                "threshold percentages must be at most 100".to_string(),
            ));
        }
        if warning > critical {
            return Err(ConfigError::ValidationError(format!(
                "warning threshold ({}) above critical threshold ({})",
                warning, critical
            )));
        }

        if self.max_concurrency == 0 {
            return Err(ConfigError::ValidationError(
                "max_concurrency must be at least 1".to_string(),
            ));
        }

        if let Some(preflight) = &self.preflight {
            if !(preflight.requests_per_second > 0.0) {
                return Err(ConfigError::ValidationError(
                    "preflight.requests_per_second must be positive".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Resolve region and credentials into a connection.
    pub fn connection(&self) -> Result<ConnectionConfig, ConfigError> {
        let region = resolve_region(self.region.as_deref())?;
        let credentials = Credentials::from_config_or_env(self.credentials.as_ref())?;

        let mut connection = ConnectionConfig::new(region, credentials).with_send_options(self.send.clone());
        if let Some(url) = &self.endpoint_url {
            connection = connection.with_endpoint_url(url.clone());
        }
        Ok(connection)
    }

    /// Limits and the queries that measure them.
    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.limits.iter().map(|cfg| {
            let mut limit = Limit::new(cfg.name.clone(), cfg.service.clone());
            limit.quota = cfg.quota;

            let mut query = ResourceQuery::new(cfg.service.clone(), cfg.action.clone(), cfg.version.clone());
            query.params = cfg.params.clone();
            query.protocol = cfg.protocol.clone();

            LimitSpec::new(limit, query, cfg.extract.build())
        }))
    }
}

/// Serde helpers for humantime durations.
pub(crate) mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
