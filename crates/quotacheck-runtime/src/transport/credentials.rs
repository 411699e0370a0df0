//! Secure credential handling for provider access.
//!
//! This module keeps access keys out of logs and error messages:
//!
//! - **No accidental logging**: secrets cannot appear in Debug/Display output
//! - **Memory safety**: secrets are zeroed on drop via `secrecy`
//! - **Explicit exposure**: the signer calls [`Credentials::expose_secret`]
//!   at the point of use and nowhere else
//!
//! ## Usage
//!
//! ```ignore
//! // Load from environment
//! let creds = Credentials::from_env()?;
//!
//! // Config first, environment as fallback
//! let creds = Credentials::from_config_or_env(config.credentials.as_ref())?;
//! ```

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;

use super::TransportError;

/// Environment variable holding the access key id.
pub const ACCESS_KEY_ID_ENV: &str = "AWS_ACCESS_KEY_ID";

/// Environment variable holding the secret access key.
pub const SECRET_ACCESS_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";

/// Environment variable holding an optional session token.
pub const SESSION_TOKEN_ENV: &str = "AWS_SESSION_TOKEN";

/// Environment variables consulted for the region, in order.
pub const REGION_ENVS: [&str; 2] = ["AWS_REGION", "AWS_DEFAULT_REGION"];

/// Where credentials were loaded from.
///
/// Useful for debugging configuration issues without exposing the actual
/// values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Loaded from the configuration file
    Config,
    /// Loaded from environment variables
    Environment,
    /// Provided programmatically
    Programmatic,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Config => write!(f, "config"),
            CredentialSource::Environment => write!(f, "environment"),
            CredentialSource::Programmatic => write!(f, "programmatic"),
        }
    }
}

/// Credentials as they appear in a configuration file.
#[derive(Clone, Deserialize)]
pub struct CredentialsConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

impl fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Access key pair (and optional session token) for request signing.
///
/// The access key id is not secret and is shown in Debug output; the secret
/// key and session token never are.
pub struct Credentials {
    access_key_id: String,
    secret_access_key: SecretString,
    session_token: Option<SecretString>,
    source: CredentialSource,
}

impl Credentials {
    /// Create credentials from raw values.
    ///
    /// The secret is wrapped immediately and cannot be logged afterwards.
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        source: CredentialSource,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: SecretString::from(secret_access_key.into()),
            session_token: None,
            source,
        }
    }

    /// Attach a session token (temporary credentials).
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(SecretString::from(token.into()));
        self
    }

    /// Load credentials from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`
    /// (and `AWS_SESSION_TOKEN` if set).
    pub fn from_env() -> Result<Self, TransportError> {
        let access_key_id = read_env(ACCESS_KEY_ID_ENV)?;
        let secret_access_key = read_env(SECRET_ACCESS_KEY_ENV)?;

        let mut creds = Self::new(access_key_id, secret_access_key, CredentialSource::Environment);
        if let Ok(token) = std::env::var(SESSION_TOKEN_ENV) {
            creds = creds.with_session_token(token);
        }
        Ok(creds)
    }

    /// Use configured credentials when present, otherwise the environment.
    pub fn from_config_or_env(config: Option<&CredentialsConfig>) -> Result<Self, TransportError> {
        match config {
            Some(cfg) => {
                let mut creds = Self::new(
                    cfg.access_key_id.clone(),
                    cfg.secret_access_key.clone(),
                    CredentialSource::Config,
                );
                if let Some(token) = &cfg.session_token {
                    creds = creds.with_session_token(token.clone());
                }
                Ok(creds)
            }
            None => Self::from_env(),
        }
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    /// Expose the secret access key for signing.
    ///
    /// # Security
    ///
    /// Only call this where the key is consumed (deriving the signing key).
    /// Never store the exposed value.
    pub fn expose_secret(&self) -> &str {
        self.secret_access_key.expose_secret()
    }

    /// Expose the session token, if any, for the security-token header.
    pub fn expose_session_token(&self) -> Option<&str> {
        self.session_token.as_ref().map(|t| t.expose_secret())
    }

    /// Check if the secret key is empty.
    pub fn is_empty(&self) -> bool {
        self.access_key_id.is_empty() || self.secret_access_key.expose_secret().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .field("session_token", &self.session_token.as_ref().map(|_| "[REDACTED]"))
            .field("source", &self.source)
            .finish()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} [REDACTED]", self.access_key_id, self.source)
    }
}

/// Region from configuration, falling back to `AWS_REGION` then
/// `AWS_DEFAULT_REGION`.
pub fn resolve_region(configured: Option<&str>) -> Result<String, TransportError> {
    if let Some(region) = configured.filter(|r| !r.is_empty()) {
        return Ok(region.to_string());
    }

    REGION_ENVS
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        .ok_or_else(|| {
            TransportError::NotConfigured(format!(
                "region not set: configure 'region' or the {} environment variable",
                REGION_ENVS.join(" / ")
            ))
        })
}

fn read_env(var: &str) -> Result<String, TransportError> {
    std::env::var(var).map_err(|_| {
        TransportError::NotConfigured(format!(
            "credentials not set: configure 'credentials' or the '{}' environment variable",
            var
        ))
    })
}
