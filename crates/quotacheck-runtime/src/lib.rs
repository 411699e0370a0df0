//! # quotacheck-runtime
//!
//! Retry-aware usage collection for quotacheck.
//!
//! This crate drives "describe resources of type X" calls against a
//! provider API and turns the answers into usage counts:
//!
//! - [`transport`]: signed request exchange, credentials, SigV4 signing
//! - [`resilience`]: retry policy and the client-side preflight gate
//! - [`collector`]: one collection pass per limit
//! - [`checker`]: parallel passes over every configured limit
//! - [`observer`]: lifecycle hooks for audit and telemetry
//!
//! ## Retry semantics
//!
//! Throttles reported after a real exchange are retried up to the attempt
//! ceiling. Rate limits (client-side gate, or the provider's request-limit
//! code) are not retried. That asymmetry matches the behaviour existing
//! deployments depend on; see [`resilience::retry`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use quotacheck_runtime::{CheckerBuilder, CheckerConfig};
//! use quotacheck_runtime::transport::HttpTransportFactory;
//!
//! let config = CheckerConfig::from_file("limits.yaml")?;
//! let checker = CheckerBuilder::from_config(config)?
//!     .transport_factory(Arc::new(HttpTransportFactory))
//!     .build()?;
//!
//! for report in checker.collect_all().await? {
//!     println!("{}: {}", report.limit, checker.registry().get(&report.limit).unwrap());
//! }
//! ```

pub mod checker;
pub mod collector;
pub mod config;
pub mod observer;
pub mod request;
pub mod resilience;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use checker::{Checker, CheckerBuilder, CheckerError, LimitStatus};
pub use collector::{Catalog, LimitSpec, UsageCollector};
pub use config::{CheckerConfig, ConfigError, ExtractConfig, LimitConfig, PreflightConfig};
pub use observer::{
    Checkpoint, CollectionObserver, LifecycleEvent, ObserverList, RecordingObserver,
    TracingObserver,
};
pub use request::{Endpoint, PreparedRequest, Protocol, ResourceQuery};
pub use resilience::{
    AttemptFailure, FailureClassifier, PreflightGate, PreflightRejection,
    ProviderErrorClassifier, RetryConfig, RetryDecision, RetryPolicy, RetrySchedule,
    TokenBucketGate, Unthrottled,
};
pub use transport::{
    ConnectionConfig, CredentialSource, Credentials, ProviderResponse, RequestSigner,
    SendOptions, SigV4Signer, SigningError, Transport, TransportError, TransportFactory,
};

/// Re-export of the core crate.
pub use quotacheck_core as core;
