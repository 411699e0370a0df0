//! Resilience patterns for quotacheck-runtime.
//!
//! This module provides:
//! - Retry policy with a pluggable failure classifier and backoff
//! - A client-side preflight gate that rejects requests before they are sent

mod preflight;
pub mod retry;

pub use preflight::{PreflightGate, PreflightRejection, TokenBucketGate, Unthrottled};
pub use retry::{
    AttemptFailure, FailureClassifier, ProviderErrorClassifier, RetryConfig, RetryDecision,
    RetryPolicy, RetrySchedule,
};
