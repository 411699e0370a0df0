//! Client-side rate gate consulted before each attempt.
//!
//! A rejection here ends the pass as rate limited without touching the
//! transport.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::PreflightConfig;

/// The gate refused a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Client-side rate limit for '{service}'; next request allowed in {retry_in:?}")]
pub struct PreflightRejection {
    pub service: String,
    pub retry_in: Duration,
}

/// Decides whether a request to a service may be sent now.
pub trait PreflightGate: Send + Sync + fmt::Debug {
    fn check(&self, service: &str) -> Result<(), PreflightRejection>;
}

/// Gate that admits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unthrottled;

impl PreflightGate for Unthrottled {
    fn check(&self, _service: &str) -> Result<(), PreflightRejection> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    refilled: Instant,
}

/// Token bucket per service.
///
/// Each service starts with `burst` tokens and refills at
/// `requests_per_second`.
#[derive(Debug)]
pub struct TokenBucketGate {
    rate: f64,
    burst: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl TokenBucketGate {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        Self {
            rate: requests_per_second,
            burst: f64::from(burst.max(1)),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &PreflightConfig) -> Self {
        Self::new(config.requests_per_second, config.burst)
    }
}

impl PreflightGate for TokenBucketGate {
    fn check(&self, service: &str) -> Result<(), PreflightRejection> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(service.to_string()).or_insert(Bucket {
            tokens: self.burst,
            refilled: now,
        });

        let elapsed = now.saturating_duration_since(bucket.refilled).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.refilled = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let retry_in = Duration::try_from_secs_f64((1.0 - bucket.tokens) / self.rate).unwrap_or(Duration::MAX);
        tracing::debug!(service = %service, retry_in = ?retry_in, "Preflight gate rejected request");
        Err(PreflightRejection {
            service: service.to_string(),
            retry_in,
        })
    }
}
