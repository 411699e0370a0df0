//! Retry policy for collection passes.
//!
//! The policy looks at the most recent attempt and decides whether the pass
//! retries, waits, or surfaces its outcome. Classification is delegated to a
//! [`FailureClassifier`]; delays come from the provider's `Retry-After` or an
//! exponential backoff schedule.
//!
//! Rate limits are never retried, even when the provider reports one after a
//! real exchange. Throttles are. Existing deployments depend on that split,
//! so keep it unless every caller is migrated.

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use quotacheck_core::{CollectionError, FailureClass};

use super::preflight::PreflightRejection;
use crate::config::duration_str;
use crate::transport::{ProviderResponse, SigningError, TransportError};

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per pass, including the first
    pub max_attempts: u32,

    /// First backoff delay
    #[serde(with = "duration_str")]
    pub min_delay: Duration,

    /// Backoff ceiling
    #[serde(with = "duration_str")]
    pub max_delay: Duration,

    /// Randomise backoff delays
    pub jitter: bool,

    /// Wait for the provider's `Retry-After` instead of the backoff delay
    pub honor_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(20),
            jitter: false,
            honor_retry_after: true,
        }
    }
}

impl RetryConfig {
    fn backoff(&self) -> ExponentialBackoff {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts as usize);

        if self.jitter {
            builder.with_jitter().build()
        } else {
            builder.build()
        }
    }
}

/// Why one attempt did not produce a response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Rejected by the preflight gate; nothing was sent
    #[error(transparent)]
    Preflight(#[from] PreflightRejection),

    /// Signing failed; nothing was sent
    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl AttemptFailure {
    /// Whether the transport was invoked for this attempt.
    pub fn was_sent(&self) -> bool {
        matches!(self, AttemptFailure::Transport(_))
    }

    pub fn code(&self) -> &str {
        match self {
            AttemptFailure::Preflight(_) => "ClientRateLimited",
            AttemptFailure::Signing(_) => "SigningError",
            AttemptFailure::Transport(e) => e.code(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            AttemptFailure::Transport(e) => e.message(),
            other => other.to_string(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            AttemptFailure::Transport(e) => e.status(),
            _ => None,
        }
    }
}

/// Maps an attempt failure to a [`FailureClass`].
pub trait FailureClassifier: Send + Sync + fmt::Debug {
    fn classify(&self, failure: &AttemptFailure) -> FailureClass;
}

const RATE_LIMIT_CODES: &[&str] = &["RequestLimitExceeded"];

const THROTTLE_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottled",
    "RequestThrottledException",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "TransactionInProgressException",
    "SlowDown",
    "PriorRequestNotComplete",
    "EC2ThrottledException",
];

/// Classifies by provider error code, then by HTTP status.
///
/// Unlisted codes on 429 and 500/502/503/504 responses count as throttles;
/// timeouts and connection failures do too. Everything else is terminal.
#[derive(Debug, Clone)]
pub struct ProviderErrorClassifier {
    codes: HashMap<String, FailureClass>,
}

impl Default for ProviderErrorClassifier {
    fn default() -> Self {
        let codes = RATE_LIMIT_CODES
            .iter()
            .map(|c| (c.to_string(), FailureClass::RateLimited))
            .chain(
                THROTTLE_CODES
                    .iter()
                    .map(|c| (c.to_string(), FailureClass::Throttled)),
            )
            .collect();
        Self { codes }
    }
}

impl ProviderErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or override the class for a provider error code.
    pub fn with_code(mut self, code: impl Into<String>, class: FailureClass) -> Self {
        self.codes.insert(code.into(), class);
        self
    }
}

impl FailureClassifier for ProviderErrorClassifier {
    fn classify(&self, failure: &AttemptFailure) -> FailureClass {
        match failure {
            AttemptFailure::Preflight(_) => FailureClass::RateLimited,
            AttemptFailure::Signing(_) => FailureClass::Terminal,
            AttemptFailure::Transport(err) => match err {
                TransportError::Provider { status, code, .. } => {
                    if let Some(class) = self.codes.get(code) {
                        return *class;
                    }
                    match status {
                        429 | 500 | 502 | 503 | 504 => FailureClass::Throttled,
                        _ => FailureClass::Terminal,
                    }
                }
                TransportError::Timeout(_) | TransportError::HttpError(_) => FailureClass::Throttled,
                TransportError::Signing(_) | TransportError::NotConfigured(_) => FailureClass::Terminal,
            },
        }
    }
}

/// What the pass does after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    RetryNow,
    RetryAfter(Duration),
    SurfaceSuccess,
    SurfaceFailure(CollectionError),
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::RetryNow | RetryDecision::RetryAfter(_))
    }
}

impl fmt::Display for RetryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDecision::RetryNow => write!(f, "retry-now"),
            RetryDecision::RetryAfter(d) => write!(f, "retry-after {}", humantime::format_duration(*d)),
            RetryDecision::SurfaceSuccess => write!(f, "surface-success"),
            RetryDecision::SurfaceFailure(_) => write!(f, "surface-failure"),
        }
    }
}

/// Per-pass retry state: attempt counters and the backoff iterator.
pub struct RetrySchedule {
    attempts: u32,
    exchanges: u32,
    backoff: ExponentialBackoff,
}

impl RetrySchedule {
    /// Start the next attempt and return its 1-based index.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Record that the current attempt reached the transport.
    pub fn mark_sent(&mut self) {
        self.exchanges += 1;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn exchanges(&self) -> u32 {
        self.exchanges
    }
}

impl fmt::Debug for RetrySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrySchedule")
            .field("attempts", &self.attempts)
            .field("exchanges", &self.exchanges)
            .finish()
    }
}

/// Attempt ceiling, classifier and backoff for collection passes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    classifier: Arc<dyn FailureClassifier>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            classifier: Arc::new(ProviderErrorClassifier::default()),
        }
    }

    /// Replace the failure classifier.
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn classify(&self, failure: &AttemptFailure) -> FailureClass {
        self.classifier.classify(failure)
    }

    /// Fresh state for one pass.
    pub fn schedule(&self) -> RetrySchedule {
        RetrySchedule {
            attempts: 0,
            exchanges: 0,
            backoff: self.config.backoff(),
        }
    }

    /// Decide what follows the attempt that just finished.
    pub fn decide(
        &self,
        schedule: &mut RetrySchedule,
        result: &Result<ProviderResponse, AttemptFailure>,
    ) -> RetryDecision {
        let failure = match result {
            Ok(_) => return RetryDecision::SurfaceSuccess,
            Err(failure) => failure,
        };

        match self.classify(failure) {
            // Not retried, even after a real exchange.
            FailureClass::RateLimited => RetryDecision::SurfaceFailure(CollectionError::PreflightRateLimited {
                attempts: schedule.exchanges,
                code: failure.code().to_string(),
                message: failure.message(),
            }),

            FailureClass::Terminal => RetryDecision::SurfaceFailure(CollectionError::TerminalProviderError {
                status: failure.status(),
                code: failure.code().to_string(),
                message: failure.message(),
            }),

            FailureClass::Throttled => {
                let last = CollectionError::TransientThrottled {
                    code: failure.code().to_string(),
                    message: failure.message(),
                };

                if schedule.attempts >= self.config.max_attempts {
                    return RetryDecision::SurfaceFailure(CollectionError::RetriesExhausted {
                        attempts: schedule.attempts,
                        last: Box::new(last),
                    });
                }

                let delay = match (failure_retry_after(failure), self.config.honor_retry_after) {
                    (Some(delay), true) => delay,
                    _ => schedule.backoff.next().unwrap_or(self.config.max_delay),
                };

                if delay.is_zero() {
                    RetryDecision::RetryNow
                } else {
                    RetryDecision::RetryAfter(delay)
                }
            }
        }
    }
}

fn failure_retry_after(failure: &AttemptFailure) -> Option<Duration> {
    match failure {
        AttemptFailure::Transport(e) => e.retry_after(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(status: u16, code: &str) -> AttemptFailure {
        AttemptFailure::Transport(TransportError::Provider {
            status,
            code: code.to_string(),
            message: format!("{} message", code),
            retry_after: None,
        })
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            ..RetryConfig::default()
        })
    }

    #[test]
    fn test_default_classification() {
        let classifier = ProviderErrorClassifier::default();

        assert_eq!(classifier.classify(&provider(503, "RequestLimitExceeded")), FailureClass::RateLimited);
        assert_eq!(classifier.classify(&provider(400, "Throttling")), FailureClass::Throttled);
        assert_eq!(classifier.classify(&provider(400, "EC2ThrottledException")), FailureClass::Throttled);
        assert_eq!(classifier.classify(&provider(429, "TooManyRequests")), FailureClass::Throttled);
        assert_eq!(classifier.classify(&provider(503, "ServiceUnavailable")), FailureClass::Throttled);
        assert_eq!(classifier.classify(&provider(403, "UnauthorizedOperation")), FailureClass::Terminal);
        assert_eq!(classifier.classify(&provider(501, "NotImplemented")), FailureClass::Terminal);

        let timeout = AttemptFailure::Transport(TransportError::Timeout(Duration::from_secs(10)));
        assert_eq!(classifier.classify(&timeout), FailureClass::Throttled);

        let signing = AttemptFailure::Signing(SigningError::MissingCredentials);
        assert_eq!(classifier.classify(&signing), FailureClass::Terminal);
    }

    #[test]
    fn test_custom_code() {
        let classifier = ProviderErrorClassifier::new().with_code("Busy", FailureClass::Throttled);
        assert_eq!(classifier.classify(&provider(400, "Busy")), FailureClass::Throttled);
    }

    #[test]
    fn test_success_surfaces() {
        let policy = fast_policy(5);
        let mut schedule = policy.schedule();
        schedule.begin_attempt();
        schedule.mark_sent();

        let decision = policy.decide(&mut schedule, &Ok(ProviderResponse::ok("<ok/>")));
        assert_eq!(decision, RetryDecision::SurfaceSuccess);
    }

    #[test]
    fn test_preflight_rejection_not_retried() {
        let policy = fast_policy(5);
        let mut schedule = policy.schedule();
        schedule.begin_attempt();

        let rejection = AttemptFailure::Preflight(PreflightRejection {
            service: "ec2".to_string(),
            retry_in: Duration::from_secs(1),
        });
        match policy.decide(&mut schedule, &Err(rejection)) {
            RetryDecision::SurfaceFailure(CollectionError::PreflightRateLimited { attempts, code, .. }) => {
                assert_eq!(attempts, 0);
                assert_eq!(code, "ClientRateLimited");
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_provider_rate_limit_not_retried() {
        let policy = fast_policy(5);
        let mut schedule = policy.schedule();
        schedule.begin_attempt();
        schedule.mark_sent();

        match policy.decide(&mut schedule, &Err(provider(503, "RequestLimitExceeded"))) {
            RetryDecision::SurfaceFailure(CollectionError::PreflightRateLimited { attempts, code, .. }) => {
                assert_eq!(attempts, 1);
                assert_eq!(code, "RequestLimitExceeded");
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_throttle_retried_until_ceiling() {
        let policy = fast_policy(3);
        let mut schedule = policy.schedule();
        let throttled = Err(provider(400, "Throttling"));

        for _ in 0..2 {
            schedule.begin_attempt();
            schedule.mark_sent();
            assert!(policy.decide(&mut schedule, &throttled).is_retry());
        }

        schedule.begin_attempt();
        schedule.mark_sent();
        match policy.decide(&mut schedule, &throttled) {
            RetryDecision::SurfaceFailure(CollectionError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(
                    *last,
                    CollectionError::TransientThrottled {
                        code: "Throttling".to_string(),
                        message: "Throttling message".to_string(),
                    }
                );
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = fast_policy(10);
        let mut schedule = policy.schedule();
        let throttled = Err(provider(400, "Throttling"));

        let mut delays = Vec::new();
        for _ in 0..6 {
            schedule.begin_attempt();
            match policy.decide(&mut schedule, &throttled) {
                RetryDecision::RetryAfter(d) => delays.push(d),
                other => panic!("unexpected decision: {:?}", other),
            }
        }

        assert_eq!(delays[0], Duration::from_millis(10));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(80)));
    }

    #[test]
    fn test_retry_after_honored() {
        let policy = fast_policy(5);
        let mut schedule = policy.schedule();
        schedule.begin_attempt();

        let failure = AttemptFailure::Transport(TransportError::Provider {
            status: 503,
            code: "SlowDown".to_string(),
            message: "Please reduce your request rate".to_string(),
            retry_after: Some(Duration::from_secs(2)),
        });
        assert_eq!(
            policy.decide(&mut schedule, &Err(failure.clone())),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );

        let ignoring = RetryPolicy::new(RetryConfig {
            honor_retry_after: false,
            min_delay: Duration::from_millis(10),
            ..RetryConfig::default()
        });
        let mut schedule = ignoring.schedule();
        schedule.begin_attempt();
        assert_eq!(
            ignoring.decide(&mut schedule, &Err(failure)),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
    }

    #[test]
    fn test_zero_delay_retries_now() {
        let policy = RetryPolicy::new(RetryConfig {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..RetryConfig::default()
        });
        let mut schedule = policy.schedule();
        schedule.begin_attempt();
        assert_eq!(
            policy.decide(&mut schedule, &Err(provider(400, "Throttling"))),
            RetryDecision::RetryNow
        );
    }

    #[test]
    fn test_terminal_carries_status() {
        let policy = fast_policy(5);
        let mut schedule = policy.schedule();
        schedule.begin_attempt();
        schedule.mark_sent();

        match policy.decide(&mut schedule, &Err(provider(403, "AuthFailure"))) {
            RetryDecision::SurfaceFailure(CollectionError::TerminalProviderError { status, code, .. }) => {
                assert_eq!(status, Some(403));
                assert_eq!(code, "AuthFailure");
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    proptest::proptest! {
        #[test]
        fn prop_throttles_stop_at_ceiling(max_attempts in 1u32..12) {
            let policy = fast_policy(max_attempts);
            let mut schedule = policy.schedule();
            let throttled = Err(provider(400, "Throttling"));

            let decision = loop {
                schedule.begin_attempt();
                schedule.mark_sent();
                let decision = policy.decide(&mut schedule, &throttled);
                if !decision.is_retry() {
                    break decision;
                }
            };

            proptest::prop_assert_eq!(schedule.exchanges(), max_attempts);
            let exhausted = matches!(
                decision,
                RetryDecision::SurfaceFailure(CollectionError::RetriesExhausted { .. })
            );
            proptest::prop_assert!(exhausted);
        }
    }

    #[test]
    fn test_config_from_yaml() {
        let config: RetryConfig = serde_yaml::from_str("max_attempts: 3\nmin_delay: 250ms\njitter: true").unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.min_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(20));
        assert!(config.jitter);
        assert!(config.honor_retry_after);
    }
}
