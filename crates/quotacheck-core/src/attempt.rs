//! Per-attempt records of a collection pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failed attempt.
///
/// Drives the retry decision: only `Throttled` is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Rate limit signalled before a retry could help (client-side gate or
    /// the provider's request-limit code). Never retried.
    RateLimited,

    /// Transient throttle reported by the provider after a real exchange
    Throttled,

    /// Non-retryable error
    Terminal,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::RateLimited => write!(f, "rate-limited"),
            FailureClass::Throttled => write!(f, "throttled"),
            FailureClass::Terminal => write!(f, "terminal"),
        }
    }
}

/// How a single attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptResult {
    /// The provider returned a success payload
    Succeeded { status: u16 },

    /// The attempt failed
    Failed { class: FailureClass, reason: String },
}

/// Immutable record of one attempt within a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAttempt {
    /// 1-based attempt index
    pub index: u32,

    /// API action the request invoked (e.g., "DescribeVpcs")
    pub action: String,

    /// Form-encoded request body
    pub body: String,

    /// When the attempt started
    pub started_at: DateTime<Utc>,

    /// Whether the request reached the transport
    pub sent: bool,

    pub result: AttemptResult,
}

impl RequestAttempt {
    pub fn is_success(&self) -> bool {
        matches!(self.result, AttemptResult::Succeeded { .. })
    }

    /// Failure class, if this attempt failed.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match &self.result {
            AttemptResult::Failed { class, .. } => Some(*class),
            AttemptResult::Succeeded { .. } => None,
        }
    }
}
