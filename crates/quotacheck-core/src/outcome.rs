//! Terminal outcomes of a collection pass.

use thiserror::Error;

use crate::attempt::RequestAttempt;
use crate::extract::ExtractError;
use crate::limit::UsageState;

/// Why a collection pass failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectionError {
    /// Rate limited before a retry was allowed. `attempts` is 0 when the
    /// client-side gate rejected the request before anything was sent.
    #[error("Rate limited after {attempts} exchange(s): {code}: {message}")]
    PreflightRateLimited {
        attempts: u32,
        code: String,
        message: String,
    },

    #[error("Throttled: {code}: {message}")]
    TransientThrottled { code: String, message: String },

    #[error("Retries exhausted after {attempts} attempts; last error: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<CollectionError>,
    },

    #[error("Provider error{}: {code}: {message}", http_status(.status))]
    TerminalProviderError {
        status: Option<u16>,
        code: String,
        message: String,
    },

    #[error("Malformed response payload: {0}")]
    ParseError(#[from] ExtractError),
}

fn http_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

/// Terminal result of one collection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionOutcome {
    /// Usage was determined
    Success(u64),

    /// Usage could not be determined
    Failure(CollectionError),

    /// The pass was abandoned before it could finish (cancelled or timed
    /// out). The registry keeps whatever it held before the pass.
    PartialUnknown { reason: String },
}

impl CollectionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CollectionOutcome::Success(_))
    }

    pub fn count(&self) -> Option<u64> {
        match self {
            CollectionOutcome::Success(n) => Some(*n),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&CollectionError> {
        match self {
            CollectionOutcome::Failure(e) => Some(e),
            _ => None,
        }
    }

    /// Usage state a registry entry should hold after this outcome.
    pub fn resolve(&self, previous: UsageState) -> UsageState {
        match self {
            CollectionOutcome::Success(n) => UsageState::Count(*n),
            CollectionOutcome::Failure(_) => UsageState::Unknown,
            CollectionOutcome::PartialUnknown { .. } => previous,
        }
    }
}

/// Everything a pass produced: the outcome and its attempt log.
#[derive(Debug, Clone)]
pub struct CollectionReport {
    /// Limit name the pass collected
    pub limit: String,

    pub outcome: CollectionOutcome,

    /// Attempts in the order they were made
    pub attempts: Vec<RequestAttempt>,
}

impl CollectionReport {
    /// Number of attempts that reached the transport.
    pub fn exchanges(&self) -> usize {
        self.attempts.iter().filter(|a| a.sent).count()
    }
}
