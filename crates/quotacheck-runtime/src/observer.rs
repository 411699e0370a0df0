//! Lifecycle hooks for collection passes.
//!
//! Observers see every checkpoint of every attempt, in order. They run
//! inline on the pass task and must not block.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use quotacheck_core::{CollectionOutcome, FailureClass};

use crate::resilience::RetryDecision;

/// Checkpoint kinds, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    PassStarted,
    RequestBuilt,
    Signed,
    Sent,
    RetryChecked,
    Completed,
    Abandoned,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Checkpoint::PassStarted => "pass-started",
            Checkpoint::RequestBuilt => "request-built",
            Checkpoint::Signed => "signed",
            Checkpoint::Sent => "sent",
            Checkpoint::RetryChecked => "retry-checked",
            Checkpoint::Completed => "completed",
            Checkpoint::Abandoned => "abandoned",
        };
        write!(f, "{}", name)
    }
}

/// One lifecycle event of a collection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    PassStarted { limit: String },

    /// A fresh copy of the canonical request was made for this attempt
    RequestBuilt { limit: String, attempt: u32 },

    Signed { limit: String, attempt: u32 },

    /// The transport returned. `status` is absent when no response arrived;
    /// `class` is absent on success.
    Sent {
        limit: String,
        attempt: u32,
        status: Option<u16>,
        class: Option<FailureClass>,
    },

    RetryChecked {
        limit: String,
        attempt: u32,
        decision: RetryDecision,
    },

    Completed {
        limit: String,
        outcome: CollectionOutcome,
        exchanges: usize,
    },

    /// The pass was dropped or timed out before an outcome
    Abandoned { limit: String, reason: String },
}

impl LifecycleEvent {
    pub fn checkpoint(&self) -> Checkpoint {
        match self {
            LifecycleEvent::PassStarted { .. } => Checkpoint::PassStarted,
            LifecycleEvent::RequestBuilt { .. } => Checkpoint::RequestBuilt,
            LifecycleEvent::Signed { .. } => Checkpoint::Signed,
            LifecycleEvent::Sent { .. } => Checkpoint::Sent,
            LifecycleEvent::RetryChecked { .. } => Checkpoint::RetryChecked,
            LifecycleEvent::Completed { .. } => Checkpoint::Completed,
            LifecycleEvent::Abandoned { .. } => Checkpoint::Abandoned,
        }
    }

    pub fn limit(&self) -> &str {
        match self {
            LifecycleEvent::PassStarted { limit }
            | LifecycleEvent::RequestBuilt { limit, .. }
            | LifecycleEvent::Signed { limit, .. }
            | LifecycleEvent::Sent { limit, .. }
            | LifecycleEvent::RetryChecked { limit, .. }
            | LifecycleEvent::Completed { limit, .. }
            | LifecycleEvent::Abandoned { limit, .. } => limit,
        }
    }
}

/// Receives lifecycle events.
pub trait CollectionObserver: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

/// Observers invoked in registration order.
#[derive(Clone, Default)]
pub struct ObserverList {
    observers: Vec<Arc<dyn CollectionObserver>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn CollectionObserver>) {
        self.observers.push(observer);
    }

    pub fn with(mut self, observer: Arc<dyn CollectionObserver>) -> Self {
        self.push(observer);
        self
    }

    pub fn notify(&self, event: &LifecycleEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverList")
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Emits a `tracing` event per checkpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CollectionObserver for TracingObserver {
    fn on_event(&self, event: &LifecycleEvent) {
        match event {
            LifecycleEvent::PassStarted { limit } => {
                tracing::debug!(limit = %limit, "Collection pass started");
            }
            LifecycleEvent::RequestBuilt { limit, attempt } => {
                tracing::trace!(limit = %limit, attempt, "Request built");
            }
            LifecycleEvent::Signed { limit, attempt } => {
                tracing::trace!(limit = %limit, attempt, "Request signed");
            }
            LifecycleEvent::Sent {
                limit,
                attempt,
                status,
                class,
            } => match class {
                None => tracing::debug!(limit = %limit, attempt, status = ?status, "Exchange succeeded"),
                Some(class) => {
                    tracing::warn!(limit = %limit, attempt, status = ?status, class = ?class, "Exchange failed")
                }
            },
            LifecycleEvent::RetryChecked {
                limit,
                attempt,
                decision,
            } => {
                tracing::debug!(limit = %limit, attempt, decision = %decision, "Retry checked");
            }
            LifecycleEvent::Completed {
                limit,
                outcome,
                exchanges,
            } => match outcome {
                CollectionOutcome::Success(count) => {
                    tracing::info!(limit = %limit, count, exchanges, "Usage collected");
                }
                CollectionOutcome::Failure(error) => {
                    tracing::warn!(limit = %limit, exchanges, error = %error, "Usage collection failed");
                }
                CollectionOutcome::PartialUnknown { reason } => {
                    tracing::warn!(limit = %limit, exchanges, reason = %reason, "Usage collection incomplete");
                }
            },
            LifecycleEvent::Abandoned { limit, reason } => {
                tracing::warn!(limit = %limit, reason = %reason, "Collection pass abandoned");
            }
        }
    }
}

/// Keeps every event in memory; for tests and audit dumps.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.events.lock().iter().map(LifecycleEvent::checkpoint).collect()
    }

    /// Checkpoints of one limit, in order.
    pub fn checkpoints_for(&self, limit: &str) -> Vec<Checkpoint> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.limit() == limit)
            .map(LifecycleEvent::checkpoint)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl CollectionObserver for RecordingObserver {
    fn on_event(&self, event: &LifecycleEvent) {
        self.events.lock().push(event.clone());
    }
}
