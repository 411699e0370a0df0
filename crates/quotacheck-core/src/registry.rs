//! Limit registry: the only state shared between collection passes.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::limit::{Limit, UsageState};
use crate::outcome::CollectionOutcome;

/// Errors from the limit registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown limit: '{0}'")]
    UnknownLimit(String),
}

/// Mapping from limit name to its current usage.
///
/// Every tracked name starts as `<unknown>`. Writes are last-writer-wins per
/// name; a name is only ever written by the one pass that collects it, so
/// no further coordination is needed.
#[derive(Debug, Default)]
pub struct LimitRegistry {
    limits: RwLock<BTreeMap<String, Limit>>,
}

impl LimitRegistry {
    /// Create a registry tracking the given limits, all reset to unknown.
    pub fn new(limits: impl IntoIterator<Item = Limit>) -> Self {
        let limits = limits
            .into_iter()
            .map(|mut limit| {
                limit.usage = UsageState::Unknown;
                (limit.name.clone(), limit)
            })
            .collect();

        Self {
            limits: RwLock::new(limits),
        }
    }

    /// Current usage of a limit, or `None` if the name is not tracked.
    pub fn get(&self, name: &str) -> Option<UsageState> {
        self.limits.read().get(name).map(|l| l.usage)
    }

    /// Copy of a tracked limit.
    pub fn limit(&self, name: &str) -> Option<Limit> {
        self.limits.read().get(name).cloned()
    }

    /// Record a collected count.
    pub fn set(&self, name: &str, count: u64) -> Result<(), RegistryError> {
        self.update(name, UsageState::Count(count))
    }

    /// Forget the usage of a limit.
    pub fn mark_unknown(&self, name: &str) -> Result<(), RegistryError> {
        self.update(name, UsageState::Unknown)
    }

    /// Apply the terminal outcome of a pass.
    ///
    /// Success records the count, failure resets to unknown, and an
    /// abandoned pass leaves the entry untouched.
    pub fn apply(&self, name: &str, outcome: &CollectionOutcome) -> Result<UsageState, RegistryError> {
        let mut limits = self.limits.write();
        let limit = limits
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownLimit(name.to_string()))?;

        limit.usage = outcome.resolve(limit.usage);
        tracing::debug!(limit = %name, usage = %limit.usage, "Registry updated");
        Ok(limit.usage)
    }

    /// Override the quota of a tracked limit.
    pub fn set_quota(&self, name: &str, quota: u64) -> Result<(), RegistryError> {
        let mut limits = self.limits.write();
        let limit = limits
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownLimit(name.to_string()))?;
        limit.quota = Some(quota);
        Ok(())
    }

    /// All tracked limits, sorted by name.
    pub fn snapshot(&self) -> Vec<Limit> {
        self.limits.read().values().cloned().collect()
    }

    /// Tracked limit names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.limits.read().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.limits.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.limits.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.read().is_empty()
    }

    fn update(&self, name: &str, usage: UsageState) -> Result<(), RegistryError> {
        let mut limits = self.limits.write();
        match limits.get_mut(name) {
            Some(limit) => {
                limit.usage = usage;
                Ok(())
            }
            None => Err(RegistryError::UnknownLimit(name.to_string())),
        }
    }
}
