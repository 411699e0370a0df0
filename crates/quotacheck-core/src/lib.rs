//! # quotacheck-core
//!
//! Deterministic building blocks for checking cloud resource usage against
//! service quotas.
//!
//! This crate answers three questions without touching the network:
//! - What limits are tracked, and what is their current usage?
//! - How is a provider payload turned into a resource count?
//! - What happened during a collection pass, and how did it end?
//!
//! ## Key Guarantees
//!
//! 1. **Unknown is not zero**: a limit whose usage could not be collected
//!    reports `<unknown>`, never `0`.
//! 2. **One writer per pass**: only the terminal outcome of a pass touches
//!    the registry.
//! 3. **Deterministic ordering**: registry snapshots are sorted by name.
//!
//! ## Example
//!
//! ```rust,ignore
//! use quotacheck_core::{CollectionOutcome, Limit, LimitRegistry};
//!
//! let registry = LimitRegistry::new([Limit::new("VPCs", "ec2").with_quota(5)]);
//! registry.apply("VPCs", &CollectionOutcome::Success(1))?;
//!
//! assert_eq!(registry.get("VPCs").unwrap().to_string(), "1");
//! ```

pub mod attempt;
pub mod extract;
pub mod limit;
pub mod outcome;
pub mod registry;

pub use attempt::{AttemptResult, FailureClass, RequestAttempt};
pub use extract::{ExtractError, JsonArrayCounter, UsageExtractor, XmlSetCounter};
pub use limit::{Limit, ThresholdStatus, Thresholds, UsageState};
pub use outcome::{CollectionError, CollectionOutcome, CollectionReport};
pub use registry::{LimitRegistry, RegistryError};
