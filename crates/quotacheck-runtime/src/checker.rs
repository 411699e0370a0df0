//! Checker: every configured limit, collected in parallel.
//!
//! Passes for distinct limits run concurrently up to `max_concurrency`;
//! attempts within a pass stay sequential. A pass that outlives
//! `pass_timeout` is abandoned and its registry entry left untouched.

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use quotacheck_core::{
    CollectionOutcome, CollectionReport, Limit, LimitRegistry, RegistryError, ThresholdStatus,
    Thresholds,
};

use crate::collector::UsageCollector;
use crate::config::{CheckerConfig, ConfigError};
use crate::observer::{CollectionObserver, LifecycleEvent, ObserverList, TracingObserver};
use crate::resilience::{FailureClassifier, PreflightGate, RetryPolicy, TokenBucketGate, Unthrottled};
use crate::transport::{ConnectionConfig, RequestSigner, TransportFactory};

/// Errors from building or running a checker.
#[derive(Error, Debug)]
pub enum CheckerError {
    #[error("Transport not configured: {0}")]
    TransportNotConfigured(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Usage of one limit against its quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitStatus {
    pub name: String,
    pub service: String,
    pub usage: Option<u64>,
    pub quota: Option<u64>,
    pub status: ThresholdStatus,
}

impl LimitStatus {
    pub fn from_limit(limit: &Limit, thresholds: &Thresholds) -> Self {
        Self {
            name: limit.name.clone(),
            service: limit.service.clone(),
            usage: limit.usage.count(),
            quota: limit.quota,
            status: limit.check_thresholds(thresholds),
        }
    }
}

/// Collects usage for every configured limit.
pub struct Checker {
    collector: UsageCollector,
    thresholds: Thresholds,
    pass_timeout: Option<Duration>,
    max_concurrency: usize,
}

impl Checker {
    pub fn registry(&self) -> &Arc<LimitRegistry> {
        self.collector.registry()
    }

    pub fn collector(&self) -> &UsageCollector {
        &self.collector
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Collect one limit, abandoning the pass after `pass_timeout`.
    pub async fn collect(&self, name: &str) -> Result<CollectionReport, CheckerError> {
        let Some(limit) = self.pass_timeout else {
            return Ok(self.collector.collect(name).await?);
        };

        match tokio::time::timeout(limit, self.collector.collect(name)).await {
            Ok(report) => Ok(report?),
            Err(_) => {
                let reason = format!("pass exceeded {}", humantime::format_duration(limit));
                self.collector.observers().notify(&LifecycleEvent::Abandoned {
                    limit: name.to_string(),
                    reason: reason.clone(),
                });

                let outcome = CollectionOutcome::PartialUnknown { reason };
                self.registry().apply(name, &outcome)?;
                Ok(CollectionReport {
                    limit: name.to_string(),
                    outcome,
                    attempts: Vec::new(),
                })
            }
        }
    }

    /// Collect every limit; reports come back sorted by limit name.
    pub async fn collect_all(&self) -> Result<Vec<CollectionReport>, CheckerError> {
        let names = self.collector.catalog().names();
        tracing::info!(limits = names.len(), concurrency = self.max_concurrency, "Collecting usage");

        let mut reports: Vec<CollectionReport> = stream::iter(names.iter().map(|name| self.collect(name)))
            .buffer_unordered(self.max_concurrency)
            .try_collect()
            .await?;

        reports.sort_by(|a, b| a.limit.cmp(&b.limit));
        Ok(reports)
    }

    /// Threshold status of every limit, sorted by name.
    pub fn statuses(&self) -> Vec<LimitStatus> {
        self.registry()
            .snapshot()
            .iter()
            .map(|limit| LimitStatus::from_limit(limit, &self.thresholds))
            .collect()
    }
}

/// Builds a [`Checker`] from configuration plus injected collaborators.
pub struct CheckerBuilder {
    config: CheckerConfig,
    connection: ConnectionConfig,
    factory: Option<Arc<dyn TransportFactory>>,
    signer: Option<Arc<dyn RequestSigner>>,
    preflight: Option<Arc<dyn PreflightGate>>,
    classifier: Option<Arc<dyn FailureClassifier>>,
    observers: ObserverList,
    thresholds: Thresholds,
}

impl CheckerBuilder {
    /// Validate the config and resolve region and credentials.
    pub fn from_config(config: CheckerConfig) -> Result<Self, CheckerError> {
        config.validate()?;
        let connection = config.connection()?;
        let thresholds = config.thresholds;

        Ok(Self {
            config,
            connection,
            factory: None,
            signer: None,
            preflight: None,
            classifier: None,
            observers: ObserverList::new().with(Arc::new(TracingObserver)),
            thresholds,
        })
    }

    pub fn connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn preflight(mut self, preflight: Arc<dyn PreflightGate>) -> Self {
        self.preflight = Some(preflight);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Append an observer after the ones already registered.
    pub fn observer(mut self, observer: Arc<dyn CollectionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn build(self) -> Result<Checker, CheckerError> {
        let factory = match self.factory {
            Some(factory) => factory,
            None => default_factory()?,
        };

        let catalog = Arc::new(self.config.catalog());
        let registry = Arc::new(LimitRegistry::new(catalog.limits()));

        let mut policy = RetryPolicy::new(self.config.retry.clone());
        if let Some(classifier) = self.classifier {
            policy = policy.with_classifier(classifier);
        }

        let preflight: Arc<dyn PreflightGate> = match (self.preflight, &self.config.preflight) {
            (Some(gate), _) => gate,
            (None, Some(cfg)) => Arc::new(TokenBucketGate::from_config(cfg)),
            (None, None) => Arc::new(Unthrottled),
        };

        let mut collector = UsageCollector::new(self.connection, factory, registry, catalog)
            .with_policy(policy)
            .with_preflight(preflight)
            .with_observers(self.observers);
        if let Some(signer) = self.signer {
            collector = collector.with_signer(signer);
        }

        tracing::debug!(
            limits = collector.catalog().len(),
            max_attempts = collector.policy().max_attempts(),
            "Checker built"
        );

        Ok(Checker {
            collector,
            thresholds: self.thresholds,
            pass_timeout: self.config.pass_timeout,
            max_concurrency: self.config.max_concurrency.max(1),
        })
    }
}

#[cfg(feature = "http")]
fn default_factory() -> Result<Arc<dyn TransportFactory>, CheckerError> {
    Ok(Arc::new(crate::transport::HttpTransportFactory))
}

#[cfg(not(feature = "http"))]
fn default_factory() -> Result<Arc<dyn TransportFactory>, CheckerError> {
    Err(CheckerError::TransportNotConfigured(
        "no transport factory supplied and the `http` feature is disabled".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{Checkpoint, RecordingObserver};
    use crate::testing::*;
    use quotacheck_core::UsageState;

    fn config(extra: &str) -> CheckerConfig {
        let yaml = format!(
            r#"
region: us-east-1
credentials:
  access_key_id: {}
  secret_access_key: {}
retry:
  min_delay: 10ms
  max_delay: 100ms
{}
limits:
  - name: VPCs
    service: ec2
    action: DescribeVpcs
    version: "2015-10-01"
    extract:
      xml_set: vpcSet
    quota: 5
  - name: DefaultVPCs
    service: ec2
    action: DescribeVpcs
    version: "2015-10-01"
    extract:
      xml_set: vpcSet
    quota: 1
"#,
            ACCESS_KEY_ID, SECRET_ACCESS_KEY, extra
        );
        CheckerConfig::from_yaml(&yaml).unwrap()
    }

    fn checker(extra: &str, retrier: Retrier) -> (Checker, Arc<RetrierFactory>) {
        let factory = Arc::new(RetrierFactory::new(retrier));
        let checker = CheckerBuilder::from_config(config(extra))
            .unwrap()
            .transport_factory(factory.clone())
            .build()
            .unwrap();
        (checker, factory)
    }

    #[tokio::test(start_paused = true)]
    async fn test_collect_all() {
        let (checker, factory) = checker("", Retrier::succeeding(DESCRIBE_VPCS_1));

        let reports = checker.collect_all().await.unwrap();

        assert_eq!(
            reports.iter().map(|r| r.limit.as_str()).collect::<Vec<_>>(),
            vec!["DefaultVPCs", "VPCs"]
        );
        assert!(reports.iter().all(|r| r.outcome == CollectionOutcome::Success(1)));
        assert_eq!(factory.connects(), 2);
        assert_eq!(checker.registry().get("VPCs"), Some(UsageState::Count(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_passes_run_in_parallel() {
        let (checker, _factory) = checker(
            "max_concurrency: 2",
            Retrier::succeeding(DESCRIBE_VPCS_1).with_delay(Duration::from_secs(1)),
        );

        let start = tokio::time::Instant::now();
        checker.collect_all().await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound() {
        let (checker, _factory) = checker(
            "max_concurrency: 1",
            Retrier::succeeding(DESCRIBE_VPCS_1).with_delay(Duration::from_secs(1)),
        );

        let start = tokio::time::Instant::now();
        checker.collect_all().await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_registry_unchanged() {
        let recorder = Arc::new(RecordingObserver::new());
        let factory = Arc::new(RetrierFactory::new(
            Retrier::succeeding(DESCRIBE_VPCS_1).with_delay(Duration::from_secs(30)),
        ));
        let checker = CheckerBuilder::from_config(config("pass_timeout: 1s"))
            .unwrap()
            .transport_factory(factory)
            .observer(recorder.clone())
            .build()
            .unwrap();
        checker.registry().set("VPCs", 3).unwrap();

        let report = checker.collect("VPCs").await.unwrap();

        assert!(matches!(report.outcome, CollectionOutcome::PartialUnknown { .. }));
        assert_eq!(checker.registry().get("VPCs"), Some(UsageState::Count(3)));
        assert_eq!(
            recorder.checkpoints_for("VPCs").last(),
            Some(&Checkpoint::Abandoned)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_preflight_gate() {
        let (checker, factory) = checker(
            "preflight:\n  requests_per_second: 0.1\n  burst: 1",
            Retrier::succeeding(DESCRIBE_VPCS_1),
        );

        let reports = checker.collect_all().await.unwrap();

        assert_eq!(factory.transport.count(), 1);
        let rejected = reports
            .iter()
            .filter(|r| {
                matches!(
                    r.outcome,
                    CollectionOutcome::Failure(quotacheck_core::CollectionError::PreflightRateLimited {
                        attempts: 0,
                        ..
                    })
                )
            })
            .count();
        assert_eq!(rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_statuses() {
        let (checker, _factory) = checker("", Retrier::succeeding(DESCRIBE_VPCS_1));
        checker.collect_all().await.unwrap();

        let statuses = checker.statuses();
        assert_eq!(statuses.len(), 2);

        // DefaultVPCs: 1 of 1
        assert_eq!(statuses[0].name, "DefaultVPCs");
        assert_eq!(statuses[0].status, ThresholdStatus::Critical);

        // VPCs: 1 of 5
        assert_eq!(statuses[1].usage, Some(1));
        assert_eq!(statuses[1].quota, Some(5));
        assert_eq!(statuses[1].status, ThresholdStatus::Ok);

        checker.registry().set("VPCs", 4).unwrap();
        assert_eq!(checker.statuses()[1].status, ThresholdStatus::Warning);
    }

    #[tokio::test]
    async fn test_unknown_limit() {
        let (checker, _factory) = checker("", Retrier::succeeding(DESCRIBE_VPCS_1));
        assert!(matches!(
            checker.collect("Subnets").await,
            Err(CheckerError::Registry(RegistryError::UnknownLimit(_)))
        ));
    }

    #[test]
    fn test_threshold_override() {
        let checker = CheckerBuilder::from_config(config(""))
            .unwrap()
            .transport_factory(Arc::new(RetrierFactory::new(Retrier::succeeding(DESCRIBE_VPCS_1))))
            .thresholds(Thresholds::new(50, 60))
            .build()
            .unwrap();
        assert_eq!(checker.thresholds(), Thresholds::new(50, 60));
    }

    #[cfg(not(feature = "http"))]
    #[test]
    fn test_build_requires_transport() {
        let result = CheckerBuilder::from_config(config("")).unwrap().build();
        assert!(matches!(result, Err(CheckerError::TransportNotConfigured(_))));
    }
}
