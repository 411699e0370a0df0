//! Usage collection: one pass per limit.
//!
//! A pass builds one canonical request for the limit's query, then loops
//! attempts under the [`RetryPolicy`]: preflight gate, sign a fresh copy,
//! send, classify, decide. A gate rejection ends the pass only on the first
//! attempt; retries wait for the gate to reopen. Only the terminal outcome reaches the registry,
//! so dropping a pass mid-flight leaves the registry as it was.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;

use quotacheck_core::{
    AttemptResult, CollectionError, CollectionOutcome, CollectionReport, Limit, LimitRegistry,
    RegistryError, RequestAttempt, UsageExtractor,
};

use crate::observer::{LifecycleEvent, ObserverList};
use crate::request::{Endpoint, PreparedRequest, ResourceQuery};
use crate::resilience::{
    AttemptFailure, PreflightGate, PreflightRejection, RetryDecision, RetryPolicy, RetrySchedule,
    Unthrottled,
};
use crate::transport::{
    ConnectionConfig, ProviderResponse, RequestSigner, SigV4Signer, Transport, TransportError,
    TransportFactory,
};

/// A limit and how to measure it.
#[derive(Debug, Clone)]
pub struct LimitSpec {
    pub limit: Limit,
    pub query: ResourceQuery,
    pub extractor: Arc<dyn UsageExtractor>,
}

impl LimitSpec {
    pub fn new(limit: Limit, query: ResourceQuery, extractor: Arc<dyn UsageExtractor>) -> Self {
        Self {
            limit,
            query,
            extractor,
        }
    }
}

/// Limit specs by name.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    specs: BTreeMap<String, LimitSpec>,
}

impl Catalog {
    pub fn new(specs: impl IntoIterator<Item = LimitSpec>) -> Self {
        Self {
            specs: specs
                .into_iter()
                .map(|spec| (spec.limit.name.clone(), spec))
                .collect(),
        }
    }

    pub fn insert(&mut self, spec: LimitSpec) {
        self.specs.insert(spec.limit.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<&LimitSpec> {
        self.specs.get(name)
    }

    /// Names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    /// Fresh copies of every limit, for seeding a registry.
    pub fn limits(&self) -> Vec<Limit> {
        self.specs.values().map(|s| s.limit.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Runs collection passes and records their outcomes in the registry.
pub struct UsageCollector {
    connection: ConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    signer: Arc<dyn RequestSigner>,
    policy: RetryPolicy,
    preflight: Arc<dyn PreflightGate>,
    observers: ObserverList,
    registry: Arc<LimitRegistry>,
    catalog: Arc<Catalog>,
}

impl UsageCollector {
    /// Collector with SigV4 signing, the default retry policy, no preflight
    /// gate and no observers.
    pub fn new(
        connection: ConnectionConfig,
        factory: Arc<dyn TransportFactory>,
        registry: Arc<LimitRegistry>,
        catalog: Arc<Catalog>,
    ) -> Self {
        let signer = Arc::new(SigV4Signer::new(connection.credentials.clone()));
        Self {
            connection,
            factory,
            signer,
            policy: RetryPolicy::default(),
            preflight: Arc::new(Unthrottled),
            observers: ObserverList::new(),
            registry,
            catalog,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.signer = signer;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_preflight(mut self, preflight: Arc<dyn PreflightGate>) -> Self {
        self.preflight = preflight;
        self
    }

    pub fn with_observers(mut self, observers: ObserverList) -> Self {
        self.observers = observers;
        self
    }

    pub fn registry(&self) -> &Arc<LimitRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub(crate) fn observers(&self) -> &ObserverList {
        &self.observers
    }

    /// Collect one limit and record the outcome.
    ///
    /// Each call connects its own transport handle.
    pub async fn collect(&self, name: &str) -> Result<CollectionReport, RegistryError> {
        let spec = self
            .catalog
            .get(name)
            .ok_or_else(|| RegistryError::UnknownLimit(name.to_string()))?;

        let report = match self.factory.connect(&self.connection) {
            Ok(transport) => self.run_pass(spec, transport.as_ref()).await,
            Err(err) => {
                tracing::error!(limit = %name, error = %err, "Could not connect transport");
                self.observers.notify(&LifecycleEvent::PassStarted {
                    limit: name.to_string(),
                });
                self.finish(name, CollectionOutcome::Failure(setup_error(&err)), Vec::new())
            }
        };

        self.registry.apply(name, &report.outcome)?;
        Ok(report)
    }

    /// Run one pass against a transport. Does not touch the registry.
    pub async fn run_pass(&self, spec: &LimitSpec, transport: &dyn Transport) -> CollectionReport {
        let name = spec.limit.name.as_str();
        self.observers.notify(&LifecycleEvent::PassStarted {
            limit: name.to_string(),
        });

        let canonical = match self.prepare(&spec.query) {
            Ok(request) => request,
            Err(err) => {
                return self.finish(name, CollectionOutcome::Failure(setup_error(&err)), Vec::new());
            }
        };

        let mut schedule = self.policy.schedule();
        let mut attempts = Vec::new();

        let outcome = loop {
            let index = schedule.begin_attempt();
            let started_at = Utc::now();
            let mut request = canonical.clone();
            self.observers.notify(&LifecycleEvent::RequestBuilt {
                limit: name.to_string(),
                attempt: index,
            });

            let result = self
                .attempt(name, index, &mut request, transport, &mut schedule)
                .await;

            let (sent, result_record) = match &result {
                Ok(response) => (true, AttemptResult::Succeeded { status: response.status }),
                Err(failure) => (
                    failure.was_sent(),
                    AttemptResult::Failed {
                        class: self.policy.classify(failure),
                        reason: failure.to_string(),
                    },
                ),
            };
            attempts.push(RequestAttempt {
                index,
                action: spec.query.action.clone(),
                body: request.body.clone(),
                started_at,
                sent,
                result: result_record,
            });

            let decision = self.policy.decide(&mut schedule, &result);
            self.observers.notify(&LifecycleEvent::RetryChecked {
                limit: name.to_string(),
                attempt: index,
                decision: decision.clone(),
            });

            match decision {
                RetryDecision::RetryNow => continue,
                RetryDecision::RetryAfter(delay) => {
                    tracing::debug!(limit = %name, attempt = index, delay = ?delay, "Backing off");
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::SurfaceSuccess => {
                    let body = result.map(|r| r.body).unwrap_or_default();
                    break match spec.extractor.count(&body) {
                        Ok(count) => CollectionOutcome::Success(count),
                        Err(err) => CollectionOutcome::Failure(CollectionError::ParseError(err)),
                    };
                }
                RetryDecision::SurfaceFailure(err) => break CollectionOutcome::Failure(err),
            }
        };

        self.finish(name, outcome, attempts)
    }

    fn prepare(&self, query: &ResourceQuery) -> Result<PreparedRequest, TransportError> {
        let endpoint = match &self.connection.endpoint_url {
            Some(url) => Endpoint::with_url(&query.service, &self.connection.region, url)?,
            None => Endpoint::resolve(&query.service, &self.connection.region)?,
        };
        Ok(PreparedRequest::build(query, &endpoint))
    }

    async fn attempt(
        &self,
        name: &str,
        index: u32,
        request: &mut PreparedRequest,
        transport: &dyn Transport,
        schedule: &mut RetrySchedule,
    ) -> Result<ProviderResponse, AttemptFailure> {
        self.admit(name, index, &request.service).await?;

        self.signer.sign(request, Utc::now())?;
        self.observers.notify(&LifecycleEvent::Signed {
            limit: name.to_string(),
            attempt: index,
        });

        schedule.mark_sent();
        let result = transport
            .send(request, &self.connection.send)
            .await
            .map_err(AttemptFailure::from);

        let (status, class) = match &result {
            Ok(response) => (Some(response.status), None),
            Err(failure) => (failure.status(), Some(self.policy.classify(failure))),
        };
        self.observers.notify(&LifecycleEvent::Sent {
            limit: name.to_string(),
            attempt: index,
            status,
            class,
        });

        result
    }

    async fn admit(&self, name: &str, index: u32, service: &str) -> Result<(), PreflightRejection> {
        let mut waits = 0;
        loop {
            match self.preflight.check(service) {
                Ok(()) => return Ok(()),
                Err(rejection) if index == 1 || waits >= self.policy.max_attempts() => {
                    return Err(rejection)
                }
                Err(rejection) => {
                    waits += 1;
                    tracing::debug!(
                        limit = %name,
                        attempt = index,
                        retry_in = ?rejection.retry_in,
                        "Waiting for preflight gate"
                    );
                    tokio::time::sleep(rejection.retry_in).await;
                }
            }
        }
    }

    fn finish(
        &self,
        name: &str,
        outcome: CollectionOutcome,
        attempts: Vec<RequestAttempt>,
    ) -> CollectionReport {
        let report = CollectionReport {
            limit: name.to_string(),
            outcome,
            attempts,
        };
        self.observers.notify(&LifecycleEvent::Completed {
            limit: name.to_string(),
            outcome: report.outcome.clone(),
            exchanges: report.exchanges(),
        });
        report
    }
}

/// A pass that could not build or connect fails without any exchange.
fn setup_error(err: &TransportError) -> CollectionError {
    CollectionError::TerminalProviderError {
        status: err.status(),
        code: err.code().to_string(),
        message: err.message(),
    }
}
