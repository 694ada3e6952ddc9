//! Bounded convergence polling.
//!
//! The control plane reconciles asynchronously, so nothing installed by the
//! bundle is guaranteed to exist right after `apply` returns. Every check in
//! the suite is a [`Probe`] driven by [`poll_until`], which retries at a fixed
//! interval until the probe is satisfied, the deadline passes, or the suite
//! is cancelled.
//!
//! `poll_until` never blocks for longer than `timeout + interval`: the last
//! attempt starts no later than the deadline and is itself bounded by one
//! interval.

use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT};

/// Result of a single probe evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// Observed and satisfied.
    Satisfied(T),
    /// Observed but not yet satisfied.
    Unsatisfied(String),
    /// Not yet observed (not found, or the API call failed).
    NotObserved(String),
}

/// Final result of [`poll_until`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollResult<T> {
    Converged {
        value: T,
        attempts: u32,
        elapsed: Duration,
    },
    TimedOut {
        /// Reason reported by the last attempt.
        last: String,
        attempts: u32,
        elapsed: Duration,
    },
    Cancelled {
        last: Option<String>,
        elapsed: Duration,
    },
}

impl<T> PollResult<T> {
    pub fn is_converged(&self) -> bool {
        matches!(self, PollResult::Converged { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            PollResult::Converged { elapsed, .. }
            | PollResult::TimedOut { elapsed, .. }
            | PollResult::Cancelled { elapsed, .. } => *elapsed,
        }
    }

    /// Drop the converged value, keeping timing and failure details.
    pub fn discard_value(self) -> PollResult<()> {
        match self {
            PollResult::Converged {
                attempts, elapsed, ..
            } => PollResult::Converged {
                value: (),
                attempts,
                elapsed,
            },
            PollResult::TimedOut {
                last,
                attempts,
                elapsed,
            } => PollResult::TimedOut {
                last,
                attempts,
                elapsed,
            },
            PollResult::Cancelled { last, elapsed } => PollResult::Cancelled { last, elapsed },
        }
    }
}

/// Deadline and retry interval for one poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_POLL_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl PollConfig {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// A repeatable check against the cluster.
pub trait Probe: Send {
    type Output: Send;

    /// Human readable target, e.g. `Deployment ns/name`.
    fn describe(&self) -> String;

    fn check(&mut self) -> impl Future<Output = PollOutcome<Self::Output>> + Send;
}

/// Evaluate `probe` until it is satisfied, `config.timeout` elapses, or
/// `cancel` fires.
pub async fn poll_until<P: Probe>(
    probe: &mut P,
    config: &PollConfig,
    cancel: &CancellationToken,
) -> PollResult<P::Output> {
    let start = Instant::now();
    let deadline = start + config.timeout;
    let hard_stop = deadline + config.interval;
    let target = probe.describe();
    let mut attempts = 0u32;
    let mut last: Option<String> = None;

    loop {
        attempts += 1;
        let budget = hard_stop.saturating_duration_since(Instant::now());

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(target = %target, attempts, "Poll cancelled");
                return PollResult::Cancelled { last, elapsed: start.elapsed() };
            }
            res = timeout(budget, probe.check()) => res.unwrap_or_else(|_| {
                let cutoff = format!("attempt did not finish within {budget:?}");
                PollOutcome::NotObserved(match &last {
                    Some(previous) => format!("{previous} ({cutoff})"),
                    None => cutoff,
                })
            }),
        };

        match outcome {
            PollOutcome::Satisfied(value) => {
                debug!(
                    target = %target,
                    attempts,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Converged"
                );
                return PollResult::Converged {
                    value,
                    attempts,
                    elapsed: start.elapsed(),
                };
            }
            PollOutcome::Unsatisfied(reason) | PollOutcome::NotObserved(reason) => {
                debug!(target = %target, attempt = attempts, reason = %reason, "Not converged yet");
                last = Some(reason);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            let last = last.unwrap_or_else(|| "no observation recorded".to_string());
            warn!(
                target = %target,
                attempts,
                timeout_ms = config.timeout.as_millis() as u64,
                last = %last,
                "Timed out waiting for convergence"
            );
            return PollResult::TimedOut {
                last,
                attempts,
                elapsed: start.elapsed(),
            };
        }

        // Sleep at most until the deadline so one final attempt lands on it.
        let pause = config.interval.min(deadline - now);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(target = %target, attempts, "Poll cancelled");
                return PollResult::Cancelled { last, elapsed: start.elapsed() };
            }
            _ = sleep(pause) => {}
        }
    }
}

/// Typed get-by-name access to one kind of object.
///
/// `Ok(None)` means not found. Implemented for [`kube::Api`]; tests supply
/// scripted sources.
pub trait ObjectSource<K>: Send + Sync {
    fn fetch(&self, name: &str) -> impl Future<Output = Result<Option<K>, kube::Error>> + Send;
}

impl<K> ObjectSource<K> for Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn fetch(&self, name: &str) -> Result<Option<K>, kube::Error> {
        self.get_opt(name).await
    }
}

impl<K, S: ObjectSource<K>> ObjectSource<K> for Arc<S> {
    async fn fetch(&self, name: &str) -> Result<Option<K>, kube::Error> {
        self.as_ref().fetch(name).await
    }
}

/// Object types the catalog can check.
pub trait CatalogObject:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<K> CatalogObject for K where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
}

/// Hands out a typed [`ObjectSource`] per kind and scope.
///
/// Implemented for [`kube::Client`]; tests record which kind was asked for.
pub trait ObjectSources: Send + Sync {
    type Source<K: CatalogObject>: ObjectSource<K>;

    fn namespaced<K>(&self, namespace: &str) -> Self::Source<K>
    where
        K: CatalogObject + Resource<Scope = NamespaceResourceScope>;

    fn cluster<K: CatalogObject>(&self) -> Self::Source<K>;
}

impl ObjectSources for Client {
    type Source<K: CatalogObject> = Api<K>;

    fn namespaced<K>(&self, namespace: &str) -> Self::Source<K>
    where
        K: CatalogObject + Resource<Scope = NamespaceResourceScope>,
    {
        Api::namespaced(self.clone(), namespace)
    }

    fn cluster<K: CatalogObject>(&self) -> Self::Source<K> {
        Api::all(self.clone())
    }
}

/// Satisfied as soon as the object can be retrieved.
pub struct ExistenceProbe<K, S> {
    source: S,
    name: String,
    target: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K, S> ExistenceProbe<K, S>
where
    S: ObjectSource<K>,
{
    /// `target` is used in log lines and failure reasons.
    pub fn new(source: S, name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source,
            name: name.into(),
            target: target.into(),
            _kind: PhantomData,
        }
    }
}

impl<K, S> Probe for ExistenceProbe<K, S>
where
    K: Send,
    S: ObjectSource<K>,
{
    type Output = K;

    fn describe(&self) -> String {
        self.target.clone()
    }

    async fn check(&mut self) -> PollOutcome<K> {
        match self.source.fetch(&self.name).await {
            Ok(Some(obj)) => PollOutcome::Satisfied(obj),
            Ok(None) => PollOutcome::NotObserved(format!("{} not found", self.target)),
            Err(e) => PollOutcome::NotObserved(format!("failed to get {}: {e}", self.target)),
        }
    }
}

/// Ready and desired counts observed when a readiness probe converged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Readiness {
    pub ready: i32,
    pub desired: i32,
}

/// Compares an observed count against the desired count declared by the
/// object itself.
///
/// The desired count is read once, from the first successful retrieval, and
/// reused for every later attempt.
pub struct ReadinessProbe<K, S> {
    source: S,
    name: String,
    target: String,
    desired_of: fn(&K) -> i32,
    observed_of: fn(&K) -> i32,
    desired: Option<i32>,
}

impl<K, S> ReadinessProbe<K, S>
where
    S: ObjectSource<K>,
{
    pub fn new(
        source: S,
        name: impl Into<String>,
        target: impl Into<String>,
        desired_of: fn(&K) -> i32,
        observed_of: fn(&K) -> i32,
    ) -> Self {
        Self {
            source,
            name: name.into(),
            target: target.into(),
            desired_of,
            observed_of,
            desired: None,
        }
    }
}

impl<S> ReadinessProbe<Deployment, S>
where
    S: ObjectSource<Deployment>,
{
    /// `status.readyReplicas` against `spec.replicas`.
    pub fn deployment(source: S, name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            source,
            name,
            target,
            deployment_desired_replicas,
            deployment_ready_replicas,
        )
    }
}

impl<K, S> Probe for ReadinessProbe<K, S>
where
    K: Send,
    S: ObjectSource<K>,
{
    type Output = Readiness;

    fn describe(&self) -> String {
        self.target.clone()
    }

    async fn check(&mut self) -> PollOutcome<Readiness> {
        let obj = match self.source.fetch(&self.name).await {
            Ok(Some(obj)) => obj,
            Ok(None) => return PollOutcome::NotObserved(format!("{} not found", self.target)),
            Err(e) => {
                return PollOutcome::NotObserved(format!("failed to get {}: {e}", self.target));
            }
        };

        let desired = *self.desired.get_or_insert_with(|| (self.desired_of)(&obj));
        let ready = (self.observed_of)(&obj);

        if ready == desired {
            PollOutcome::Satisfied(Readiness { ready, desired })
        } else {
            PollOutcome::Unsatisfied(format!(
                "{}: {ready}/{desired} replicas ready",
                self.target
            ))
        }
    }
}

/// `spec.replicas`, defaulting to 1 like the API server does.
pub fn deployment_desired_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

pub fn deployment_ready_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}
