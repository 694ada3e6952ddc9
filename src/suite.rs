//! The ordered install suite.
//!
//! Setup runs first (namespace, then bundle apply) and any failure there
//! aborts the run before a single expectation is polled. Expectations are
//! then evaluated one after another; a timeout is recorded and the run moves
//! on. The bundle is removed exactly once after the last expectation, and a
//! removal failure is reported next to, never instead of, the expectation
//! results.
//!
//! Cancellation during setup aborts with [`Error::Cancelled`]. Cancellation
//! during evaluation makes the remaining polls return cancelled at once; the
//! bundle is still removed.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bundle::{BundleApplier, CommandRunner, ManifestBundle, ProcessRunner};
use crate::catalog::{AssertionCatalog, ExpectationReport, GroupReport, ResourceExpectation};
use crate::config::HarnessConfig;
use crate::error::{Error, Result};
use crate::namespace::{NamespaceState, ensure_namespace};
use crate::poll::{PollConfig, PollResult};
use crate::session::ClusterSession;

/// Cluster operations the suite depends on (allows mocking in tests).
pub trait ClusterOps: Send + Sync {
    fn ensure_namespace(&self, name: &str) -> impl Future<Output = Result<NamespaceState>> + Send;

    fn evaluate(
        &self,
        expectation: &ResourceExpectation,
        defaults: &PollConfig,
        cancel: &CancellationToken,
    ) -> impl Future<Output = PollResult<()>> + Send;
}

/// [`ClusterOps`] backed by a live API client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ClusterOps for KubeCluster {
    async fn ensure_namespace(&self, name: &str) -> Result<NamespaceState> {
        ensure_namespace(self.client.clone(), name).await
    }

    async fn evaluate(
        &self,
        expectation: &ResourceExpectation,
        defaults: &PollConfig,
        cancel: &CancellationToken,
    ) -> PollResult<()> {
        expectation.evaluate(&self.client, defaults, cancel).await
    }
}

/// Install, verify and remove the bundle.
pub struct InstallSuite<C, R> {
    cluster: C,
    applier: Arc<BundleApplier<R>>,
    bundle: ManifestBundle,
    namespace: String,
    catalog: AssertionCatalog,
    poll: PollConfig,
}

impl InstallSuite<KubeCluster, ProcessRunner> {
    /// Suite against a live cluster, resolving the bundle path against
    /// `base_dir`.
    pub fn from_config(session: &ClusterSession, config: &HarnessConfig, base_dir: &Path) -> Self {
        Self::new(
            KubeCluster::new(session.client().clone()),
            BundleApplier::new(config.kubectl.clone(), ProcessRunner)
                .with_teardown_timeout(config.teardown_timeout),
            ManifestBundle::new(config.absolute_bundle_path(base_dir)),
            &config.namespace,
            AssertionCatalog::policy_controller(&config.namespace),
            PollConfig::new(config.poll_timeout, config.poll_interval),
        )
    }
}

impl<C, R> InstallSuite<C, R>
where
    C: ClusterOps,
    R: CommandRunner + 'static,
{
    pub fn new(
        cluster: C,
        applier: BundleApplier<R>,
        bundle: ManifestBundle,
        namespace: &str,
        catalog: AssertionCatalog,
        poll: PollConfig,
    ) -> Self {
        Self {
            cluster,
            applier: Arc::new(applier),
            bundle,
            namespace: namespace.to_string(),
            catalog,
            poll,
        }
    }

    pub fn catalog(&self) -> &AssertionCatalog {
        &self.catalog
    }

    /// Run the suite. `Err` means setup failed and nothing was evaluated.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<SuiteReport> {
        let start = Instant::now();

        info!(namespace = %self.namespace, "Ensuring namespace exists");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!("ensuring namespace {}", self.namespace)));
            }
            state = self.cluster.ensure_namespace(&self.namespace) => { state?; }
        }

        let installed = Arc::clone(&self.applier)
            .install(self.bundle.clone(), &self.namespace, cancel)
            .await?;

        let mut groups = Vec::with_capacity(self.catalog.groups().len());
        for group in self.catalog.groups() {
            info!(group = %group.title, "Evaluating");
            let mut reports = Vec::with_capacity(group.expectations.len());
            for expectation in &group.expectations {
                let result = self.cluster.evaluate(expectation, &self.poll, cancel).await;
                let report = ExpectationReport {
                    expectation: expectation.clone(),
                    result,
                };
                if let Some(reason) = report.failure() {
                    warn!(
                        group = %group.title,
                        elapsed_ms = report.result.elapsed().as_millis() as u64,
                        "{reason}"
                    );
                }
                reports.push(report);
            }
            groups.push(GroupReport {
                title: group.title.clone(),
                reports,
            });
        }

        let teardown = installed.teardown().await.err();
        if let Some(e) = &teardown {
            error!(error = %e, "Bundle teardown failed");
        }

        Ok(SuiteReport {
            groups,
            teardown,
            elapsed: start.elapsed(),
        })
    }
}

/// Aggregated results of one suite run.
#[derive(Debug)]
pub struct SuiteReport {
    pub groups: Vec<GroupReport>,
    /// Bundle removal failure, reported independently of the groups.
    pub teardown: Option<Error>,
    pub elapsed: Duration,
}

impl SuiteReport {
    pub fn passed(&self) -> bool {
        self.teardown.is_none() && self.groups.iter().all(GroupReport::passed)
    }

    /// Every failure reason, expectation failures first.
    pub fn failures(&self) -> Vec<String> {
        let mut failures: Vec<String> = self.groups.iter().flat_map(GroupReport::failures).collect();
        if let Some(e) = &self.teardown {
            failures.push(e.to_string());
        }
        failures
    }

    pub fn expectations_passed(&self) -> usize {
        self.reports().filter(|r| r.passed()).count()
    }

    pub fn expectations_total(&self) -> usize {
        self.reports().count()
    }

    fn reports(&self) -> impl Iterator<Item = &ExpectationReport> {
        self.groups.iter().flat_map(|g| g.reports.iter())
    }
}

impl fmt::Display for SuiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for group in &self.groups {
            let mark = if group.passed() { "PASS" } else { "FAIL" };
            writeln!(f, "[{mark}] {}", group.title)?;
            for failure in group.failures() {
                writeln!(f, "       {failure}")?;
            }
        }
        if let Some(e) = &self.teardown {
            writeln!(f, "[FAIL] teardown: {e}")?;
        }
        write!(
            f,
            "{}/{} expectations converged in {:.1}s",
            self.expectations_passed(),
            self.expectations_total(),
            self.elapsed.as_secs_f64()
        )
    }
}
