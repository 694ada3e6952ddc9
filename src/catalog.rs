//! Expected post-install resources.
//!
//! The catalog mirrors every artifact the install bundle produces. Each
//! [`ResourceExpectation`] is evaluated as an independent poll; entries have
//! no ordering dependency on each other.

use std::fmt;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret, Service};
use tokio_util::sync::CancellationToken;

use crate::poll::{
    CatalogObject, ExistenceProbe, ObjectSource, ObjectSources, PollConfig, PollResult,
    ReadinessProbe, poll_until,
};

/// Deployment serving the admission webhooks.
pub const DEPLOYMENT_NAME: &str = "policycontroller-sample-policy-controller-webhook";

pub const VALIDATING_WEBHOOKS: [&str; 2] = [
    "policy.rhtas.com",
    "validating.clusterimagepolicy.rhtas.com",
];

pub const MUTATING_WEBHOOKS: [&str; 2] = [
    "policy.rhtas.com",
    "defaulting.clusterimagepolicy.rhtas.com",
];

pub const WEBHOOK_SERVICE: &str = "webhook";
pub const METRICS_SERVICE: &str = "policycontroller-sample-policy-controller-webhook-metrics";

/// TLS secret backing the webhook endpoint.
pub const WEBHOOK_SECRET: &str = "webhook-certs";

pub const CONFIG_MAPS: [&str; 4] = [
    "config-policy-controller",
    "config-image-policies",
    "config-sigstore-keys",
    "policycontroller-sample-policy-controller-webhook-logging",
];

/// Object kinds the suite reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Namespace,
    Deployment,
    ValidatingWebhookConfiguration,
    MutatingWebhookConfiguration,
    Service,
    Secret,
    ConfigMap,
}

impl ResourceKind {
    pub fn is_namespaced(self) -> bool {
        !matches!(
            self,
            ResourceKind::Namespace
                | ResourceKind::ValidatingWebhookConfiguration
                | ResourceKind::MutatingWebhookConfiguration
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::ValidatingWebhookConfiguration => "ValidatingWebhookConfiguration",
            ResourceKind::MutatingWebhookConfiguration => "MutatingWebhookConfiguration",
            ResourceKind::Service => "Service",
            ResourceKind::Secret => "Secret",
            ResourceKind::ConfigMap => "ConfigMap",
        };
        f.write_str(kind)
    }
}

/// What must become true of the object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Check {
    /// The object can be retrieved.
    Exists,
    /// Ready replicas equal the replicas declared in the object's spec.
    ReplicasReady,
}

/// One fact that must become true of the cluster after install.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceExpectation {
    kind: ResourceKind,
    namespace: Option<String>,
    name: String,
    check: Check,
}

impl ResourceExpectation {
    /// Existence check. The namespace is dropped for cluster-scoped kinds.
    pub fn exists(kind: ResourceKind, namespace: &str, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: kind.is_namespaced().then(|| namespace.to_string()),
            name: name.into(),
            check: Check::Exists,
        }
    }

    /// Deployment ready-replica check.
    pub fn deployment_ready(namespace: &str, name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Deployment,
            namespace: Some(namespace.to_string()),
            name: name.into(),
            check: Check::ReplicasReady,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check(&self) -> Check {
        self.check
    }

    /// Poll the cluster until this expectation holds or the deadline passes.
    ///
    /// The kind decides which typed source `sources` is asked for.
    pub async fn evaluate<S: ObjectSources>(
        &self,
        sources: &S,
        config: &PollConfig,
        cancel: &CancellationToken,
    ) -> PollResult<()> {
        let target = self.to_string();
        let ns = self.namespace.as_deref().unwrap_or_default();
        let name = self.name.as_str();

        if self.check == Check::ReplicasReady {
            let source = sources.namespaced::<Deployment>(ns);
            let mut probe = ReadinessProbe::deployment(source, name, target);
            return poll_until(&mut probe, config, cancel).await.discard_value();
        }

        match self.kind {
            ResourceKind::Namespace => {
                let source = sources.cluster::<Namespace>();
                exists::<Namespace, _>(source, name, target, config, cancel).await
            }
            ResourceKind::ValidatingWebhookConfiguration => {
                let source = sources.cluster::<ValidatingWebhookConfiguration>();
                exists::<ValidatingWebhookConfiguration, _>(source, name, target, config, cancel)
                    .await
            }
            ResourceKind::MutatingWebhookConfiguration => {
                let source = sources.cluster::<MutatingWebhookConfiguration>();
                exists::<MutatingWebhookConfiguration, _>(source, name, target, config, cancel)
                    .await
            }
            ResourceKind::Deployment => {
                let source = sources.namespaced::<Deployment>(ns);
                exists::<Deployment, _>(source, name, target, config, cancel).await
            }
            ResourceKind::Service => {
                let source = sources.namespaced::<Service>(ns);
                exists::<Service, _>(source, name, target, config, cancel).await
            }
            ResourceKind::Secret => {
                let source = sources.namespaced::<Secret>(ns);
                exists::<Secret, _>(source, name, target, config, cancel).await
            }
            ResourceKind::ConfigMap => {
                let source = sources.namespaced::<ConfigMap>(ns);
                exists::<ConfigMap, _>(source, name, target, config, cancel).await
            }
        }
    }

    fn verb(&self) -> &'static str {
        match self.check {
            Check::Exists => "exist",
            Check::ReplicasReady => "become ready",
        }
    }
}

impl fmt::Display for ResourceExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

async fn exists<K, S>(
    source: S,
    name: &str,
    target: String,
    config: &PollConfig,
    cancel: &CancellationToken,
) -> PollResult<()>
where
    K: CatalogObject,
    S: ObjectSource<K>,
{
    let mut probe = ExistenceProbe::new(source, name, target);
    poll_until(&mut probe, config, cancel).await.discard_value()
}

/// Expectations reported together, like one test case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectationGroup {
    pub title: String,
    pub expectations: Vec<ResourceExpectation>,
}

impl ExpectationGroup {
    pub fn new(title: impl Into<String>, expectations: Vec<ResourceExpectation>) -> Self {
        Self {
            title: title.into(),
            expectations,
        }
    }
}

/// Ordered list of expectation groups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssertionCatalog {
    groups: Vec<ExpectationGroup>,
}

impl AssertionCatalog {
    /// Everything the policy-controller bundle installs into `namespace`.
    pub fn policy_controller(namespace: &str) -> Self {
        let mut groups = vec![ExpectationGroup::new(
            "creates and becomes ready the policy-controller Deployment",
            vec![ResourceExpectation::deployment_ready(namespace, DEPLOYMENT_NAME)],
        )];

        for name in VALIDATING_WEBHOOKS {
            groups.push(ExpectationGroup::new(
                format!("creates the ValidatingWebhookConfiguration {name}"),
                vec![ResourceExpectation::exists(
                    ResourceKind::ValidatingWebhookConfiguration,
                    namespace,
                    name,
                )],
            ));
        }
        for name in MUTATING_WEBHOOKS {
            groups.push(ExpectationGroup::new(
                format!("creates the MutatingWebhookConfiguration {name}"),
                vec![ResourceExpectation::exists(
                    ResourceKind::MutatingWebhookConfiguration,
                    namespace,
                    name,
                )],
            ));
        }

        groups.push(ExpectationGroup::new(
            "creates the webhook Service",
            vec![ResourceExpectation::exists(ResourceKind::Service, namespace, WEBHOOK_SERVICE)],
        ));
        groups.push(ExpectationGroup::new(
            "creates the webhook-metrics Service",
            vec![ResourceExpectation::exists(ResourceKind::Service, namespace, METRICS_SERVICE)],
        ));
        groups.push(ExpectationGroup::new(
            "creates the webhook-certs Secret",
            vec![ResourceExpectation::exists(ResourceKind::Secret, namespace, WEBHOOK_SECRET)],
        ));
        groups.push(ExpectationGroup::new(
            "creates all required ConfigMaps",
            CONFIG_MAPS
                .iter()
                .map(|name| ResourceExpectation::exists(ResourceKind::ConfigMap, namespace, *name))
                .collect(),
        ));

        Self { groups }
    }

    pub fn groups(&self) -> &[ExpectationGroup] {
        &self.groups
    }

    pub fn expectations(&self) -> impl Iterator<Item = &ResourceExpectation> {
        self.groups.iter().flat_map(|g| g.expectations.iter())
    }

    pub fn len(&self) -> usize {
        self.expectations().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of one expectation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectationReport {
    pub expectation: ResourceExpectation,
    pub result: PollResult<()>,
}

impl ExpectationReport {
    pub fn passed(&self) -> bool {
        self.result.is_converged()
    }

    /// Failure reason naming the resource and the elapsed wait.
    pub fn failure(&self) -> Option<String> {
        match &self.result {
            PollResult::Converged { .. } => None,
            PollResult::TimedOut { last, elapsed, .. } => Some(format!(
                "timed out after {:.1}s waiting for {} to {}: {}",
                elapsed.as_secs_f64(),
                self.expectation,
                self.expectation.verb(),
                last
            )),
            PollResult::Cancelled { last, elapsed } => Some(format!(
                "cancelled after {:.1}s waiting for {} to {}{}",
                elapsed.as_secs_f64(),
                self.expectation,
                self.expectation.verb(),
                last.as_deref().map(|l| format!(": {l}")).unwrap_or_default()
            )),
        }
    }
}

/// Outcome of one expectation group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupReport {
    pub title: String,
    pub reports: Vec<ExpectationReport>,
}

impl GroupReport {
    pub fn passed(&self) -> bool {
        self.reports.iter().all(ExpectationReport::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = String> + '_ {
        self.reports.iter().filter_map(ExpectationReport::failure)
    }
}
