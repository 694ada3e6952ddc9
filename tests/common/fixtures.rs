//! Test fixtures, fakes and builders shared by unit, proptest and
//! integration tests.

#![allow(dead_code)]

use std::collections::{BTreeSet, VecDeque};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use kube::core::ErrorResponse;
use tokio_util::sync::CancellationToken;

use policy_controller_e2e::bundle::{CommandOutput, CommandRunner};
use policy_controller_e2e::catalog::ResourceExpectation;
use policy_controller_e2e::error::{Error, Result};
use policy_controller_e2e::namespace::NamespaceState;
use policy_controller_e2e::poll::{
    CatalogObject, ExistenceProbe, ObjectSource, ObjectSources, PollConfig, PollResult, poll_until,
};
use policy_controller_e2e::suite::ClusterOps;

/// Minimal kubeconfig accepted by the client builder without contacting
/// the server.
pub const TEST_KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- cluster:
    server: https://127.0.0.1:6443
    insecure-skip-tls-verify: true
  name: test
contexts:
- context:
    cluster: test
    user: test
  name: test
current-context: test
users:
- name: test
  user:
    token: fake-token
"#;

/// Build an API error response.
pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} (test)"),
        reason: reason.to_string(),
        code,
    })
}

// ============================================================
// Deployment Builder
// ============================================================

/// Builder for Deployment objects as returned by the API server.
#[derive(Clone, Debug)]
pub struct DeploymentBuilder {
    name: String,
    namespace: String,
    replicas: Option<i32>,
    ready_replicas: Option<i32>,
}

impl DeploymentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "policy-controller-operator".to_string(),
            replicas: Some(1),
            ready_replicas: None,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Desired replicas (`spec.replicas`). `None` leaves it unset.
    pub fn replicas(mut self, replicas: Option<i32>) -> Self {
        self.replicas = replicas;
        self
    }

    /// `status.readyReplicas`. `None` leaves the status empty.
    pub fn ready(mut self, ready: Option<i32>) -> Self {
        self.ready_replicas = ready;
        self
    }

    pub fn build(self) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(self.name),
                namespace: Some(self.namespace),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: self.replicas,
                ..Default::default()
            }),
            status: self.ready_replicas.map(|ready| DeploymentStatus {
                ready_replicas: Some(ready),
                ..Default::default()
            }),
        }
    }
}

/// A Deployment with `desired` replicas of which `ready` are ready.
pub fn deployment(desired: i32, ready: i32) -> Deployment {
    DeploymentBuilder::new("policycontroller-sample-policy-controller-webhook")
        .replicas(Some(desired))
        .ready(Some(ready))
        .build()
}

// ============================================================
// Object Sources
// ============================================================

/// Returns scripted observations in order; the last one repeats.
///
/// `None` entries are not-found observations.
pub struct ScriptedSource<K> {
    script: Mutex<VecDeque<Option<K>>>,
    fetches: Mutex<usize>,
}

impl<K: Clone> ScriptedSource<K> {
    pub fn new(script: Vec<Option<K>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fetches: Mutex::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        *self.fetches.lock().unwrap()
    }
}

impl<K: Clone + Send> ObjectSource<K> for ScriptedSource<K> {
    async fn fetch(&self, _name: &str) -> std::result::Result<Option<K>, kube::Error> {
        *self.fetches.lock().unwrap() += 1;
        let mut script = self.script.lock().unwrap();
        let next = if script.len() > 1 {
            script.pop_front().flatten()
        } else {
            script.front().cloned().flatten()
        };
        Ok(next)
    }
}

/// Fails every fetch with the given API error code.
pub struct FailingSource {
    pub code: u16,
}

impl<K: Send> ObjectSource<K> for FailingSource {
    async fn fetch(&self, _name: &str) -> std::result::Result<Option<K>, kube::Error> {
        Err(api_error(self.code, "InternalError"))
    }
}

/// Source factory that logs `Kind ns/name` (or `Kind name` for cluster
/// scope) for every fetch, using the kind of the typed source it was asked
/// for. Every object is reported missing.
#[derive(Clone)]
pub struct RecordingSources {
    pub log: EventLog,
}

impl RecordingSources {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

pub struct RecordedSource<K> {
    log: EventLog,
    namespace: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: CatalogObject> ObjectSource<K> for RecordedSource<K> {
    async fn fetch(&self, name: &str) -> std::result::Result<Option<K>, kube::Error> {
        let kind = K::kind(&());
        let entry = match &self.namespace {
            Some(ns) => format!("{kind} {ns}/{name}"),
            None => format!("{kind} {name}"),
        };
        self.log.lock().unwrap().push(entry);
        Ok(None)
    }
}

impl ObjectSources for RecordingSources {
    type Source<K: CatalogObject> = RecordedSource<K>;

    fn namespaced<K>(&self, namespace: &str) -> Self::Source<K>
    where
        K: CatalogObject + Resource<Scope = NamespaceResourceScope>,
    {
        RecordedSource {
            log: self.log.clone(),
            namespace: Some(namespace.to_string()),
            _kind: PhantomData,
        }
    }

    fn cluster<K: CatalogObject>(&self) -> Self::Source<K> {
        RecordedSource {
            log: self.log.clone(),
            namespace: None,
            _kind: PhantomData,
        }
    }
}

// ============================================================
// Command Runner
// ============================================================

/// Shared, ordered log of what the fakes observed.
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Records invocations and answers with configured exit codes.
///
/// Like a real runner, it refuses to start when the token is already
/// cancelled; such calls are not recorded.
#[derive(Clone)]
pub struct RecordingRunner {
    pub log: EventLog,
    pub calls: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    pub apply_code: i32,
    pub delete_code: i32,
    /// Block until cancelled instead of answering.
    pub hang: bool,
    /// Like `hang`, for `delete` only.
    pub hang_delete: bool,
}

impl RecordingRunner {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            calls: Arc::new(Mutex::new(Vec::new())),
            apply_code: 0,
            delete_code: 0,
            hang: false,
            hang_delete: false,
        }
    }

    pub fn apply_exit(mut self, code: i32) -> Self {
        self.apply_code = code;
        self
    }

    pub fn delete_exit(mut self, code: i32) -> Self {
        self.delete_code = code;
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn hanging_on_delete(mut self) -> Self {
        self.hang_delete = true;
        self
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of invocations whose first argument is `verb`.
    pub fn count(&self, verb: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(_, args)| args.first().map(String::as_str) == Some(verb))
            .count()
    }
}

impl CommandRunner for RecordingRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        let verb = args.first().cloned().unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("{program} {verb}")));
        }
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        self.log.lock().unwrap().push(verb.clone());

        if self.hang || (self.hang_delete && verb == "delete") {
            cancel.cancelled().await;
            return Err(Error::Cancelled(format!("{program} {verb}")));
        }

        let code = if verb == "apply" {
            self.apply_code
        } else {
            self.delete_code
        };
        Ok(CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: if code == 0 {
                String::new()
            } else {
                format!("error: {verb} failed")
            },
        })
    }
}

// ============================================================
// Cluster
// ============================================================

/// How the fake answers `ensure_namespace`.
#[derive(Clone, Copy, Debug)]
pub enum NamespaceBehaviour {
    Create,
    AlreadyExists,
    Forbidden,
}

/// In-memory cluster: every expectation converges except the names listed
/// in `missing`, which are polled until their deadline.
pub struct FakeCluster {
    pub log: EventLog,
    pub namespace: NamespaceBehaviour,
    pub missing: BTreeSet<String>,
}

impl FakeCluster {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            namespace: NamespaceBehaviour::Create,
            missing: BTreeSet::new(),
        }
    }

    pub fn namespace(mut self, behaviour: NamespaceBehaviour) -> Self {
        self.namespace = behaviour;
        self
    }

    pub fn missing(mut self, name: &str) -> Self {
        self.missing.insert(name.to_string());
        self
    }
}

impl ClusterOps for FakeCluster {
    async fn ensure_namespace(&self, name: &str) -> Result<NamespaceState> {
        self.log.lock().unwrap().push("namespace".to_string());
        match self.namespace {
            NamespaceBehaviour::Create => Ok(NamespaceState::Created),
            NamespaceBehaviour::AlreadyExists => Ok(NamespaceState::AlreadyExists),
            NamespaceBehaviour::Forbidden => Err(Error::NamespaceCreate {
                namespace: name.to_string(),
                source: api_error(403, "Forbidden"),
            }),
        }
    }

    async fn evaluate(
        &self,
        expectation: &ResourceExpectation,
        defaults: &PollConfig,
        cancel: &CancellationToken,
    ) -> PollResult<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("evaluate:{}", expectation.name()));

        let present = !self.missing.contains(expectation.name());
        let source: ScriptedSource<ConfigMap> =
            ScriptedSource::new(vec![present.then(ConfigMap::default)]);
        let mut probe = ExistenceProbe::new(source, expectation.name(), expectation.to_string());
        poll_until(&mut probe, defaults, cancel)
            .await
            .discard_value()
    }
}
