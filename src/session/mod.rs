//! Cluster session bootstrap.
//!
//! The kubeconfig is resolved and read exactly once per suite run by the
//! designated worker. Its raw bytes are broadcast through a [`Participant`]
//! rendezvous and every worker builds its own [`ClusterSession`] from the
//! identical payload. The session lives in a per-worker [`SessionSlot`] that
//! is cleared by the synchronized teardown.

mod rendezvous;

pub use rendezvous::{Participant, rendezvous};

use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Serialized kubeconfig exactly as read from disk.
pub type CredentialPayload = Arc<[u8]>;

/// Locate the kubeconfig: first entry of `KUBECONFIG`, else `~/.kube/config`.
pub fn resolve_kubeconfig_path() -> Result<PathBuf> {
    kubeconfig_path_from(std::env::var_os("KUBECONFIG"), dirs::home_dir())
        .ok_or(Error::CredentialsNotFound)
}

/// Path resolution with the environment and home directory supplied.
pub fn kubeconfig_path_from(env: Option<OsString>, home: Option<PathBuf>) -> Option<PathBuf> {
    env.and_then(|value| std::env::split_paths(&value).find(|p| !p.as_os_str().is_empty()))
        .or_else(|| home.map(|h| h.join(".kube").join("config")))
}

/// Read the kubeconfig into an opaque payload.
pub async fn read_credentials(path: &Path) -> Result<CredentialPayload> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| Error::CredentialsUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), bytes = bytes.len(), "Read kubeconfig");
    Ok(bytes.into())
}

/// Resolve and read the ambient kubeconfig.
pub async fn load_ambient_credentials() -> Result<CredentialPayload> {
    let path = resolve_kubeconfig_path()?;
    read_credentials(&path).await
}

/// Parse a kubeconfig payload.
pub fn parse_kubeconfig(payload: &[u8]) -> Result<Kubeconfig> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| Error::InvalidKubeconfig(format!("not UTF-8: {e}")))?;
    serde_yaml::from_str(text).map_err(|e| Error::InvalidKubeconfig(format!("invalid YAML: {e}")))
}

/// Install the rustls crypto provider used by the kube client.
///
/// Safe to call more than once.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// A typed API client built from the broadcast kubeconfig.
#[derive(Clone)]
pub struct ClusterSession {
    payload: CredentialPayload,
    cluster_url: String,
    client: Client,
}

impl std::fmt::Debug for ClusterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSession")
            .field("cluster_url", &self.cluster_url)
            .field("payload_bytes", &self.payload.len())
            .finish_non_exhaustive()
    }
}

impl ClusterSession {
    /// Build a session from a kubeconfig payload without contacting the
    /// cluster.
    pub async fn from_payload(payload: CredentialPayload) -> Result<Self> {
        install_crypto_provider();

        let kubeconfig = parse_kubeconfig(&payload)?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::ClientConstruction(format!("failed to build config: {e}")))?;
        let cluster_url = config.cluster_url.to_string();
        let client = Client::try_from(config)
            .map_err(|e| Error::ClientConstruction(format!("failed to create client: {e}")))?;

        Ok(Self {
            payload,
            cluster_url,
            client,
        })
    }

    /// Build a session and verify the API server answers.
    pub async fn connect(payload: CredentialPayload) -> Result<Self> {
        let session = Self::from_payload(payload).await?;
        session.verify().await?;
        Ok(session)
    }

    /// Quick health check against the API server.
    pub async fn verify(&self) -> Result<()> {
        let version = self
            .client
            .apiserver_version()
            .await
            .map_err(|e| Error::ClientConstruction(format!("API server unreachable: {e}")))?;
        info!(
            cluster = %self.cluster_url,
            platform = %version.platform,
            version = %version.git_version,
            "Connected to Kubernetes cluster"
        );
        Ok(())
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The exact bytes this session was built from.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn cluster_url(&self) -> &str {
        &self.cluster_url
    }
}

/// Holds the worker's active session between setup and teardown.
#[derive(Debug, Default)]
pub struct SessionSlot {
    inner: RwLock<Option<Arc<ClusterSession>>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn install(&self, session: Arc<ClusterSession>) {
        *self.inner.write().await = Some(session);
    }

    /// The active session, or an error if setup has not run or teardown
    /// already cleared it.
    pub async fn get(&self) -> Result<Arc<ClusterSession>> {
        self.inner
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::ClientConstruction("no active cluster session".to_string()))
    }

    pub async fn is_active(&self) -> bool {
        self.inner.read().await.is_some()
    }

    pub async fn clear(&self) {
        self.inner.write().await.take();
    }
}

/// Setup hook run by every worker.
///
/// The designated worker resolves credentials with `load`; every worker
/// builds a session from the broadcast payload and installs it in `slot`,
/// where test bodies pick it up with [`SessionSlot::get`]. When `verify` is
/// set the API server is contacted before returning.
pub async fn synchronized_setup<F, Fut>(
    participant: &mut Participant<CredentialPayload>,
    slot: &SessionSlot,
    load: F,
    verify: bool,
) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<CredentialPayload>>,
{
    let payload = participant.synchronize(load).await?;

    let session = if verify {
        ClusterSession::connect(payload).await?
    } else {
        ClusterSession::from_payload(payload).await?
    };
    debug!(
        worker = participant.index(),
        cluster = %session.cluster_url(),
        kubeconfig_bytes = session.payload().len(),
        "Cluster session ready"
    );
    slot.install(Arc::new(session)).await;
    Ok(())
}

/// Teardown hook run by every worker: clear the local session, then
/// rendezvous. The designated-only phase has nothing to release.
pub async fn synchronized_teardown(participant: Participant<CredentialPayload>, slot: &SessionSlot) {
    let worker = participant.index();
    slot.clear().await;
    participant.teardown(|| async {}).await;
    debug!(worker, "Cluster session cleared");
}
