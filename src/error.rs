//! Error types for the acceptance harness.
//!
//! Setup failures abort the suite before any expectation is evaluated.
//! Convergence failures are not errors at all: they surface as
//! [`PollResult::TimedOut`](crate::poll::PollResult) values in the report.

use std::path::PathBuf;

use thiserror::Error;

/// Error type for harness operations
#[derive(Error, Debug)]
pub enum Error {
    /// The kubeconfig could not be located or read
    #[error("failed to read kubeconfig {path}: {source}")]
    CredentialsUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No kubeconfig location could be discovered
    #[error("no kubeconfig found: set KUBECONFIG or create ~/.kube/config")]
    CredentialsNotFound,

    /// The broadcast kubeconfig payload could not be parsed
    #[error("invalid kubeconfig: {0}")]
    InvalidKubeconfig(String),

    /// The API client could not be built from the parsed kubeconfig
    #[error("failed to construct Kubernetes client: {0}")]
    ClientConstruction(String),

    /// Namespace creation failed for a reason other than already-exists
    #[error("failed to create namespace {namespace}: {source}")]
    NamespaceCreate {
        namespace: String,
        #[source]
        source: kube::Error,
    },

    /// The cluster-management executable could not be started
    #[error("failed to run {program}: {source}")]
    CommandSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// `apply -f` exited non-zero
    #[error("applying bundle {bundle} failed (exit code {code:?}): {stderr}")]
    BundleApply {
        bundle: PathBuf,
        code: Option<i32>,
        stderr: String,
    },

    /// `delete -f` exited non-zero
    #[error("removing bundle {bundle} failed (exit code {code:?}): {stderr}")]
    BundleTeardown {
        bundle: PathBuf,
        code: Option<i32>,
        stderr: String,
    },

    /// The designated worker never published the credential payload
    #[error("session rendezvous failed: {0}")]
    Rendezvous(String),

    /// The suite-wide cancellation token fired
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// A configuration value was present but unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// HTTP 409 with reason `AlreadyExists`.
///
/// A 409 `Conflict` (stale resourceVersion) is not matched.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists")
}

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, Error>;
