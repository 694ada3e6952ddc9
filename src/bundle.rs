//! Install bundle application and removal.
//!
//! The bundle is opaque: it is handed to the cluster-management executable
//! as `apply -f <path> -n <namespace>` and removed with
//! `delete -f <path> -n <namespace>`. Only the exit status is observed.
//!
//! A successful install yields an [`InstalledBundle`] guard. Its removal runs
//! at most once, either through [`InstalledBundle::teardown`] or from `Drop`
//! when the suite unwinds without reaching teardown. Removal is detached from
//! the suite's cancellation token and bounded by its own deadline instead, so
//! an interrupted run still cleans up.
//!
//! IMPORTANT: the `Drop` fallback needs a multi-threaded tokio runtime to
//! block on the removal command.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::process::Command;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DEFAULT_TEARDOWN_TIMEOUT;
use crate::error::{Error, Result};

/// Exit status and captured output of an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Trait for executing external commands (allows mocking in tests)
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion, or until `cancel` fires.
    fn run(
        &self,
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// Runs commands as child processes.
///
/// Children are killed if the run is cancelled.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<CommandOutput> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("{program} {}", args.join(" "))));
        }

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::CommandSpawn {
                program: program.to_string(),
                source,
            })?;

        debug!(program = %program, args = ?args, "Spawned command");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Dropping the wait future kills the child.
                Err(Error::Cancelled(format!("{program} {}", args.join(" "))))
            }
            output = child.wait_with_output() => {
                let output = output.map_err(|source| Error::CommandSpawn {
                    program: program.to_string(),
                    source,
                })?;
                Ok(CommandOutput::from(output))
            }
        }
    }
}

/// A declarative manifest identified solely by its path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestBundle {
    path: PathBuf,
}

impl ManifestBundle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ManifestBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Applies and removes a bundle through an external executable.
#[derive(Debug)]
pub struct BundleApplier<R> {
    program: String,
    runner: R,
    teardown_timeout: Duration,
}

impl<R: CommandRunner + 'static> BundleApplier<R> {
    pub fn new(program: impl Into<String>, runner: R) -> Self {
        Self {
            program: program.into(),
            runner,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }

    /// Deadline for the removal run by an [`InstalledBundle`].
    pub fn with_teardown_timeout(mut self, teardown_timeout: Duration) -> Self {
        self.teardown_timeout = teardown_timeout;
        self
    }

    /// Arguments for `verb -f <bundle> -n <namespace>`.
    pub fn args(verb: &str, bundle: &ManifestBundle, namespace: &str) -> Vec<String> {
        vec![
            verb.to_string(),
            "-f".to_string(),
            bundle.path().display().to_string(),
            "-n".to_string(),
            namespace.to_string(),
        ]
    }

    /// Apply the bundle. Any non-zero exit is an error.
    pub async fn apply(
        &self,
        bundle: &ManifestBundle,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(bundle = %bundle, namespace = %namespace, "Applying operator bundle");
        let output = self
            .runner
            .run(&self.program, &Self::args("apply", bundle, namespace), cancel)
            .await?;

        if output.success() {
            debug!(bundle = %bundle, stdout = %output.stdout.trim(), "Bundle applied");
            Ok(())
        } else {
            Err(Error::BundleApply {
                bundle: bundle.path().to_path_buf(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Remove the bundle. Any non-zero exit is an error.
    pub async fn remove(
        &self,
        bundle: &ManifestBundle,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(bundle = %bundle, namespace = %namespace, "Removing operator bundle");
        let output = self
            .runner
            .run(&self.program, &Self::args("delete", bundle, namespace), cancel)
            .await?;

        if output.success() {
            debug!(bundle = %bundle, "Bundle removed");
            Ok(())
        } else {
            Err(Error::BundleTeardown {
                bundle: bundle.path().to_path_buf(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Remove the bundle under a fresh token, bounded by the teardown
    /// deadline. Dropping the timed-out command kills the child.
    async fn remove_detached(&self, bundle: &ManifestBundle, namespace: &str) -> Result<()> {
        let detached = CancellationToken::new();
        match timeout(self.teardown_timeout, self.remove(bundle, namespace, &detached)).await {
            Ok(result) => result,
            Err(_) => Err(Error::BundleTeardown {
                bundle: bundle.path().to_path_buf(),
                code: None,
                stderr: format!("removal did not finish within {:?}", self.teardown_timeout),
            }),
        }
    }

    /// Apply the bundle and return a guard that owns its removal.
    pub async fn install(
        self: Arc<Self>,
        bundle: ManifestBundle,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<InstalledBundle<R>> {
        self.apply(&bundle, namespace, cancel).await?;
        Ok(InstalledBundle {
            applier: self,
            bundle,
            namespace: namespace.to_string(),
            torn_down: AtomicBool::new(false),
        })
    }
}

/// An applied bundle whose removal is still owed.
pub struct InstalledBundle<R: CommandRunner + 'static> {
    applier: Arc<BundleApplier<R>>,
    bundle: ManifestBundle,
    namespace: String,
    /// Track if removal has already been initiated
    torn_down: AtomicBool,
}

impl<R: CommandRunner + 'static> InstalledBundle<R> {
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Remove the bundle. Only the first call runs the remove command;
    /// later calls return `Ok(())`.
    ///
    /// Runs even when the suite has been cancelled.
    pub async fn teardown(&self) -> Result<()> {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.applier
            .remove_detached(&self.bundle, &self.namespace)
            .await
    }
}

impl<R: CommandRunner + 'static> fmt::Debug for InstalledBundle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstalledBundle")
            .field("bundle", &self.bundle)
            .field("namespace", &self.namespace)
            .field("torn_down", &self.is_torn_down())
            .finish_non_exhaustive()
    }
}

/// Fallback removal when the guard is dropped before `teardown` ran.
impl<R: CommandRunner + 'static> Drop for InstalledBundle<R> {
    fn drop(&mut self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            error!(bundle = %self.bundle, "Bundle dropped outside a runtime; it was not removed");
            return;
        };
        if handle.runtime_flavor() != RuntimeFlavor::MultiThread {
            error!(
                bundle = %self.bundle,
                "Bundle dropped on a current-thread runtime; it was not removed"
            );
            return;
        }

        warn!(bundle = %self.bundle, "Bundle dropped without teardown, removing it now");
        tokio::task::block_in_place(|| {
            let result =
                handle.block_on(self.applier.remove_detached(&self.bundle, &self.namespace));
            if let Err(e) = result {
                error!(bundle = %self.bundle, error = %e, "Failed to remove bundle on drop");
            }
        });
    }
}
