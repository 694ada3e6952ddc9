//! policy-controller-e2e - acceptance run for the policy-controller operator bundle.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Spawns the configured workers and bootstraps one cluster session per run
//! - Runs the install suite on the designated worker
//! - Tears the sessions down and exits non-zero on any failure

use std::path::PathBuf;
use std::process::ExitCode;

use futures::future::join_all;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use policy_controller_e2e::config::HarnessConfig;
use policy_controller_e2e::error::{Error, Result};
use policy_controller_e2e::logging;
use policy_controller_e2e::session::{
    CredentialPayload, Participant, SessionSlot, load_ambient_credentials, rendezvous,
    synchronized_setup, synchronized_teardown,
};
use policy_controller_e2e::suite::{InstallSuite, SuiteReport};

#[tokio::main]
async fn main() -> ExitCode {
    let json = std::env::var(logging::ENV_LOG_FORMAT).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if let Err(e) = logging::init(json) {
        eprintln!("failed to initialise logging: {e}");
    }

    match run().await {
        Ok(report) => {
            println!("{report}");
            if report.passed() {
                info!("Policy Controller E2E Suite passed");
                ExitCode::SUCCESS
            } else {
                for failure in report.failures() {
                    error!("{failure}");
                }
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "Suite setup failed, no expectation was evaluated");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<SuiteReport> {
    let config = HarnessConfig::from_env()?;
    let base_dir = std::env::current_dir()
        .map_err(|e| Error::InvalidConfig(format!("cannot determine working directory: {e}")))?;

    info!(
        namespace = %config.namespace,
        bundle = %config.absolute_bundle_path(&base_dir).display(),
        workers = config.workers,
        timeout_secs = config.poll_timeout.as_secs(),
        "Starting Policy Controller E2E Suite"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            warn!("Received shutdown signal, cancelling suite");
            cancel.cancel();
        });
    }

    let workers = rendezvous::<CredentialPayload>(config.workers)
        .into_iter()
        .map(|participant| {
            let config = config.clone();
            let base_dir = base_dir.clone();
            let cancel = cancel.clone();
            tokio::spawn(run_worker(participant, config, base_dir, cancel))
        });

    let mut report = None;
    let mut setup_error = None;
    for joined in join_all(workers).await {
        match joined {
            Ok(Ok(Some(r))) => report = Some(r),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                setup_error.get_or_insert(e);
            }
            Err(e) => {
                setup_error.get_or_insert(Error::Rendezvous(format!("worker task failed: {e}")));
            }
        }
    }

    match (report, setup_error) {
        (Some(report), _) => Ok(report),
        (None, Some(e)) => Err(e),
        (None, None) => Err(Error::Rendezvous("designated worker produced no report".to_string())),
    }
}

/// One worker: synchronized setup, the suite on the designated worker,
/// synchronized teardown.
///
/// If this task panics, dropping `participant` releases the other workers
/// from the teardown rendezvous.
async fn run_worker(
    mut participant: Participant<CredentialPayload>,
    config: HarnessConfig,
    base_dir: PathBuf,
    cancel: CancellationToken,
) -> Result<Option<SuiteReport>> {
    let slot = SessionSlot::new();

    let outcome = match synchronized_setup(&mut participant, &slot, load_ambient_credentials, true)
        .await
    {
        Ok(()) if participant.is_designated() => match slot.get().await {
            Ok(session) => InstallSuite::from_config(&session, &config, &base_dir)
                .run(&cancel)
                .await
                .map(Some),
            Err(e) => Err(e),
        },
        Ok(()) => Ok(None),
        Err(e) => Err(e),
    };

    synchronized_teardown(participant, &slot).await;
    outcome
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
