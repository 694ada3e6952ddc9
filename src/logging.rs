//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,kube=warn,policy_controller_e2e=debug";

/// Environment variable selecting `json` output for the binary.
pub const ENV_LOG_FORMAT: &str = "E2E_LOG_FORMAT";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialise logging for the binary. JSON when `json` is set.
///
/// Returns an error if a global subscriber is already installed.
pub fn init(json: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter());
    if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}

/// Initialise logging for tests. Safe to call from every test.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_test_writer()
        .try_init();
}
