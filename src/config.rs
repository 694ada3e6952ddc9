//! Harness configuration.
//!
//! Defaults carry the identifiers the install bundle produces. Every value
//! can be overridden from the environment so the same binary runs against
//! other clusters or bundle locations.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Namespace the bundle is installed into.
pub const DEFAULT_NAMESPACE: &str = "policy-controller-operator";

/// Install bundle, relative to the working directory.
pub const DEFAULT_BUNDLE_PATH: &str = "charts/common_install_cr.yaml";

/// Cluster-management executable used to apply and remove the bundle.
pub const DEFAULT_KUBECTL: &str = "kubectl";

/// Suite-wide default deadline for every convergence check.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(180);

/// Delay between two convergence attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound on bundle removal. Removal ignores suite cancellation.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(120);

pub const ENV_NAMESPACE: &str = "E2E_NAMESPACE";
pub const ENV_BUNDLE_PATH: &str = "E2E_BUNDLE_PATH";
pub const ENV_KUBECTL: &str = "E2E_KUBECTL";
pub const ENV_POLL_TIMEOUT_SECS: &str = "E2E_POLL_TIMEOUT_SECS";
pub const ENV_POLL_INTERVAL_MS: &str = "E2E_POLL_INTERVAL_MS";
pub const ENV_TEARDOWN_TIMEOUT_SECS: &str = "E2E_TEARDOWN_TIMEOUT_SECS";
pub const ENV_WORKERS: &str = "E2E_WORKERS";

/// Runtime configuration for one suite run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HarnessConfig {
    pub namespace: String,
    pub bundle_path: PathBuf,
    pub kubectl: String,
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
    pub teardown_timeout: Duration,
    /// Number of parallel workers taking part in the session rendezvous.
    pub workers: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            bundle_path: PathBuf::from(DEFAULT_BUNDLE_PATH),
            kubectl: DEFAULT_KUBECTL.to_string(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
            workers: 1,
        }
    }
}

impl HarnessConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Unset or empty keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(ns) = get(ENV_NAMESPACE) {
            config.namespace = ns;
        }
        if let Some(path) = get(ENV_BUNDLE_PATH) {
            config.bundle_path = PathBuf::from(path);
        }
        if let Some(kubectl) = get(ENV_KUBECTL) {
            config.kubectl = kubectl;
        }
        if let Some(secs) = get(ENV_POLL_TIMEOUT_SECS) {
            config.poll_timeout = Duration::from_secs(parse_number(ENV_POLL_TIMEOUT_SECS, &secs)?);
        }
        if let Some(ms) = get(ENV_POLL_INTERVAL_MS) {
            config.poll_interval = Duration::from_millis(parse_number(ENV_POLL_INTERVAL_MS, &ms)?);
        }
        if let Some(secs) = get(ENV_TEARDOWN_TIMEOUT_SECS) {
            config.teardown_timeout =
                Duration::from_secs(parse_number(ENV_TEARDOWN_TIMEOUT_SECS, &secs)?);
        }
        if let Some(workers) = get(ENV_WORKERS) {
            config.workers = parse_number(ENV_WORKERS, &workers)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the harness cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::InvalidConfig("namespace must not be empty".to_string()));
        }
        if self.poll_timeout.is_zero() {
            return Err(Error::InvalidConfig("poll timeout must be positive".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll interval must be positive".to_string()));
        }
        if self.teardown_timeout.is_zero() {
            return Err(Error::InvalidConfig("teardown timeout must be positive".to_string()));
        }
        if self.workers == 0 {
            return Err(Error::InvalidConfig("at least one worker is required".to_string()));
        }
        Ok(())
    }

    /// The bundle path made absolute against `base`.
    pub fn absolute_bundle_path(&self, base: &Path) -> PathBuf {
        if self.bundle_path.is_absolute() {
            self.bundle_path.clone()
        } else {
            base.join(&self.bundle_path)
        }
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{key}={value:?} is not a valid number")))
}
