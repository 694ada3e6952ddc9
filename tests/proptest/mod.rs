// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for policy-controller-e2e.
//!
//! Uses proptest to generate random inputs and verify invariants.

#[path = "../common/mod.rs"]
mod common;

use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use policy_controller_e2e::config::{ENV_POLL_INTERVAL_MS, ENV_POLL_TIMEOUT_SECS, HarnessConfig};
use policy_controller_e2e::poll::{
    ExistenceProbe, PollConfig, PollOutcome, PollResult, Probe, ReadinessProbe, poll_until,
};

use common::fixtures::{DeploymentBuilder, ScriptedSource, deployment};

/// Paused single-threaded runtime so virtual time advances instantly.
fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

/// Strategy for replica counts a Deployment may declare.
fn replica_count() -> impl Strategy<Value = i32> {
    0..=10i32
}

/// Strategy for poll timeouts in milliseconds.
fn timeout_ms() -> impl Strategy<Value = u64> {
    1..=5_000u64
}

/// Strategy for poll intervals in milliseconds.
fn interval_ms() -> impl Strategy<Value = u64> {
    1..=1_000u64
}

/// Attempts a poll makes before giving up: one per interval plus the
/// final attempt on the deadline.
fn max_attempts(timeout: u64, interval: u64) -> u64 {
    timeout.div_ceil(interval) + 1
}

proptest! {
    /// Property: a readiness check is satisfied exactly when ready equals desired.
    #[test]
    fn test_readiness_iff_ready_equals_desired(
        desired in replica_count(),
        ready in replica_count(),
    ) {
        let source = ScriptedSource::new(vec![Some(deployment(desired, ready))]);
        let mut probe = ReadinessProbe::deployment(source, "webhook", "Deployment ns/webhook");

        let outcome = futures::executor::block_on(probe.check());
        match outcome {
            PollOutcome::Satisfied(r) => {
                prop_assert_eq!(ready, desired);
                prop_assert_eq!(r.ready, r.desired);
            }
            PollOutcome::Unsatisfied(reason) => {
                prop_assert_ne!(ready, desired);
                let counts = format!("{ready}/{desired}");
                prop_assert!(reason.contains(&counts));
            }
            PollOutcome::NotObserved(reason) => {
                prop_assert!(false, "unexpected not-observed: {}", reason);
            }
        }
    }

    /// Property: later changes to the declared replicas never move the target.
    #[test]
    fn test_desired_is_fixed_by_first_retrieval(
        observations in prop::collection::vec((replica_count(), replica_count()), 1..8),
    ) {
        let first_desired = observations[0].0;
        let script = observations
            .iter()
            .map(|&(desired, ready)| {
                Some(
                    DeploymentBuilder::new("webhook")
                        .replicas(Some(desired))
                        .ready(Some(ready))
                        .build(),
                )
            })
            .collect();
        let mut probe = ReadinessProbe::deployment(
            ScriptedSource::new(script),
            "webhook",
            "Deployment ns/webhook",
        );

        for &(_, ready) in &observations {
            match futures::executor::block_on(probe.check()) {
                PollOutcome::Satisfied(readiness) => {
                    prop_assert_eq!(readiness.desired, first_desired);
                    prop_assert_eq!(ready, first_desired);
                }
                PollOutcome::Unsatisfied(reason) => {
                    let expected = format!("/{first_desired} replicas");
                    prop_assert!(reason.contains(&expected), "{}", reason);
                    prop_assert_ne!(ready, first_desired);
                }
                PollOutcome::NotObserved(reason) => {
                    prop_assert!(false, "unexpected not-observed: {}", reason);
                }
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: a poll that never converges returns within timeout + interval.
    #[test]
    fn test_poll_is_bounded(timeout in timeout_ms(), interval in interval_ms()) {
        let config = PollConfig::new(
            Duration::from_millis(timeout),
            Duration::from_millis(interval),
        );
        let source = ScriptedSource::<ConfigMap>::new(vec![None]);
        let mut probe = ExistenceProbe::new(source, "cfg", "ConfigMap ns/cfg");

        let result = paused_runtime()
            .block_on(poll_until(&mut probe, &config, &CancellationToken::new()));

        match result {
            PollResult::TimedOut { last, attempts, elapsed } => {
                prop_assert_eq!(last, "ConfigMap ns/cfg not found");
                prop_assert!(elapsed >= config.timeout);
                prop_assert!(elapsed <= config.timeout + config.interval);
                prop_assert_eq!(u64::from(attempts), max_attempts(timeout, interval));
            }
            other => prop_assert!(false, "expected timeout, got {:?}", other),
        }
    }

    /// Property: an object that appears on attempt `k` converges iff `k` fits
    /// inside the deadline.
    #[test]
    fn test_converges_iff_observed_before_deadline(
        timeout in 1..=2_000u64,
        interval in 50..=500u64,
        missing in 0..30usize,
    ) {
        let config = PollConfig::new(
            Duration::from_millis(timeout),
            Duration::from_millis(interval),
        );
        let mut script = vec![None; missing];
        script.push(Some(ConfigMap::default()));
        let mut probe = ExistenceProbe::new(ScriptedSource::new(script), "cfg", "ConfigMap ns/cfg");

        let result = paused_runtime()
            .block_on(poll_until(&mut probe, &config, &CancellationToken::new()));

        let needed = missing as u64 + 1;
        let allowed = max_attempts(timeout, interval);
        prop_assert_eq!(result.is_converged(), needed <= allowed);
        prop_assert!(result.elapsed() <= config.timeout + config.interval);
        if let PollResult::Converged { attempts, .. } = result {
            prop_assert_eq!(u64::from(attempts), needed);
        }
    }

    /// Property: any positive numeric override is accepted verbatim.
    #[test]
    fn test_numeric_overrides(secs in 1..=3_600u64, ms in 1..=60_000u64) {
        let config = HarnessConfig::from_lookup(|key| match key {
            k if k == ENV_POLL_TIMEOUT_SECS => Some(secs.to_string()),
            k if k == ENV_POLL_INTERVAL_MS => Some(format!(" {ms} ")),
            _ => None,
        })
        .unwrap();
        prop_assert_eq!(config.poll_timeout, Duration::from_secs(secs));
        prop_assert_eq!(config.poll_interval, Duration::from_millis(ms));
    }

    /// Property: non-numeric overrides are rejected.
    #[test]
    fn test_non_numeric_overrides_rejected(value in "[a-z]{1,8}") {
        let result = HarnessConfig::from_lookup(|key| {
            (key == ENV_POLL_TIMEOUT_SECS).then(|| value.clone())
        });
        prop_assert!(result.is_err());
    }
}
