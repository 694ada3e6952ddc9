//! policy-controller-e2e library crate
//!
//! Acceptance harness for the policy-controller operator bundle. It
//! bootstraps one cluster session per run, ensures the target namespace,
//! applies the bundle, polls every expected resource until it converges or
//! times out, and removes the bundle again.

pub mod bundle;
pub mod catalog;
pub mod config;
pub mod error;
pub mod logging;
pub mod namespace;
pub mod poll;
pub mod session;
pub mod suite;

pub use bundle::{BundleApplier, CommandOutput, CommandRunner, InstalledBundle, ManifestBundle, ProcessRunner};
pub use catalog::{AssertionCatalog, Check, ExpectationGroup, ResourceExpectation, ResourceKind};
pub use config::HarnessConfig;
pub use error::{Error, Result};
pub use poll::{PollConfig, PollOutcome, PollResult, Probe, poll_until};
pub use session::{ClusterSession, Participant, SessionSlot, rendezvous};
pub use suite::{ClusterOps, InstallSuite, KubeCluster, SuiteReport};
