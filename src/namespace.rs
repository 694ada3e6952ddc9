//! Idempotent namespace provisioning.
//!
//! The namespace is never deleted by the harness. Concurrent suite runs on a
//! shared cluster target the same namespace, and races on its creation are
//! resolved by treating "already exists" as success.

use k8s_openapi::api::core::v1::Namespace;
use kube::Client;
use kube::api::{Api, ObjectMeta, PostParams};
use tracing::{debug, info};

use crate::error::{Error, Result, is_already_exists};

/// Label applied to namespaces created by the harness.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "policy-controller-e2e";

/// Whether [`ensure_namespace`] created the namespace or found it in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespaceState {
    Created,
    AlreadyExists,
}

/// Namespace object submitted by [`ensure_namespace`].
pub fn namespace_object(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                [(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Create `name`, treating an existing namespace as success.
pub async fn ensure_namespace(client: Client, name: &str) -> Result<NamespaceState> {
    let ns_api: Api<Namespace> = Api::all(client);

    match ns_api
        .create(&PostParams::default(), &namespace_object(name))
        .await
    {
        Ok(_) => {
            info!(namespace = %name, "Created namespace");
            Ok(NamespaceState::Created)
        }
        Err(e) if is_already_exists(&e) => {
            debug!(namespace = %name, "Namespace already exists");
            Ok(NamespaceState::AlreadyExists)
        }
        Err(source) => Err(Error::NamespaceCreate {
            namespace: name.to_string(),
            source,
        }),
    }
}
