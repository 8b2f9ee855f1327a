//! Notebook controller wiring
//!
//! Builds the controller future: the Notebook watch, ownership of the
//! dependent kinds, and the ConfigMap watch whose events fan out to
//! notebooks through the shared index.

pub mod networkpolicy;
pub mod notebook;
pub mod oauth;
pub mod rolebinding;
pub mod trustbundle;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use workbench_common::crd::Notebook;
use workbench_common::trust::{
    GLOBAL_TRUST_BUNDLE_NAME, MERGED_BUNDLE_NAME, SELF_SIGNED_BUNDLE_NAME,
};
use workbench_common::Error;

use crate::config::OperatorConfig;
use crate::controller::notebook::{error_policy, reconcile, NotebookContext};
use crate::index::NotebookIndex;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Attempts for the read-modify-write loops on conflicting writes
pub(crate) const CONFLICT_RETRY_ATTEMPTS: u32 = 5;

/// Initial backoff between conflicting write attempts
pub(crate) const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Controller owner reference for a notebook's dependent objects
pub(crate) fn owner_reference(notebook: &Notebook) -> Result<OwnerReference, Error> {
    notebook
        .controller_owner_ref(&())
        .ok_or_else(|| Error::internal("notebook has no uid, cannot own dependents"))
}

/// Map a ConfigMap event to the notebooks it affects
///
/// A trust source change reconciles one notebook per namespace (any one
/// rebuilds the shared bundle); a merged bundle change reconciles every
/// notebook currently mounting it. Other ConfigMaps are ignored.
pub fn map_config_map_event(
    index: &NotebookIndex,
    config_map: &ConfigMap,
) -> Vec<ObjectRef<Notebook>> {
    let Some(namespace) = config_map.metadata.namespace.as_deref() else {
        return vec![];
    };

    let names: Vec<String> = match config_map.metadata.name.as_deref() {
        Some(GLOBAL_TRUST_BUNDLE_NAME) | Some(SELF_SIGNED_BUNDLE_NAME) => {
            index.any_in_namespace(namespace).into_iter().collect()
        }
        Some(MERGED_BUNDLE_NAME) => index.mounting_in_namespace(namespace),
        _ => return vec![],
    };

    tracing::debug!(
        namespace,
        config_map = %config_map.metadata.name.as_deref().unwrap_or_default(),
        affected_count = names.len(),
        "Triggering re-reconciliation of affected notebooks"
    );

    names
        .into_iter()
        .map(|name| ObjectRef::new(&name).within(namespace))
        .collect()
}

/// Build the notebook controller future
pub fn build_notebook_controller(
    client: Client,
    config: OperatorConfig,
    index: Arc<NotebookIndex>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let ctx = Arc::new(NotebookContext::new(
        Arc::new(notebook::NotebookKubeClientImpl::new(client.clone())),
        config,
        index.clone(),
    ));

    let notebooks: Api<Notebook> = Api::all(client.clone());
    let network_policies: Api<NetworkPolicy> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client.clone());
    let service_accounts: Api<ServiceAccount> = Api::all(client.clone());
    let role_bindings: Api<RoleBinding> = Api::all(client.clone());
    let config_maps: Api<ConfigMap> = Api::all(client);

    tracing::info!("- Notebook controller");

    let index_for_watch = index;
    Box::pin(
        Controller::new(
            notebooks,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .owns(
            network_policies,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .owns(services, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .owns(secrets, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .owns(
            service_accounts,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .owns(
            role_bindings,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .watches(
            config_maps,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            move |config_map| map_config_map_event(&index_for_watch, &config_map),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Notebook")),
    )
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
