//! Notebook controller implementation
//!
//! Reconciliation converges the dependent objects of a Notebook in a
//! fixed order: trust bundle aggregation, trust unset when the bundle is
//! gone, network policies, optional pipeline RBAC, OAuth or plain route
//! resources, and finally reconciliation-lock removal. Any step failing
//! aborts the cycle and surfaces through the error policy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::discovery::ApiResource;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use workbench_common::crd::{Notebook, STOP_ANNOTATION};
use workbench_common::retry::{retry_with_backoff, RetryConfig};
use workbench_common::{trust, Error};

use crate::config::OperatorConfig;
use crate::controller::{networkpolicy, oauth, rolebinding, trustbundle};
use crate::index::NotebookIndex;

/// Field manager used for server-side operations
pub const FIELD_MANAGER: &str = "workbench-notebook-controller";

/// ApiResource for OpenShift Routes (not in k8s-openapi)
pub fn route_api_resource() -> ApiResource {
    ApiResource::from_gvk(&kube::api::GroupVersionKind {
        group: "route.openshift.io".to_string(),
        version: "v1".to_string(),
        kind: "Route".to_string(),
    })
}

/// ApiResource for OpenShift ImageStreams (not in k8s-openapi)
pub fn image_stream_api_resource() -> ApiResource {
    ApiResource::from_gvk(&kube::api::GroupVersionKind {
        group: "image.openshift.io".to_string(),
        version: "v1".to_string(),
        kind: "ImageStream".to_string(),
    })
}

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Trait abstracting Kubernetes client operations for the notebook
/// controller and webhook
///
/// Gets return `Ok(None)` on 404 so callers distinguish absence from
/// transport failure. Creates and updates surface 409 through
/// [`Error::is_conflict`] for the callers that tolerate or retry it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NotebookKubeClient: Send + Sync {
    /// Get a Notebook by namespace and name
    async fn get_notebook(&self, namespace: &str, name: &str) -> Result<Option<Notebook>, Error>;

    /// JSON merge patch against a Notebook
    async fn merge_patch_notebook(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), Error>;

    /// Get a ConfigMap by namespace and name
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Create a ConfigMap
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> Result<(), Error>;

    /// Replace a ConfigMap (metadata must carry the resourceVersion)
    async fn update_config_map(&self, namespace: &str, config_map: &ConfigMap)
        -> Result<(), Error>;

    /// Get a NetworkPolicy by namespace and name
    async fn get_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkPolicy>, Error>;

    /// Create a NetworkPolicy
    async fn create_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> Result<(), Error>;

    /// Replace a NetworkPolicy (metadata must carry the resourceVersion)
    async fn update_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> Result<(), Error>;

    /// Get a RoleBinding by namespace and name
    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RoleBinding>, Error>;

    /// Create a RoleBinding
    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding)
        -> Result<(), Error>;

    /// Replace a RoleBinding (metadata must carry the resourceVersion)
    async fn update_role_binding(&self, namespace: &str, binding: &RoleBinding)
        -> Result<(), Error>;

    /// Get a ServiceAccount by namespace and name
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, Error>;

    /// Create a ServiceAccount
    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<(), Error>;

    /// Get a Service by namespace and name
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error>;

    /// Create a Service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;

    /// Get a Secret by namespace and name
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error>;

    /// Get an OpenShift Route by namespace and name
    async fn get_route(&self, namespace: &str, name: &str)
        -> Result<Option<DynamicObject>, Error>;

    /// Create an OpenShift Route
    async fn create_route(&self, namespace: &str, route: &DynamicObject) -> Result<(), Error>;

    /// List ImageStreams in a namespace
    async fn list_image_streams(&self, namespace: &str) -> Result<Vec<DynamicObject>, Error>;
}

/// Real Kubernetes client implementation
pub struct NotebookKubeClientImpl {
    client: Client,
}

impl NotebookKubeClientImpl {
    /// Create a new NotebookKubeClientImpl wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Map a get result so 404 becomes `Ok(None)`
fn absent_on_404<T>(result: Result<T, kube::Error>) -> Result<Option<T>, Error> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl NotebookKubeClient for NotebookKubeClientImpl {
    async fn get_notebook(&self, namespace: &str, name: &str) -> Result<Option<Notebook>, Error> {
        let api: Api<Notebook> = Api::namespaced(self.client.clone(), namespace);
        absent_on_404(api.get(name).await)
    }

    async fn merge_patch_notebook(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), Error> {
        let api: Api<Notebook> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        api.patch(name, &params, &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        absent_on_404(api.get(name).await)
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), config_map).await?;
        Ok(())
    }

    async fn update_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&config_map.name_any(), &PostParams::default(), config_map)
            .await?;
        Ok(())
    }

    async fn get_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NetworkPolicy>, Error> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        absent_on_404(api.get(name).await)
    }

    async fn create_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> Result<(), Error> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), policy).await?;
        Ok(())
    }

    async fn update_network_policy(
        &self,
        namespace: &str,
        policy: &NetworkPolicy,
    ) -> Result<(), Error> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&policy.name_any(), &PostParams::default(), policy)
            .await?;
        Ok(())
    }

    async fn get_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<RoleBinding>, Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        absent_on_404(api.get(name).await)
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), binding).await?;
        Ok(())
    }

    async fn update_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        api.replace(&binding.name_any(), &PostParams::default(), binding)
            .await?;
        Ok(())
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        absent_on_404(api.get(name).await)
    }

    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<(), Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), account).await?;
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        absent_on_404(api.get(name).await)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), service).await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        absent_on_404(api.get(name).await)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn get_route(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &route_api_resource());
        absent_on_404(api.get(name).await)
    }

    async fn create_route(&self, namespace: &str, route: &DynamicObject) -> Result<(), Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &route_api_resource());
        api.create(&PostParams::default(), route).await?;
        Ok(())
    }

    async fn list_image_streams(&self, namespace: &str) -> Result<Vec<DynamicObject>, Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &image_stream_api_resource());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items)
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Controller context containing shared state and clients
pub struct NotebookContext {
    /// Kubernetes client for API operations
    pub kube: Arc<dyn NotebookKubeClient>,
    /// Resolved operator configuration
    pub config: OperatorConfig,
    /// Shared notebook index feeding the ConfigMap watch fan-out
    pub index: Arc<NotebookIndex>,
}

impl NotebookContext {
    /// Create a new context with the given dependencies
    pub fn new(
        kube: Arc<dyn NotebookKubeClient>,
        config: OperatorConfig,
        index: Arc<NotebookIndex>,
    ) -> Self {
        Self { kube, config, index }
    }

    /// Create a context from a Kubernetes client
    pub fn from_client(client: Client, config: OperatorConfig) -> Self {
        Self {
            kube: Arc::new(NotebookKubeClientImpl::new(client)),
            config,
            index: Arc::new(NotebookIndex::new()),
        }
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn NotebookKubeClient>) -> Self {
        Self {
            kube,
            config: OperatorConfig::for_testing(),
            index: Arc::new(NotebookIndex::new()),
        }
    }
}

// =============================================================================
// Notebook reconciliation
// =============================================================================

/// Reconcile a Notebook resource
///
/// Steps run in a fixed order; each failure aborts the cycle so the
/// error policy can decide whether to requeue.
#[instrument(skip(notebook, ctx), fields(notebook = %notebook.name_any(), namespace = %notebook.namespace().unwrap_or_default()))]
pub async fn reconcile(notebook: Arc<Notebook>, ctx: Arc<NotebookContext>) -> Result<Action, Error> {
    let name = notebook.name_any();
    let namespace = notebook
        .namespace()
        .ok_or_else(|| Error::validation_for(&name, "notebook has no namespace"))?;

    // Re-fetch: the cached object may lag behind a deletion
    let Some(notebook) = ctx.kube.get_notebook(&namespace, &name).await? else {
        debug!("notebook deleted, dropping from index");
        ctx.index.remove(&namespace, &name);
        return Ok(Action::await_change());
    };

    info!("reconciling notebook");
    ctx.index.upsert(
        &namespace,
        &name,
        trust::mounts_merged_bundle(notebook.pod_spec()),
    );

    trustbundle::reconcile(&ctx, &namespace).await?;
    trustbundle::unset_if_bundle_removed(&ctx, &notebook, &namespace, &name).await?;

    networkpolicy::reconcile(&ctx, &notebook, &namespace, &name).await?;

    if ctx.config.set_pipeline_rbac {
        rolebinding::reconcile(&ctx, &notebook, &namespace, &name).await?;
    }

    if !notebook.service_mesh_enabled() {
        if notebook.oauth_injection_enabled() {
            oauth::reconcile(&ctx, &notebook, &namespace, &name).await?;
        } else {
            oauth::reconcile_plain_route(&ctx, &notebook, &namespace, &name).await?;
        }
    }

    if notebook.has_reconciliation_lock() {
        remove_reconciliation_lock(&ctx, &notebook, &namespace, &name).await?;
    }

    Ok(Action::await_change())
}

/// Error policy for the notebook controller
///
/// Retryable errors (transient API failures) requeue with backoff;
/// permanent errors wait for a spec change.
pub fn error_policy(notebook: Arc<Notebook>, error: &Error, _ctx: Arc<NotebookContext>) -> Action {
    error!(
        ?error,
        notebook = %notebook.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::await_change()
    }
}

/// Remove the reconciliation lock from a notebook
///
/// Polls the notebook's ServiceAccount until it has image pull secrets,
/// then clears the stop annotation with a merge patch. The poll is
/// best-effort: exhausting it logs a warning and the lock is cleared
/// anyway, since holding the lock forever would strand the notebook.
async fn remove_reconciliation_lock(
    ctx: &NotebookContext,
    notebook: &Notebook,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let sa_name = notebook.service_account_name().unwrap_or(name).to_string();

    let poll = retry_with_backoff(&RetryConfig::lock_poll(), "wait_for_pull_secrets", || {
        let kube = ctx.kube.clone();
        let namespace = namespace.to_string();
        let sa_name = sa_name.clone();
        async move {
            match kube.get_service_account(&namespace, &sa_name).await? {
                Some(sa) if sa.image_pull_secrets.as_ref().is_some_and(|s| !s.is_empty()) => Ok(()),
                _ => Err(Error::internal_with_context(
                    "reconciler",
                    format!("service account {sa_name} has no image pull secrets yet"),
                )),
            }
        }
    })
    .await;

    if let Err(e) = poll {
        warn!(error = %e, "service account not ready, clearing lock anyway");
    }

    info!("removing reconciliation lock");
    let patch = serde_json::json!({
        "metadata": {
            "annotations": {
                STOP_ANNOTATION: null
            }
        }
    });
    ctx.kube.merge_patch_notebook(namespace, name, patch).await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, LocalObjectReference, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use workbench_common::crd::{
        NotebookSpec, NotebookTemplateSpec, INJECT_OAUTH_ANNOTATION, RECONCILIATION_LOCK_VALUE,
    };

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    pub(crate) fn sample_notebook(name: &str, namespace: &str) -> Notebook {
        Notebook {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some("11111111-2222-3333-4444-555555555555".to_string()),
                ..Default::default()
            },
            spec: NotebookSpec {
                template: NotebookTemplateSpec {
                    spec: PodSpec {
                        containers: vec![Container {
                            name: name.to_string(),
                            image: Some("jupyter:latest".to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    },
                },
            },
        }
    }

    pub(crate) fn with_annotation(mut notebook: Notebook, key: &str, value: &str) -> Notebook {
        notebook
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        notebook
    }

    /// Mock where every read returns absence and every write succeeds
    fn mock_kube_success() -> MockNotebookKubeClient {
        let mut mock = MockNotebookKubeClient::new();
        mock.expect_get_config_map().returning(|_, _| Ok(None));
        mock.expect_create_config_map().returning(|_, _| Ok(()));
        mock.expect_update_config_map().returning(|_, _| Ok(()));
        mock.expect_get_network_policy().returning(|_, _| Ok(None));
        mock.expect_create_network_policy().returning(|_, _| Ok(()));
        mock.expect_update_network_policy().returning(|_, _| Ok(()));
        mock.expect_get_role_binding().returning(|_, _| Ok(None));
        mock.expect_create_role_binding().returning(|_, _| Ok(()));
        mock.expect_update_role_binding().returning(|_, _| Ok(()));
        mock.expect_get_service_account().returning(|_, _| Ok(None));
        mock.expect_create_service_account().returning(|_, _| Ok(()));
        mock.expect_get_service().returning(|_, _| Ok(None));
        mock.expect_create_service().returning(|_, _| Ok(()));
        mock.expect_get_secret().returning(|_, _| Ok(None));
        mock.expect_create_secret().returning(|_, _| Ok(()));
        mock.expect_get_route().returning(|_, _| Ok(None));
        mock.expect_create_route().returning(|_, _| Ok(()));
        mock.expect_merge_patch_notebook().returning(|_, _, _| Ok(()));
        mock.expect_list_image_streams().returning(|_| Ok(vec![]));
        mock
    }

    // =========================================================================
    // Reconciliation Story Tests
    // =========================================================================

    /// Story: a deleted notebook is dropped from the index without error
    #[tokio::test]
    async fn story_deleted_notebook_leaves_quietly() {
        let notebook = Arc::new(sample_notebook("gone", "team-a"));

        let mut mock = MockNotebookKubeClient::new();
        mock.expect_get_notebook().returning(|_, _| Ok(None));
        let ctx = Arc::new(NotebookContext::for_testing(Arc::new(mock)));
        ctx.index.upsert("team-a", "gone", false);

        let action = reconcile(notebook, ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(ctx.index.any_in_namespace("team-a").is_none());
    }

    /// Story: a plain notebook converges and registers in the index
    #[tokio::test]
    async fn story_plain_notebook_converges() {
        let notebook = sample_notebook("bench", "team-a");
        let fetched = notebook.clone();

        let mut mock = mock_kube_success();
        mock.expect_get_notebook()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        let ctx = Arc::new(NotebookContext::for_testing(Arc::new(mock)));

        let action = reconcile(Arc::new(notebook), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(
            ctx.index.any_in_namespace("team-a"),
            Some("bench".to_string())
        );
    }

    /// Mock covering the steps every reconcile hits before the lock step:
    /// trust sources absent, policies created, plain route created
    fn mock_kube_plain_path(notebook: Notebook) -> MockNotebookKubeClient {
        let mut mock = MockNotebookKubeClient::new();
        mock.expect_get_notebook()
            .returning(move |_, _| Ok(Some(notebook.clone())));
        mock.expect_get_config_map().returning(|_, _| Ok(None));
        mock.expect_get_network_policy().returning(|_, _| Ok(None));
        mock.expect_create_network_policy().returning(|_, _| Ok(()));
        mock.expect_get_route().returning(|_, _| Ok(None));
        mock.expect_create_route().returning(|_, _| Ok(()));
        mock
    }

    /// Story: the lock is cleared even when the service account never
    /// reports image pull secrets
    #[tokio::test(start_paused = true)]
    async fn story_lock_cleared_after_poll_timeout() {
        let notebook = with_annotation(
            sample_notebook("bench", "team-a"),
            STOP_ANNOTATION,
            RECONCILIATION_LOCK_VALUE,
        );

        let mut mock = mock_kube_plain_path(notebook.clone());
        // SA exists but has no pull secrets; the poll exhausts its attempts
        mock.expect_get_service_account().times(3).returning(|_, _| {
            Ok(Some(ServiceAccount {
                ..Default::default()
            }))
        });
        mock.expect_merge_patch_notebook()
            .times(1)
            .withf(|_, _, patch| {
                patch["metadata"]["annotations"][STOP_ANNOTATION] == serde_json::Value::Null
            })
            .returning(|_, _, _| Ok(()));

        let ctx = Arc::new(NotebookContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(notebook), ctx).await.unwrap();
    }

    /// Story: a ready service account short-circuits the lock poll
    #[tokio::test]
    async fn story_lock_cleared_when_pull_secrets_ready() {
        let notebook = with_annotation(
            sample_notebook("bench", "team-a"),
            STOP_ANNOTATION,
            RECONCILIATION_LOCK_VALUE,
        );

        let mut mock = mock_kube_plain_path(notebook.clone());
        mock.expect_get_service_account().times(1).returning(|_, _| {
            Ok(Some(ServiceAccount {
                image_pull_secrets: Some(vec![LocalObjectReference {
                    name: "bench-dockercfg".to_string(),
                }]),
                ..Default::default()
            }))
        });
        mock.expect_merge_patch_notebook()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let ctx = Arc::new(NotebookContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(notebook), ctx).await.unwrap();
    }

    /// Story: mesh delegation skips OAuth and route reconciliation
    #[tokio::test]
    async fn story_mesh_notebook_gets_no_routes() {
        let notebook = with_annotation(
            sample_notebook("bench", "team-a"),
            workbench_common::crd::SERVICE_MESH_ANNOTATION,
            "true",
        );
        let fetched = notebook.clone();

        let mut mock = MockNotebookKubeClient::new();
        mock.expect_get_notebook()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        mock.expect_get_config_map().returning(|_, _| Ok(None));
        mock.expect_get_network_policy().returning(|_, _| Ok(None));
        mock.expect_create_network_policy().returning(|_, _| Ok(()));
        // No route, service account, or secret expectations: any such
        // call would fail the test
        mock.expect_get_route().never();
        mock.expect_create_route().never();

        let ctx = Arc::new(NotebookContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(notebook), ctx).await.unwrap();
    }

    /// Story: an OAuth notebook provisions its sidecar dependencies
    #[tokio::test]
    async fn story_oauth_notebook_provisions_resources() {
        let notebook = with_annotation(
            sample_notebook("bench", "team-a"),
            INJECT_OAUTH_ANNOTATION,
            "true",
        );
        let fetched = notebook.clone();

        let mut mock = MockNotebookKubeClient::new();
        mock.expect_get_notebook()
            .returning(move |_, _| Ok(Some(fetched.clone())));
        mock.expect_get_config_map().returning(|_, _| Ok(None));
        mock.expect_get_network_policy().returning(|_, _| Ok(None));
        mock.expect_create_network_policy().returning(|_, _| Ok(()));
        mock.expect_get_service_account().returning(|_, _| Ok(None));
        mock.expect_create_service_account()
            .times(1)
            .returning(|_, _| Ok(()));
        mock.expect_get_secret().returning(|_, _| Ok(None));
        mock.expect_create_secret().times(1).returning(|_, _| Ok(()));
        mock.expect_get_service().returning(|_, _| Ok(None));
        mock.expect_create_service().times(1).returning(|_, _| Ok(()));
        mock.expect_get_route().returning(|_, _| Ok(None));
        mock.expect_create_route().times(1).returning(|_, _| Ok(()));

        let ctx = Arc::new(NotebookContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(notebook), ctx).await.unwrap();
    }

    /// Story: pipeline RBAC only runs when the flag is set
    #[tokio::test]
    async fn story_pipeline_rbac_is_gated() {
        let notebook = sample_notebook("bench", "team-a");

        let mut mock = mock_kube_plain_path(notebook.clone());
        mock.expect_get_role_binding().never();
        mock.expect_create_role_binding().never();

        // Flag off in the test config
        let ctx = Arc::new(NotebookContext::for_testing(Arc::new(mock)));
        assert!(!ctx.config.set_pipeline_rbac);
        reconcile(Arc::new(notebook), ctx).await.unwrap();
    }

    // =========================================================================
    // Error Policy Tests
    // =========================================================================

    /// Story: error policy distinguishes retryable vs non-retryable errors
    #[test]
    fn story_error_policy_requeues() {
        let notebook = Arc::new(sample_notebook("bench", "team-a"));
        let ctx = Arc::new(NotebookContext::for_testing(Arc::new(
            MockNotebookKubeClient::new(),
        )));

        let validation_error = Error::validation("bad spec");
        let action = error_policy(Arc::clone(&notebook), &validation_error, Arc::clone(&ctx));
        assert_eq!(action, Action::await_change());

        let retryable_error = Error::internal("transient");
        let action = error_policy(notebook, &retryable_error, ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }
}
