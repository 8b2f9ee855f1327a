//! Notebook CRD definition
//!
//! A Notebook wraps a pod template plus a set of annotations that drive
//! the operator: OAuth sidecar injection, service mesh delegation, image
//! catalog selection, restart deferral, and the reconciliation lock.
//!
//! Invariant: the pod template contains exactly one container whose name
//! equals the Notebook's own name (the primary container). Everything the
//! webhook and controller rewrite targets that container.

use k8s_openapi::api::core::v1::{Container, PodSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation enabling OAuth proxy sidecar injection ("true"/"false")
pub const INJECT_OAUTH_ANNOTATION: &str = "workbench.dev/inject-oauth";

/// Annotation delegating auth and routing to a service mesh ("true"/"false")
pub const SERVICE_MESH_ANNOTATION: &str = "workbench.dev/service-mesh";

/// Annotation with the logout redirect URL for the OAuth proxy
pub const LOGOUT_URL_ANNOTATION: &str = "workbench.dev/oauth-logout-url";

/// Annotation naming the image catalog entry to resolve, as `name:tag`
pub const IMAGE_SELECTION_ANNOTATION: &str = "workbench.dev/last-image-selection";

/// Annotation holding the reason a template update was deferred
pub const UPDATE_PENDING_ANNOTATION: &str = "workbench.dev/update-pending";

/// Annotation requesting an explicit restart, allowing deferred updates through
pub const RESTART_ANNOTATION: &str = "workbench.dev/notebook-restart";

/// Annotation marking a notebook as stopped (set by the culling service).
///
/// The reconciliation lock is this annotation carrying
/// [`RECONCILIATION_LOCK_VALUE`]: the webhook sets it on create so the
/// notebook stays down until the first reconcile has run, and the
/// controller clears it once dependent objects exist.
pub const STOP_ANNOTATION: &str = "kubeflow-resource-stopped";

/// Value of [`STOP_ANNOTATION`] that marks the reconciliation lock
pub const RECONCILIATION_LOCK_VALUE: &str = "workbench-operator-lock";

/// Spec for the Notebook custom resource
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "workbench.dev",
    version = "v1",
    kind = "Notebook",
    namespaced,
    shortname = "nb"
)]
#[serde(rename_all = "camelCase")]
pub struct NotebookSpec {
    /// Pod template for the notebook workload
    pub template: NotebookTemplateSpec,
}

/// Pod template wrapper inside the Notebook spec
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotebookTemplateSpec {
    /// The pod spec to run. Schema validation is left to the API server;
    /// the embedded core type is too large to inline into the CRD.
    #[schemars(schema_with = "pod_spec_schema")]
    pub spec: PodSpec,
}

/// Schema for the embedded PodSpec: an open object, validated server-side
fn pod_spec_schema(_gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    let mut obj = schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schemars::schema::Schema::Object(obj)
}

impl Notebook {
    /// Look up an annotation value
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Check whether a boolean annotation is set to "true"
    ///
    /// Values are trimmed and compared case-insensitively, so " True "
    /// enables the feature while "1" or "yes" do not.
    pub fn annotation_flag(&self, key: &str) -> bool {
        self.annotation(key)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Whether OAuth proxy sidecar injection is requested
    pub fn oauth_injection_enabled(&self) -> bool {
        self.annotation_flag(INJECT_OAUTH_ANNOTATION)
    }

    /// Whether auth and routing are delegated to a service mesh
    pub fn service_mesh_enabled(&self) -> bool {
        self.annotation_flag(SERVICE_MESH_ANNOTATION)
    }

    /// Whether the notebook is stopped (stop annotation present, any value)
    pub fn is_stopped(&self) -> bool {
        self.annotation(STOP_ANNOTATION).is_some()
    }

    /// Whether the stop annotation carries the reconciliation lock value
    pub fn has_reconciliation_lock(&self) -> bool {
        self.annotation(STOP_ANNOTATION) == Some(RECONCILIATION_LOCK_VALUE)
    }

    /// Whether an explicit restart was requested
    pub fn restart_requested(&self) -> bool {
        self.annotation_flag(RESTART_ANNOTATION)
    }

    /// The pod spec inside the template
    pub fn pod_spec(&self) -> &PodSpec {
        &self.spec.template.spec
    }

    /// Mutable access to the pod spec inside the template
    pub fn pod_spec_mut(&mut self) -> &mut PodSpec {
        &mut self.spec.template.spec
    }

    /// The primary container: the one named like the notebook itself
    pub fn primary_container(&self) -> Option<&Container> {
        let name = self.metadata.name.as_deref()?;
        self.pod_spec().containers.iter().find(|c| c.name == name)
    }

    /// Mutable access to the primary container
    pub fn primary_container_mut(&mut self) -> Option<&mut Container> {
        let name = self.metadata.name.clone()?;
        self.spec
            .template
            .spec
            .containers
            .iter_mut()
            .find(|c| c.name == name)
    }

    /// The service account the notebook pod runs as
    ///
    /// Defaults to the notebook name when the pod spec leaves it unset,
    /// matching what the OAuth injection forces.
    pub fn service_account_name(&self) -> Option<&str> {
        self.pod_spec()
            .service_account_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.metadata.name.as_deref())
    }
}
