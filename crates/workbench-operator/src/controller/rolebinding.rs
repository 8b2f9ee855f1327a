//! Pipeline access RoleBinding reconciliation
//!
//! Grants the notebook's service account the cluster role used to
//! submit pipeline runs. Only invoked when the operator-wide pipeline
//! RBAC flag is set.

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use workbench_common::crd::Notebook;
use workbench_common::{Error, MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE, NOTEBOOK_NAME_LABEL};

use crate::controller::notebook::NotebookContext;
use crate::controller::{owner_reference, CONFLICT_RETRY_ATTEMPTS, CONFLICT_RETRY_DELAY};

/// ClusterRole granting pipeline run submission
pub const PIPELINE_RUNNER_CLUSTER_ROLE: &str = "workbench-pipeline-runner";

/// Converge the notebook's pipeline-access RoleBinding
pub async fn reconcile(
    ctx: &NotebookContext,
    notebook: &Notebook,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let desired = desired_binding(notebook, namespace, name)?;
    let binding_name = format!("{name}-pipeline-access");

    let mut delay = CONFLICT_RETRY_DELAY;
    for attempt in 1..=CONFLICT_RETRY_ATTEMPTS {
        match ctx.kube.get_role_binding(namespace, &binding_name).await? {
            None => {
                info!(namespace, binding = %binding_name, "creating pipeline role binding");
                match ctx.kube.create_role_binding(namespace, &desired).await {
                    // Lost a create race; re-read to converge the subject
                    Err(e) if e.is_conflict() => {}
                    result => return result,
                }
            }
            Some(observed) if observed.subjects != desired.subjects => {
                // RoleRefs are immutable, only the subject can drift (the
                // notebook's service account name changed)
                info!(namespace, binding = %binding_name, "updating pipeline role binding subject");
                let mut updated = observed;
                updated.subjects = desired.subjects.clone();
                match ctx.kube.update_role_binding(namespace, &updated).await {
                    Err(e) if e.is_conflict() => {
                        warn!(
                            namespace,
                            binding = %binding_name,
                            attempt,
                            "pipeline role binding update conflicted, retrying"
                        );
                    }
                    result => return result,
                }
            }
            Some(_) => {
                debug!(namespace, binding = %binding_name, "pipeline role binding in sync");
                return Ok(());
            }
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }

    Err(Error::internal_with_context(
        "role_binding",
        format!(
            "update of {binding_name} kept conflicting after {CONFLICT_RETRY_ATTEMPTS} attempts"
        ),
    ))
}

fn desired_binding(notebook: &Notebook, namespace: &str, name: &str) -> Result<RoleBinding, Error> {
    let owner = owner_reference(notebook)?;
    Ok(RoleBinding {
        metadata: ObjectMeta {
            name: Some(format!("{name}-pipeline-access")),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (NOTEBOOK_NAME_LABEL.to_string(), name.to_string()),
                (
                    MANAGED_BY_LABEL_KEY.to_string(),
                    MANAGED_BY_LABEL_VALUE.to_string(),
                ),
            ])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: PIPELINE_RUNNER_CLUSTER_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: notebook.service_account_name().unwrap_or(name).to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    })
}
