//! Network policy reconciliation
//!
//! Each notebook gets an ingress policy for its primary port scoped to
//! peers in its own namespace, plus (unless service mesh delegation is
//! on) a policy admitting any peer to the OAuth proxy port. Observed
//! policies are converged by structural comparison of labels and spec;
//! drift is fixed under a bounded optimistic-concurrency retry loop so
//! races with external editors converge instead of failing.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::{
    NetworkPolicy, NetworkPolicyIngressRule, NetworkPolicyPeer, NetworkPolicyPort,
    NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{debug, info, warn};

use workbench_common::crd::Notebook;
use workbench_common::{
    Error, MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE, NOTEBOOK_NAME_LABEL, NOTEBOOK_PORT,
    OAUTH_PROXY_PORT,
};

use crate::controller::notebook::NotebookContext;
use crate::controller::{owner_reference, CONFLICT_RETRY_ATTEMPTS, CONFLICT_RETRY_DELAY};

/// Converge the notebook's network policies
pub async fn reconcile(
    ctx: &NotebookContext,
    notebook: &Notebook,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let owner = owner_reference(notebook)?;

    converge(ctx, namespace, notebook_port_policy(namespace, name, &owner)).await?;
    if !notebook.service_mesh_enabled() {
        converge(ctx, namespace, oauth_port_policy(namespace, name, &owner)).await?;
    }
    Ok(())
}

/// Policy admitting same-namespace peers to the notebook port
fn notebook_port_policy(namespace: &str, name: &str, owner: &OwnerReference) -> NetworkPolicy {
    let peer = NetworkPolicyPeer {
        namespace_selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "kubernetes.io/metadata.name".to_string(),
                namespace.to_string(),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    };
    desired_policy(
        namespace,
        name,
        format!("{name}-ctrl-np"),
        owner,
        NetworkPolicyIngressRule {
            from: Some(vec![peer]),
            ports: Some(vec![tcp_port(NOTEBOOK_PORT)]),
        },
    )
}

/// Policy admitting any peer to the OAuth proxy port
fn oauth_port_policy(namespace: &str, name: &str, owner: &OwnerReference) -> NetworkPolicy {
    desired_policy(
        namespace,
        name,
        format!("{name}-oauth-np"),
        owner,
        NetworkPolicyIngressRule {
            from: None,
            ports: Some(vec![tcp_port(OAUTH_PROXY_PORT)]),
        },
    )
}

fn tcp_port(port: i32) -> NetworkPolicyPort {
    NetworkPolicyPort {
        port: Some(IntOrString::Int(port)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn desired_policy(
    namespace: &str,
    notebook_name: &str,
    policy_name: String,
    owner: &OwnerReference,
    rule: NetworkPolicyIngressRule,
) -> NetworkPolicy {
    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(policy_name),
            namespace: Some(namespace.to_string()),
            labels: Some(desired_labels(notebook_name)),
            owner_references: Some(vec![owner.clone()]),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    NOTEBOOK_NAME_LABEL.to_string(),
                    notebook_name.to_string(),
                )])),
                ..Default::default()
            },
            ingress: Some(vec![rule]),
            policy_types: Some(vec!["Ingress".to_string()]),
            ..Default::default()
        }),
    }
}

fn desired_labels(notebook_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            NOTEBOOK_NAME_LABEL.to_string(),
            notebook_name.to_string(),
        ),
        (
            MANAGED_BY_LABEL_KEY.to_string(),
            MANAGED_BY_LABEL_VALUE.to_string(),
        ),
    ])
}

/// Whether the observed policy already carries the desired labels and spec
///
/// Labels external editors add on top of ours do not count as drift.
fn in_sync(desired: &NetworkPolicy, observed: &NetworkPolicy) -> Result<bool, Error> {
    let labels_ok = desired
        .metadata
        .labels
        .iter()
        .flatten()
        .all(|(k, v)| {
            observed
                .metadata
                .labels
                .as_ref()
                .is_some_and(|l| l.get(k) == Some(v))
        });
    if !labels_ok {
        return Ok(false);
    }

    let desired_spec = serde_json::to_value(&desired.spec)
        .map_err(|e| Error::serialization_for_kind("NetworkPolicy", e.to_string()))?;
    let observed_spec = serde_json::to_value(&observed.spec)
        .map_err(|e| Error::serialization_for_kind("NetworkPolicy", e.to_string()))?;
    Ok(desired_spec == observed_spec)
}

/// Create the policy, or converge an existing one by read-modify-write
async fn converge(
    ctx: &NotebookContext,
    namespace: &str,
    desired: NetworkPolicy,
) -> Result<(), Error> {
    let policy_name = desired
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::internal("network policy without a name"))?;

    let mut delay = CONFLICT_RETRY_DELAY;
    for attempt in 1..=CONFLICT_RETRY_ATTEMPTS {
        match ctx.kube.get_network_policy(namespace, &policy_name).await? {
            None => {
                info!(namespace, policy = %policy_name, "creating network policy");
                match ctx.kube.create_network_policy(namespace, &desired).await {
                    // Someone created it between our read and write
                    Err(e) if e.is_conflict() => {}
                    result => return result,
                }
            }
            Some(observed) => {
                if in_sync(&desired, &observed)? {
                    debug!(namespace, policy = %policy_name, "network policy in sync");
                    return Ok(());
                }
                let mut updated = observed;
                updated.spec = desired.spec.clone();
                updated
                    .metadata
                    .labels
                    .get_or_insert_with(BTreeMap::new)
                    .extend(desired.metadata.labels.clone().into_iter().flatten());
                info!(namespace, policy = %policy_name, "updating network policy");
                match ctx.kube.update_network_policy(namespace, &updated).await {
                    Err(e) if e.is_conflict() => {
                        warn!(
                            namespace,
                            policy = %policy_name,
                            attempt,
                            "network policy update conflicted, retrying"
                        );
                    }
                    result => return result,
                }
            }
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }

    Err(Error::internal_with_context(
        "network_policy",
        format!("update of {policy_name} kept conflicting after {CONFLICT_RETRY_ATTEMPTS} attempts"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::notebook::tests::sample_notebook;
    use crate::controller::notebook::MockNotebookKubeClient;
    use kube::core::ErrorResponse;
    use mockall::Sequence;
    use std::sync::Arc;

    fn ctx_with(mock: MockNotebookKubeClient) -> NotebookContext {
        NotebookContext::for_testing(Arc::new(mock))
    }

    fn conflict() -> Error {
        Error::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }))
    }

    fn owner() -> OwnerReference {
        owner_reference(&sample_notebook("bench", "team-a")).unwrap()
    }

    #[test]
    fn test_notebook_port_policy_shape() {
        let policy = notebook_port_policy("team-a", "bench", &owner());
        assert_eq!(policy.metadata.name.as_deref(), Some("bench-ctrl-np"));

        let spec = policy.spec.unwrap();
        assert_eq!(
            spec.pod_selector.match_labels.unwrap().get(NOTEBOOK_NAME_LABEL),
            Some(&"bench".to_string())
        );
        let rule = &spec.ingress.unwrap()[0];
        assert_eq!(
            rule.ports.as_ref().unwrap()[0].port,
            Some(IntOrString::Int(NOTEBOOK_PORT))
        );
        let peer = &rule.from.as_ref().unwrap()[0];
        assert_eq!(
            peer.namespace_selector
                .as_ref()
                .unwrap()
                .match_labels
                .as_ref()
                .unwrap()
                .get("kubernetes.io/metadata.name"),
            Some(&"team-a".to_string())
        );
    }

    #[test]
    fn test_oauth_port_policy_admits_any_peer() {
        let policy = oauth_port_policy("team-a", "bench", &owner());
        let rule = &policy.spec.unwrap().ingress.unwrap()[0];
        assert!(rule.from.is_none());
        assert_eq!(
            rule.ports.as_ref().unwrap()[0].port,
            Some(IntOrString::Int(OAUTH_PROXY_PORT))
        );
    }

    #[test]
    fn test_external_extra_labels_are_not_drift() {
        let desired = notebook_port_policy("team-a", "bench", &owner());
        let mut observed = desired.clone();
        observed
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert("ingress.example.com/class".to_string(), "edge".to_string());

        assert!(in_sync(&desired, &observed).unwrap());
    }

    /// Story: missing policies are created with owner references
    #[tokio::test]
    async fn story_missing_policies_are_created() {
        let notebook = sample_notebook("bench", "team-a");

        let mut mock = MockNotebookKubeClient::new();
        mock.expect_get_network_policy().returning(|_, _| Ok(None));
        mock.expect_create_network_policy()
            .times(2)
            .withf(|_, policy| {
                policy
                    .metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|refs| refs[0].controller == Some(true))
            })
            .returning(|_, _| Ok(()));

        reconcile(&ctx_with(mock), &notebook, "team-a", "bench")
            .await
            .unwrap();
    }

    /// Story: mesh delegation suppresses the OAuth port policy
    #[tokio::test]
    async fn story_mesh_notebook_skips_oauth_policy() {
        let notebook = crate::controller::notebook::tests::with_annotation(
            sample_notebook("bench", "team-a"),
            workbench_common::crd::SERVICE_MESH_ANNOTATION,
            "true",
        );

        let mut mock = MockNotebookKubeClient::new();
        mock.expect_get_network_policy()
            .times(1)
            .withf(|_, name| name == "bench-ctrl-np")
            .returning(|_, _| Ok(None));
        mock.expect_create_network_policy()
            .times(1)
            .returning(|_, _| Ok(()));

        reconcile(&ctx_with(mock), &notebook, "team-a", "bench")
            .await
            .unwrap();
    }

    /// Story: label drift is fixed without touching ingress rules
    #[tokio::test]
    async fn story_label_drift_updates_labels_only() {
        let notebook = sample_notebook("bench", "team-a");

        let drifted = {
            let mut p = notebook_port_policy("team-a", "bench", &owner());
            p.metadata.labels = None;
            p
        };
        let in_sync_oauth = oauth_port_policy("team-a", "bench", &owner());

        let mut mock = MockNotebookKubeClient::new();
        mock.expect_get_network_policy()
            .withf(|_, name| name == "bench-ctrl-np")
            .returning(move |_, _| Ok(Some(drifted.clone())));
        mock.expect_get_network_policy()
            .withf(|_, name| name == "bench-oauth-np")
            .returning(move |_, _| Ok(Some(in_sync_oauth.clone())));
        mock.expect_update_network_policy()
            .times(1)
            .withf(|_, updated| {
                let labels_restored = updated
                    .metadata
                    .labels
                    .as_ref()
                    .is_some_and(|l| l.contains_key(NOTEBOOK_NAME_LABEL));
                let rules_intact = updated
                    .spec
                    .as_ref()
                    .and_then(|s| s.ingress.as_ref())
                    .is_some_and(|rules| rules[0].from.is_some());
                labels_restored && rules_intact
            })
            .returning(|_, _| Ok(()));

        reconcile(&ctx_with(mock), &notebook, "team-a", "bench")
            .await
            .unwrap();
    }

    /// Story: a concurrent edit costs exactly one retried read-modify-write
    #[tokio::test(start_paused = true)]
    async fn story_conflict_retries_exactly_once() {
        let desired = notebook_port_policy("team-a", "bench", &owner());
        let drifted = {
            let mut p = desired.clone();
            p.metadata.labels = None;
            p
        };

        let mut seq = Sequence::new();
        let mut mock = MockNotebookKubeClient::new();
        let drifted_first = drifted.clone();
        mock.expect_get_network_policy()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(Some(drifted_first.clone())));
        mock.expect_update_network_policy()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(conflict()));
        mock.expect_get_network_policy()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_, _| Ok(Some(drifted.clone())));
        mock.expect_update_network_policy()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let ctx = ctx_with(mock);
        converge(&ctx, "team-a", desired).await.unwrap();
    }

    /// Story: conflicts that never resolve surface a retryable error
    #[tokio::test(start_paused = true)]
    async fn story_unresolvable_conflict_errors_out() {
        let desired = notebook_port_policy("team-a", "bench", &owner());
        let drifted = {
            let mut p = desired.clone();
            p.metadata.labels = None;
            p
        };

        let mut mock = MockNotebookKubeClient::new();
        mock.expect_get_network_policy()
            .returning(move |_, _| Ok(Some(drifted.clone())));
        mock.expect_update_network_policy()
            .times(CONFLICT_RETRY_ATTEMPTS as usize)
            .returning(|_, _| Err(conflict()));

        let ctx = ctx_with(mock);
        let err = converge(&ctx, "team-a", desired).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
