//! OAuth proxy resource reconciliation
//!
//! When OAuth injection is enabled the webhook adds the proxy sidecar,
//! and the controller backs it with a ServiceAccount carrying the OAuth
//! redirect reference, a serving-cert Service, a cookie secret, and a
//! reencrypt Route. All four are create-if-absent: once created, later
//! spec drift belongs to whoever edited them, the controller does not
//! take ownership back. Without OAuth (and without mesh delegation) the
//! notebook instead gets a plain edge Route to its primary port.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k8s_openapi::api::core::v1::{Secret, Service, ServiceAccount, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::DynamicObject;
use rand::Rng;
use tracing::{debug, info};

use workbench_common::crd::Notebook;
use workbench_common::{
    Error, MANAGED_BY_LABEL_KEY, MANAGED_BY_LABEL_VALUE, NOTEBOOK_NAME_LABEL, OAUTH_PROXY_PORT,
};

use crate::controller::notebook::{route_api_resource, NotebookContext};
use crate::controller::owner_reference;

/// Annotation OpenShift reads to register the proxy's OAuth redirect
const OAUTH_REDIRECT_ANNOTATION: &str = "serviceaccounts.openshift.io/oauth-redirectreference.first";

/// Annotation requesting a serving certificate for the TLS service
const SERVING_CERT_ANNOTATION: &str = "service.beta.openshift.io/serving-cert-secret-name";

/// Key of the proxy cookie secret inside the config Secret
const COOKIE_SECRET_KEY: &str = "cookie_secret";

/// Converge the OAuth proxy's backing resources, create-if-absent
pub async fn reconcile(
    ctx: &NotebookContext,
    notebook: &Notebook,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let owner = owner_reference(notebook)?;

    if ctx.kube.get_service_account(namespace, name).await?.is_none() {
        info!(namespace, notebook = name, "creating oauth service account");
        tolerate_conflict(
            ctx.kube
                .create_service_account(namespace, &oauth_service_account(namespace, name, &owner))
                .await,
        )?;
    }

    let service_name = format!("{name}-tls");
    if ctx.kube.get_service(namespace, &service_name).await?.is_none() {
        info!(namespace, notebook = name, "creating oauth tls service");
        tolerate_conflict(
            ctx.kube
                .create_service(namespace, &oauth_service(namespace, name, &owner))
                .await,
        )?;
    }

    let secret_name = format!("{name}-oauth-config");
    if ctx.kube.get_secret(namespace, &secret_name).await?.is_none() {
        info!(namespace, notebook = name, "creating oauth cookie secret");
        tolerate_conflict(
            ctx.kube
                .create_secret(namespace, &oauth_secret(namespace, name, &owner))
                .await,
        )?;
    }

    if ctx.kube.get_route(namespace, name).await?.is_none() {
        info!(namespace, notebook = name, "creating oauth route");
        tolerate_conflict(
            ctx.kube
                .create_route(namespace, &oauth_route(namespace, name, &owner))
                .await,
        )?;
    }

    Ok(())
}

/// Converge the plain external Route used when OAuth is not injected
pub async fn reconcile_plain_route(
    ctx: &NotebookContext,
    notebook: &Notebook,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let owner = owner_reference(notebook)?;
    if ctx.kube.get_route(namespace, name).await?.is_some() {
        debug!(namespace, notebook = name, "route already present");
        return Ok(());
    }
    info!(namespace, notebook = name, "creating plain route");
    tolerate_conflict(
        ctx.kube
            .create_route(namespace, &plain_route(namespace, name, &owner))
            .await,
    )
}

/// Lost create races are fine, the object now exists either way
fn tolerate_conflict(result: Result<(), Error>) -> Result<(), Error> {
    match result {
        Err(e) if e.is_conflict() => Ok(()),
        other => other,
    }
}

fn managed_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NOTEBOOK_NAME_LABEL.to_string(), name.to_string()),
        (
            MANAGED_BY_LABEL_KEY.to_string(),
            MANAGED_BY_LABEL_VALUE.to_string(),
        ),
    ])
}

fn owned_meta(
    namespace: &str,
    name: &str,
    object_name: String,
    owner: &OwnerReference,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(object_name),
        namespace: Some(namespace.to_string()),
        labels: Some(managed_labels(name)),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    }
}

fn oauth_service_account(namespace: &str, name: &str, owner: &OwnerReference) -> ServiceAccount {
    let redirect = serde_json::json!({
        "kind": "OAuthRedirectReference",
        "apiVersion": "v1",
        "reference": {"kind": "Route", "name": name}
    });
    let mut meta = owned_meta(namespace, name, name.to_string(), owner);
    meta.annotations = Some(BTreeMap::from([(
        OAUTH_REDIRECT_ANNOTATION.to_string(),
        redirect.to_string(),
    )]));
    ServiceAccount {
        metadata: meta,
        ..Default::default()
    }
}

fn oauth_service(namespace: &str, name: &str, owner: &OwnerReference) -> Service {
    let service_name = format!("{name}-tls");
    let mut meta = owned_meta(namespace, name, service_name.clone(), owner);
    meta.annotations = Some(BTreeMap::from([(
        SERVING_CERT_ANNOTATION.to_string(),
        service_name,
    )]));
    Service {
        metadata: meta,
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                NOTEBOOK_NAME_LABEL.to_string(),
                name.to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some("oauth-proxy".to_string()),
                port: 443,
                target_port: Some(IntOrString::Int(OAUTH_PROXY_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn oauth_secret(namespace: &str, name: &str, owner: &OwnerReference) -> Secret {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    Secret {
        metadata: owned_meta(namespace, name, format!("{name}-oauth-config"), owner),
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([(
            COOKIE_SECRET_KEY.to_string(),
            BASE64.encode(bytes),
        )])),
        ..Default::default()
    }
}

fn oauth_route(namespace: &str, name: &str, owner: &OwnerReference) -> DynamicObject {
    let mut route = DynamicObject::new(name, &route_api_resource())
        .within(namespace)
        .data(serde_json::json!({
            "spec": {
                "to": {"kind": "Service", "name": format!("{name}-tls"), "weight": 100},
                "port": {"targetPort": "oauth-proxy"},
                "tls": {
                    "termination": "reencrypt",
                    "insecureEdgeTerminationPolicy": "Redirect"
                },
                "wildcardPolicy": "None"
            }
        }));
    route.metadata.labels = Some(managed_labels(name));
    route.metadata.owner_references = Some(vec![owner.clone()]);
    route
}

fn plain_route(namespace: &str, name: &str, owner: &OwnerReference) -> DynamicObject {
    let mut route = DynamicObject::new(name, &route_api_resource())
        .within(namespace)
        .data(serde_json::json!({
            "spec": {
                "to": {"kind": "Service", "name": name, "weight": 100},
                "port": {"targetPort": "notebook-port"},
                "tls": {
                    "termination": "edge",
                    "insecureEdgeTerminationPolicy": "Redirect"
                },
                "wildcardPolicy": "None"
            }
        }));
    route.metadata.labels = Some(managed_labels(name));
    route.metadata.owner_references = Some(vec![owner.clone()]);
    route
}
