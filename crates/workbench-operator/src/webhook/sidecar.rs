//! OAuth proxy sidecar injection
//!
//! Adds the openshift oauth-proxy container in front of the notebook
//! server, wired to the cookie secret and serving-cert Secret the
//! controller provisions. Injection is a keyed upsert, so re-admitting
//! an already-injected notebook changes nothing.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, Probe, ResourceRequirements, SecretVolumeSource,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use workbench_common::crd::{Notebook, LOGOUT_URL_ANNOTATION};
use workbench_common::{podutil, Error, NOTEBOOK_PORT, OAUTH_PROXY_PORT};

use crate::config::OperatorConfig;

/// Name of the injected sidecar container
pub const OAUTH_PROXY_CONTAINER: &str = "oauth-proxy";

const OAUTH_CONFIG_VOLUME: &str = "oauth-config";
const TLS_VOLUME: &str = "tls-certificates";

/// Inject the OAuth proxy sidecar and its volumes into the notebook
pub fn inject(notebook: &mut Notebook, config: &OperatorConfig) -> Result<(), Error> {
    let name = notebook.name_any();
    let namespace = notebook.namespace().ok_or_else(|| {
        Error::validation_for(&name, "notebook has no namespace, cannot inject oauth proxy")
    })?;
    let logout_url = notebook
        .annotation(LOGOUT_URL_ANNOTATION)
        .map(str::to_string);

    let container = proxy_container(&name, &namespace, config, logout_url.as_deref());
    let pod = notebook.pod_spec_mut();

    podutil::upsert_container(&mut pod.containers, container);
    podutil::upsert_volume(
        &mut pod.volumes,
        secret_volume(OAUTH_CONFIG_VOLUME, format!("{name}-oauth-config")),
    );
    podutil::upsert_volume(
        &mut pod.volumes,
        secret_volume(TLS_VOLUME, format!("{name}-tls")),
    );

    // The proxy authenticates as the notebook's own service account; the
    // redirect reference annotation lives on the account named after the
    // notebook, so pin it explicitly.
    pod.service_account_name = Some(name);

    Ok(())
}

fn proxy_container(
    name: &str,
    namespace: &str,
    config: &OperatorConfig,
    logout_url: Option<&str>,
) -> Container {
    let sar = serde_json::json!({
        "verb": "get",
        "resource": "notebooks",
        "resourceAPIGroup": "workbench.dev",
        "resourceName": name,
        "namespace": namespace,
    });

    let mut args = vec![
        "--provider=openshift".to_string(),
        format!("--https-address=:{OAUTH_PROXY_PORT}"),
        "--http-address=".to_string(),
        format!("--openshift-service-account={name}"),
        "--cookie-secret-file=/etc/oauth/config/cookie_secret".to_string(),
        "--tls-cert=/etc/tls/private/tls.crt".to_string(),
        "--tls-key=/etc/tls/private/tls.key".to_string(),
        format!("--upstream=http://localhost:{NOTEBOOK_PORT}"),
        "--email-domain=*".to_string(),
        "--skip-provider-button".to_string(),
        format!("--openshift-sar={sar}"),
    ];
    if let Some(url) = logout_url {
        args.push(format!("--logout-url={url}"));
    }

    Container {
        name: OAUTH_PROXY_CONTAINER.to_string(),
        image: Some(config.oauth_proxy_image.clone()),
        image_pull_policy: Some("Always".to_string()),
        args: Some(args),
        ports: Some(vec![ContainerPort {
            name: Some("oauth-proxy".to_string()),
            container_port: OAUTH_PROXY_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        liveness_probe: Some(healthz_probe(30)),
        readiness_probe: Some(healthz_probe(5)),
        resources: Some(proxy_resources()),
        volume_mounts: Some(vec![
            VolumeMount {
                name: OAUTH_CONFIG_VOLUME.to_string(),
                mount_path: "/etc/oauth/config".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: TLS_VOLUME.to_string(),
                mount_path: "/etc/tls/private".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

fn healthz_probe(initial_delay_seconds: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/oauth/healthz".to_string()),
            port: IntOrString::String("oauth-proxy".to_string()),
            scheme: Some("HTTPS".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(5),
        timeout_seconds: Some(1),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn proxy_resources() -> ResourceRequirements {
    let amounts = BTreeMap::from([
        ("cpu".to_string(), Quantity("100m".to_string())),
        ("memory".to_string(), Quantity("64Mi".to_string())),
    ]);
    ResourceRequirements {
        requests: Some(amounts.clone()),
        limits: Some(amounts),
        ..Default::default()
    }
}

fn secret_volume(volume_name: &str, secret_name: String) -> Volume {
    Volume {
        name: volume_name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name),
            default_mode: Some(420),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::notebook::tests::{sample_notebook, with_annotation};

    #[test]
    fn test_sidecar_wiring() {
        let mut notebook = sample_notebook("bench", "team-a");
        inject(&mut notebook, &OperatorConfig::for_testing()).unwrap();

        let pod = notebook.pod_spec();
        assert_eq!(pod.containers.len(), 2);
        assert_eq!(pod.service_account_name.as_deref(), Some("bench"));

        let proxy = &pod.containers[1];
        assert_eq!(proxy.name, OAUTH_PROXY_CONTAINER);
        let args = proxy.args.as_ref().unwrap();
        assert!(args.contains(&"--openshift-service-account=bench".to_string()));
        assert!(args
            .iter()
            .any(|a| a.starts_with("--openshift-sar=") && a.contains("\"resourceName\":\"bench\"")));
        assert!(!args.iter().any(|a| a.starts_with("--logout-url=")));

        let volumes = pod.volumes.as_ref().unwrap();
        let secret_of = |name: &str| {
            volumes
                .iter()
                .find(|v| v.name == name)
                .and_then(|v| v.secret.as_ref())
                .and_then(|s| s.secret_name.clone())
        };
        assert_eq!(secret_of(OAUTH_CONFIG_VOLUME).as_deref(), Some("bench-oauth-config"));
        assert_eq!(secret_of(TLS_VOLUME).as_deref(), Some("bench-tls"));
    }

    #[test]
    fn test_logout_url_annotation_is_forwarded() {
        let mut notebook = with_annotation(
            sample_notebook("bench", "team-a"),
            LOGOUT_URL_ANNOTATION,
            "https://console.example.com/logout",
        );
        inject(&mut notebook, &OperatorConfig::for_testing()).unwrap();

        let args = notebook.pod_spec().containers[1].args.clone().unwrap();
        assert!(args.contains(&"--logout-url=https://console.example.com/logout".to_string()));
    }

    #[test]
    fn test_injection_is_idempotent() {
        let mut notebook = sample_notebook("bench", "team-a");
        let config = OperatorConfig::for_testing();

        inject(&mut notebook, &config).unwrap();
        let once = serde_json::to_value(notebook.pod_spec()).unwrap();

        inject(&mut notebook, &config).unwrap();
        let twice = serde_json::to_value(notebook.pod_spec()).unwrap();

        assert_eq!(once, twice);
    }
}
