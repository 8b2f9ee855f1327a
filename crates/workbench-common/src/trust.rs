//! Trust bundle wiring shared by the controller and the webhook
//!
//! The controller aggregates namespace trust sources into a merged
//! ConfigMap; the webhook mounts that ConfigMap into notebook pods and
//! points the common TLS environment variables at it. Both sides agree
//! on the names and paths defined here.

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, EnvVar, KeyToPath, PodSpec, Volume, VolumeMount,
};

use crate::error::Error;
use crate::podutil;

/// Namespace ConfigMap carrying platform-wide trust anchors
pub const GLOBAL_TRUST_BUNDLE_NAME: &str = "platform-trusted-ca-bundle";

/// Primary data key of the global trust source; empty means the feature is off
pub const GLOBAL_PRIMARY_KEY: &str = "ca-bundle.crt";

/// Namespace ConfigMap carrying the cluster's own CA (injected by kube)
pub const SELF_SIGNED_BUNDLE_NAME: &str = "kube-root-ca.crt";

/// Merged per-namespace bundle written by the controller
pub const MERGED_BUNDLE_NAME: &str = "workbench-trusted-ca-bundle";

/// Data key of the merged bundle
pub const MERGED_BUNDLE_KEY: &str = "ca-bundle.crt";

/// Name of the volume mounting the merged bundle into notebook pods
pub const TRUST_VOLUME_NAME: &str = "trusted-ca";

/// Path the merged bundle is mounted at inside the container
pub const TRUST_MOUNT_PATH: &str = "/etc/pki/tls/custom-certs/ca-bundle.crt";

/// Environment variables pointed at the mounted bundle.
///
/// This set is fixed: pip, requests, OpenSSL consumers, pipeline clients,
/// and git all discover custom CAs through these.
pub const CERT_ENV_VARS: [&str; 5] = [
    "PIP_CERT",
    "REQUESTS_CA_BUNDLE",
    "SSL_CERT_FILE",
    "PIPELINES_SSL_SA_CERTS",
    "GIT_SSL_CAINFO",
];

/// Trust sources visited in fixed order, with their data keys in fixed
/// order, so the merged bundle bytes are deterministic.
pub const TRUST_SOURCES: [(&str, &[&str]); 2] = [
    (
        GLOBAL_TRUST_BUNDLE_NAME,
        &["ca-bundle.crt", "custom-ca-bundle.crt"],
    ),
    (SELF_SIGNED_BUNDLE_NAME, &["ca.crt"]),
];

/// Inject the trust volume, mount, and env set into the primary container
///
/// Idempotent: every edit is a keyed replace-else-append, so running the
/// webhook twice over the same pod yields the same result.
pub fn inject(pod: &mut PodSpec, notebook_name: &str) -> Result<(), Error> {
    let container = pod
        .containers
        .iter_mut()
        .find(|c| c.name == notebook_name)
        .ok_or_else(|| {
            Error::validation_for(
                notebook_name,
                format!("no container named {notebook_name} in pod template"),
            )
        })?;

    for var in CERT_ENV_VARS {
        podutil::upsert_env(
            &mut container.env,
            EnvVar {
                name: var.to_string(),
                value: Some(TRUST_MOUNT_PATH.to_string()),
                ..Default::default()
            },
        );
    }

    podutil::upsert_volume_mount(
        &mut container.volume_mounts,
        VolumeMount {
            name: TRUST_VOLUME_NAME.to_string(),
            mount_path: TRUST_MOUNT_PATH.to_string(),
            sub_path: Some(MERGED_BUNDLE_KEY.to_string()),
            read_only: Some(true),
            ..Default::default()
        },
    );

    podutil::upsert_volume(
        &mut pod.volumes,
        Volume {
            name: TRUST_VOLUME_NAME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: MERGED_BUNDLE_NAME.to_string(),
                // Optional so pods still schedule while the bundle is absent
                optional: Some(true),
                items: Some(vec![KeyToPath {
                    key: MERGED_BUNDLE_KEY.to_string(),
                    path: MERGED_BUNDLE_KEY.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
    );

    Ok(())
}

/// Strip the trust wiring from the pod; true if anything changed
///
/// Used by the controller when the merged bundle disappears but the
/// notebook still references it.
pub fn strip(pod: &mut PodSpec, notebook_name: &str) -> bool {
    let mut changed = podutil::remove_volume(&mut pod.volumes, TRUST_VOLUME_NAME);

    if let Some(container) = pod.containers.iter_mut().find(|c| c.name == notebook_name) {
        changed |= podutil::remove_env(&mut container.env, &CERT_ENV_VARS);
        changed |= podutil::remove_volume_mount(&mut container.volume_mounts, TRUST_VOLUME_NAME);
    }

    changed
}

/// Whether the pod mounts the merged bundle ConfigMap
pub fn mounts_merged_bundle(pod: &PodSpec) -> bool {
    pod.volumes
        .as_ref()
        .map(|vols| {
            vols.iter().any(|v| {
                v.config_map
                    .as_ref()
                    .is_some_and(|cm| cm.name == MERGED_BUNDLE_NAME)
            })
        })
        .unwrap_or(false)
}
