//! Operator configuration
//!
//! All tunables are resolved once at startup and threaded explicitly
//! through the controller context and webhook state. Nothing below main
//! reads the environment.

/// Environment variable gating the pipeline RoleBinding reconciler
pub const SET_PIPELINE_RBAC_ENV: &str = "SET_PIPELINE_RBAC";

/// Default host of the cluster-internal image registry
pub const DEFAULT_INTERNAL_REGISTRY_HOST: &str = "image-registry.openshift-image-registry.svc:5000";

/// Default OAuth proxy sidecar image
pub const DEFAULT_OAUTH_PROXY_IMAGE: &str = "registry.redhat.io/openshift4/ose-oauth-proxy:v4.14";

/// Resolved operator configuration, shared by controller and webhook
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace the operator runs in; ImageStreams are read from here
    /// and the notebook network policy admits traffic from it
    pub namespace: String,
    /// Image used for the injected OAuth proxy sidecar
    pub oauth_proxy_image: String,
    /// Host prefix identifying images already resolved against the
    /// internal registry; such images are never re-resolved
    pub internal_registry_host: String,
    /// Whether to reconcile the pipeline-access RoleBinding per notebook
    pub set_pipeline_rbac: bool,
}

impl OperatorConfig {
    /// Parse the pipeline RBAC flag the way the deployment manifests
    /// write it: trimmed, case-insensitive "true" enables it, anything
    /// else (including unset) disables it.
    pub fn parse_pipeline_rbac(value: Option<&str>) -> bool {
        value
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Configuration for tests
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            namespace: "workbench-system".to_string(),
            oauth_proxy_image: "oauth-proxy:test".to_string(),
            internal_registry_host: DEFAULT_INTERNAL_REGISTRY_HOST.to_string(),
            set_pipeline_rbac: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_rbac_parsing() {
        assert!(OperatorConfig::parse_pipeline_rbac(Some("true")));
        assert!(OperatorConfig::parse_pipeline_rbac(Some(" True ")));
        assert!(OperatorConfig::parse_pipeline_rbac(Some("TRUE")));
        assert!(!OperatorConfig::parse_pipeline_rbac(Some("false")));
        assert!(!OperatorConfig::parse_pipeline_rbac(Some("1")));
        assert!(!OperatorConfig::parse_pipeline_rbac(Some("")));
        assert!(!OperatorConfig::parse_pipeline_rbac(None));
    }
}
