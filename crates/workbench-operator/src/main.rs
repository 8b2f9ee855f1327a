//! Workbench operator - Notebook reconciliation and admission mutation

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use workbench_common::crd::Notebook;
use workbench_operator::config::{
    OperatorConfig, DEFAULT_INTERNAL_REGISTRY_HOST, DEFAULT_OAUTH_PROXY_IMAGE,
    SET_PIPELINE_RBAC_ENV,
};
use workbench_operator::controller::build_notebook_controller;
use workbench_operator::controller::notebook::NotebookKubeClientImpl;
use workbench_operator::index::NotebookIndex;
use workbench_operator::webhook::{webhook_router, WebhookState};

/// Path the serviceaccount namespace is mounted at inside a pod
const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Workbench - Kubernetes operator for Notebook workbenches
#[derive(Parser, Debug)]
#[command(name = "workbench-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Address the admission webhook listens on
    #[arg(long, default_value = "0.0.0.0:8443")]
    webhook_addr: SocketAddr,

    /// Path to the webhook TLS certificate (PEM). Without it the webhook
    /// serves plain HTTP, which is only useful for local testing.
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<std::path::PathBuf>,

    /// Path to the webhook TLS private key (PEM)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<std::path::PathBuf>,

    /// Image used for the injected OAuth proxy sidecar
    #[arg(long, env = "OAUTH_PROXY_IMAGE", default_value = DEFAULT_OAUTH_PROXY_IMAGE)]
    oauth_proxy_image: String,

    /// Host prefix of the cluster-internal image registry
    #[arg(long, env = "INTERNAL_REGISTRY_HOST", default_value = DEFAULT_INTERNAL_REGISTRY_HOST)]
    internal_registry_host: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before anything opens a TLS connection
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install crypto provider: {:?}. \
             The operator cannot serve or dial TLS without one.",
            e
        );
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Notebook::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_operator(cli).await
}

/// Ensure the Notebook CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply,
/// so the CRD version always matches the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Api, Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("workbench-operator").force();

    tracing::info!("Installing Notebook CRD...");
    crds.patch("notebooks.workbench.dev", &params, &Patch::Apply(&Notebook::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install Notebook CRD: {}", e))?;

    tracing::info!("Notebook CRD installed/updated");
    Ok(())
}

/// Detect the namespace the operator pod runs in
fn detect_namespace() -> String {
    if let Ok(ns) = std::env::var("POD_NAMESPACE") {
        if !ns.trim().is_empty() {
            return ns.trim().to_string();
        }
    }
    match std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE) {
        Ok(ns) if !ns.trim().is_empty() => ns.trim().to_string(),
        _ => {
            tracing::warn!("could not detect operator namespace, defaulting to workbench-system");
            "workbench-system".to_string()
        }
    }
}

/// Run controller and webhook until signal
async fn run_operator(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Workbench operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let config = OperatorConfig {
        namespace: detect_namespace(),
        oauth_proxy_image: cli.oauth_proxy_image,
        internal_registry_host: cli.internal_registry_host,
        set_pipeline_rbac: OperatorConfig::parse_pipeline_rbac(
            std::env::var(SET_PIPELINE_RBAC_ENV).ok().as_deref(),
        ),
    };
    tracing::info!(
        namespace = %config.namespace,
        pipeline_rbac = config.set_pipeline_rbac,
        "resolved operator configuration"
    );

    let index = Arc::new(NotebookIndex::new());
    let controller = build_notebook_controller(client.clone(), config.clone(), index);

    let webhook_state = Arc::new(WebhookState::new(
        Arc::new(NotebookKubeClientImpl::new(client)),
        config,
    ));
    let app = webhook_router(webhook_state);

    let webhook = async move {
        match (cli.tls_cert, cli.tls_key) {
            (Some(cert), Some(key)) => {
                let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(|e| anyhow::anyhow!("TLS config error: {}", e))?;
                tracing::info!(addr = %cli.webhook_addr, "Starting admission webhook (TLS)");
                axum_server::bind_rustls(cli.webhook_addr, tls_config)
                    .serve(app.into_make_service())
                    .await
                    .map_err(|e| anyhow::anyhow!("Webhook server error: {}", e))
            }
            _ => {
                tracing::warn!(
                    addr = %cli.webhook_addr,
                    "Starting admission webhook WITHOUT TLS, local testing only"
                );
                axum_server::bind(cli.webhook_addr)
                    .serve(app.into_make_service())
                    .await
                    .map_err(|e| anyhow::anyhow!("Webhook server error: {}", e))
            }
        }
    };

    tokio::select! {
        _ = controller => {
            tracing::info!("Notebook controller completed");
        }
        result = webhook => {
            result?;
            tracing::info!("Webhook server completed");
        }
    }

    tracing::info!("Workbench operator shutting down");
    Ok(())
}
