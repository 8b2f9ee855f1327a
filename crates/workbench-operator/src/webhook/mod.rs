//! Mutating Admission Webhook for Notebooks
//!
//! Intercepts Notebook create/update operations and applies the mutation
//! pipeline: reconciliation lock injection, image reference resolution,
//! certificate mount injection, OAuth sidecar injection, and the restart
//! guard that defers pod-template changes a user did not ask for.

pub mod image;
pub mod notebook;
pub mod sidecar;

use std::sync::Arc;

use axum::{routing::post, Router};

use crate::config::OperatorConfig;
use crate::controller::notebook::NotebookKubeClient;

/// Shared state for webhook handlers
#[derive(Clone)]
pub struct WebhookState {
    /// Kubernetes client for ConfigMap and ImageStream lookups
    pub kube: Arc<dyn NotebookKubeClient>,
    /// Resolved operator configuration
    pub config: OperatorConfig,
}

impl WebhookState {
    /// Create a new webhook state
    pub fn new(kube: Arc<dyn NotebookKubeClient>, config: OperatorConfig) -> Self {
        Self { kube, config }
    }

    /// Create a state for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn NotebookKubeClient>) -> Self {
        Self {
            kube,
            config: OperatorConfig::for_testing(),
        }
    }
}

/// Create the webhook router with all mutation endpoints
///
/// Currently supports:
/// - POST /mutate/notebooks - Mutate Notebooks on create/update
pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate/notebooks", post(notebook::mutate_handler))
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .with_state(state)
}
