//! Notebook Mutation Webhook
//!
//! Handles AdmissionReview requests for Notebook resources. The pipeline
//! runs lock injection, image resolution, trust-bundle mount injection,
//! and OAuth sidecar injection over a working copy, then lets the
//! restart guard decide whether the pod-template edits may ship with
//! this write or must wait for a restart the user actually asked for.

use std::sync::Arc;

use axum::{extract::State, Json};
use json_patch::PatchOperation;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use workbench_common::crd::{
    Notebook, IMAGE_SELECTION_ANNOTATION, RECONCILIATION_LOCK_VALUE, STOP_ANNOTATION,
    UPDATE_PENDING_ANNOTATION,
};
use workbench_common::trust::{GLOBAL_TRUST_BUNDLE_NAME, MERGED_BUNDLE_NAME};
use workbench_common::{podutil, trust};

use super::{image, sidecar, WebhookState};

/// Env var mirroring the resolved notebook image for in-pod consumers
const JUPYTER_IMAGE_ENV: &str = "JUPYTER_IMAGE";

/// Restart guard verdict for one admission write
#[derive(Clone, Debug, PartialEq, Eq)]
enum GuardVerdict {
    /// Ship the mutated template as computed
    Allow,
    /// Withhold the pipeline's template edits; the reason describes them
    Deferred { reason: String },
}

/// Handle mutating admission review for Notebooks
pub async fn mutate_handler(
    State(state): State<Arc<WebhookState>>,
    Json(body): Json<AdmissionReview<Notebook>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<Notebook> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = mutate_notebook(&state, &req).await;
    Json(response.into_review())
}

/// Process a single notebook mutation request
async fn mutate_notebook(
    state: &WebhookState,
    request: &AdmissionRequest<Notebook>,
) -> AdmissionResponse {
    let uid = request.uid.clone();

    let Some(incoming) = request.object.as_ref() else {
        debug!(uid = %uid, "No notebook object in request, allowing unchanged");
        return AdmissionResponse::from(request);
    };
    let name = incoming.name_any();

    if incoming.oauth_injection_enabled() && incoming.service_mesh_enabled() {
        warn!(uid = %uid, notebook = %name, "oauth injection and mesh delegation both requested");
        return AdmissionResponse::from(request)
            .deny("OAuth sidecar injection and service mesh delegation are mutually exclusive");
    }

    let mut mutated = incoming.clone();

    if matches!(request.operation, Operation::Create) {
        debug!(uid = %uid, notebook = %name, "injecting reconciliation lock");
        mutated
            .annotations_mut()
            .insert(STOP_ANNOTATION.to_string(), RECONCILIATION_LOCK_VALUE.to_string());
    }

    if let Err(response) = resolve_image(state, request, &mut mutated, &name).await {
        return *response;
    }
    if let Err(response) = inject_trust_bundle(state, request, &mut mutated, &name).await {
        return *response;
    }

    if mutated.oauth_injection_enabled() {
        if let Err(e) = sidecar::inject(&mut mutated, &state.config) {
            warn!(uid = %uid, notebook = %name, error = %e, "oauth sidecar injection failed");
            return AdmissionResponse::from(request).deny(e.to_string());
        }
    }

    match restart_guard(&request.operation, request.old_object.as_ref(), incoming, &mutated) {
        GuardVerdict::Allow => {
            mutated.annotations_mut().remove(UPDATE_PENDING_ANNOTATION);
        }
        GuardVerdict::Deferred { reason } => {
            info!(uid = %uid, notebook = %name, reason = %reason, "deferring pod template changes");
            mutated.spec.template = incoming.spec.template.clone();
            mutated
                .annotations_mut()
                .insert(UPDATE_PENDING_ANNOTATION.to_string(), reason);
        }
    }

    let patch = match diff_as_patch(incoming, &mutated) {
        Ok(patch) => patch,
        Err(e) => {
            error!(uid = %uid, notebook = %name, error = %e, "Failed to compute patch");
            return AdmissionResponse::from(request).deny(e.to_string());
        }
    };

    info!(uid = %uid, notebook = %name, patch_ops = patch.0.len(), "Applying patch to notebook");
    match AdmissionResponse::from(request).with_patch(patch) {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %uid, error = %e, "Failed to serialize patch");
            AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
        }
    }
}

/// Resolve the primary container image from the image catalog
///
/// Skipped when the image already points at the internal registry.
/// A malformed selection annotation is a hard rejection; a selection
/// naming a catalog entry that does not exist is logged and skipped.
async fn resolve_image(
    state: &WebhookState,
    request: &AdmissionRequest<Notebook>,
    mutated: &mut Notebook,
    name: &str,
) -> Result<(), Box<AdmissionResponse>> {
    let current_image = mutated
        .primary_container()
        .and_then(|c| c.image.clone())
        .unwrap_or_default();
    if current_image.contains(&state.config.internal_registry_host) {
        debug!(notebook = %name, "image already resolved against internal registry");
        return Ok(());
    }

    let Some(raw) = mutated.annotation(IMAGE_SELECTION_ANNOTATION).map(str::to_string) else {
        return Ok(());
    };

    let selection = match image::ImageSelection::parse(&raw) {
        Ok(selection) => selection,
        Err(e) => {
            warn!(notebook = %name, selection = %raw, "rejecting malformed image selection");
            return Err(Box::new(AdmissionResponse::from(request).deny(e.to_string())));
        }
    };

    let streams = match state.kube.list_image_streams(&state.config.namespace).await {
        Ok(streams) => streams,
        Err(e) => {
            error!(notebook = %name, error = %e, "Failed to list image streams");
            return Err(Box::new(AdmissionResponse::from(request).deny(e.to_string())));
        }
    };

    let Some(reference) = image::select_image_reference(&streams, &selection) else {
        warn!(
            notebook = %name,
            stream = %selection.stream,
            tag = %selection.tag,
            "image selection not found in catalog, leaving image unchanged"
        );
        return Ok(());
    };

    info!(notebook = %name, image = %reference, "resolved notebook image");
    let Some(container) = mutated.primary_container_mut() else {
        return Err(Box::new(AdmissionResponse::from(request).deny(format!(
            "no container named {name} in pod template"
        ))));
    };
    container.image = Some(reference.clone());
    podutil::upsert_env(
        &mut container.env,
        k8s_openapi::api::core::v1::EnvVar {
            name: JUPYTER_IMAGE_ENV.to_string(),
            value: Some(reference),
            ..Default::default()
        },
    );
    Ok(())
}

/// Inject the trust bundle mount when the namespace has one
///
/// Requires both the global trust source and the merged bundle to exist;
/// the controller creates the bundle asynchronously, so a notebook
/// admitted before that simply picks the mount up on its next write.
async fn inject_trust_bundle(
    state: &WebhookState,
    request: &AdmissionRequest<Notebook>,
    mutated: &mut Notebook,
    name: &str,
) -> Result<(), Box<AdmissionResponse>> {
    let Some(namespace) = mutated.namespace() else {
        return Ok(());
    };

    let sources = async {
        let global = state
            .kube
            .get_config_map(&namespace, GLOBAL_TRUST_BUNDLE_NAME)
            .await?;
        let merged = state.kube.get_config_map(&namespace, MERGED_BUNDLE_NAME).await?;
        Ok::<_, workbench_common::Error>((global, merged))
    };
    match sources.await {
        Ok((Some(_), Some(_))) => {
            debug!(notebook = %name, "injecting trust bundle mount");
            if let Err(e) = trust::inject(mutated.pod_spec_mut(), name) {
                return Err(Box::new(AdmissionResponse::from(request).deny(e.to_string())));
            }
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(e) => {
            error!(notebook = %name, error = %e, "Failed to read trust sources");
            Err(Box::new(AdmissionResponse::from(request).deny(e.to_string())))
        }
    }
}

/// Decide whether the pipeline's pod-template edits may ship on this write
fn restart_guard(
    operation: &Operation,
    old: Option<&Notebook>,
    incoming: &Notebook,
    mutated: &Notebook,
) -> GuardVerdict {
    if matches!(operation, Operation::Create) {
        return GuardVerdict::Allow;
    }
    let Some(old) = old else {
        return GuardVerdict::Allow;
    };

    // A stopped or restarting notebook has no running pod to disturb
    if incoming.is_stopped() || incoming.restart_requested() {
        return GuardVerdict::Allow;
    }

    // The user is changing the template themselves: the restart happens
    // anyway, our edits ride along
    if old.spec.template != incoming.spec.template {
        return GuardVerdict::Allow;
    }

    // Nothing the pipeline did would change the running pod
    if mutated.spec.template == old.spec.template {
        return GuardVerdict::Allow;
    }

    GuardVerdict::Deferred {
        reason: render_template_diff(incoming, mutated),
    }
}

/// Human-readable summary of the withheld template changes
fn render_template_diff(incoming: &Notebook, mutated: &Notebook) -> String {
    let from = serde_json::to_value(&incoming.spec.template).unwrap_or_default();
    let to = serde_json::to_value(&mutated.spec.template).unwrap_or_default();

    let ops: Vec<String> = json_patch::diff(&from, &to)
        .0
        .iter()
        .map(|op| match op {
            PatchOperation::Add(o) => format!("add {}", o.path),
            PatchOperation::Remove(o) => format!("remove {}", o.path),
            PatchOperation::Replace(o) => format!("replace {}", o.path),
            PatchOperation::Move(o) => format!("move {}", o.path),
            PatchOperation::Copy(o) => format!("copy {}", o.path),
            PatchOperation::Test(o) => format!("test {}", o.path),
        })
        .collect();

    if ops.is_empty() {
        "pod template changed".to_string()
    } else {
        format!("deferred pod template changes: {}", ops.join(", "))
    }
}

/// JSON patch turning the raw request object into the mutated one
fn diff_as_patch(incoming: &Notebook, mutated: &Notebook) -> Result<json_patch::Patch, serde_json::Error> {
    let from = serde_json::to_value(incoming)?;
    let to = serde_json::to_value(mutated)?;
    Ok(json_patch::diff(&from, &to))
}
