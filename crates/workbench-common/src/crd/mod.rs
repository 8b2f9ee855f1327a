//! Custom Resource Definitions for the workbench operator

mod notebook;

pub use notebook::{
    Notebook, NotebookSpec, NotebookTemplateSpec, IMAGE_SELECTION_ANNOTATION,
    INJECT_OAUTH_ANNOTATION, LOGOUT_URL_ANNOTATION, RECONCILIATION_LOCK_VALUE, RESTART_ANNOTATION,
    SERVICE_MESH_ANNOTATION, STOP_ANNOTATION, UPDATE_PENDING_ANNOTATION,
};
