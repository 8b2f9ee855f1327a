//! Common types for the workbench operator: the Notebook CRD, errors, and
//! pod spec helpers shared by the controller and the admission webhook.

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod podutil;
pub mod retry;
pub mod trust;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Port the notebook server listens on inside the pod
pub const NOTEBOOK_PORT: i32 = 8888;

/// Port the OAuth proxy sidecar listens on
pub const OAUTH_PROXY_PORT: i32 = 8443;

/// Label applied to every dependent object, keyed by the owning notebook
pub const NOTEBOOK_NAME_LABEL: &str = "notebook-name";

/// Label key marking objects written by this operator
pub const MANAGED_BY_LABEL_KEY: &str = "workbench.dev/managed-by";

/// Label value marking objects written by this operator
pub const MANAGED_BY_LABEL_VALUE: &str = "workbench-operator";
