//! Error types for the workbench operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries contextual information such as the notebook name
//! or the subsystem where the failure occurred.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for workbench operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for Notebook objects (invariant violations)
    #[error("validation error for {notebook}: {message}")]
    Validation {
        /// Name of the notebook with the invalid state
        notebook: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.template.spec.containers")
        field: Option<String>,
    },

    /// Malformed admission input that must be rejected outright
    #[error("admission error: {message}")]
    Admission {
        /// Description of what was malformed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "webhook")
        context: String,
    },
}

impl Error {
    /// Create a validation error without notebook context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            notebook: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with notebook context
    pub fn validation_for(notebook: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            notebook: notebook.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with notebook context and field path
    pub fn validation_for_field(
        notebook: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            notebook: notebook.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an admission rejection error
    pub fn admission(msg: impl Into<String>) -> Self {
        Self::Admission {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, admission, and serialization errors are not retryable
    /// (they require a spec or request change). Kubernetes errors depend
    /// on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout)
                // Don't retry on 4xx errors (validation, not found, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::Admission { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error is an optimistic-concurrency conflict (HTTP 409)
    ///
    /// Covers both update conflicts and AlreadyExists on create, which the
    /// API server reports with the same status code.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 409
        )
    }

    /// Get the notebook name if this error is associated with one
    pub fn notebook(&self) -> Option<&str> {
        match self {
            Error::Validation { notebook, .. } => Some(notebook),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
