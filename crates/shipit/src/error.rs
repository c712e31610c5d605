use std::time::Duration;

use serde::Serialize;
use shipit_store::StoreError;
use shipit_types::EntityKind;
use thiserror::Error;

/// One rejected field of an incoming tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Location in the tree, e.g. `environments[0].containers[1].image`
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Terminal failure of a reconciliation or read.
///
/// Whatever the variant, a failed reconciliation has left storage exactly as
/// it found it.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("validation failed: {}", join(errors))]
    Validation { errors: Vec<FieldError> },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{kind} `{name}` not found")]
    NotFound { kind: EntityKind, name: String },

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("transaction timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),

    #[error("field codec failed: {message}")]
    Codec { message: String },
}

fn join(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ReconcileError {
    pub fn validation(errors: Vec<FieldError>) -> Self {
        ReconcileError::Validation { errors }
    }

    pub fn not_found(kind: EntityKind, name: impl Into<String>) -> Self {
        ReconcileError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub(crate) fn codec(err: anyhow::Error) -> Self {
        ReconcileError::Codec {
            message: format!("{err:#}"),
        }
    }

    /// HTTP status the router answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            ReconcileError::Validation { .. } | ReconcileError::Conflict(_) => 422,
            ReconcileError::NotFound { .. } => 404,
            ReconcileError::Transaction(_)
            | ReconcileError::Timeout(_)
            | ReconcileError::Codec { .. } => 500,
        }
    }

    /// Message safe to show an unauthenticated caller.
    pub fn public_message(&self) -> String {
        match self {
            ReconcileError::Transaction(_) | ReconcileError::Timeout(_) => {
                "reconciliation aborted; nothing was changed".to_string()
            }
            ReconcileError::Codec { .. } => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    /// Field errors carried by a validation failure.
    pub fn field_errors(&self) -> &[FieldError] {
        match self {
            ReconcileError::Validation { errors } => errors,
            _ => &[],
        }
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation { .. } => ReconcileError::Conflict(err.to_string()),
            other => ReconcileError::Transaction(other.to_string()),
        }
    }
}
