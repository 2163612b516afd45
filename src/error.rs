use serde::Serialize;
use thiserror::Error;

use crate::query::RewriteError;
use crate::reconcile::ReconcileError;

/// Errors surfaced by the store, the reconciler and the ingestion pipeline.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Missing setting, malformed payload or bad argument. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    /// A transient failure that was not eligible for another attempt.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The reconnect budget ran out.
    #[error("backend unavailable after {attempts} reconnect attempt(s): {message}")]
    Unavailable { attempts: u32, message: String },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unexpected shape for '{field}': expected {expected}")]
    UnexpectedShape {
        field: String,
        expected: &'static str,
    },

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("ingestion queue is full ({0} pending)")]
    Overloaded(usize),

    #[error("ingestion pipeline is shut down")]
    Closed,
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

impl StoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }

    pub fn unexpected_shape(field: impl Into<String>, expected: &'static str) -> Self {
        StoreError::UnexpectedShape {
            field: field.into(),
            expected,
        }
    }

    /// HTTP-style status code for the structured error body.
    pub fn status_code(&self) -> u16 {
        match self {
            StoreError::Validation(_) | StoreError::Rewrite(_) | StoreError::Serialization(_) => {
                400
            }
            StoreError::NotFound(_) => 404,
            StoreError::Transient(_)
            | StoreError::Unavailable { .. }
            | StoreError::Overloaded(_)
            | StoreError::Closed => 503,
            StoreError::Backend(_) | StoreError::UnexpectedShape { .. } | StoreError::Reconcile(_) => {
                500
            }
        }
    }
}

/// Structured error body handed to the HTTP layer.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&StoreError> for ErrorBody {
    fn from(err: &StoreError) -> Self {
        let code = err.status_code();
        // Backend internals stay out of the headline message.
        let (error, details) = match err {
            StoreError::Backend(msg) => ("Internal backend error".to_string(), Some(msg.clone())),
            other => (other.to_string(), None),
        };
        ErrorBody {
            code,
            error,
            details,
        }
    }
}
