//! Error types for stevedore

use thiserror::Error;

use crate::client::StoreError;

/// Errors that abort a run.
///
/// Per-resource create failures and per-patch reapply failures are not
/// errors at this level; they are recorded in the run state and the run
/// continues. Only batch-fatal conditions, startup failures, cancellation,
/// and genuinely unexpected problems surface as `UploadError`.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Batch document error: {0}")]
    Batch(String),

    #[error("Resource '{resource}' references unknown local id '{target}' via property '{property}'")]
    DanglingReference {
        resource: String,
        property: String,
        target: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
