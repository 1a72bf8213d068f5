use thiserror::Error;

use crate::store::StoreError;

/// Why a caller was refused a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionReason {
    /// The record belongs to someone else.
    WrongOwner { owner: Option<String> },
    /// The caller owns the record but the store still refused the write.
    InsufficientRights,
}

impl std::fmt::Display for PermissionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionReason::WrongOwner { owner: Some(owner) } => {
                write!(f, "record belongs to a different user ({owner})")
            }
            PermissionReason::WrongOwner { owner: None } => {
                write!(f, "record has no owner on file")
            }
            PermissionReason::InsufficientRights => {
                write!(f, "insufficient rights to modify this record")
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum RecordsError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied on {id}: {reason}")]
    PermissionDenied { id: String, reason: PermissionReason },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Render failed: {0}")]
    RenderFailure(String),

    #[error("Upload failed: {0}")]
    UploadFailure(String),

    #[error("Operation already in progress for {0}")]
    AlreadyInFlight(String),

    #[error("Record {0} still exists after deletion")]
    DeleteNotApplied(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

impl RecordsError {
    /// Whether the same call may succeed if simply repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RecordsError::Unavailable(_)
                | RecordsError::FailedPrecondition(_)
                | RecordsError::RenderFailure(_)
                | RecordsError::UploadFailure(_)
        )
    }
}

impl From<StoreError> for RecordsError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => RecordsError::NotFound(what),
            StoreError::PermissionDenied(what) => RecordsError::PermissionDenied {
                id: what,
                reason: PermissionReason::InsufficientRights,
            },
            StoreError::Unavailable(msg) => RecordsError::Unavailable(msg),
            StoreError::FailedPrecondition(msg) => RecordsError::FailedPrecondition(msg),
            StoreError::Other(msg) => RecordsError::Other(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, RecordsError>;
