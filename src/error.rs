use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::manifest::ManifestError;
use crate::repo::RepoError;
use crate::storage::StorageError;

/// Every failure the SCORM subsystem surfaces to its callers.
#[derive(Debug, thiserror::Error)]
pub enum ScormError {
    // --- input validation ---
    #[error("archive is not a readable zip: {0}")]
    ArchiveInvalid(String),
    #[error("archive exceeds the {limit} byte ceiling ({actual} bytes)")]
    ArchiveTooLarge { limit: u64, actual: u64 },
    #[error("imsmanifest.xml not found at the package root")]
    ManifestMissing,
    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),
    #[error("unsupported manifest schema version '{0}'")]
    ManifestUnsupportedVersion(String),
    #[error("manifest declares no launchable items")]
    ManifestEmpty,
    #[error("suspend data is {actual} bytes, limit is {limit}")]
    SuspendDataTooLarge { limit: usize, actual: usize },
    #[error("invalid request: {0}")]
    BadRequest(String),

    // --- authorization ---
    #[error("access denied")]
    AccessDenied,

    // --- not found ---
    #[error("content object {0} not found")]
    ContentObjectNotFound(Uuid),
    #[error("package {0} not found")]
    PackageNotFound(Uuid),
    #[error("content file '{0}' is missing from storage")]
    ContentMissing(String),

    // --- infrastructure ---
    #[error("ingestion exceeded the {0}s time limit")]
    IngestionTimeout(u64),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("repository error: {0}")]
    Repository(#[from] RepoError),
}

pub type ScormResult<T> = Result<T, ScormError>;

impl From<ManifestError> for ScormError {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::Invalid(msg) => ScormError::ManifestInvalid(msg),
            ManifestError::UnsupportedVersion(v) => ScormError::ManifestUnsupportedVersion(v),
            ManifestError::Empty => ScormError::ManifestEmpty,
        }
    }
}

/// Body returned by every endpoint on failure.
#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl ScormError {
    pub fn code(&self) -> &'static str {
        match self {
            ScormError::ArchiveInvalid(_) => "ARCHIVE_INVALID",
            ScormError::ArchiveTooLarge { .. } => "ARCHIVE_TOO_LARGE",
            ScormError::ManifestMissing => "MANIFEST_MISSING",
            ScormError::ManifestInvalid(_) => "MANIFEST_INVALID",
            ScormError::ManifestUnsupportedVersion(_) => "MANIFEST_UNSUPPORTED_VERSION",
            ScormError::ManifestEmpty => "MANIFEST_EMPTY",
            ScormError::SuspendDataTooLarge { .. } => "SUSPEND_DATA_TOO_LARGE",
            ScormError::BadRequest(_) => "VALIDATION_ERROR",
            ScormError::AccessDenied => "ACCESS_DENIED",
            ScormError::ContentObjectNotFound(_) => "CONTENT_OBJECT_NOT_FOUND",
            ScormError::PackageNotFound(_) => "PACKAGE_NOT_FOUND",
            ScormError::ContentMissing(_) => "CONTENT_MISSING",
            ScormError::IngestionTimeout(_) => "INGESTION_TIMEOUT",
            ScormError::Storage(_) | ScormError::Repository(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ScormError::ArchiveTooLarge { .. } | ScormError::SuspendDataTooLarge { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            ScormError::ArchiveInvalid(_)
            | ScormError::ManifestMissing
            | ScormError::ManifestInvalid(_)
            | ScormError::ManifestUnsupportedVersion(_)
            | ScormError::ManifestEmpty
            | ScormError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ScormError::AccessDenied => StatusCode::FORBIDDEN,
            ScormError::ContentObjectNotFound(_)
            | ScormError::PackageNotFound(_)
            | ScormError::ContentMissing(_) => StatusCode::NOT_FOUND,
            ScormError::IngestionTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            ScormError::Storage(_) | ScormError::Repository(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ScormError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "internal error");
        }
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
