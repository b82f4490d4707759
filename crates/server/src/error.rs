//! API error types.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use waveforge_storage::StorageError;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type. The closed set every handler returns; the wire layer
/// maps each variant to a status code and a machine-readable code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad identifier: {0}")]
    BadIdentifier(String),

    #[error("metadata conflict: {0}")]
    MetadataConflict(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("unknown chunk: index {index}")]
    UnknownChunk { index: u32 },

    #[error("offset mismatch: declared {declared}, actual {actual}")]
    OffsetMismatch { declared: u64, actual: u64 },

    #[error("payload too large: limit is {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("storage full")]
    StorageFull,

    #[error("assembly in progress")]
    AssemblyInProgress,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadIdentifier(_) => "bad_identifier",
            Self::MetadataConflict(_) => "metadata_conflict",
            Self::UnknownSession(_) => "unknown_session",
            Self::UnknownChunk { .. } => "unknown_chunk",
            Self::OffsetMismatch { .. } => "offset_mismatch",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::StorageFull => "storage_full",
            Self::AssemblyInProgress => "assembly_in_progress",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadIdentifier(_) => StatusCode::BAD_REQUEST,
            Self::MetadataConflict(_) => StatusCode::CONFLICT,
            Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::UnknownChunk { .. } => StatusCode::NOT_FOUND,
            Self::OffsetMismatch { .. } => StatusCode::CONFLICT,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::StorageFull => StatusCode::INSUFFICIENT_STORAGE,
            Self::AssemblyInProgress => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::OffsetMismatch { declared, actual } => {
                Self::OffsetMismatch { declared, actual }
            }
            StorageError::StorageFull => Self::StorageFull,
            StorageError::NotFound(what) => Self::NotFound(what),
            StorageError::InvalidKey(what) => Self::BadRequest(what),
            StorageError::InvalidRange(what) => Self::BadRequest(what),
            other => Self::Storage(other),
        }
    }
}

impl From<waveforge_core::Error> for ApiError {
    fn from(err: waveforge_core::Error) -> Self {
        use waveforge_core::Error as CoreError;
        match err {
            CoreError::InvalidSessionId(msg) => Self::BadIdentifier(msg),
            CoreError::MetadataConflict(msg) => Self::MetadataConflict(msg),
            CoreError::InvalidChunkIndex { index, .. } => Self::UnknownChunk { index },
            CoreError::InvalidMetadata(msg) => Self::BadRequest(msg),
            CoreError::InvalidTransition { from, to } => {
                Self::Conflict(format!("invalid assembly transition: {from} -> {to}"))
            }
            CoreError::Serialization(msg) => Self::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };

        // Offset mismatches carry the actual offset in the tus header so the
        // client can correct and retry without a separate probe.
        if let Self::OffsetMismatch { actual, .. } = &self {
            let mut response = (status, Json(body)).into_response();
            if let Ok(value) = HeaderValue::from_str(&actual.to_string()) {
                response.headers_mut().insert("Upload-Offset", value);
            }
            response
                .headers_mut()
                .insert("Tus-Resumable", HeaderValue::from_static("1.0.0"));
            response.headers_mut().insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static("no-store"),
            );
            return response;
        }

        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(
            ApiError::BadIdentifier(String::new()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::UnknownSession(String::new()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::OffsetMismatch { declared: 0, actual: 5 }.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::PayloadTooLarge { limit: 1 }.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::StorageFull.status_code(),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(
            ApiError::AssemblyInProgress.status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn storage_errors_map_to_wire_errors() {
        let err: ApiError = StorageError::OffsetMismatch { declared: 3, actual: 9 }.into();
        assert!(matches!(err, ApiError::OffsetMismatch { declared: 3, actual: 9 }));

        let err: ApiError = StorageError::StorageFull.into();
        assert!(matches!(err, ApiError::StorageFull));

        let err: ApiError = StorageError::NotFound("x".to_string()).into();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[test]
    fn offset_mismatch_response_carries_actual_offset() {
        let response =
            ApiError::OffsetMismatch { declared: 0, actual: 262144 }.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get("Upload-Offset").unwrap(),
            "262144"
        );
        assert_eq!(response.headers().get("Tus-Resumable").unwrap(), "1.0.0");
    }
}
