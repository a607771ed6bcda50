use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Body of every error response, shaped like Django REST Framework errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub code: &'static str,
    pub detail: String,
}

/// Errors returned to administrative callers. The evaluation path never
/// produces one of these.
#[derive(Error, Debug)]
pub enum FlagError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Version conflict: expected version {expected}, current version is {actual}")]
    Conflict { expected: i64, actual: i64 },
    #[error("Flag inactive: {0}")]
    Inactive(String),
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlagError {
    /// Returns (error_code, status_code) for this error.
    fn error_metadata(&self) -> (&'static str, u16) {
        match self {
            FlagError::Validation(_) => ("validation_error", 400),
            FlagError::NotFound(_) => ("not_found", 404),
            FlagError::Conflict { .. } => ("version_conflict", 409),
            FlagError::Inactive(_) => ("flag_inactive", 409),
            FlagError::StoreUnavailable(_) => ("store_unavailable", 503),
            FlagError::Internal(_) => ("internal_error", 500),
        }
    }

    /// Short error code for logs and metrics.
    pub fn error_code(&self) -> &'static str {
        self.error_metadata().0
    }

    pub fn status_code(&self) -> u16 {
        self.error_metadata().1
    }

    pub fn is_5xx(&self) -> bool {
        self.status_code() >= 500
    }
}

impl From<StoreError> for FlagError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => FlagError::NotFound(what),
            StoreError::DuplicateKey(key) => {
                FlagError::Validation(format!("flag key {key} is already taken"))
            }
            StoreError::VersionConflict { expected, actual } => {
                FlagError::Conflict { expected, actual }
            }
            StoreError::Timeout | StoreError::Unavailable(_) => {
                FlagError::StoreUnavailable(err.to_string())
            }
            StoreError::Corrupt(_) | StoreError::Database(_) => {
                FlagError::Internal(err.to_string())
            }
        }
    }
}

impl From<JsonRejection> for FlagError {
    fn from(rejection: JsonRejection) -> Self {
        FlagError::Validation(format!("malformed request body: {}", rejection.body_text()))
    }
}

impl From<QueryRejection> for FlagError {
    fn from(rejection: QueryRejection) -> Self {
        FlagError::Validation(format!("malformed query string: {}", rejection.body_text()))
    }
}

impl IntoResponse for FlagError {
    fn into_response(self) -> Response {
        let (code, status) = self.error_metadata();
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let (error_type, detail) = match &self {
            FlagError::Validation(_) => ("validation_error", self.to_string()),
            FlagError::NotFound(_) | FlagError::Conflict { .. } | FlagError::Inactive(_) => {
                ("invalid_request", self.to_string())
            }
            FlagError::StoreUnavailable(msg) => {
                tracing::warn!("Store unavailable: {}", msg);
                (
                    "server_error",
                    "The flag store is currently unavailable. This is likely a temporary issue. Please try again later.".to_string(),
                )
            }
            FlagError::Internal(msg) => {
                tracing::error!("Internal server error: {}", msg);
                (
                    "server_error",
                    "An internal server error occurred. Please try again later or contact support if the problem persists.".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorResponse {
                error_type,
                code,
                detail,
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(FlagError::Validation("bad".to_string()), 400, "validation_error")]
    #[case(FlagError::NotFound("flag x".to_string()), 404, "not_found")]
    #[case(FlagError::Conflict { expected: 1, actual: 2 }, 409, "version_conflict")]
    #[case(FlagError::Inactive("flag x".to_string()), 409, "flag_inactive")]
    #[case(FlagError::StoreUnavailable("down".to_string()), 503, "store_unavailable")]
    #[case(FlagError::Internal("boom".to_string()), 500, "internal_error")]
    fn test_error_metadata(#[case] err: FlagError, #[case] status: u16, #[case] code: &str) {
        assert_eq!(err.status_code(), status);
        assert_eq!(err.error_code(), code);
        assert_eq!(err.into_response().status().as_u16(), status);
    }

    #[test]
    fn test_store_errors_map_to_admin_taxonomy() {
        assert!(matches!(
            FlagError::from(StoreError::DuplicateKey("f".to_string())),
            FlagError::Validation(_)
        ));
        assert!(matches!(
            FlagError::from(StoreError::VersionConflict {
                expected: 3,
                actual: 4
            }),
            FlagError::Conflict {
                expected: 3,
                actual: 4
            }
        ));
        assert!(matches!(
            FlagError::from(StoreError::Timeout),
            FlagError::StoreUnavailable(_)
        ));
        assert!(matches!(
            FlagError::from(StoreError::NotFound("override".to_string())),
            FlagError::NotFound(_)
        ));
    }

    #[test]
    fn test_is_5xx() {
        assert!(FlagError::StoreUnavailable("x".to_string()).is_5xx());
        assert!(!FlagError::Conflict {
            expected: 1,
            actual: 2
        }
        .is_5xx());
    }
}
