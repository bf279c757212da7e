use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use job_common::cache::CacheError;
use job_common::job::ValidationError;
use job_common::kafka::producer::ProduceError;
use job_common::storage::StorageError;
use job_common::store::StoreError;

/// Every failure a request can surface. The `IntoResponse` impl maps each
/// variant to a status code and a `{"error": "<message>"}` body.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("failed to parse request: {0}")]
    RequestParsingError(String),
    #[error("job name cannot be empty")]
    EmptyJobName,
    #[error("{0} is not a registered job type")]
    UnknownJobType(String),
    #[error("job id must be an integer")]
    InvalidJobId,
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("missing or malformed authorization header")]
    MissingToken,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("job {0} does not exist")]
    JobNotFound(i64),

    #[error("a database error occurred: {0}")]
    Store(String),
    #[error("a cache error occurred: {0}")]
    Cache(String),
    #[error("failed to publish job message: {0}")]
    Publish(String),
    #[error("failed to stage document: {0}")]
    Staging(String),
    #[error("failed to sign token: {0}")]
    TokenSigning(String),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => ApiError::JobNotFound(id),
            other => ApiError::Store(other.to_string()),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(error: CacheError) -> Self {
        ApiError::Cache(error.to_string())
    }
}

impl From<ProduceError> for ApiError {
    fn from(error: ProduceError) -> Self {
        ApiError::Publish(error.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        ApiError::Staging(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::RequestParsingError(_)
            | ApiError::EmptyJobName
            | ApiError::UnknownJobType(_)
            | ApiError::InvalidJobId
            | ApiError::Validation(_) => StatusCode::BAD_REQUEST,

            ApiError::MissingToken | ApiError::InvalidToken | ApiError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }

            ApiError::JobNotFound(_) => StatusCode::NOT_FOUND,

            ApiError::Store(_)
            | ApiError::Cache(_)
            | ApiError::Publish(_)
            | ApiError::Staging(_)
            | ApiError::TokenSigning(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_keep_their_literal_message() {
        let err = ApiError::from(ValidationError::PdfTooLarge);
        assert_eq!(
            err.to_string(),
            "PDF size exceeds maximum allowed size of 10MB"
        );
    }

    #[tokio::test]
    async fn responses_carry_the_error_shape() {
        use http_body_util::BodyExt;

        let response = ApiError::EmptyJobName.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "job name cannot be empty");
    }
}
