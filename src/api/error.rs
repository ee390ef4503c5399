use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use crate::validation::ValidationError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("No {doc_type} document with id {id}")]
    NotFound { doc_type: String, id: String },

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Indexing failed: {0}")]
    Indexing(String),

    #[error("Invalid Ethereum address: {0}")]
    InvalidAddress(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::Store(_) | ApiError::Indexing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Errors are rendered as a JSON:API `errors` array with a single entry
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            ApiError::Store(e) => {
                error!("Store error while serving request: {}", e);
                "Store error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "errors": [{
                "status": status.as_u16().to_string(),
                "title": status.canonical_reason().unwrap_or_default(),
                "detail": detail,
            }]
        }));

        (status, body).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::InvalidEthereumAddress(address) => ApiError::InvalidAddress(address),
            ValidationError::MissingParameter(param) => ApiError::BadRequest(format!("missing {}", param)),
            ValidationError::InvalidParameter(msg) => ApiError::BadRequest(msg),
        }
    }
}
