use crate::error::Error;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

/// HTTP face of [`Error`]: validation problems are the client's, the rest are ours.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Validation(_) => ApiError::BadRequest(e.to_string()),
            other => {
                error!(error = %other, "certificate request failed");
                ApiError::Internal("certificate generation failed".into())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Internal(msg)   => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}
