use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use mtf_data::DataError;
use serde_json::json;
use thiserror::Error;

/// All errors returned by the HTTP surface.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Data(#[from] DataError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Data(DataError::InvalidTimeframe(_) | DataError::Decode { .. }) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Data(DataError::OutOfOrder { .. } | DataError::StaleBucket { .. }) => {
                StatusCode::CONFLICT
            }
            ApiError::Data(DataError::DataUnavailable(_)) => StatusCode::NOT_FOUND,
            ApiError::Data(DataError::Switch { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
