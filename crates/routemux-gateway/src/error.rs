//! Error-to-response mapping for the REST surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use routemux_core::RoutingError;
use serde::Serialize;

/// Wire shape of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub name: String,
    pub message: String,
}

/// A routing error leaving through HTTP.
#[derive(Debug)]
pub struct ApiError(pub RoutingError);

impl From<RoutingError> for ApiError {
    fn from(err: RoutingError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            RoutingError::Invalid(_) | RoutingError::InvalidFamily(_) => StatusCode::BAD_REQUEST,
            RoutingError::NotFound(_) => StatusCode::NOT_FOUND,
            RoutingError::Conflict(_) | RoutingError::InUse(_) => StatusCode::CONFLICT,
            RoutingError::RefIntegrity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RoutingError::Backend(_) | RoutingError::Overflow | RoutingError::Closed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            name: self.0.name().to_string(),
            message: self.0.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
