use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use warden_core::WardenError;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<String>,
}

pub const fn http_status(err: &WardenError) -> StatusCode {
    match err {
        WardenError::Validation(_) => StatusCode::BAD_REQUEST,
        WardenError::Forbidden(_) => StatusCode::FORBIDDEN,
        WardenError::NotFound(_) => StatusCode::NOT_FOUND,
        WardenError::PreconditionFailed { .. } => StatusCode::PRECONDITION_FAILED,
        WardenError::SignerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        WardenError::SignerRejected(_) => StatusCode::BAD_GATEWAY,
        WardenError::IdempotencyConflict(_)
        | WardenError::Conflict(_)
        | WardenError::TamperDetected { .. } => StatusCode::CONFLICT,
        WardenError::Storage(_) | WardenError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Storage and internal details stay in the logs.
pub fn public_body(err: &WardenError) -> PublicErrorBody {
    let message = match err {
        WardenError::Storage(_) | WardenError::Internal(_) => "internal error".to_string(),
        WardenError::SignerUnavailable(_) => "signer unavailable".to_string(),
        other => other.to_string(),
    };
    let current_status = match err {
        WardenError::PreconditionFailed { current, .. } => Some(current.clone()),
        _ => None,
    };
    PublicErrorBody {
        code: err.code(),
        message,
        current_status,
    }
}

#[derive(Debug)]
pub struct ApiError(pub WardenError);

impl From<WardenError> for ApiError {
    fn from(err: WardenError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = http_status(&self.0);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "request failed");
        } else {
            tracing::debug!(code = self.0.code(), error = %self.0, "request rejected");
        }
        (status, Json(public_body(&self.0))).into_response()
    }
}
