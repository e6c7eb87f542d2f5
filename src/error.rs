//! Errors surfaced to API clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::upnp::UpnpError;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// The remote device or host could not be reached or refused the action
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ControlError {
    pub fn page_not_found() -> Self {
        ControlError::NotFound("page not found".to_string())
    }

    pub fn missing_param(name: &str) -> Self {
        ControlError::BadRequest(format!("missing parameter '{}'", name))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::Conflict(_) => StatusCode::CONFLICT,
            ControlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `{"errors":[{"status":N,"message":"..."}]}`
    pub fn body(&self) -> serde_json::Value {
        json!({
            "errors": [{
                "status": self.status().as_u16(),
                "message": self.to_string(),
            }]
        })
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

impl From<UpnpError> for ControlError {
    fn from(e: UpnpError) -> Self {
        match e {
            UpnpError::Parse(_) => ControlError::Internal(e.to_string()),
            UpnpError::Transport(_)
            | UpnpError::Status(_)
            | UpnpError::MissingHeader(_)
            | UpnpError::MissingService(_) => ControlError::Unavailable(e.to_string()),
        }
    }
}
