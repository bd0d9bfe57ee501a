use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::auth::AuthError;
use crate::proxy::ControllerError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("proxy controller: {0}")]
    Controller(#[from] ControllerError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("certificate signing failed: {0}")]
    Signing(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<&Error> for StatusCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::Auth(AuthError::Forbidden) => StatusCode::FORBIDDEN,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for StatusCode {
    fn from(err: Error) -> Self {
        StatusCode::from(&err)
    }
}

/// Clients only ever see the coarse category; the detail goes to the log.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = StatusCode::from(&self);
        let body = match &self {
            Error::Auth(AuthError::Forbidden) => "Forbidden".to_string(),
            Error::Auth(_) => "Unauthorized".to_string(),
            Error::InvalidRequest(msg) => msg.clone(),
            other => {
                log::error!("request failed: {}", other);
                "Internal Server Error".to_string()
            }
        };
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
