//! Request-level errors and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::{AuthError, LookupError, PoolError, RangeError, ReadError};

/// Everything that can stop a stream request before its status is sent.
///
/// Responses carry a short plain-text message. Upstream and internal details
/// only go to the log.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error(transparent)]
    Upstream(#[from] ReadError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl StreamError {
    pub fn status(&self) -> StatusCode {
        match self {
            StreamError::BadRequest(_) => StatusCode::BAD_REQUEST,
            StreamError::Auth(AuthError::Missing) => StatusCode::BAD_REQUEST,
            StreamError::Auth(AuthError::Mismatch) => StatusCode::UNAUTHORIZED,
            StreamError::Auth(AuthError::InvalidSecret) => StatusCode::INTERNAL_SERVER_ERROR,
            StreamError::Range(RangeError::Malformed(_)) => StatusCode::BAD_REQUEST,
            StreamError::Range(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            StreamError::Lookup(LookupError::NotFound(_)) => StatusCode::NOT_FOUND,
            StreamError::Lookup(LookupError::Failed(_)) => StatusCode::BAD_GATEWAY,
            StreamError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StreamError::Pool(PoolError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
            StreamError::Pool(PoolError::Empty) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            StreamError::BadRequest(msg) => msg,
            StreamError::Auth(e) => match e {
                AuthError::InvalidSecret => {
                    tracing::error!("auth misconfigured: {}", e);
                    "internal error".to_string()
                }
                e => e.to_string(),
            },
            StreamError::Range(e) => return e.into_response(),
            StreamError::Lookup(e) => match e {
                LookupError::NotFound(_) => "file not found".to_string(),
                LookupError::Failed(msg) => {
                    tracing::error!("lookup failed: {}", msg);
                    "lookup failed".to_string()
                }
            },
            StreamError::Upstream(e) => {
                tracing::error!("upstream failure: {}", e);
                "upstream fetch failed".to_string()
            }
            StreamError::Pool(e) => {
                tracing::warn!("session pool: {}", e);
                "service unavailable".to_string()
            }
        };

        (status, message).into_response()
    }
}
