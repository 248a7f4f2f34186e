//! HTTP error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use proxy_engine::EngineError;
use proxy_types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: &'static str, reason: String },

    #[error("invalid path parameter: {0}")]
    InvalidParam(String),

    #[error("metrics encoding failed: {0}")]
    Metrics(String),

    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// HTTP status for each caller-visible error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::BadSignature => StatusCode::UNAUTHORIZED,
        ErrorKind::ClockSkew => StatusCode::BAD_REQUEST,
        ErrorKind::UnknownNode | ErrorKind::UnknownTask => StatusCode::NOT_FOUND,
        ErrorKind::IllegalStateTransition | ErrorKind::AlreadyTerminal | ErrorKind::Stale => {
            StatusCode::CONFLICT
        }
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::NotEligible => StatusCode::FORBIDDEN,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::InternalInvariantViolated => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl RpcError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Engine(e) => status_for(e.kind()),
            Self::MissingHeader(_) | Self::InvalidHeader { .. } | Self::InvalidParam(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Metrics(_) | Self::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Engine(e) => e.kind().as_str(),
            Self::MissingHeader(_) | Self::InvalidHeader { .. } | Self::InvalidParam(_) => {
                "BadRequest"
            }
            Self::Metrics(_) | Self::Server(_) => "Internal",
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, %status, "request failed");
        } else {
            tracing::debug!(error = %self, %status, "request rejected");
        }
        let body = ErrorBody {
            error: self.label().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
