use rocket::http::Status;
use rocket::request::Request;
use rocket::response::{self, status::Custom, Responder};
use rocket::serde::json::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced to HTTP callers.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad input from the caller
    #[error("validation error: {0}")]
    Validation(String),
    /// The completion API or payment provider failed
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("payment required: {0}")]
    PaymentRequired(String),
    /// Webhook signature missing, malformed or stale
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    /// A dependency is not configured (missing API key or secret)
    #[error("not configured: {0}")]
    NotConfigured(&'static str),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> Status {
        match self {
            GatewayError::Validation(_) => Status::BadRequest,
            GatewayError::Upstream(_) => Status::BadGateway,
            GatewayError::PaymentRequired(_) => Status::PaymentRequired,
            GatewayError::InvalidSignature(_) => Status::BadRequest,
            GatewayError::NotConfigured(_) => Status::ServiceUnavailable,
            GatewayError::Internal(_) => Status::InternalServerError,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation_error",
            GatewayError::Upstream(_) => "upstream_error",
            GatewayError::PaymentRequired(_) => "payment_required",
            GatewayError::InvalidSignature(_) => "invalid_signature",
            GatewayError::NotConfigured(_) => "not_configured",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Map an internal `anyhow` failure from a dependency client.
    pub fn upstream(err: anyhow::Error) -> Self {
        GatewayError::Upstream(format!("{:#}", err))
    }

    pub fn internal(err: anyhow::Error) -> Self {
        GatewayError::Internal(format!("{:#}", err))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl<'r> Responder<'r, 'static> for GatewayError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        // Internal details stay in the logs.
        let message = match &self {
            GatewayError::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                "An internal error occurred".to_string()
            }
            GatewayError::Upstream(msg) => {
                tracing::error!("upstream error: {}", msg);
                self.to_string()
            }
            other => {
                tracing::warn!("request rejected: {}", other);
                other.to_string()
            }
        };

        Custom(
            self.status(),
            Json(ErrorBody {
                error: self.code(),
                message,
            }),
        )
        .respond_to(req)
    }
}
