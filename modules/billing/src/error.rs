use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::models::ErrorResponse;
use crate::whop::error::WhopError;

/// Error taxonomy for the billing engines.
///
/// Validation and NotFound are caller-facing and never leave partial state
/// behind. Provider errors are transient by nature and carry the provider's
/// payload so callers can retry with backoff. Invariant violations should be
/// impossible by construction and are logged loudly when detected.
/// Idempotency short-circuits (redelivered webhooks, payout already in
/// flight) are NOT errors; they are outcome variants on the engine methods.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment provider error: {0}")]
    Provider(#[from] WhopError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invariant violation: {0}")]
    Invariant(String),
}

pub type BillingResult<T> = Result<T, BillingError>;

impl BillingError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BillingError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BillingError::NotFound(_) => StatusCode::NOT_FOUND,
            BillingError::Provider(_) => StatusCode::BAD_GATEWAY,
            BillingError::Database(_) | BillingError::Invariant(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BillingError::Validation(_) => "validation_error",
            BillingError::NotFound(_) => "not_found",
            BillingError::Provider(_) => "provider_error",
            BillingError::Database(_) => "database_error",
            BillingError::Invariant(_) => "invariant_violation",
        }
    }

    /// Whether a caller may reasonably retry the same request. Validation
    /// failures will fail again; provider/network failures may clear up.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Provider(e) => e.is_retryable(),
            BillingError::Database(_) => true,
            _ => false,
        }
    }
}

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        match &self {
            BillingError::Invariant(msg) => {
                tracing::error!(error = %msg, "Invariant violation surfaced to handler");
            }
            BillingError::Database(e) => {
                tracing::error!(error = %e, "Database error surfaced to handler");
            }
            _ => {}
        }

        let details = match &self {
            // Attach the provider's error payload so callers can distinguish
            // declines from outages.
            BillingError::Provider(WhopError::ApiError { status_code, message }) => {
                Some(serde_json::json!({
                    "provider_status": status_code,
                    "provider_message": message,
                }))
            }
            _ => None,
        };

        let mut body = ErrorResponse::new(self.code(), self.to_string());
        body.details = details;

        (self.status_code(), Json(body)).into_response()
    }
}
