use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Reconciliation error: {0}")]
    Reconciliation(#[from] ReconciliationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

/// Domain failures raised by the reconciliation path.
///
/// Every one of these is returned before anything is written, so callers can
/// rely on a failed operation having no side effects.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReconciliationError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid amount {0}: must be greater than zero")]
    InvalidAmount(Decimal),

    #[error("Payment of {amount} exceeds remaining balance of {remaining}")]
    OverpaymentRejected { amount: Decimal, remaining: Decimal },

    #[error("Settlement locked: {0}")]
    LockedSettlement(String),

    #[error("A non-empty reason is required for this change")]
    MissingReason,
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::Reconciliation(ReconciliationError::NotFound(what)) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::Reconciliation(ReconciliationError::InvalidAmount(amount)) => (
                StatusCode::BAD_REQUEST,
                "INVALID_AMOUNT",
                "Payment amount must be greater than zero".to_string(),
                Some(serde_json::json!({ "amount": amount.to_string() })),
            ),
            AppError::Reconciliation(ReconciliationError::OverpaymentRejected { amount, remaining }) => (
                StatusCode::CONFLICT,
                "OVERPAYMENT_REJECTED",
                format!(
                    "Payment of {} exceeds the remaining balance of {}",
                    amount, remaining
                ),
                Some(serde_json::json!({
                    "amount": amount.to_string(),
                    "remaining_balance": remaining.to_string(),
                })),
            ),
            AppError::Reconciliation(ReconciliationError::LockedSettlement(message)) => (
                StatusCode::CONFLICT,
                "LOCKED_SETTLEMENT",
                message,
                None,
            ),
            AppError::Reconciliation(ReconciliationError::MissingReason) => (
                StatusCode::BAD_REQUEST,
                "MISSING_REASON",
                "A reason is required for this change".to_string(),
                None,
            ),
            AppError::InvalidInput(message) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                message,
                None,
            ),
            AppError::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHORIZED",
                message,
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("Invalid JSON: {}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_for_reconciliation_errors() {
        let cases = vec![
            (ReconciliationError::NotFound("sale".into()), StatusCode::NOT_FOUND),
            (ReconciliationError::InvalidAmount(Decimal::ZERO), StatusCode::BAD_REQUEST),
            (
                ReconciliationError::OverpaymentRejected {
                    amount: Decimal::from(10),
                    remaining: Decimal::from(5),
                },
                StatusCode::CONFLICT,
            ),
            (ReconciliationError::LockedSettlement("locked".into()), StatusCode::CONFLICT),
            (ReconciliationError::MissingReason, StatusCode::BAD_REQUEST),
        ];

        for (error, expected) in cases {
            let response = AppError::from(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn test_internal_errors_are_not_leaked() {
        let response = AppError::Internal("journal mismatch".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
