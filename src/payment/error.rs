//! Payment Error Types

use thiserror::Error;

use crate::providers::ProviderError;
use crate::saga::SagaError;

/// Payment error types
///
/// Validation errors are precise; provider failures are recorded internally
/// and surface to callers only as `PaymentCreationFailed`.
#[derive(Error, Debug, Clone)]
pub enum PaymentError {
    // === Validation Errors ===
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Payment amount does not match order amount: {amount} vs {expected}")]
    AmountMismatch {
        amount: rust_decimal::Decimal,
        expected: rust_decimal::Decimal,
    },

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Refund amount cannot exceed payment amount")]
    RefundAmountExceeded,

    #[error("Unsupported payment method: {0}")]
    UnsupportedMethod(String),

    // === Webhook Errors ===
    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Malformed notification")]
    InvalidNotification,

    // === Provider Errors ===
    /// Generic, stable message returned for any dispatch failure
    #[error("Payment creation failed")]
    PaymentCreationFailed,

    /// Internal only. Never returned from `create_payment`.
    #[error("Provider error: {0}")]
    Provider(String),

    // === System Errors ===
    #[error("Saga submission failed: {0}")]
    Saga(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl PaymentError {
    pub fn payment_not_found(id: impl ToString) -> Self {
        PaymentError::NotFound {
            entity: "Payment",
            id: id.to_string(),
        }
    }

    pub fn order_not_found(id: impl ToString) -> Self {
        PaymentError::NotFound {
            entity: "Order",
            id: id.to_string(),
        }
    }

    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            PaymentError::NotFound { .. } => "NOT_FOUND",
            PaymentError::InvalidState(_) => "INVALID_STATE",
            PaymentError::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            PaymentError::InvalidAmount => "INVALID_AMOUNT",
            PaymentError::RefundAmountExceeded => "REFUND_AMOUNT_EXCEEDED",
            PaymentError::UnsupportedMethod(_) => "UNSUPPORTED_METHOD",
            PaymentError::SignatureInvalid => "SIGNATURE_INVALID",
            PaymentError::InvalidNotification => "INVALID_NOTIFICATION",
            PaymentError::PaymentCreationFailed => "PAYMENT_CREATION_FAILED",
            PaymentError::Provider(_) => "PROVIDER_ERROR",
            PaymentError::Saga(_) => "SAGA_ERROR",
            PaymentError::DatabaseError(_) => "DATABASE_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            PaymentError::InvalidState(_)
            | PaymentError::AmountMismatch { .. }
            | PaymentError::InvalidAmount
            | PaymentError::RefundAmountExceeded
            | PaymentError::UnsupportedMethod(_)
            | PaymentError::SignatureInvalid
            | PaymentError::InvalidNotification => 400,
            PaymentError::NotFound { .. } => 404,
            PaymentError::Provider(_) => 502,
            PaymentError::PaymentCreationFailed
            | PaymentError::Saga(_)
            | PaymentError::DatabaseError(_) => 500,
        }
    }

    /// Validation errors are reported to callers verbatim
    #[inline]
    pub fn is_validation(&self) -> bool {
        self.http_status() < 500
    }
}

impl From<sqlx::Error> for PaymentError {
    fn from(e: sqlx::Error) -> Self {
        PaymentError::DatabaseError(e.to_string())
    }
}

impl From<SagaError> for PaymentError {
    fn from(e: SagaError) -> Self {
        match e {
            SagaError::AlreadyRunning(key) => {
                PaymentError::InvalidState(format!("A refund is already in progress for {key}"))
            }
            other => PaymentError::Saga(other.to_string()),
        }
    }
}

impl From<ProviderError> for PaymentError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Unsupported(m) => PaymentError::UnsupportedMethod(m),
            other => PaymentError::Provider(other.to_string()),
        }
    }
}
