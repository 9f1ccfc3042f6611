//! API Request/Response types and error codes
//!
//! - `ApiResponse<T>`: Unified response wrapper
//! - `ApiError`: `PaymentError` mapped to status + numeric code
//! - `error_codes`: Standard error code constants
//! - Request DTOs, validated with `validator`

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::payment::PaymentError;

// ============================================================================
// Unified API Response Format
// ============================================================================

/// Unified API response wrapper
///
/// - code: 0 = success, non-zero = error code
/// - msg: short message description
/// - data: actual data (success) or null (error)
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    /// Response code: 0 for success, non-zero for errors
    #[schema(example = 0)]
    pub code: i32,
    /// Response message
    #[schema(example = "ok")]
    pub msg: String,
    /// Response data (only present when code == 0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

// ============================================================================
// Error Codes
// ============================================================================

pub mod error_codes {
    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;
    pub const INVALID_STATE: i32 = 1002;
    pub const AMOUNT_MISMATCH: i32 = 1003;
    pub const INVALID_AMOUNT: i32 = 1004;
    pub const REFUND_AMOUNT_EXCEEDED: i32 = 1005;
    pub const UNSUPPORTED_METHOD: i32 = 1006;

    // Webhook errors (2xxx)
    pub const SIGNATURE_INVALID: i32 = 2001;
    pub const INVALID_NOTIFICATION: i32 = 2002;

    // Resource errors (4xxx)
    pub const NOT_FOUND: i32 = 4001;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const PAYMENT_CREATION_FAILED: i32 = 5001;
    pub const PROVIDER_ERROR: i32 = 5002;
}

// ============================================================================
// ApiError
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub msg: String,
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[inline]
pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            msg: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_PARAMETER, msg)
    }
}

impl From<PaymentError> for ApiError {
    fn from(e: PaymentError) -> Self {
        let status =
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let code = match e.code() {
            "NOT_FOUND" => error_codes::NOT_FOUND,
            "INVALID_STATE" => error_codes::INVALID_STATE,
            "AMOUNT_MISMATCH" => error_codes::AMOUNT_MISMATCH,
            "INVALID_AMOUNT" => error_codes::INVALID_AMOUNT,
            "REFUND_AMOUNT_EXCEEDED" => error_codes::REFUND_AMOUNT_EXCEEDED,
            "UNSUPPORTED_METHOD" => error_codes::UNSUPPORTED_METHOD,
            "SIGNATURE_INVALID" => error_codes::SIGNATURE_INVALID,
            "INVALID_NOTIFICATION" => error_codes::INVALID_NOTIFICATION,
            "PAYMENT_CREATION_FAILED" => error_codes::PAYMENT_CREATION_FAILED,
            "PROVIDER_ERROR" => error_codes::PROVIDER_ERROR,
            _ => error_codes::INTERNAL_ERROR,
        };
        // Internal details stay in the logs
        let msg = if e.is_validation() || matches!(e, PaymentError::PaymentCreationFailed) {
            e.to_string()
        } else {
            tracing::error!(error = %e, "Request failed");
            "Internal server error".to_string()
        };
        Self::new(status, code, msg)
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(e: validator::ValidationErrors) -> Self {
        Self::bad_request(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::error(self.code, self.msg))).into_response()
    }
}

// ============================================================================
// Request DTOs
// ============================================================================

/// POST /api/billing/payments
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentBody {
    #[validate(length(min = 1, max = 64))]
    #[schema(example = "order-123")]
    pub order_id: String,
    /// wechat | alipay | balance | stripe | paypal | paddle
    #[validate(length(min = 1, max = 16))]
    #[schema(example = "wechat")]
    pub method: String,
    #[schema(value_type = String, example = "99.99")]
    pub amount: Decimal,
}

/// POST /api/billing/payments/{id}/refund
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefundBody {
    #[schema(value_type = String, example = "99.99")]
    pub amount: Decimal,
    #[validate(length(min = 1, max = 255))]
    #[schema(example = "Customer request")]
    pub reason: String,
}

/// GET /api/billing/payments
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub user_id: Option<String>,
}

/// Stripe / PayPal / Paddle webhook ack
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// WeChat Pay webhook ack
#[derive(Debug, Serialize, ToSchema)]
pub struct WechatAck {
    #[schema(example = "SUCCESS")]
    pub code: String,
    #[schema(example = "OK")]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_payment_error_mapping() {
        let e: ApiError = PaymentError::RefundAmountExceeded.into();
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        assert_eq!(e.code, error_codes::REFUND_AMOUNT_EXCEEDED);

        let e: ApiError = PaymentError::payment_not_found("p1").into();
        assert_eq!(e.status, StatusCode::NOT_FOUND);
        assert_eq!(e.msg, "Payment not found: p1");
    }

    #[test]
    fn test_internal_errors_are_generic() {
        let e: ApiError = PaymentError::DatabaseError("connection refused on 10.0.0.3".into()).into();
        assert_eq!(e.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(e.msg, "Internal server error");

        let e: ApiError = PaymentError::PaymentCreationFailed.into();
        assert_eq!(e.code, error_codes::PAYMENT_CREATION_FAILED);
        assert_eq!(e.msg, "Payment creation failed");
    }

    #[test]
    fn test_create_body_validation() {
        let body: CreatePaymentBody =
            serde_json::from_str(r#"{"orderId":"order-1","method":"wechat","amount":"99.99"}"#).unwrap();
        assert!(body.validate().is_ok());
        assert_eq!(body.amount, dec!(99.99));

        let body: CreatePaymentBody =
            serde_json::from_str(r#"{"orderId":"","method":"wechat","amount":99.99}"#).unwrap();
        assert!(body.validate().is_err());
    }

    #[test]
    fn test_error_envelope() {
        let json = serde_json::to_value(ApiResponse::<()>::error(1001, "bad")).unwrap();
        assert_eq!(json, serde_json::json!({"code": 1001, "msg": "bad"}));
    }
}
