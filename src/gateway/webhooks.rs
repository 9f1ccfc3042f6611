//! Gateway notification endpoint
//!
//! Each provider expects its own acknowledgement body. WeChat Pay and Alipay
//! always get HTTP 200 and read the verdict from the body; they retry on
//! anything other than a success marker.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use super::state::AppState;
use super::types::{WebhookAck, WechatAck};
use crate::payment::{PaymentError, PaymentMethod, ReconcileOutcome};
use crate::providers::WebhookHeaders;

const ALIPAY_SUCCESS: &str = "success";
const ALIPAY_FAIL: &str = "fail";

/// Receive an asynchronous payment notification
///
/// POST /api/billing/payments/notify/{method}
#[utoipa::path(
    post,
    path = "/api/billing/payments/notify/{method}",
    params(("method" = String, Path, description = "wechat | alipay | stripe | paypal | paddle")),
    request_body(content = String, description = "Raw provider payload", content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Notification accepted (WeChat/Alipay carry the verdict in the body)"),
        (status = 400, description = "Rejected notification (Stripe/PayPal/Paddle)")
    ),
    tag = "Webhooks"
)]
pub async fn handle_notify(
    State(state): State<Arc<AppState>>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let method = match method.parse::<PaymentMethod>() {
        Ok(m) if m != PaymentMethod::Balance => m,
        _ => {
            warn!(method = %method, "Webhook for unknown method");
            return (
                StatusCode::NOT_FOUND,
                Json(WebhookAck {
                    received: false,
                    error: Some(format!("Unsupported payment method: {}", method)),
                }),
            )
                .into_response();
        }
    };

    let headers = WebhookHeaders::from(&headers);
    let result = state.payments.handle_webhook(method, &headers, &body).await;
    match &result {
        Ok(outcome) => info!(method = %method, outcome = ?outcome, "Webhook processed"),
        Err(e) => warn!(method = %method, error = %e, "Webhook rejected"),
    }
    ack(method, result)
}

fn ack(method: PaymentMethod, result: Result<ReconcileOutcome, PaymentError>) -> Response {
    match method {
        PaymentMethod::Wechat => {
            let body = match result {
                Ok(_) => WechatAck {
                    code: "SUCCESS".into(),
                    message: "OK".into(),
                },
                Err(e) => WechatAck {
                    code: "FAIL".into(),
                    message: failure_message(&e),
                },
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        PaymentMethod::Alipay => {
            let body = if result.is_ok() { ALIPAY_SUCCESS } else { ALIPAY_FAIL };
            (StatusCode::OK, body).into_response()
        }
        _ => match result {
            Ok(_) => (
                StatusCode::OK,
                Json(WebhookAck {
                    received: true,
                    error: None,
                }),
            )
                .into_response(),
            Err(e) => (
                StatusCode::BAD_REQUEST,
                Json(WebhookAck {
                    received: false,
                    error: Some(failure_message(&e)),
                }),
            )
                .into_response(),
        },
    }
}

fn failure_message(e: &PaymentError) -> String {
    if e.is_validation() {
        e.to_string()
    } else {
        "Internal error".to_string()
    }
}
