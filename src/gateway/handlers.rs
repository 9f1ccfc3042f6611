//! Payment API handlers

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;
use validator::Validate;

use super::state::AppState;
use super::types::{ApiError, ApiResult, CreatePaymentBody, ListQuery, RefundBody, ok};
use crate::payment::{
    CreatePaymentRequest, Payment, PaymentError, PaymentId, PaymentMethod, RefundRequest,
    RefundSubmission,
};
use crate::providers::ClientConfig;
use crate::saga::SagaRecord;

/// Caller identity, set by the upstream API gateway
pub const USER_ID_HEADER: &str = "x-user-id";
const LEGACY_USER_ID_HEADER: &str = "user-id";

pub(crate) fn user_id(headers: &HeaderMap) -> Option<String> {
    [USER_ID_HEADER, LEGACY_USER_ID_HEADER]
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_method(raw: &str) -> Result<PaymentMethod, ApiError> {
    raw.parse::<PaymentMethod>()
        .map_err(|_| PaymentError::UnsupportedMethod(raw.to_string()).into())
}

fn parse_payment_id(raw: &str) -> Result<PaymentId, ApiError> {
    raw.parse::<PaymentId>()
        .map_err(|_| PaymentError::payment_not_found(raw).into())
}

/// Health check response data
#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    /// Server timestamp in milliseconds
    #[schema(example = 1703494800000_i64)]
    pub timestamp_ms: i64,
}

#[utoipa::path(
    get,
    path = "/api/billing/health",
    responses((status = 200, description = "Service healthy", body = HealthResponse)),
    tag = "System"
)]
pub async fn health_check() -> ApiResult<HealthResponse> {
    ok(HealthResponse {
        timestamp_ms: Utc::now().timestamp_millis(),
    })
}

/// Create a payment for a PENDING order
///
/// POST /api/billing/payments
#[utoipa::path(
    post,
    path = "/api/billing/payments",
    request_body = CreatePaymentBody,
    responses(
        (status = 200, description = "Payment dispatched", content_type = "application/json"),
        (status = 400, description = "Order not payable, amount mismatch or unsupported method"),
        (status = 404, description = "Order not found"),
        (status = 500, description = "Payment creation failed")
    ),
    tag = "Payments"
)]
pub async fn create_payment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreatePaymentBody>,
) -> ApiResult<Payment> {
    body.validate()?;
    let method = parse_method(&body.method)?;

    let mut req = CreatePaymentRequest::new(body.order_id, method, body.amount);
    if let Some(user) = user_id(&headers) {
        req = req.with_user(user);
    }

    ok(state.payments.create_payment(req).await?)
}

/// List payments, newest first
///
/// GET /api/billing/payments
#[utoipa::path(
    get,
    path = "/api/billing/payments",
    params(("userId" = Option<String>, Query, description = "Filter by user")),
    responses((status = 200, description = "Up to 100 payments", content_type = "application/json")),
    tag = "Payments"
)]
pub async fn list_payments(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Payment>> {
    ok(state.payments.find_all(query.user_id.as_deref()).await?)
}

#[utoipa::path(
    get,
    path = "/api/billing/payments/{id}",
    params(("id" = String, Path, description = "Payment id")),
    responses(
        (status = 200, description = "Payment", content_type = "application/json"),
        (status = 404, description = "Payment not found")
    ),
    tag = "Payments"
)]
pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Payment> {
    let id = parse_payment_id(&id)?;
    ok(state.payments.find_one(id).await?)
}

/// Return a payment by number, polling the gateway while it is PROCESSING
///
/// GET /api/billing/payments/query/{payment_no}
#[utoipa::path(
    get,
    path = "/api/billing/payments/query/{payment_no}",
    params(("payment_no" = String, Path, description = "Payment number")),
    responses(
        (status = 200, description = "Payment after reconciliation", content_type = "application/json"),
        (status = 404, description = "Payment not found")
    ),
    tag = "Payments"
)]
pub async fn query_payment(
    State(state): State<Arc<AppState>>,
    Path(payment_no): Path<String>,
) -> ApiResult<Payment> {
    ok(state.payments.query_payment(&payment_no).await?)
}

/// Submit a refund saga
///
/// POST /api/billing/payments/{id}/refund
#[utoipa::path(
    post,
    path = "/api/billing/payments/{id}/refund",
    params(("id" = String, Path, description = "Payment id")),
    request_body = RefundBody,
    responses(
        (status = 200, description = "Refund saga submitted", content_type = "application/json"),
        (status = 400, description = "Payment not refundable or amount invalid"),
        (status = 404, description = "Payment or order not found")
    ),
    tag = "Payments"
)]
pub async fn refund_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RefundBody>,
) -> ApiResult<RefundSubmission> {
    body.validate()?;
    let id = parse_payment_id(&id)?;

    let submission = state
        .payments
        .refund_payment(
            id,
            RefundRequest {
                amount: body.amount,
                reason: body.reason,
            },
        )
        .await?;
    ok(submission)
}

/// Progress of a refund saga
///
/// GET /api/billing/payments/sagas/{saga_id}
#[utoipa::path(
    get,
    path = "/api/billing/payments/sagas/{saga_id}",
    params(("saga_id" = String, Path, description = "Saga id returned by the refund call")),
    responses(
        (status = 200, description = "Saga record", content_type = "application/json"),
        (status = 404, description = "Saga not found")
    ),
    tag = "Payments"
)]
pub async fn get_saga(
    State(state): State<Arc<AppState>>,
    Path(saga_id): Path<String>,
) -> ApiResult<SagaRecord> {
    match state.sagas.status(&saga_id) {
        Some(record) => ok(record),
        None => Err(PaymentError::NotFound {
            entity: "Saga",
            id: saga_id,
        }
        .into()),
    }
}

/// Public client-side configuration of a gateway
///
/// GET /api/billing/payments/providers/{method}/config
#[utoipa::path(
    get,
    path = "/api/billing/payments/providers/{method}/config",
    params(("method" = String, Path, description = "Payment method")),
    responses(
        (status = 200, description = "Client configuration", content_type = "application/json"),
        (status = 400, description = "Unsupported method")
    ),
    tag = "Payments"
)]
pub async fn provider_config(
    State(state): State<Arc<AppState>>,
    Path(method): Path<String>,
) -> ApiResult<ClientConfig> {
    let method = parse_method(&method)?;
    ok(state.payments.provider_client_config(method)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RecordingAlertSink;
    use crate::payment::{InMemoryStore, Order, PaymentLifecycleService, PaymentSettings, PaymentStatus};
    use crate::providers::{ProviderRegistry, StubAdapter};
    use crate::saga::InlineSagaRunner;
    use axum::http::{HeaderValue, StatusCode};
    use rust_decimal_macros::dec;

    fn state() -> (Arc<AppState>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store.insert_order(Order::new_pending("order-1", "owner-1", dec!(99.99)));
        let runner = Arc::new(InlineSagaRunner::default());
        let service = PaymentLifecycleService::new(
            store.clone(),
            store.clone(),
            ProviderRegistry::new().with(
                PaymentMethod::Wechat,
                Arc::new(StubAdapter::new("wechat", "secret")),
            ),
            runner.clone(),
            Arc::new(RecordingAlertSink::new()),
            PaymentSettings::default(),
        );
        (Arc::new(AppState::new(Arc::new(service), runner)), store)
    }

    fn body(method: &str, amount: rust_decimal::Decimal) -> CreatePaymentBody {
        CreatePaymentBody {
            order_id: "order-1".into(),
            method: method.into(),
            amount,
        }
    }

    #[test]
    fn test_user_id_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_id(&headers), None);
        headers.insert("user-id", HeaderValue::from_static("legacy"));
        assert_eq!(user_id(&headers).as_deref(), Some("legacy"));
        headers.insert("x-user-id", HeaderValue::from_static(" u-1 "));
        assert_eq!(user_id(&headers).as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn test_create_payment_uses_header_user() {
        let (state, _) = state();
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("caller-9"));

        let Json(resp) = create_payment(State(state), headers, Json(body("wechat", dec!(99.99))))
            .await
            .unwrap();
        let payment = resp.data.unwrap();
        assert_eq!(resp.code, 0);
        assert_eq!(payment.user_id, "caller-9");
        assert_eq!(payment.status, PaymentStatus::Processing);
    }

    #[tokio::test]
    async fn test_create_payment_unknown_method() {
        let (state, store) = state();
        let err = create_payment(State(state), HeaderMap::new(), Json(body("bitcoin", dec!(99.99))))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, super::super::types::error_codes::UNSUPPORTED_METHOD);
        assert_eq!(store.payment_count(), 0);
    }

    #[tokio::test]
    async fn test_get_payment_bad_id() {
        let (state, _) = state();
        let err = get_payment(State(state), Path("not-a-ulid".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_refund_validation() {
        let (state, _) = state();
        let err = refund_payment(
            State(state),
            Path(PaymentId::new().to_string()),
            Json(RefundBody {
                amount: dec!(1),
                reason: String::new(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_provider_config() {
        let (state, _) = state();
        let Json(resp) = provider_config(State(state.clone()), Path("wechat".into()))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap().mode, "stub");

        let err = provider_config(State(state), Path("paddle".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
