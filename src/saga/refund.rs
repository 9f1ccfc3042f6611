//! PAYMENT_REFUND saga
//!
//! | # | Step                  | Execute                          | Compensate                    |
//! |---|-----------------------|----------------------------------|-------------------------------|
//! | 1 | SET_REFUNDING_STATUS  | SUCCESS -> REFUNDING             | REFUNDING -> SUCCESS          |
//! | 2 | CALL_PROVIDER_REFUND  | adapter refund, result to state  | none; raises an alert (pivot) |
//! | 3 | UPDATE_PAYMENT_STATUS | REFUNDING -> REFUNDED + fields   | REFUNDED -> REFUNDING         |
//! | 4 | UPDATE_ORDER_STATUS   | order PAID -> REFUNDED           | order REFUNDED -> PAID        |
//!
//! Each execute treats "already in the target state" as success so a retry
//! after a lost response is harmless.
//!
//! CALL_PROVIDER_REFUND is the pivot. Once it has started, the payment never
//! goes back to SUCCESS: a timeout, a lost response or a later step failing
//! leaves it REFUNDING with a critical alert. Only a refund the gateway
//! definitely declined rolls the payment back.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use super::{SagaDefinition, SagaError, SagaState, SagaStep};
use crate::alerts::{Alert, AlertKind, AlertSeverity, AlertSink, emit_best_effort};
use crate::payment::repository::{OrderRepository, PaymentRepository};
use crate::payment::state::{OrderStatus, PaymentStatus, Transition};
use crate::payment::types::{PaymentId, PaymentMethod, RefundCompletion};
use crate::providers::{ProviderRegistry, RefundParams};

pub const PAYMENT_REFUND: &str = "PAYMENT_REFUND";
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Saga state key holding the provider's refund result
const REFUND_RESULT_KEY: &str = "refund";

/// Immutable input shared by every step
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundSagaContext {
    pub payment_id: PaymentId,
    pub payment_no: String,
    pub order_id: String,
    pub user_id: String,
    pub method: PaymentMethod,
    pub transaction_id: Option<String>,
    pub currency: String,
    pub total_amount: Decimal,
    pub refund_amount: Decimal,
    pub reason: String,
    /// Allocated once per saga so provider retries stay idempotent
    pub refund_no: String,
}

pub struct RefundDeps {
    pub payments: Arc<dyn PaymentRepository>,
    pub orders: Arc<dyn OrderRepository>,
    pub providers: ProviderRegistry,
    pub alerts: Arc<dyn AlertSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundStepKind {
    SetRefundingStatus,
    CallProviderRefund,
    UpdatePaymentStatus,
    UpdateOrderStatus,
}

impl RefundStepKind {
    pub const ORDERED: [RefundStepKind; 4] = [
        RefundStepKind::SetRefundingStatus,
        RefundStepKind::CallProviderRefund,
        RefundStepKind::UpdatePaymentStatus,
        RefundStepKind::UpdateOrderStatus,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RefundStepKind::SetRefundingStatus => "SET_REFUNDING_STATUS",
            RefundStepKind::CallProviderRefund => "CALL_PROVIDER_REFUND",
            RefundStepKind::UpdatePaymentStatus => "UPDATE_PAYMENT_STATUS",
            RefundStepKind::UpdateOrderStatus => "UPDATE_ORDER_STATUS",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RefundSagaSettings {
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for RefundSagaSettings {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

pub struct RefundStep {
    kind: RefundStepKind,
    deps: Arc<RefundDeps>,
}

/// Build the four-step refund saga for one payment
pub fn refund_saga_definition(
    deps: Arc<RefundDeps>,
    payment_id: PaymentId,
    settings: RefundSagaSettings,
) -> SagaDefinition<RefundStep> {
    SagaDefinition {
        saga_type: PAYMENT_REFUND,
        key: payment_id.to_string(),
        timeout_ms: settings.timeout_ms,
        max_retries: settings.max_retries,
        steps: RefundStepKind::ORDERED
            .iter()
            .map(|&kind| RefundStep {
                kind,
                deps: deps.clone(),
            })
            .collect(),
    }
}

#[async_trait]
impl SagaStep for RefundStep {
    type Context = RefundSagaContext;

    fn name(&self) -> &'static str {
        self.kind.name()
    }

    fn is_pivot(&self) -> bool {
        self.kind == RefundStepKind::CallProviderRefund
    }

    async fn execute(&self, ctx: &RefundSagaContext, state: &SagaState) -> Result<SagaState, SagaError> {
        let step = self.name();
        match self.kind {
            RefundStepKind::SetRefundingStatus => {
                let outcome = self
                    .deps
                    .payments
                    .transition(ctx.payment_id, PaymentStatus::Success, PaymentStatus::Refunding)
                    .await
                    .map_err(|e| SagaError::step(step, e))?;
                if let Transition::Rejected(current) = outcome {
                    return Err(SagaError::step(
                        step,
                        format!("payment {} is {}, expected SUCCESS", ctx.payment_no, current),
                    ));
                }
                Ok(SagaState::new())
            }
            RefundStepKind::CallProviderRefund => {
                let adapter = self
                    .deps
                    .providers
                    .get(ctx.method)
                    .map_err(|e| SagaError::rejected(step, e))?;
                let params = RefundParams {
                    payment_no: ctx.payment_no.clone(),
                    transaction_id: ctx.transaction_id.clone(),
                    refund_no: ctx.refund_no.clone(),
                    currency: ctx.currency.clone(),
                    total_amount: ctx.total_amount,
                    refund_amount: ctx.refund_amount,
                    reason: ctx.reason.clone(),
                    user_id: ctx.user_id.clone(),
                    order_id: ctx.order_id.clone(),
                };
                let result = adapter.refund(&params).await.map_err(|e| {
                    if e.is_rejection() {
                        SagaError::rejected(step, e)
                    } else {
                        SagaError::step(step, e)
                    }
                })?;
                info!(
                    payment_no = %ctx.payment_no,
                    refund_no = %ctx.refund_no,
                    refund_id = %result.refund_id,
                    "Provider refund accepted"
                );

                let mut out = SagaState::new();
                out.insert(
                    REFUND_RESULT_KEY.to_string(),
                    serde_json::to_value(&result).map_err(|e| SagaError::step(step, e))?,
                );
                Ok(out)
            }
            RefundStepKind::UpdatePaymentStatus => {
                let completion = RefundCompletion {
                    refund_amount: ctx.refund_amount,
                    refund_reason: ctx.reason.clone(),
                    refunded_at: Utc::now(),
                    result: state
                        .get(REFUND_RESULT_KEY)
                        .cloned()
                        .unwrap_or(serde_json::Value::Null),
                };
                let outcome = self
                    .deps
                    .payments
                    .mark_refunded(ctx.payment_id, &completion)
                    .await
                    .map_err(|e| SagaError::step(step, e))?;
                if let Transition::Rejected(current) = outcome {
                    return Err(SagaError::step(
                        step,
                        format!("payment {} is {}, expected REFUNDING", ctx.payment_no, current),
                    ));
                }
                Ok(SagaState::new())
            }
            RefundStepKind::UpdateOrderStatus => {
                let outcome = self
                    .deps
                    .orders
                    .mark_order_refunded(&ctx.order_id, Utc::now())
                    .await
                    .map_err(|e| SagaError::step(step, e))?;
                if let Transition::Rejected(current) = outcome {
                    return Err(SagaError::step(
                        step,
                        format!("order {} is {}, expected PAID", ctx.order_id, current),
                    ));
                }
                Ok(SagaState::new())
            }
        }
    }

    async fn compensate(&self, ctx: &RefundSagaContext, state: &SagaState) -> Result<(), SagaError> {
        let step = self.name();
        match self.kind {
            RefundStepKind::SetRefundingStatus => {
                self.deps
                    .payments
                    .transition(ctx.payment_id, PaymentStatus::Refunding, PaymentStatus::Success)
                    .await
                    .map_err(|e| SagaError::step(step, e))?;
                Ok(())
            }
            RefundStepKind::CallProviderRefund => {
                warn!(
                    payment_no = %ctx.payment_no,
                    refund_no = %ctx.refund_no,
                    "Provider refund may have executed; payment left in REFUNDING"
                );
                let alert = Alert::new(
                    AlertKind::IrreversibleRefundFailure,
                    AlertSeverity::Critical,
                    format!(
                        "Refund {} may have executed at provider but the saga could not finish; manual intervention required",
                        ctx.refund_no
                    ),
                )
                .with_payment_no(ctx.payment_no.clone())
                .with_context(json!({
                    "paymentId": ctx.payment_id,
                    "orderId": ctx.order_id,
                    "refundNo": ctx.refund_no,
                    "refundAmount": ctx.refund_amount,
                    "refund": state.get(REFUND_RESULT_KEY),
                }));
                emit_best_effort(self.deps.alerts.as_ref(), alert).await;
                Ok(())
            }
            RefundStepKind::UpdatePaymentStatus => {
                self.deps
                    .payments
                    .transition(ctx.payment_id, PaymentStatus::Refunded, PaymentStatus::Refunding)
                    .await
                    .map_err(|e| SagaError::step(step, e))?;
                Ok(())
            }
            RefundStepKind::UpdateOrderStatus => {
                self.deps
                    .orders
                    .transition_order(&ctx.order_id, OrderStatus::Refunded, OrderStatus::Paid)
                    .await
                    .map_err(|e| SagaError::step(step, e))?;
                Ok(())
            }
        }
    }
}
