//! Payment Lifecycle Service
//!
//! Owns the payment state machine end to end: creation and dispatch to a
//! gateway, reconciliation from webhooks and polling, refund submission and
//! the expiry sweep. All status writes go through conditional updates on the
//! repository, so concurrent webhook/poll/sweep calls converge.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::error::PaymentError;
use super::reconcile::reconciled_status;
use super::repository::{OrderRepository, PaymentRepository, SettleUpdate};
use super::state::{OrderStatus, PaymentStatus, Transition};
use super::types::{
    CreatePaymentRequest, DispatchUpdate, Payment, PaymentId, PaymentMethod, PaymentNo,
    RefundRequest, RefundSubmission,
};
use crate::alerts::{Alert, AlertKind, AlertSeverity, AlertSink, emit_best_effort};
use crate::money;
use crate::providers::{
    ClientConfig, CreatePaymentParams, ProviderRegistry, ProviderStatus, WebhookHeaders,
};
use crate::saga::{
    RefundDeps, RefundSagaContext, RefundSagaSettings, RefundStep, SagaSubmitter,
    refund_saga_definition,
};

/// Upper bound for `find_all`
pub const LIST_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct PaymentSettings {
    pub currency: String,
    /// PENDING/PROCESSING lifetime before the sweep may cancel it
    pub ttl: Duration,
    /// Base of every notify URL handed to a gateway
    pub api_gateway_url: String,
    pub return_url: Option<String>,
    pub saga: RefundSagaSettings,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            currency: "CNY".to_string(),
            ttl: Duration::minutes(15),
            api_gateway_url: "http://localhost:30000".to_string(),
            return_url: None,
            saga: RefundSagaSettings::default(),
        }
    }
}

/// What a provider-reported status did to a payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "lowercase")]
pub enum ReconcileOutcome {
    /// Payment moved to this status
    Applied(PaymentStatus),
    /// Payment already settled; nothing written
    Unchanged(PaymentStatus),
    /// Provider status is not one we persist
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub scanned: usize,
    pub cancelled: usize,
    pub close_failed: usize,
    pub orders_cancelled: u64,
}

pub struct PaymentLifecycleService {
    payments: Arc<dyn PaymentRepository>,
    orders: Arc<dyn OrderRepository>,
    providers: ProviderRegistry,
    sagas: Arc<dyn SagaSubmitter<RefundStep>>,
    alerts: Arc<dyn AlertSink>,
    refund_deps: Arc<RefundDeps>,
    settings: PaymentSettings,
}

impl PaymentLifecycleService {
    pub fn new(
        payments: Arc<dyn PaymentRepository>,
        orders: Arc<dyn OrderRepository>,
        providers: ProviderRegistry,
        sagas: Arc<dyn SagaSubmitter<RefundStep>>,
        alerts: Arc<dyn AlertSink>,
        settings: PaymentSettings,
    ) -> Self {
        let refund_deps = Arc::new(RefundDeps {
            payments: payments.clone(),
            orders: orders.clone(),
            providers: providers.clone(),
            alerts: alerts.clone(),
        });
        Self {
            payments,
            orders,
            providers,
            sagas,
            alerts,
            refund_deps,
            settings,
        }
    }

    pub fn settings(&self) -> &PaymentSettings {
        &self.settings
    }

    /// `<api_gateway_url>/api/billing/payments/notify/<method>`
    pub fn notify_url(&self, method: PaymentMethod) -> String {
        format!(
            "{}/api/billing/payments/notify/{}",
            self.settings.api_gateway_url.trim_end_matches('/'),
            method.as_str()
        )
    }

    /// Create a payment for a PENDING order and dispatch it to the gateway
    ///
    /// Validation failures write nothing. A dispatch failure leaves the
    /// payment FAILED with the gateway's message and returns the generic
    /// `PaymentCreationFailed`.
    pub async fn create_payment(&self, req: CreatePaymentRequest) -> Result<Payment, PaymentError> {
        let order = self
            .orders
            .find_order(&req.order_id)
            .await?
            .ok_or_else(|| PaymentError::order_not_found(&req.order_id))?;

        if order.status != OrderStatus::Pending {
            return Err(PaymentError::InvalidState(format!(
                "Order {} is {}, only PENDING orders can be paid",
                order.id, order.status
            )));
        }
        if req.amount <= rust_decimal::Decimal::ZERO {
            return Err(PaymentError::InvalidAmount);
        }
        if !money::amounts_match(req.amount, order.amount) {
            return Err(PaymentError::AmountMismatch {
                amount: req.amount,
                expected: order.amount,
            });
        }
        let adapter = self.providers.get(req.method)?;

        let user_id = req.user_id.unwrap_or_else(|| order.user_id.clone());
        let payment = Payment::new_pending(
            order.id.clone(),
            user_id,
            money::normalize(req.amount),
            self.settings.currency.clone(),
            req.method,
            self.settings.ttl,
        );
        self.payments.insert(&payment).await?;

        info!(
            payment_no = %payment.payment_no,
            order_id = %payment.order_id,
            method = %payment.method,
            amount = %payment.amount,
            "Payment created"
        );

        let params = CreatePaymentParams {
            amount: payment.amount,
            currency: payment.currency.clone(),
            description: format!("Order payment - {}", order.id),
            payment_no: payment.payment_no.to_string(),
            notify_url: self.notify_url(payment.method),
            return_url: self.settings.return_url.clone(),
            user_id: payment.user_id.clone(),
            order_id: payment.order_id.clone(),
        };

        let created = match adapter.create_one_time_payment(&params).await {
            Ok(created) => created,
            Err(e) => {
                self.fail_dispatch(&payment, &e.to_string()).await;
                return Err(PaymentError::PaymentCreationFailed);
            }
        };

        let now = Utc::now();
        let update = DispatchUpdate {
            status: if created.settled {
                PaymentStatus::Success
            } else {
                PaymentStatus::Processing
            },
            transaction_id: created.transaction_id,
            payment_url: created.payment_url,
            client_secret: created.client_secret,
            customer_id: created.customer_id,
            paid_at: created.settled.then_some(now),
        };
        let outcome = self.payments.record_dispatch(payment.id, &update).await?;
        if !outcome.is_applied() {
            warn!(payment_no = %payment.payment_no, ?outcome, "Dispatch result not recorded");
        }
        if created.settled && outcome.is_applied() {
            self.mark_order_paid(&payment.order_id, now).await?;
        }

        info!(
            payment_no = %payment.payment_no,
            status = %update.status,
            "Payment dispatched"
        );
        self.find_one(payment.id).await
    }

    async fn fail_dispatch(&self, payment: &Payment, reason: &str) {
        error!(
            payment_no = %payment.payment_no,
            method = %payment.method,
            error = %reason,
            "Provider dispatch failed"
        );
        if let Err(e) = self.payments.mark_failed(payment.id, reason).await {
            error!(payment_no = %payment.payment_no, error = %e, "Failed to record dispatch failure");
        }

        let alert = Alert::new(
            AlertKind::PaymentCreationFailed,
            AlertSeverity::High,
            format!("Payment creation failed via {}", payment.method),
        )
        .with_payment_no(payment.payment_no.to_string())
        .with_context(json!({
            "orderId": payment.order_id,
            "method": payment.method,
            "amount": payment.amount,
            "error": reason,
        }));
        emit_best_effort(self.alerts.as_ref(), alert).await;
    }

    /// Verify and apply an inbound gateway notification
    pub async fn handle_webhook(
        &self,
        method: PaymentMethod,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> Result<ReconcileOutcome, PaymentError> {
        let adapter = self.providers.get(method)?;

        if !adapter.verify_webhook_signature(headers, body).await {
            warn!(method = %method, "Webhook signature verification failed");
            return Err(PaymentError::SignatureInvalid);
        }

        let notification = match adapter.parse_notification(body) {
            Ok(Some(n)) => n,
            Ok(None) => {
                debug!(method = %method, "Webhook event not relevant");
                return Ok(ReconcileOutcome::Ignored);
            }
            Err(e) => {
                warn!(method = %method, error = %e, "Malformed webhook body");
                return Err(PaymentError::InvalidNotification);
            }
        };

        let payment = self
            .payments
            .find_by_payment_no(&notification.payment_no)
            .await?
            .ok_or_else(|| PaymentError::payment_not_found(&notification.payment_no))?;

        debug!(
            payment_no = %payment.payment_no,
            raw_status = %notification.raw_status,
            "Webhook received"
        );

        self.reconcile(
            &payment,
            notification.status,
            notification.transaction_id,
            notification.payload,
        )
        .await
    }

    /// Return the payment, polling the gateway first if it is PROCESSING
    ///
    /// Gateway errors are logged and the stored record is returned.
    pub async fn query_payment(&self, payment_no: &str) -> Result<Payment, PaymentError> {
        let payment = self
            .payments
            .find_by_payment_no(payment_no)
            .await?
            .ok_or_else(|| PaymentError::payment_not_found(payment_no))?;

        if payment.status != PaymentStatus::Processing {
            return Ok(payment);
        }

        let adapter = match self.providers.get(payment.method) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(payment_no, error = %e, "No adapter for poll");
                return Ok(payment);
            }
        };

        let polled = match adapter
            .query_payment(payment_no, payment.transaction_id.as_deref())
            .await
        {
            Ok(polled) => polled,
            Err(e) => {
                warn!(payment_no, method = %payment.method, error = %e, "Payment poll failed");
                return Ok(payment);
            }
        };

        // Closing is left to webhooks and the expiry sweep
        if polled.status != ProviderStatus::Success {
            debug!(payment_no, status = ?polled.status, "Poll did not report success");
            return Ok(payment);
        }

        let payload = json!({
            "source": "poll",
            "rawStatus": polled.raw_status,
            "transactionId": polled.transaction_id,
        });
        match self
            .reconcile(&payment, polled.status, polled.transaction_id, payload)
            .await?
        {
            ReconcileOutcome::Applied(_) => self.find_one(payment.id).await,
            ReconcileOutcome::Unchanged(_) | ReconcileOutcome::Ignored => Ok(payment),
        }
    }

    /// Shared by webhook and poll paths
    async fn reconcile(
        &self,
        payment: &Payment,
        status: ProviderStatus,
        transaction_id: Option<String>,
        payload: serde_json::Value,
    ) -> Result<ReconcileOutcome, PaymentError> {
        let Some(next) = reconciled_status(status) else {
            debug!(payment_no = %payment.payment_no, ?status, "Provider status ignored");
            return Ok(ReconcileOutcome::Ignored);
        };

        let now = Utc::now();
        let update = SettleUpdate {
            status: next,
            transaction_id,
            payload: Some(payload),
            at: now,
        };
        match self.payments.settle(payment.id, &update).await? {
            Transition::Applied => {
                if next == PaymentStatus::Success {
                    self.mark_order_paid(&payment.order_id, now).await?;
                }
                info!(payment_no = %payment.payment_no, status = %next, "Payment reconciled");
                Ok(ReconcileOutcome::Applied(next))
            }
            Transition::Unchanged => Ok(ReconcileOutcome::Unchanged(next)),
            Transition::Rejected(current) => {
                if current != next && current.is_terminal() {
                    warn!(
                        payment_no = %payment.payment_no,
                        current = %current,
                        reported = %next,
                        "Provider status conflicts with settled payment"
                    );
                }
                Ok(ReconcileOutcome::Unchanged(current))
            }
        }
    }

    async fn mark_order_paid(&self, order_id: &str, at: DateTime<Utc>) -> Result<(), PaymentError> {
        if let Transition::Rejected(current) = self.orders.mark_order_paid(order_id, at).await? {
            warn!(order_id, current = %current, "Order not PENDING; left as is");
        }
        Ok(())
    }

    /// Validate and submit a refund saga; returns before the saga finishes
    pub async fn refund_payment(
        &self,
        payment_id: PaymentId,
        req: RefundRequest,
    ) -> Result<RefundSubmission, PaymentError> {
        let payment = self.find_one(payment_id).await?;

        if payment.status != PaymentStatus::Success {
            return Err(PaymentError::InvalidState(format!(
                "Only successful payments can be refunded, payment {} is {}",
                payment.payment_no, payment.status
            )));
        }
        if req.amount <= rust_decimal::Decimal::ZERO {
            return Err(PaymentError::InvalidAmount);
        }
        if req.amount > payment.amount {
            return Err(PaymentError::RefundAmountExceeded);
        }
        let order = self
            .orders
            .find_order(&payment.order_id)
            .await?
            .ok_or_else(|| PaymentError::order_not_found(&payment.order_id))?;

        let context = RefundSagaContext {
            payment_id: payment.id,
            payment_no: payment.payment_no.to_string(),
            order_id: order.id,
            user_id: payment.user_id.clone(),
            method: payment.method,
            transaction_id: payment.transaction_id.clone(),
            currency: payment.currency.clone(),
            total_amount: payment.amount,
            refund_amount: money::normalize(req.amount),
            reason: req.reason,
            refund_no: PaymentNo::generate_refund().into_inner(),
        };
        let definition =
            refund_saga_definition(self.refund_deps.clone(), payment.id, self.settings.saga);
        let refund_no = context.refund_no.clone();

        let saga_id = self.sagas.execute_saga(definition, context).await?;
        info!(
            payment_no = %payment.payment_no,
            saga_id = %saga_id,
            refund_no = %refund_no,
            amount = %req.amount,
            "Refund saga submitted"
        );

        Ok(RefundSubmission {
            saga_id,
            payment: self.find_one(payment.id).await?,
        })
    }

    pub async fn find_one(&self, id: PaymentId) -> Result<Payment, PaymentError> {
        self.payments
            .find_by_id(id)
            .await?
            .ok_or_else(|| PaymentError::payment_not_found(id))
    }

    /// Newest first, at most `LIST_LIMIT`
    pub async fn find_all(&self, user_id: Option<&str>) -> Result<Vec<Payment>, PaymentError> {
        self.payments.list(user_id, LIST_LIMIT).await
    }

    pub fn provider_client_config(&self, method: PaymentMethod) -> Result<ClientConfig, PaymentError> {
        Ok(self.providers.get(method)?.client_config())
    }

    /// Cancel PROCESSING payments past `expires_at`
    ///
    /// Each gateway order is closed first; a payment whose close fails is left
    /// for the next sweep. Orders of cancelled payments that are still PENDING
    /// are cancelled with a single bulk update.
    pub async fn close_expired_payments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<SweepReport, PaymentError> {
        let expired = self.payments.find_expired(now, limit).await?;
        let mut report = SweepReport {
            scanned: expired.len(),
            ..Default::default()
        };
        let mut order_ids = Vec::with_capacity(expired.len());

        for payment in expired {
            let closed = match self.providers.get(payment.method) {
                Ok(adapter) => adapter
                    .close_order(payment.payment_no.as_str(), payment.transaction_id.as_deref())
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(reason) = closed {
                report.close_failed += 1;
                warn!(payment_no = %payment.payment_no, error = %reason, "Close order failed");
                let alert = Alert::new(
                    AlertKind::CloseOrderFailed,
                    AlertSeverity::Warning,
                    format!("Could not close expired order at {}", payment.method),
                )
                .with_payment_no(payment.payment_no.to_string())
                .with_context(json!({ "error": reason }));
                emit_best_effort(self.alerts.as_ref(), alert).await;
                continue;
            }

            match self
                .payments
                .transition(payment.id, PaymentStatus::Processing, PaymentStatus::Cancelled)
                .await
            {
                Ok(Transition::Applied) => {
                    report.cancelled += 1;
                    order_ids.push(payment.order_id);
                }
                Ok(outcome) => {
                    debug!(payment_no = %payment.payment_no, ?outcome, "Expired payment settled concurrently");
                }
                Err(e) => {
                    error!(payment_no = %payment.payment_no, error = %e, "Failed to cancel expired payment");
                }
            }
        }

        if !order_ids.is_empty() {
            report.orders_cancelled = self.orders.cancel_pending_orders(&order_ids).await?;
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                cancelled = report.cancelled,
                close_failed = report.close_failed,
                orders_cancelled = report.orders_cancelled,
                "Expiry sweep finished"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RecordingAlertSink;
    use crate::payment::memory::InMemoryStore;
    use crate::saga::InlineSagaRunner;

    fn service(api_gateway_url: &str) -> PaymentLifecycleService {
        let store = Arc::new(InMemoryStore::new());
        PaymentLifecycleService::new(
            store.clone(),
            store,
            ProviderRegistry::new(),
            Arc::new(InlineSagaRunner::default()),
            Arc::new(RecordingAlertSink::new()),
            PaymentSettings {
                api_gateway_url: api_gateway_url.to_string(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_notify_url() {
        let svc = service("https://api.example.com/");
        assert_eq!(
            svc.notify_url(PaymentMethod::Wechat),
            "https://api.example.com/api/billing/payments/notify/wechat"
        );
        assert_eq!(
            svc.notify_url(PaymentMethod::Paddle),
            "https://api.example.com/api/billing/payments/notify/paddle"
        );
    }

    #[tokio::test]
    async fn test_unknown_payment_no() {
        let svc = service("http://localhost");
        let err = svc.query_payment("PAY-missing").await.unwrap_err();
        assert!(matches!(err, PaymentError::NotFound { entity: "Payment", .. }));
    }

    #[tokio::test]
    async fn test_unregistered_method_config() {
        let svc = service("http://localhost");
        let err = svc.provider_client_config(PaymentMethod::Stripe).unwrap_err();
        assert!(matches!(err, PaymentError::UnsupportedMethod(_)));
    }
}
