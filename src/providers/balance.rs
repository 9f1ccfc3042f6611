//! Internal balance ledger as a payment method
//!
//! Settles synchronously: check, then deduct with `order_id` as the idempotency
//! token. There is no webhook, so signature verification always fails.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{
    ClientConfig, CreatePaymentParams, CreatedPayment, ProviderAdapter, ProviderError,
    ProviderNotification, ProviderPaymentStatus, ProviderStatus, RefundParams, RefundResult,
    WebhookHeaders,
};
use crate::ledger::{LedgerClient, LedgerError};

impl From<LedgerError> for ProviderError {
    fn from(e: LedgerError) -> Self {
        ProviderError::Ledger(e.to_string())
    }
}

pub struct BalanceLedgerAdapter {
    ledger: Arc<dyn LedgerClient>,
}

impl BalanceLedgerAdapter {
    pub fn new(ledger: Arc<dyn LedgerClient>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl ProviderAdapter for BalanceLedgerAdapter {
    fn name(&self) -> &'static str {
        "balance"
    }

    async fn create_one_time_payment(
        &self,
        params: &CreatePaymentParams,
    ) -> Result<CreatedPayment, ProviderError> {
        let check = self
            .ledger
            .check_balance(&params.user_id, params.amount)
            .await?;
        if !check.allowed {
            return Err(ProviderError::InsufficientBalance {
                available: check.balance,
                required: params.amount,
            });
        }

        let deduction = self
            .ledger
            .deduct_balance(&params.user_id, params.amount, &params.order_id)
            .await?;
        if !deduction.success {
            return Err(ProviderError::Ledger("deduction not applied".into()));
        }

        info!(
            payment_no = %params.payment_no,
            user_id = %params.user_id,
            new_balance = %deduction.new_balance,
            "Balance deducted"
        );

        Ok(CreatedPayment {
            transaction_id: Some(deduction.transaction_id),
            settled: true,
            ..Default::default()
        })
    }

    /// Ledger payments never sit in PROCESSING
    async fn query_payment(
        &self,
        _payment_no: &str,
        transaction_id: Option<&str>,
    ) -> Result<ProviderPaymentStatus, ProviderError> {
        Ok(ProviderPaymentStatus {
            transaction_id: transaction_id.map(str::to_string),
            raw_status: "SETTLED".into(),
            status: ProviderStatus::Success,
        })
    }

    async fn refund(&self, params: &RefundParams) -> Result<RefundResult, ProviderError> {
        let refund = self
            .ledger
            .refund_balance(&params.user_id, params.refund_amount, &params.order_id)
            .await?;
        Ok(RefundResult {
            refund_id: refund.transaction_id,
            status: "SUCCESS".into(),
            amount: params.refund_amount,
        })
    }

    async fn close_order(
        &self,
        _payment_no: &str,
        _transaction_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn verify_webhook_signature(&self, _headers: &WebhookHeaders, _body: &[u8]) -> bool {
        false
    }

    fn parse_notification(&self, _body: &[u8]) -> Result<Option<ProviderNotification>, ProviderError> {
        Ok(None)
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            mode: "internal".into(),
            ..Default::default()
        }
    }
}
