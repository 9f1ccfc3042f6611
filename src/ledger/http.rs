//! HTTP ledger client

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::{BalanceCheck, Deduction, LedgerClient, LedgerError, LedgerRefund};

pub struct HttpLedgerClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpLedgerClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> Result<T, LedgerError> {
        let mut req = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body);
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LedgerError::Rejected(format!("{}: {}", status.as_u16(), text)));
        }
        resp.json::<T>()
            .await
            .map_err(|e| LedgerError::Decode(e.to_string()))
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn check_balance(&self, user_id: &str, amount: Decimal) -> Result<BalanceCheck, LedgerError> {
        debug!(user_id, %amount, "Ledger balance check");
        self.post(
            "/balance/check",
            json!({ "userId": user_id, "amount": amount }),
            None,
        )
        .await
    }

    async fn deduct_balance(
        &self,
        user_id: &str,
        amount: Decimal,
        order_id: &str,
    ) -> Result<Deduction, LedgerError> {
        self.post(
            "/balance/deduct",
            json!({ "userId": user_id, "amount": amount, "orderId": order_id }),
            Some(order_id),
        )
        .await
    }

    async fn refund_balance(
        &self,
        user_id: &str,
        amount: Decimal,
        order_id: &str,
    ) -> Result<LedgerRefund, LedgerError> {
        let key = format!("refund:{}", order_id);
        self.post(
            "/balance/refund",
            json!({ "userId": user_id, "amount": amount, "orderId": order_id }),
            Some(&key),
        )
        .await
    }
}
