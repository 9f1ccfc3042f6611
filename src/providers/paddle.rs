//! Paddle Billing (transactions + adjustments)

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::crypto;
use super::{
    ClientConfig, CreatePaymentParams, CreatedPayment, ProviderAdapter, ProviderError,
    ProviderMode, ProviderNotification, ProviderPaymentStatus, ProviderStatus, RefundParams,
    RefundResult, WebhookHeaders, opt_str, read_json, str_field,
};
use crate::money::{from_minor_units, to_minor_units};

pub const HEADER_SIGNATURE: &str = "paddle-signature";

const SANDBOX_API: &str = "https://sandbox-api.paddle.com";
const LIVE_API: &str = "https://api.paddle.com";
const WEBHOOK_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct PaddleConfig {
    pub api_key: String,
    /// Client-side token for Paddle.js
    pub client_token: String,
    pub webhook_secret: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub mode: ProviderMode,
}

pub struct PaddleTransactionAdapter {
    config: PaddleConfig,
    api_base: String,
    http: reqwest::Client,
}

/// Transaction status -> normalized status
pub fn transaction_status(raw: &str) -> ProviderStatus {
    match raw {
        "draft" | "ready" => ProviderStatus::Pending,
        "billed" => ProviderStatus::Processing,
        "paid" | "completed" => ProviderStatus::Success,
        "canceled" => ProviderStatus::Cancelled,
        "past_due" => ProviderStatus::Failed,
        _ => ProviderStatus::Unknown,
    }
}

/// Check `ts=<ts>;h1=<hex>` against `HMAC(secret, "<ts>:<body>")`
pub fn verify_paddle_signature(secret: &str, header: &str, body: &[u8], now: i64) -> bool {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(';') {
        match part.trim().split_once('=') {
            Some(("ts", v)) => timestamp = v.parse::<i64>().ok(),
            Some(("h1", v)) => signatures.push(v),
            _ => {}
        }
    }
    let Some(ts) = timestamp else {
        return false;
    };
    if (now - ts).abs() > WEBHOOK_TOLERANCE_SECS {
        warn!(ts, now, "Paddle webhook outside tolerance window");
        return false;
    }

    let mut signed = format!("{}:", ts).into_bytes();
    signed.extend_from_slice(body);
    signatures
        .iter()
        .any(|sig| crypto::verify_hmac_sha256_hex(secret.as_bytes(), &signed, sig))
}

impl PaddleTransactionAdapter {
    pub fn new(config: PaddleConfig) -> Self {
        let api_base = config.api_base.clone().unwrap_or_else(|| match config.mode {
            ProviderMode::Live => LIVE_API.to_string(),
            ProviderMode::Sandbox => SANDBOX_API.to_string(),
        });
        Self {
            config,
            api_base,
            http: super::shared_http_client(),
        }
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ProviderError> {
        let mut req = self
            .http
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.config.api_key);
        if let Some(body) = body {
            req = req.json(&body);
        }
        read_json(req.send().await?).await
    }

    fn require_transaction<'a>(
        &self,
        transaction_id: Option<&'a str>,
    ) -> Result<&'a str, ProviderError> {
        transaction_id.ok_or_else(|| ProviderError::Decode("paddle transaction id not recorded".into()))
    }
}

#[async_trait]
impl ProviderAdapter for PaddleTransactionAdapter {
    fn name(&self) -> &'static str {
        "paddle"
    }

    async fn create_one_time_payment(
        &self,
        params: &CreatePaymentParams,
    ) -> Result<CreatedPayment, ProviderError> {
        let amount = to_minor_units(params.amount).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let mut body = json!({
            "items": [{
                "quantity": 1,
                "price": {
                    "description": params.description,
                    "name": params.description,
                    "unit_price": {
                        "amount": amount.to_string(),
                        "currency_code": params.currency,
                    },
                    "product": {
                        "name": params.description,
                        "tax_category": "standard",
                    },
                },
            }],
            "custom_data": {
                "payment_no": params.payment_no,
                "order_id": params.order_id,
                "user_id": params.user_id,
            },
        });
        if let Some(url) = &params.return_url {
            body["checkout"] = json!({ "url": url });
        }

        let resp = self.send(reqwest::Method::POST, "/transactions", Some(body)).await?;
        debug!(payment_no = %params.payment_no, "Paddle transaction created");

        Ok(CreatedPayment {
            transaction_id: Some(str_field(&resp, "/data/id")?),
            payment_url: opt_str(&resp, "/data/checkout/url"),
            customer_id: opt_str(&resp, "/data/customer_id"),
            ..Default::default()
        })
    }

    async fn query_payment(
        &self,
        _payment_no: &str,
        transaction_id: Option<&str>,
    ) -> Result<ProviderPaymentStatus, ProviderError> {
        let txn_id = self.require_transaction(transaction_id)?;
        let resp = self
            .send(reqwest::Method::GET, &format!("/transactions/{}", txn_id), None)
            .await?;
        let raw_status = str_field(&resp, "/data/status")?;

        Ok(ProviderPaymentStatus {
            transaction_id: Some(txn_id.to_string()),
            status: transaction_status(&raw_status),
            raw_status,
        })
    }

    async fn refund(&self, params: &RefundParams) -> Result<RefundResult, ProviderError> {
        let txn_id = self.require_transaction(params.transaction_id.as_deref())?;
        let txn = self
            .send(reqwest::Method::GET, &format!("/transactions/{}", txn_id), None)
            .await?;
        let item_id = str_field(&txn, "/data/details/line_items/0/id")?;

        let item = if params.refund_amount >= params.total_amount {
            json!({ "item_id": item_id, "type": "full" })
        } else {
            let amount = to_minor_units(params.refund_amount)
                .map_err(|e| ProviderError::Decode(e.to_string()))?;
            json!({ "item_id": item_id, "type": "partial", "amount": amount.to_string() })
        };
        let body = json!({
            "action": "refund",
            "transaction_id": txn_id,
            "reason": params.reason,
            "items": [item],
        });
        let resp = self.send(reqwest::Method::POST, "/adjustments", Some(body)).await?;

        let amount = opt_str(&resp, "/data/totals/total")
            .and_then(|v| v.parse::<i64>().ok())
            .map(from_minor_units)
            .unwrap_or(params.refund_amount);

        Ok(RefundResult {
            refund_id: str_field(&resp, "/data/id")?,
            status: opt_str(&resp, "/data/status").unwrap_or_else(|| "pending_approval".into()),
            amount,
        })
    }

    /// Unpaid transactions expire on their own
    async fn close_order(
        &self,
        payment_no: &str,
        _transaction_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        debug!(payment_no, "Paddle transactions auto-expire; nothing to close");
        Ok(())
    }

    async fn verify_webhook_signature(&self, headers: &WebhookHeaders, body: &[u8]) -> bool {
        let Some(header) = headers.get(HEADER_SIGNATURE) else {
            return false;
        };
        verify_paddle_signature(
            &self.config.webhook_secret,
            header,
            body,
            Utc::now().timestamp(),
        )
    }

    fn parse_notification(&self, body: &[u8]) -> Result<Option<ProviderNotification>, ProviderError> {
        let event: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let event_type = str_field(&event, "/event_type")?;

        let status = match event_type.as_str() {
            "transaction.completed" | "transaction.paid" => ProviderStatus::Success,
            "transaction.canceled" => ProviderStatus::Cancelled,
            "transaction.past_due" => ProviderStatus::Failed,
            _ => return Ok(None),
        };

        let payment_no = opt_str(&event, "/data/custom_data/payment_no")
            .ok_or_else(|| ProviderError::Decode("missing custom_data.payment_no".into()))?;

        Ok(Some(ProviderNotification {
            payment_no,
            transaction_id: opt_str(&event, "/data/id"),
            raw_status: event_type,
            status,
            payload: event,
        }))
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            public_key: Some(self.config.client_token.clone()),
            client_id: None,
            mode: self.config.mode.as_str().to_string(),
        }
    }
}
