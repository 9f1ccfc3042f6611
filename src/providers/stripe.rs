//! Stripe Checkout (hosted page)
//!
//! The Checkout Session id is the payment's `transaction_id`; the session's
//! `client_reference_id` carries our `payment_no`.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};

use super::crypto;
use super::{
    ClientConfig, CreatePaymentParams, CreatedPayment, ProviderAdapter, ProviderError,
    ProviderMode, ProviderNotification, ProviderPaymentStatus, ProviderStatus, RefundParams,
    RefundResult, WebhookHeaders, opt_str, read_json, str_field,
};
use crate::money::{from_minor_units, to_minor_units};

pub const HEADER_SIGNATURE: &str = "stripe-signature";

const DEFAULT_API_BASE: &str = "https://api.stripe.com";
/// Maximum age of a signed webhook
pub const WEBHOOK_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct StripeConfig {
    pub secret_key: String,
    pub publishable_key: String,
    pub webhook_secret: String,
    /// Redirect after checkout when the caller supplies none
    pub success_url: String,
    pub cancel_url: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub mode: ProviderMode,
}

pub struct StripeHostedAdapter {
    config: StripeConfig,
    api_base: String,
    http: reqwest::Client,
}

impl StripeHostedAdapter {
    pub fn new(config: StripeConfig) -> Self {
        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self {
            config,
            api_base,
            http: super::shared_http_client(),
        }
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(String, String)],
        idempotency_key: Option<&str>,
    ) -> Result<serde_json::Value, ProviderError> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(form.iter())
            .finish();
        let mut req = self
            .http
            .post(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.config.secret_key)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body);
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        read_json(req.send().await?).await
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value, ProviderError> {
        let resp = self
            .http
            .get(format!("{}{}", self.api_base, path))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;
        read_json(resp).await
    }

    fn require_session<'a>(&self, transaction_id: Option<&'a str>) -> Result<&'a str, ProviderError> {
        transaction_id.ok_or_else(|| ProviderError::Decode("checkout session id not recorded".into()))
    }
}

/// Checkout Session -> normalized status
pub fn session_status(status: &str, payment_status: &str) -> ProviderStatus {
    match (status, payment_status) {
        (_, "paid") | (_, "no_payment_required") => ProviderStatus::Success,
        ("expired", _) => ProviderStatus::Cancelled,
        ("open", _) => ProviderStatus::Processing,
        ("complete", "unpaid") => ProviderStatus::Processing,
        _ => ProviderStatus::Unknown,
    }
}

/// Check a `t=<ts>,v1=<hex>` header against `HMAC(secret, "<ts>.<body>")`
pub fn verify_stripe_signature(secret: &str, header: &str, body: &[u8], now: i64) -> bool {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = v.parse::<i64>().ok(),
            Some(("v1", v)) => signatures.push(v),
            _ => {}
        }
    }
    let Some(ts) = timestamp else {
        return false;
    };
    if (now - ts).abs() > WEBHOOK_TOLERANCE_SECS {
        warn!(ts, now, "Stripe webhook outside tolerance window");
        return false;
    }

    let mut signed = format!("{}.", ts).into_bytes();
    signed.extend_from_slice(body);
    signatures
        .iter()
        .any(|sig| crypto::verify_hmac_sha256_hex(secret.as_bytes(), &signed, sig))
}

#[async_trait]
impl ProviderAdapter for StripeHostedAdapter {
    fn name(&self) -> &'static str {
        "stripe"
    }

    async fn create_one_time_payment(
        &self,
        params: &CreatePaymentParams,
    ) -> Result<CreatedPayment, ProviderError> {
        let unit_amount =
            to_minor_units(params.amount).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let success_url = params
            .return_url
            .clone()
            .unwrap_or_else(|| self.config.success_url.clone());

        let form: Vec<(String, String)> = vec![
            ("mode".into(), "payment".into()),
            ("client_reference_id".into(), params.payment_no.clone()),
            ("success_url".into(), success_url),
            ("cancel_url".into(), self.config.cancel_url.clone()),
            ("line_items[0][quantity]".into(), "1".into()),
            (
                "line_items[0][price_data][currency]".into(),
                params.currency.to_ascii_lowercase(),
            ),
            (
                "line_items[0][price_data][unit_amount]".into(),
                unit_amount.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]".into(),
                params.description.clone(),
            ),
            ("metadata[payment_no]".into(), params.payment_no.clone()),
            ("metadata[order_id]".into(), params.order_id.clone()),
            ("metadata[user_id]".into(), params.user_id.clone()),
            (
                "payment_intent_data[metadata][payment_no]".into(),
                params.payment_no.clone(),
            ),
        ];

        let session = self
            .post_form("/v1/checkout/sessions", &form, Some(&params.payment_no))
            .await?;
        debug!(payment_no = %params.payment_no, "Stripe checkout session created");

        Ok(CreatedPayment {
            transaction_id: Some(str_field(&session, "/id")?),
            payment_url: opt_str(&session, "/url"),
            client_secret: opt_str(&session, "/client_secret"),
            customer_id: opt_str(&session, "/customer"),
            settled: false,
        })
    }

    async fn query_payment(
        &self,
        _payment_no: &str,
        transaction_id: Option<&str>,
    ) -> Result<ProviderPaymentStatus, ProviderError> {
        let session_id = self.require_session(transaction_id)?;
        let session = self.get(&format!("/v1/checkout/sessions/{}", session_id)).await?;
        let status = opt_str(&session, "/status").unwrap_or_default();
        let payment_status = opt_str(&session, "/payment_status").unwrap_or_default();

        Ok(ProviderPaymentStatus {
            transaction_id: Some(session_id.to_string()),
            status: session_status(&status, &payment_status),
            raw_status: format!("{}/{}", status, payment_status),
        })
    }

    async fn refund(&self, params: &RefundParams) -> Result<RefundResult, ProviderError> {
        let session_id = self.require_session(params.transaction_id.as_deref())?;
        let session = self.get(&format!("/v1/checkout/sessions/{}", session_id)).await?;
        let payment_intent = str_field(&session, "/payment_intent")?;

        let amount =
            to_minor_units(params.refund_amount).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let form: Vec<(String, String)> = vec![
            ("payment_intent".into(), payment_intent),
            ("amount".into(), amount.to_string()),
            ("reason".into(), "requested_by_customer".into()),
            ("metadata[refund_no]".into(), params.refund_no.clone()),
            ("metadata[reason]".into(), params.reason.clone()),
        ];
        let refund = self
            .post_form("/v1/refunds", &form, Some(&params.refund_no))
            .await?;

        Ok(RefundResult {
            refund_id: str_field(&refund, "/id")?,
            status: opt_str(&refund, "/status").unwrap_or_else(|| "pending".into()),
            amount: refund
                .get("amount")
                .and_then(|v| v.as_i64())
                .map(from_minor_units)
                .unwrap_or(params.refund_amount),
        })
    }

    async fn close_order(
        &self,
        _payment_no: &str,
        transaction_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        let session_id = self.require_session(transaction_id)?;
        self.post_form(
            &format!("/v1/checkout/sessions/{}/expire", session_id),
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    async fn verify_webhook_signature(&self, headers: &WebhookHeaders, body: &[u8]) -> bool {
        let Some(header) = headers.get(HEADER_SIGNATURE) else {
            return false;
        };
        verify_stripe_signature(
            &self.config.webhook_secret,
            header,
            body,
            Utc::now().timestamp(),
        )
    }

    fn parse_notification(&self, body: &[u8]) -> Result<Option<ProviderNotification>, ProviderError> {
        let event: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let event_type = str_field(&event, "/type")?;

        let status = match event_type.as_str() {
            "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
                let payment_status =
                    opt_str(&event, "/data/object/payment_status").unwrap_or_default();
                session_status("complete", &payment_status)
            }
            "checkout.session.expired" => ProviderStatus::Cancelled,
            "checkout.session.async_payment_failed" => ProviderStatus::Failed,
            _ => return Ok(None),
        };

        let object = event.pointer("/data/object").cloned().unwrap_or_default();
        let payment_no = opt_str(&object, "/client_reference_id")
            .or_else(|| opt_str(&object, "/metadata/payment_no"))
            .ok_or_else(|| ProviderError::Decode("missing client_reference_id".into()))?;

        Ok(Some(ProviderNotification {
            payment_no,
            transaction_id: opt_str(&object, "/id"),
            raw_status: event_type,
            status,
            payload: event,
        }))
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            public_key: Some(self.config.publishable_key.clone()),
            client_id: None,
            mode: self.config.mode.as_str().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> StripeHostedAdapter {
        StripeHostedAdapter::new(StripeConfig {
            secret_key: "sk_test_x".into(),
            publishable_key: "pk_test_x".into(),
            webhook_secret: "whsec_test".into(),
            success_url: "https://app.example.com/paid".into(),
            cancel_url: "https://app.example.com/cancel".into(),
            api_base: Some("http://127.0.0.1:9".into()),
            mode: ProviderMode::Sandbox,
        })
    }

    #[test]
    fn test_signature_header() {
        let body = br#"{"type":"checkout.session.completed"}"#;
        let now = 1_700_000_000;
        let mut signed = format!("{}.", now).into_bytes();
        signed.extend_from_slice(body);
        let sig = crypto::hmac_sha256_hex(b"whsec_test", &signed);
        let header = format!("t={},v1={}", now, sig);

        assert!(verify_stripe_signature("whsec_test", &header, body, now + 10));
        assert!(!verify_stripe_signature("whsec_test", &header, body, now + 301));
        assert!(!verify_stripe_signature("whsec_other", &header, body, now));
        assert!(!verify_stripe_signature("whsec_test", "v1=abc", body, now));
    }

    #[test]
    fn test_session_status() {
        assert_eq!(session_status("complete", "paid"), ProviderStatus::Success);
        assert_eq!(session_status("expired", "unpaid"), ProviderStatus::Cancelled);
        assert_eq!(session_status("open", "unpaid"), ProviderStatus::Processing);
    }

    #[test]
    fn test_parse_completed_event() {
        let body = br#"{
            "type": "checkout.session.completed",
            "data": {"object": {"id": "cs_test_1", "client_reference_id": "PAY1", "payment_status": "paid"}}
        }"#;
        let n = adapter().parse_notification(body).unwrap().unwrap();
        assert_eq!(n.payment_no, "PAY1");
        assert_eq!(n.transaction_id.as_deref(), Some("cs_test_1"));
        assert_eq!(n.status, ProviderStatus::Success);

        let other = br#"{"type": "customer.created", "data": {"object": {}}}"#;
        assert!(adapter().parse_notification(other).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_query_requires_session_id() {
        let err = adapter().query_payment("PAY1", None).await.unwrap_err();
        assert!(matches!(err, ProviderError::Decode(_)));
    }

    #[test]
    fn test_client_config_exposes_publishable_key() {
        let config = adapter().client_config();
        assert_eq!(config.public_key.as_deref(), Some("pk_test_x"));
        assert_eq!(config.mode, "sandbox");
    }
}
