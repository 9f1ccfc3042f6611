//! PayPal Orders v2
//!
//! OAuth client-credentials token is cached until shortly before expiry.
//! Webhooks are verified by PayPal's verification API, not locally.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    ClientConfig, CreatePaymentParams, CreatedPayment, ProviderAdapter, ProviderError,
    ProviderMode, ProviderNotification, ProviderPaymentStatus, ProviderStatus, RefundParams,
    RefundResult, WebhookHeaders, opt_str, read_json, str_field,
};
use crate::money::{format_amount, parse_amount};

const SANDBOX_API: &str = "https://api-m.sandbox.paypal.com";
const LIVE_API: &str = "https://api-m.paypal.com";

/// Headers PayPal attaches to every webhook delivery
const VERIFY_HEADERS: [(&str, &str); 5] = [
    ("paypal-auth-algo", "auth_algo"),
    ("paypal-cert-url", "cert_url"),
    ("paypal-transmission-id", "transmission_id"),
    ("paypal-transmission-sig", "transmission_sig"),
    ("paypal-transmission-time", "transmission_time"),
];

#[derive(Debug, Clone, Deserialize)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub webhook_id: String,
    pub return_url: String,
    pub cancel_url: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub mode: ProviderMode,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct PayPalOrderAdapter {
    config: PayPalConfig,
    api_base: String,
    token: Mutex<Option<CachedToken>>,
    http: reqwest::Client,
}

/// Order status -> normalized status
pub fn order_status(raw: &str) -> ProviderStatus {
    match raw {
        "CREATED" | "SAVED" | "PAYER_ACTION_REQUIRED" => ProviderStatus::Pending,
        "APPROVED" => ProviderStatus::Processing,
        "COMPLETED" => ProviderStatus::Success,
        "VOIDED" => ProviderStatus::Cancelled,
        _ => ProviderStatus::Unknown,
    }
}

impl PayPalOrderAdapter {
    pub fn new(config: PayPalConfig) -> Self {
        let api_base = config.api_base.clone().unwrap_or_else(|| match config.mode {
            ProviderMode::Live => LIVE_API.to_string(),
            ProviderMode::Sandbox => SANDBOX_API.to_string(),
        });
        Self {
            config,
            api_base,
            token: Mutex::new(None),
            http: super::shared_http_client(),
        }
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.token.clone());
            }
        }

        let resp = self
            .http
            .post(format!("{}/v1/oauth2/token", self.api_base))
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body("grant_type=client_credentials")
            .send()
            .await?;
        let body = read_json(resp).await?;
        let token = str_field(&body, "/access_token")?;
        let expires_in = body.get("expires_in").and_then(|v| v.as_u64()).unwrap_or(300);

        *cached = Some(CachedToken {
            token: token.clone(),
            // refresh one minute early
            expires_at: Instant::now() + Duration::from_secs(expires_in.saturating_sub(60)),
        });
        Ok(token)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
        request_id: Option<&str>,
    ) -> Result<serde_json::Value, ProviderError> {
        let token = self.access_token().await?;
        let mut req = self
            .http
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(token);
        if let Some(id) = request_id {
            req = req.header("PayPal-Request-Id", id);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        read_json(req.send().await?).await
    }

    fn require_order<'a>(&self, transaction_id: Option<&'a str>) -> Result<&'a str, ProviderError> {
        transaction_id.ok_or_else(|| ProviderError::Decode("paypal order id not recorded".into()))
    }
}

#[async_trait]
impl ProviderAdapter for PayPalOrderAdapter {
    fn name(&self) -> &'static str {
        "paypal"
    }

    async fn create_one_time_payment(
        &self,
        params: &CreatePaymentParams,
    ) -> Result<CreatedPayment, ProviderError> {
        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": params.payment_no,
                "custom_id": params.payment_no,
                "description": params.description,
                "amount": {
                    "currency_code": params.currency,
                    "value": format_amount(params.amount),
                },
            }],
            "application_context": {
                "return_url": params.return_url.clone().unwrap_or_else(|| self.config.return_url.clone()),
                "cancel_url": self.config.cancel_url,
                "user_action": "PAY_NOW",
            },
        });

        let order = self
            .send(
                reqwest::Method::POST,
                "/v2/checkout/orders",
                Some(body),
                Some(&params.payment_no),
            )
            .await?;

        let approve_url = order
            .get("links")
            .and_then(|l| l.as_array())
            .and_then(|links| {
                links.iter().find(|l| {
                    matches!(
                        l.get("rel").and_then(|r| r.as_str()),
                        Some("approve") | Some("payer-action")
                    )
                })
            })
            .and_then(|l| opt_str(l, "/href"));
        debug!(payment_no = %params.payment_no, "PayPal order created");

        Ok(CreatedPayment {
            transaction_id: Some(str_field(&order, "/id")?),
            payment_url: approve_url,
            ..Default::default()
        })
    }

    async fn query_payment(
        &self,
        _payment_no: &str,
        transaction_id: Option<&str>,
    ) -> Result<ProviderPaymentStatus, ProviderError> {
        let order_id = self.require_order(transaction_id)?;
        let order = self
            .send(
                reqwest::Method::GET,
                &format!("/v2/checkout/orders/{}", order_id),
                None,
                None,
            )
            .await?;
        let raw_status = str_field(&order, "/status")?;

        Ok(ProviderPaymentStatus {
            transaction_id: Some(order_id.to_string()),
            status: order_status(&raw_status),
            raw_status,
        })
    }

    async fn refund(&self, params: &RefundParams) -> Result<RefundResult, ProviderError> {
        let order_id = self.require_order(params.transaction_id.as_deref())?;
        let order = self
            .send(
                reqwest::Method::GET,
                &format!("/v2/checkout/orders/{}", order_id),
                None,
                None,
            )
            .await?;
        let capture_id = str_field(&order, "/purchase_units/0/payments/captures/0/id")
            .map_err(|_| ProviderError::Decode("no capture found for order".into()))?;

        let body = json!({
            "amount": {
                "value": format_amount(params.refund_amount),
                "currency_code": params.currency,
            },
            "invoice_id": params.refund_no,
            "note_to_payer": params.reason,
        });
        let refund = self
            .send(
                reqwest::Method::POST,
                &format!("/v2/payments/captures/{}/refund", capture_id),
                Some(body),
                Some(&params.refund_no),
            )
            .await?;

        Ok(RefundResult {
            refund_id: str_field(&refund, "/id")?,
            status: opt_str(&refund, "/status").unwrap_or_else(|| "PENDING".into()),
            amount: opt_str(&refund, "/amount/value")
                .and_then(|v| parse_amount(&v).ok())
                .unwrap_or(params.refund_amount),
        })
    }

    /// Unapproved orders expire on their own
    async fn close_order(
        &self,
        payment_no: &str,
        _transaction_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        debug!(payment_no, "PayPal orders auto-expire; nothing to close");
        Ok(())
    }

    async fn verify_webhook_signature(&self, headers: &WebhookHeaders, body: &[u8]) -> bool {
        let Ok(event) = serde_json::from_slice::<serde_json::Value>(body) else {
            return false;
        };

        let mut request = serde_json::Map::new();
        for (header, field) in VERIFY_HEADERS {
            let Some(value) = headers.get(header) else {
                warn!(header, "PayPal webhook missing verification header");
                return false;
            };
            request.insert(field.to_string(), json!(value));
        }
        request.insert("webhook_id".into(), json!(self.config.webhook_id));
        request.insert("webhook_event".into(), event);

        match self
            .send(
                reqwest::Method::POST,
                "/v1/notifications/verify-webhook-signature",
                Some(serde_json::Value::Object(request)),
                None,
            )
            .await
        {
            Ok(resp) => opt_str(&resp, "/verification_status").as_deref() == Some("SUCCESS"),
            Err(e) => {
                warn!(error = %e, "PayPal webhook verification call failed");
                false
            }
        }
    }

    fn parse_notification(&self, body: &[u8]) -> Result<Option<ProviderNotification>, ProviderError> {
        let event: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let event_type = str_field(&event, "/event_type")?;

        let (status, payment_no, transaction_id) = match event_type.as_str() {
            "CHECKOUT.ORDER.COMPLETED" | "CHECKOUT.ORDER.VOIDED" | "CHECKOUT.ORDER.APPROVED" => {
                let status = match event_type.as_str() {
                    "CHECKOUT.ORDER.COMPLETED" => ProviderStatus::Success,
                    "CHECKOUT.ORDER.VOIDED" => ProviderStatus::Cancelled,
                    _ => ProviderStatus::Processing,
                };
                (
                    status,
                    opt_str(&event, "/resource/purchase_units/0/reference_id"),
                    opt_str(&event, "/resource/id"),
                )
            }
            "PAYMENT.CAPTURE.COMPLETED" => (
                ProviderStatus::Success,
                opt_str(&event, "/resource/custom_id"),
                opt_str(&event, "/resource/supplementary_data/related_ids/order_id"),
            ),
            _ => return Ok(None),
        };

        let payment_no =
            payment_no.ok_or_else(|| ProviderError::Decode("missing payment reference".into()))?;

        Ok(Some(ProviderNotification {
            payment_no,
            transaction_id,
            raw_status: event_type,
            status,
            payload: event,
        }))
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            public_key: None,
            client_id: Some(self.config.client_id.clone()),
            mode: self.config.mode.as_str().to_string(),
        }
    }
}
