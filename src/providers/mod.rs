//! Provider Adapters
//!
//! One adapter per payment method, all behind the [`ProviderAdapter`]
//! capability trait. Adapters translate between the gateway's wire vocabulary
//! and the normalized [`ProviderStatus`]; they never touch persistence.

pub mod alipay;
pub mod balance;
pub mod crypto;
pub mod paddle;
pub mod paypal;
pub mod stripe;
pub mod stub;
pub mod wechat;

pub use alipay::{AlipayConfig, AlipayQrAdapter};
pub use balance::BalanceLedgerAdapter;
pub use paddle::{PaddleConfig, PaddleTransactionAdapter};
pub use paypal::{PayPalConfig, PayPalOrderAdapter};
pub use stripe::{StripeConfig, StripeHostedAdapter};
pub use stub::StubAdapter;
pub use wechat::{WechatConfig, WechatNativeAdapter};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::payment::types::PaymentMethod;

/// Provider-side errors. Never shown to API callers verbatim.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Gateway rejected request [{code}]: {message}")]
    Api { code: String, message: String },

    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientBalance {
        available: Decimal,
        required: Decimal,
    },

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Invalid provider configuration: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Unexpected gateway response: {0}")]
    Decode(String),

    #[error("Unsupported payment method: {0}")]
    Unsupported(String),
}

impl ProviderError {
    /// The gateway definitely did not act on the request.
    ///
    /// Transport failures, 5xx replies and unreadable responses are
    /// ambiguous: the operation may have been applied.
    pub fn is_rejection(&self) -> bool {
        match self {
            ProviderError::Api { code, .. } => !(code.len() == 3 && code.starts_with('5')),
            ProviderError::InsufficientBalance { .. }
            | ProviderError::Config(_)
            | ProviderError::Crypto(_)
            | ProviderError::Unsupported(_) => true,
            ProviderError::Http(_) | ProviderError::Ledger(_) | ProviderError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Http(e.to_string())
    }
}

impl From<crypto::CryptoError> for ProviderError {
    fn from(e: crypto::CryptoError) -> Self {
        ProviderError::Crypto(e.to_string())
    }
}

/// Normalized provider status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Pending,
    Processing,
    Success,
    Cancelled,
    Failed,
    Unknown,
}

/// Gateway mode (sandbox vs live credentials)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    #[default]
    Sandbox,
    Live,
}

impl ProviderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderMode::Sandbox => "sandbox",
            ProviderMode::Live => "live",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatePaymentParams {
    pub amount: Decimal,
    pub currency: String,
    pub description: String,
    pub payment_no: String,
    pub notify_url: String,
    pub return_url: Option<String>,
    pub user_id: String,
    pub order_id: String,
}

/// Provider response to a create call
#[derive(Debug, Clone, Default)]
pub struct CreatedPayment {
    pub transaction_id: Option<String>,
    pub payment_url: Option<String>,
    pub client_secret: Option<String>,
    pub customer_id: Option<String>,
    /// Funds already captured (ledger). Payment goes straight to SUCCESS.
    pub settled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPaymentStatus {
    pub transaction_id: Option<String>,
    pub raw_status: String,
    pub status: ProviderStatus,
}

#[derive(Debug, Clone)]
pub struct RefundParams {
    pub payment_no: String,
    pub transaction_id: Option<String>,
    pub refund_no: String,
    pub currency: String,
    pub total_amount: Decimal,
    pub refund_amount: Decimal,
    pub reason: String,
    pub user_id: String,
    pub order_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundResult {
    pub refund_id: String,
    pub status: String,
    pub amount: Decimal,
}

/// Inbound webhook headers, names lowercased
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders(HashMap<String, String>);

impl WebhookHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

impl From<&axum::http::HeaderMap> for WebhookHeaders {
    fn from(map: &axum::http::HeaderMap) -> Self {
        let mut headers = WebhookHeaders::new();
        for (name, value) in map {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str(), v);
            }
        }
        headers
    }
}

/// Verified webhook, reduced to what reconciliation needs
#[derive(Debug, Clone)]
pub struct ProviderNotification {
    pub payment_no: String,
    pub transaction_id: Option<String>,
    pub raw_status: String,
    pub status: ProviderStatus,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub mode: String,
}

/// Payment gateway capability set
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Adapter name for logging
    fn name(&self) -> &'static str;

    async fn create_one_time_payment(
        &self,
        params: &CreatePaymentParams,
    ) -> Result<CreatedPayment, ProviderError>;

    async fn query_payment(
        &self,
        payment_no: &str,
        transaction_id: Option<&str>,
    ) -> Result<ProviderPaymentStatus, ProviderError>;

    /// Must be idempotent on `refund_no`
    async fn refund(&self, params: &RefundParams) -> Result<RefundResult, ProviderError>;

    async fn close_order(
        &self,
        payment_no: &str,
        transaction_id: Option<&str>,
    ) -> Result<(), ProviderError>;

    async fn verify_webhook_signature(&self, headers: &WebhookHeaders, body: &[u8]) -> bool;

    /// Extract the payment reference and status from a verified body.
    ///
    /// `Ok(None)` for event types that carry no payment status change.
    fn parse_notification(&self, body: &[u8]) -> Result<Option<ProviderNotification>, ProviderError>;

    fn client_config(&self) -> ClientConfig;
}

/// Adapters keyed by payment method, built once by the composition root
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<PaymentMethod, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: PaymentMethod, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(method, adapter);
    }

    pub fn with(mut self, method: PaymentMethod, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(method, adapter);
        self
    }

    pub fn get(&self, method: PaymentMethod) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.adapters
            .get(&method)
            .cloned()
            .ok_or_else(|| ProviderError::Unsupported(method.to_string()))
    }
}

/// Read a JSON body, mapping non-2xx to `ProviderError::Api`
pub(crate) async fn read_json(resp: reqwest::Response) -> Result<serde_json::Value, ProviderError> {
    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| {
                v.get("message")
                    .or_else(|| v.get("error").and_then(|e| e.get("message").or(e.get("detail"))))
                    .and_then(|m| m.as_str().map(str::to_string))
            })
            .unwrap_or(text);
        return Err(ProviderError::Api {
            code: status.as_u16().to_string(),
            message,
        });
    }
    if text.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| ProviderError::Decode(e.to_string()))
}

/// Required string field of a JSON response
pub(crate) fn str_field(value: &serde_json::Value, pointer: &str) -> Result<String, ProviderError> {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ProviderError::Decode(format!("missing {}", pointer)))
}

pub(crate) fn opt_str(value: &serde_json::Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub(crate) fn shared_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_vs_ambiguous() {
        let declined = ProviderError::Api {
            code: "REFUND_REJECTED".into(),
            message: "declined".into(),
        };
        assert!(declined.is_rejection());
        assert!(ProviderError::Unsupported("paddle".into()).is_rejection());

        let unavailable = ProviderError::Api {
            code: "503".into(),
            message: "upstream".into(),
        };
        assert!(!unavailable.is_rejection());
        assert!(!ProviderError::Http("connection reset".into()).is_rejection());
        assert!(!ProviderError::Decode("truncated".into()).is_rejection());
    }

    #[test]
    fn test_headers_case_insensitive() {
        let headers = WebhookHeaders::new().with("Wechatpay-Timestamp", "1700000000");
        assert_eq!(headers.get("wechatpay-timestamp"), Some("1700000000"));
        assert_eq!(headers.get("WECHATPAY-TIMESTAMP"), Some("1700000000"));
        assert!(headers.get("wechatpay-nonce").is_none());
    }

    #[test]
    fn test_registry_unsupported() {
        let registry = ProviderRegistry::new();
        let err = registry.get(PaymentMethod::Paddle).err().unwrap();
        assert!(matches!(err, ProviderError::Unsupported(m) if m == "paddle"));
    }

    #[test]
    fn test_json_pointers() {
        let v = serde_json::json!({"data": {"id": "txn_1", "empty": ""}});
        assert_eq!(str_field(&v, "/data/id").unwrap(), "txn_1");
        assert!(str_field(&v, "/data/missing").is_err());
        assert!(opt_str(&v, "/data/empty").is_none());
    }
}
