//! WeChat Pay v3 (Native / QR code)
//!
//! Requests are signed with the merchant RSA key and carry a
//! `WECHATPAY2-SHA256-RSA2048` authorization header. Notifications are signed
//! by the platform key over `timestamp\nnonce\nbody\n`.

use async_trait::async_trait;
use chrono::Utc;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::crypto::{self, parse_private_key, parse_public_key};
use super::{
    ClientConfig, CreatePaymentParams, CreatedPayment, ProviderAdapter, ProviderError,
    ProviderMode, ProviderNotification, ProviderPaymentStatus, RefundParams, RefundResult,
    WebhookHeaders, opt_str, read_json, str_field,
};
use crate::money::{from_minor_units, to_minor_units};
use crate::payment::reconcile::map_trade_state;

pub const HEADER_TIMESTAMP: &str = "wechatpay-timestamp";
pub const HEADER_NONCE: &str = "wechatpay-nonce";
pub const HEADER_SIGNATURE: &str = "wechatpay-signature";

const DEFAULT_API_BASE: &str = "https://api.mch.weixin.qq.com";

#[derive(Debug, Clone, Deserialize)]
pub struct WechatConfig {
    pub app_id: String,
    pub mch_id: String,
    /// Serial number of the merchant API certificate
    pub serial_no: String,
    /// Merchant private key (PEM or bare base64)
    pub private_key: String,
    /// WeChat Pay platform public key used to verify notifications
    pub platform_public_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub mode: ProviderMode,
}

pub struct WechatNativeAdapter {
    config: WechatConfig,
    api_base: String,
    private_key: RsaPrivateKey,
    platform_key: RsaPublicKey,
    http: reqwest::Client,
}

impl WechatNativeAdapter {
    pub fn new(config: WechatConfig) -> Result<Self, ProviderError> {
        let private_key = parse_private_key(&config.private_key)
            .map_err(|e| ProviderError::Config(format!("wechat private_key: {}", e)))?;
        let platform_key = parse_public_key(&config.platform_public_key)
            .map_err(|e| ProviderError::Config(format!("wechat platform_public_key: {}", e)))?;
        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        Ok(Self {
            config,
            api_base,
            private_key,
            platform_key,
            http: super::shared_http_client(),
        })
    }

    /// `WECHATPAY2-SHA256-RSA2048` header over `METHOD\nPATH\nTS\nNONCE\nBODY\n`
    fn authorization(&self, method: &str, path: &str, body: &str) -> Result<String, ProviderError> {
        let timestamp = Utc::now().timestamp();
        let nonce = crypto::nonce(32);
        let message = format!("{}\n{}\n{}\n{}\n{}\n", method, path, timestamp, nonce, body);
        let signature = crypto::sign_rsa_sha256(&self.private_key, message.as_bytes())?;

        Ok(format!(
            "WECHATPAY2-SHA256-RSA2048 mchid=\"{}\",nonce_str=\"{}\",signature=\"{}\",timestamp=\"{}\",serial_no=\"{}\"",
            self.config.mch_id, nonce, signature, timestamp, self.config.serial_no
        ))
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ProviderError> {
        let body_str = body.as_ref().map(|b| b.to_string()).unwrap_or_default();
        let auth = self.authorization(method.as_str(), path, &body_str)?;

        let mut req = self
            .http
            .request(method, format!("{}{}", self.api_base, path))
            .header("Authorization", auth)
            .header("Accept", "application/json");
        if body.is_some() {
            req = req
                .header("Content-Type", "application/json")
                .body(body_str);
        }

        let resp = req.send().await?;
        read_json(resp).await
    }
}

#[async_trait]
impl ProviderAdapter for WechatNativeAdapter {
    fn name(&self) -> &'static str {
        "wechat"
    }

    async fn create_one_time_payment(
        &self,
        params: &CreatePaymentParams,
    ) -> Result<CreatedPayment, ProviderError> {
        let total = to_minor_units(params.amount).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let body = json!({
            "appid": self.config.app_id,
            "mchid": self.config.mch_id,
            "description": params.description,
            "out_trade_no": params.payment_no,
            "notify_url": params.notify_url,
            "amount": { "total": total, "currency": params.currency },
        });

        let resp = self
            .call(reqwest::Method::POST, "/v3/pay/transactions/native", Some(body))
            .await?;
        let code_url = str_field(&resp, "/code_url")?;
        debug!(payment_no = %params.payment_no, "WeChat native order created");

        Ok(CreatedPayment {
            payment_url: Some(code_url),
            ..Default::default()
        })
    }

    async fn query_payment(
        &self,
        payment_no: &str,
        _transaction_id: Option<&str>,
    ) -> Result<ProviderPaymentStatus, ProviderError> {
        let path = format!(
            "/v3/pay/transactions/out-trade-no/{}?mchid={}",
            payment_no, self.config.mch_id
        );
        let resp = self.call(reqwest::Method::GET, &path, None).await?;
        let raw_status = str_field(&resp, "/trade_state")?;

        Ok(ProviderPaymentStatus {
            transaction_id: opt_str(&resp, "/transaction_id"),
            status: map_trade_state(&raw_status),
            raw_status,
        })
    }

    async fn refund(&self, params: &RefundParams) -> Result<RefundResult, ProviderError> {
        let total =
            to_minor_units(params.total_amount).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let refund =
            to_minor_units(params.refund_amount).map_err(|e| ProviderError::Decode(e.to_string()))?;
        let body = json!({
            "out_trade_no": params.payment_no,
            "out_refund_no": params.refund_no,
            "reason": params.reason,
            "amount": { "refund": refund, "total": total, "currency": params.currency },
        });

        let resp = self
            .call(reqwest::Method::POST, "/v3/refund/domestic/refunds", Some(body))
            .await?;

        let amount = resp
            .pointer("/amount/refund")
            .and_then(|v| v.as_i64())
            .map(from_minor_units)
            .unwrap_or(params.refund_amount);

        Ok(RefundResult {
            refund_id: str_field(&resp, "/refund_id")?,
            status: opt_str(&resp, "/status").unwrap_or_else(|| "PROCESSING".to_string()),
            amount,
        })
    }

    async fn close_order(
        &self,
        payment_no: &str,
        _transaction_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        let path = format!("/v3/pay/transactions/out-trade-no/{}/close", payment_no);
        self.call(
            reqwest::Method::POST,
            &path,
            Some(json!({ "mchid": self.config.mch_id })),
        )
        .await?;
        Ok(())
    }

    async fn verify_webhook_signature(&self, headers: &WebhookHeaders, body: &[u8]) -> bool {
        let (Some(timestamp), Some(nonce), Some(signature)) = (
            headers.get(HEADER_TIMESTAMP),
            headers.get(HEADER_NONCE),
            headers.get(HEADER_SIGNATURE),
        ) else {
            warn!("WeChat notification missing signature headers");
            return false;
        };

        let mut message = Vec::with_capacity(body.len() + 64);
        message.extend_from_slice(timestamp.as_bytes());
        message.push(b'\n');
        message.extend_from_slice(nonce.as_bytes());
        message.push(b'\n');
        message.extend_from_slice(body);
        message.push(b'\n');

        crypto::verify_rsa_sha256(&self.platform_key, &message, signature)
    }

    fn parse_notification(&self, body: &[u8]) -> Result<Option<ProviderNotification>, ProviderError> {
        parse_trade_notification(body)
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            public_key: None,
            client_id: Some(self.config.app_id.clone()),
            mode: self.config.mode.as_str().to_string(),
        }
    }
}

/// `{"resource": {"out_trade_no", "trade_state", "transaction_id"}}`
pub(crate) fn parse_trade_notification(
    body: &[u8],
) -> Result<Option<ProviderNotification>, ProviderError> {
    let payload: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| ProviderError::Decode(e.to_string()))?;
    let resource = payload.get("resource").unwrap_or(&payload);

    let payment_no = str_field(resource, "/out_trade_no")?;
    let raw_status = opt_str(resource, "/trade_state")
        .or_else(|| opt_str(resource, "/trade_status"))
        .unwrap_or_default();

    Ok(Some(ProviderNotification {
        payment_no,
        transaction_id: opt_str(resource, "/transaction_id").or_else(|| opt_str(resource, "/trade_no")),
        status: map_trade_state(&raw_status),
        raw_status,
        payload,
    }))
}
