//! Alipay open API (precreate / QR code)
//!
//! Every request is an RSA2-signed form posted to the gateway. Notifications
//! arrive as `application/x-www-form-urlencoded` and are verified against the
//! Alipay public key over the sorted `k=v&...` string.

use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

use super::crypto::{self, parse_private_key, parse_public_key};
use super::{
    ClientConfig, CreatePaymentParams, CreatedPayment, ProviderAdapter, ProviderError,
    ProviderMode, ProviderNotification, ProviderPaymentStatus, RefundParams, RefundResult,
    WebhookHeaders, opt_str, read_json, str_field,
};
use crate::money::{format_amount, parse_amount};
use crate::payment::reconcile::map_trade_state;

const DEFAULT_GATEWAY: &str = "https://openapi.alipay.com/gateway.do";
const SANDBOX_GATEWAY: &str = "https://openapi-sandbox.dl.alipaydev.com/gateway.do";
const SUCCESS_CODE: &str = "10000";

#[derive(Debug, Clone, Deserialize)]
pub struct AlipayConfig {
    pub app_id: String,
    /// Application private key (PEM or bare base64)
    pub private_key: String,
    /// Alipay public key used to verify responses and notifications
    pub alipay_public_key: String,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub mode: ProviderMode,
}

pub struct AlipayQrAdapter {
    config: AlipayConfig,
    gateway: String,
    private_key: RsaPrivateKey,
    alipay_key: RsaPublicKey,
    http: reqwest::Client,
}

impl AlipayQrAdapter {
    pub fn new(config: AlipayConfig) -> Result<Self, ProviderError> {
        let private_key = parse_private_key(&config.private_key)
            .map_err(|e| ProviderError::Config(format!("alipay private_key: {}", e)))?;
        let alipay_key = parse_public_key(&config.alipay_public_key)
            .map_err(|e| ProviderError::Config(format!("alipay_public_key: {}", e)))?;
        let gateway = config.gateway.clone().unwrap_or_else(|| match config.mode {
            ProviderMode::Live => DEFAULT_GATEWAY.to_string(),
            ProviderMode::Sandbox => SANDBOX_GATEWAY.to_string(),
        });

        Ok(Self {
            config,
            gateway,
            private_key,
            alipay_key,
            http: super::shared_http_client(),
        })
    }

    /// Call an open API method and return its `<method>_response` object
    async fn call(
        &self,
        method: &str,
        biz_content: serde_json::Value,
        notify_url: Option<&str>,
    ) -> Result<serde_json::Value, ProviderError> {
        let beijing = FixedOffset::east_opt(8 * 3600)
            .ok_or_else(|| ProviderError::Config("timezone".into()))?;
        let timestamp = Utc::now()
            .with_timezone(&beijing)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();

        let mut params: BTreeMap<String, String> = BTreeMap::new();
        params.insert("app_id".into(), self.config.app_id.clone());
        params.insert("method".into(), method.to_string());
        params.insert("format".into(), "JSON".into());
        params.insert("charset".into(), "utf-8".into());
        params.insert("sign_type".into(), "RSA2".into());
        params.insert("timestamp".into(), timestamp);
        params.insert("version".into(), "1.0".into());
        params.insert("biz_content".into(), biz_content.to_string());
        if let Some(url) = notify_url {
            params.insert("notify_url".into(), url.to_string());
        }

        let sign = crypto::sign_rsa_sha256(&self.private_key, signing_string(&params, false).as_bytes())?;
        params.insert("sign".into(), sign);

        let form = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter())
            .finish();

        let resp = self
            .http
            .post(&self.gateway)
            .header(
                "Content-Type",
                "application/x-www-form-urlencoded;charset=utf-8",
            )
            .body(form)
            .send()
            .await?;
        let body = read_json(resp).await?;

        let key = format!("{}_response", method.replace('.', "_"));
        let response = body
            .get(&key)
            .cloned()
            .ok_or_else(|| ProviderError::Decode(format!("missing {}", key)))?;

        let code = opt_str(&response, "/code").unwrap_or_default();
        if code != SUCCESS_CODE {
            let message = opt_str(&response, "/sub_msg")
                .or_else(|| opt_str(&response, "/msg"))
                .unwrap_or_default();
            return Err(ProviderError::Api { code, message });
        }
        Ok(response)
    }
}

/// Sorted `k=v&k=v`, skipping empty values and `sign` (and `sign_type` when
/// verifying a notification)
pub fn signing_string(params: &BTreeMap<String, String>, exclude_sign_type: bool) -> String {
    params
        .iter()
        .filter(|(k, v)| {
            !v.is_empty() && k.as_str() != "sign" && !(exclude_sign_type && k.as_str() == "sign_type")
        })
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Decode a form-encoded notification body
pub fn parse_form(body: &[u8]) -> BTreeMap<String, String> {
    url::form_urlencoded::parse(body).into_owned().collect()
}

#[async_trait]
impl ProviderAdapter for AlipayQrAdapter {
    fn name(&self) -> &'static str {
        "alipay"
    }

    async fn create_one_time_payment(
        &self,
        params: &CreatePaymentParams,
    ) -> Result<CreatedPayment, ProviderError> {
        let biz = json!({
            "out_trade_no": params.payment_no,
            "total_amount": format_amount(params.amount),
            "subject": params.description,
        });
        let resp = self
            .call("alipay.trade.precreate", biz, Some(&params.notify_url))
            .await?;
        debug!(payment_no = %params.payment_no, "Alipay precreate accepted");

        Ok(CreatedPayment {
            payment_url: Some(str_field(&resp, "/qr_code")?),
            ..Default::default()
        })
    }

    async fn query_payment(
        &self,
        payment_no: &str,
        _transaction_id: Option<&str>,
    ) -> Result<ProviderPaymentStatus, ProviderError> {
        let resp = self
            .call("alipay.trade.query", json!({ "out_trade_no": payment_no }), None)
            .await?;
        let raw_status = str_field(&resp, "/trade_status")?;

        Ok(ProviderPaymentStatus {
            transaction_id: opt_str(&resp, "/trade_no"),
            status: map_trade_state(&raw_status),
            raw_status,
        })
    }

    async fn refund(&self, params: &RefundParams) -> Result<RefundResult, ProviderError> {
        let biz = json!({
            "out_trade_no": params.payment_no,
            "refund_amount": format_amount(params.refund_amount),
            "refund_reason": params.reason,
            "out_request_no": params.refund_no,
        });
        let resp = self.call("alipay.trade.refund", biz, None).await?;

        let amount = opt_str(&resp, "/refund_fee")
            .and_then(|s| parse_amount(&s).ok())
            .unwrap_or(params.refund_amount);
        let status = match opt_str(&resp, "/fund_change").as_deref() {
            Some("Y") => "SUCCESS",
            _ => "PROCESSING",
        };

        Ok(RefundResult {
            refund_id: opt_str(&resp, "/trade_no").unwrap_or_else(|| params.refund_no.clone()),
            status: status.to_string(),
            amount,
        })
    }

    async fn close_order(
        &self,
        payment_no: &str,
        _transaction_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        self.call("alipay.trade.close", json!({ "out_trade_no": payment_no }), None)
            .await?;
        Ok(())
    }

    async fn verify_webhook_signature(&self, _headers: &WebhookHeaders, body: &[u8]) -> bool {
        let params = parse_form(body);
        let Some(sign) = params.get("sign") else {
            return false;
        };
        let message = signing_string(&params, true);
        crypto::verify_rsa_sha256(&self.alipay_key, message.as_bytes(), sign)
    }

    fn parse_notification(&self, body: &[u8]) -> Result<Option<ProviderNotification>, ProviderError> {
        let params = parse_form(body);
        let payment_no = params
            .get("out_trade_no")
            .cloned()
            .ok_or_else(|| ProviderError::Decode("missing out_trade_no".into()))?;
        let raw_status = params.get("trade_status").cloned().unwrap_or_default();
        let payload = serde_json::to_value(&params).map_err(|e| ProviderError::Decode(e.to_string()))?;

        Ok(Some(ProviderNotification {
            payment_no,
            transaction_id: params.get("trade_no").cloned(),
            status: map_trade_state(&raw_status),
            raw_status,
            payload,
        }))
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            public_key: None,
            client_id: Some(self.config.app_id.clone()),
            mode: self.config.mode.as_str().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderStatus;
    use crate::providers::crypto::test_keys::generate_pem_pair;

    fn adapter() -> (AlipayQrAdapter, RsaPrivateKey) {
        let (app_private, _) = generate_pem_pair();
        let (alipay_private, alipay_public) = generate_pem_pair();
        let adapter = AlipayQrAdapter::new(AlipayConfig {
            app_id: "2021000000000000".into(),
            private_key: app_private,
            alipay_public_key: alipay_public,
            gateway: Some("http://127.0.0.1:9/gateway.do".into()),
            mode: ProviderMode::Sandbox,
        })
        .unwrap();
        (adapter, parse_private_key(&alipay_private).unwrap())
    }

    fn signed_form(key: &RsaPrivateKey, pairs: &[(&str, &str)]) -> Vec<u8> {
        let params: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let sign = crypto::sign_rsa_sha256(key, signing_string(&params, true).as_bytes()).unwrap();
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter())
            .append_pair("sign", &sign)
            .append_pair("sign_type", "RSA2")
            .finish()
            .into_bytes()
    }

    #[test]
    fn test_signing_string_sorted_and_filtered() {
        let mut params = BTreeMap::new();
        params.insert("trade_status".to_string(), "TRADE_SUCCESS".to_string());
        params.insert("app_id".to_string(), "2021".to_string());
        params.insert("sign".to_string(), "xxx".to_string());
        params.insert("sign_type".to_string(), "RSA2".to_string());
        params.insert("body".to_string(), "".to_string());

        assert_eq!(signing_string(&params, true), "app_id=2021&trade_status=TRADE_SUCCESS");
        assert_eq!(
            signing_string(&params, false),
            "app_id=2021&sign_type=RSA2&trade_status=TRADE_SUCCESS"
        );
    }

    #[tokio::test]
    async fn test_verify_notification() {
        let (adapter, alipay_key) = adapter();
        let body = signed_form(
            &alipay_key,
            &[
                ("out_trade_no", "PAY17000000000001234"),
                ("trade_no", "2024010122001"),
                ("trade_status", "TRADE_SUCCESS"),
                ("total_amount", "99.99"),
            ],
        );
        let headers = WebhookHeaders::new();
        assert!(adapter.verify_webhook_signature(&headers, &body).await);

        let mut tampered = String::from_utf8(body.clone()).unwrap();
        tampered = tampered.replace("99.99", "0.01");
        assert!(!adapter.verify_webhook_signature(&headers, tampered.as_bytes()).await);
        assert!(!adapter.verify_webhook_signature(&headers, b"out_trade_no=PAY1").await);
    }

    #[test]
    fn test_parse_notification() {
        let (adapter, _) = adapter();
        let body = b"out_trade_no=PAY1&trade_no=T1&trade_status=TRADE_CLOSED";
        let n = adapter.parse_notification(body).unwrap().unwrap();
        assert_eq!(n.payment_no, "PAY1");
        assert_eq!(n.transaction_id.as_deref(), Some("T1"));
        assert_eq!(n.status, ProviderStatus::Cancelled);
        assert_eq!(n.payload["trade_status"], "TRADE_CLOSED");

        assert!(adapter.parse_notification(b"trade_status=TRADE_SUCCESS").is_err());
    }
}
