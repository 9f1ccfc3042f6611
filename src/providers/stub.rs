//! Stub gateway
//!
//! Selected by the composition root for any method without credentials, and
//! used by the test suites. Accepts every create call, reports a configurable
//! status on poll and verifies webhooks with `X-Stub-Signature:
//! hex(HMAC-SHA256(secret, body))`. Notifications use the WeChat/Alipay trade
//! shape (`out_trade_no`, `trade_state`/`trade_status`).

use async_trait::async_trait;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use super::crypto;
use super::wechat::parse_trade_notification;
use super::{
    ClientConfig, CreatePaymentParams, CreatedPayment, ProviderAdapter, ProviderError,
    ProviderNotification, ProviderPaymentStatus, RefundParams, RefundResult, WebhookHeaders,
};
use crate::payment::reconcile::map_trade_state;

pub const HEADER_SIGNATURE: &str = "x-stub-signature";

pub struct StubAdapter {
    name: &'static str,
    secret: String,
    /// Raw trade state returned by `query_payment`
    query_state: Mutex<String>,
    fail_create: Mutex<bool>,
    fail_query: Mutex<bool>,
    fail_refund: Mutex<bool>,
    /// Refund errors out like a dropped connection
    lose_refund_response: Mutex<bool>,
    /// Applied after the refund is recorded, before replying
    refund_delay: Mutex<Option<Duration>>,
    fail_close: Mutex<bool>,
    create_count: AtomicUsize,
    query_count: AtomicUsize,
    refund_count: AtomicUsize,
    close_count: AtomicUsize,
    refund_nos: Mutex<Vec<String>>,
}

impl StubAdapter {
    pub fn new(name: &'static str, secret: impl Into<String>) -> Self {
        Self {
            name,
            secret: secret.into(),
            query_state: Mutex::new("NOTPAY".to_string()),
            fail_create: Mutex::new(false),
            fail_query: Mutex::new(false),
            fail_refund: Mutex::new(false),
            lose_refund_response: Mutex::new(false),
            refund_delay: Mutex::new(None),
            fail_close: Mutex::new(false),
            create_count: AtomicUsize::new(0),
            query_count: AtomicUsize::new(0),
            refund_count: AtomicUsize::new(0),
            close_count: AtomicUsize::new(0),
            refund_nos: Mutex::new(Vec::new()),
        }
    }

    /// Signature header value a caller must send for `body`
    pub fn sign(&self, body: &[u8]) -> String {
        crypto::hmac_sha256_hex(self.secret.as_bytes(), body)
    }

    pub fn set_query_state(&self, state: &str) {
        if let Ok(mut s) = self.query_state.lock() {
            *s = state.to_string();
        }
    }

    pub fn set_fail_create(&self, fail: bool) {
        set(&self.fail_create, fail);
    }

    pub fn set_fail_query(&self, fail: bool) {
        set(&self.fail_query, fail);
    }

    pub fn set_fail_refund(&self, fail: bool) {
        set(&self.fail_refund, fail);
    }

    /// The refund is recorded but the caller sees a transport error
    pub fn set_lose_refund_response(&self, lose: bool) {
        set(&self.lose_refund_response, lose);
    }

    pub fn set_refund_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.refund_delay.lock() {
            *d = Some(delay);
        }
    }

    pub fn set_fail_close(&self, fail: bool) {
        set(&self.fail_close, fail);
    }

    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.query_count.load(Ordering::SeqCst)
    }

    pub fn refund_count(&self) -> usize {
        self.refund_count.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Refund numbers seen, in call order
    pub fn refund_nos(&self) -> Vec<String> {
        self.refund_nos.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

fn set(flag: &Mutex<bool>, value: bool) {
    if let Ok(mut f) = flag.lock() {
        *f = value;
    }
}

fn get(flag: &Mutex<bool>) -> bool {
    flag.lock().map(|f| *f).unwrap_or(false)
}

#[async_trait]
impl ProviderAdapter for StubAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn create_one_time_payment(
        &self,
        params: &CreatePaymentParams,
    ) -> Result<CreatedPayment, ProviderError> {
        self.create_count.fetch_add(1, Ordering::SeqCst);
        if get(&self.fail_create) {
            return Err(ProviderError::Api {
                code: "SYSTEM_ERROR".into(),
                message: "stub gateway unavailable".into(),
            });
        }
        debug!(provider = self.name, payment_no = %params.payment_no, "Stub payment created");

        Ok(CreatedPayment {
            transaction_id: Some(format!("STUB-{}", params.payment_no)),
            payment_url: Some(format!("stub://{}/pay/{}", self.name, params.payment_no)),
            ..Default::default()
        })
    }

    async fn query_payment(
        &self,
        payment_no: &str,
        _transaction_id: Option<&str>,
    ) -> Result<ProviderPaymentStatus, ProviderError> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        if get(&self.fail_query) {
            return Err(ProviderError::Http("stub query timeout".into()));
        }
        let raw_status = self
            .query_state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();

        Ok(ProviderPaymentStatus {
            transaction_id: Some(format!("STUB-TX-{}", payment_no)),
            status: map_trade_state(&raw_status),
            raw_status,
        })
    }

    async fn refund(&self, params: &RefundParams) -> Result<RefundResult, ProviderError> {
        self.refund_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut nos) = self.refund_nos.lock() {
            nos.push(params.refund_no.clone());
        }
        if get(&self.fail_refund) {
            return Err(ProviderError::Api {
                code: "REFUND_REJECTED".into(),
                message: "stub refund rejected".into(),
            });
        }
        let delay = self.refund_delay.lock().map(|d| *d).unwrap_or(None);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if get(&self.lose_refund_response) {
            return Err(ProviderError::Http("stub refund connection reset".into()));
        }

        Ok(RefundResult {
            refund_id: format!("STUB-RF-{}", params.refund_no),
            status: "SUCCESS".into(),
            amount: params.refund_amount,
        })
    }

    async fn close_order(
        &self,
        _payment_no: &str,
        _transaction_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        if get(&self.fail_close) {
            return Err(ProviderError::Http("stub close failed".into()));
        }
        Ok(())
    }

    async fn verify_webhook_signature(&self, headers: &WebhookHeaders, body: &[u8]) -> bool {
        headers
            .get(HEADER_SIGNATURE)
            .is_some_and(|sig| crypto::verify_hmac_sha256_hex(self.secret.as_bytes(), body, sig))
    }

    fn parse_notification(&self, body: &[u8]) -> Result<Option<ProviderNotification>, ProviderError> {
        parse_trade_notification(body)
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            mode: "stub".into(),
            ..Default::default()
        }
    }
}
