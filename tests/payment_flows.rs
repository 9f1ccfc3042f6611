//! End-to-end payment flows over HTTP
//!
//! Serves the real router on an ephemeral port backed by the in-memory store,
//! stub gateways and the in-memory ledger.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use billing_payments::alerts::RecordingAlertSink;
use billing_payments::gateway::{self, AppState};
use billing_payments::ledger::InMemoryLedger;
use billing_payments::payment::{
    InMemoryStore, Order, OrderRepository, OrderStatus, PaymentLifecycleService, PaymentMethod,
    PaymentSettings,
};
use billing_payments::providers::{BalanceLedgerAdapter, ProviderRegistry, StubAdapter};
use billing_payments::saga::{InlineSagaRunner, RunnerConfig};

const ORDER_ID: &str = "order-123";
const USER_ID: &str = "user-123";

struct TestServer {
    base: String,
    http: reqwest::Client,
    store: Arc<InMemoryStore>,
    wechat: Arc<StubAdapter>,
    alipay: Arc<StubAdapter>,
    ledger: Arc<InMemoryLedger>,
}

impl TestServer {
    async fn start() -> Self {
        let store = Arc::new(InMemoryStore::new());
        store.insert_order(Order::new_pending(ORDER_ID, USER_ID, dec!(99.99)));

        let wechat = Arc::new(StubAdapter::new("wechat", "wechat-secret"));
        let alipay = Arc::new(StubAdapter::new("alipay", "alipay-secret"));
        let ledger = Arc::new(InMemoryLedger::new());
        let runner = Arc::new(InlineSagaRunner::new(RunnerConfig {
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        }));

        let providers = ProviderRegistry::new()
            .with(PaymentMethod::Wechat, wechat.clone())
            .with(PaymentMethod::Alipay, alipay.clone())
            .with(
                PaymentMethod::Balance,
                Arc::new(BalanceLedgerAdapter::new(ledger.clone())),
            );

        let service = Arc::new(PaymentLifecycleService::new(
            store.clone(),
            store.clone(),
            providers,
            runner.clone(),
            Arc::new(RecordingAlertSink::new()),
            PaymentSettings {
                api_gateway_url: "https://api.example.com".into(),
                ..Default::default()
            },
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(AppState::new(service, runner));
        tokio::spawn(async move {
            gateway::serve(listener, state).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            http: reqwest::Client::new(),
            store,
            wechat,
            alipay,
            ledger,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn create(&self, method: &str, amount: &str) -> (u16, Value) {
        let resp = self
            .http
            .post(self.url("/api/billing/payments"))
            .header("x-user-id", USER_ID)
            .json(&json!({"orderId": ORDER_ID, "method": method, "amount": amount}))
            .send()
            .await
            .unwrap();
        (resp.status().as_u16(), resp.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self.http.get(self.url(path)).send().await.unwrap();
        (resp.status().as_u16(), resp.json().await.unwrap())
    }

    async fn wechat_notify(&self, payment_no: &str, trade_state: &str) -> (u16, String) {
        let body = format!(
            r#"{{"resource":{{"out_trade_no":"{}","trade_state":"{}","transaction_id":"4200009"}}}}"#,
            payment_no, trade_state
        );
        let resp = self
            .http
            .post(self.url("/api/billing/payments/notify/wechat"))
            .header("x-stub-signature", self.wechat.sign(body.as_bytes()))
            .body(body)
            .send()
            .await
            .unwrap();
        (resp.status().as_u16(), resp.text().await.unwrap())
    }

    async fn order_status(&self) -> OrderStatus {
        self.store.find_order(ORDER_ID).await.unwrap().unwrap().status
    }

    async fn wait_saga(&self, saga_id: &str) -> Value {
        for _ in 0..200 {
            let (_, body) = self
                .get(&format!("/api/billing/payments/sagas/{}", saga_id))
                .await;
            if body["data"]["status"] != "RUNNING" {
                return body["data"].clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("saga {} did not finish", saga_id);
    }
}

#[tokio::test]
async fn test_wechat_payment_settles_via_webhook() {
    let server = TestServer::start().await;

    let (status, body) = server.create("wechat", "99.99").await;
    assert_eq!(status, 200);
    assert_eq!(body["code"], 0);
    let payment = &body["data"];
    assert_eq!(payment["status"], "PROCESSING");
    assert!(!payment["paymentUrl"].as_str().unwrap().is_empty());
    let payment_no = payment["paymentNo"].as_str().unwrap().to_string();

    let (status, ack) = server.wechat_notify(&payment_no, "SUCCESS").await;
    assert_eq!(status, 200);
    assert_eq!(ack, r#"{"code":"SUCCESS","message":"OK"}"#);

    let id = payment["id"].as_str().unwrap();
    let (_, body) = server.get(&format!("/api/billing/payments/{}", id)).await;
    assert_eq!(body["data"]["status"], "SUCCESS");
    assert_eq!(body["data"]["transactionId"], "4200009");
    assert_eq!(server.order_status().await, OrderStatus::Paid);

    // Replay is acknowledged and changes nothing
    let (status, ack) = server.wechat_notify(&payment_no, "CLOSED").await;
    assert_eq!(status, 200);
    assert!(ack.contains("SUCCESS"));
    let (_, body) = server.get(&format!("/api/billing/payments/{}", id)).await;
    assert_eq!(body["data"]["status"], "SUCCESS");
}

#[tokio::test]
async fn test_balance_insufficient_fails_payment() {
    let server = TestServer::start().await;
    server.ledger.set_balance(USER_ID, dec!(10));

    let (status, body) = server.create("balance", "99.99").await;
    assert_eq!(status, 500);
    assert_eq!(body["code"], 5001);
    assert_eq!(body["msg"], "Payment creation failed");
    assert_eq!(server.ledger.deduct_calls(), 0);

    let (_, body) = server
        .get(&format!("/api/billing/payments?userId={}", USER_ID))
        .await;
    assert_eq!(body["data"][0]["status"], "FAILED");
    assert_eq!(server.order_status().await, OrderStatus::Pending);
}

#[tokio::test]
async fn test_amount_mismatch_rejected() {
    let server = TestServer::start().await;

    let (status, body) = server.create("wechat", "50.00").await;
    assert_eq!(status, 400);
    assert_ne!(body["code"], 0);
    assert_eq!(server.store.payment_count(), 0);
}

#[tokio::test]
async fn test_full_refund_runs_saga() {
    let server = TestServer::start().await;
    server.ledger.set_balance(USER_ID, dec!(500));

    let (_, body) = server.create("balance", "99.99").await;
    assert_eq!(body["data"]["status"], "SUCCESS");
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let resp = server
        .http
        .post(server.url(&format!("/api/billing/payments/{}/refund", id)))
        .json(&json!({"amount": "99.99", "reason": "Customer request"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    let saga_id = body["data"]["sagaId"].as_str().unwrap().to_string();

    let saga = server.wait_saga(&saga_id).await;
    assert_eq!(saga["status"], "COMPLETED");
    assert_eq!(
        saga["completedSteps"],
        json!([
            "SET_REFUNDING_STATUS",
            "CALL_PROVIDER_REFUND",
            "UPDATE_PAYMENT_STATUS",
            "UPDATE_ORDER_STATUS"
        ])
    );

    let (_, body) = server.get(&format!("/api/billing/payments/{}", id)).await;
    assert_eq!(body["data"]["status"], "REFUNDED");
    assert_eq!(server.order_status().await, OrderStatus::Refunded);
    assert_eq!(server.ledger.balance(USER_ID), dec!(500));
}

#[tokio::test]
async fn test_refund_exceeding_amount_rejected() {
    let server = TestServer::start().await;
    server.ledger.set_balance(USER_ID, dec!(500));

    let (_, body) = server.create("balance", "99.99").await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let resp = server
        .http
        .post(server.url(&format!("/api/billing/payments/{}/refund", id)))
        .json(&json!({"amount": "100.00", "reason": "too much"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let (_, body) = server.get(&format!("/api/billing/payments/{}", id)).await;
    assert_eq!(body["data"]["status"], "SUCCESS");
}

#[tokio::test]
async fn test_alipay_bad_signature_acks_fail() {
    let server = TestServer::start().await;
    let (_, body) = server.create("alipay", "99.99").await;
    let payment_no = body["data"]["paymentNo"].as_str().unwrap();

    let payload = format!(
        r#"{{"out_trade_no":"{}","trade_status":"TRADE_SUCCESS"}}"#,
        payment_no
    );
    let resp = server
        .http
        .post(server.url("/api/billing/payments/notify/alipay"))
        .header("x-stub-signature", "00")
        .body(payload)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "fail");
    assert_eq!(server.alipay.create_count(), 1);
    assert_eq!(server.order_status().await, OrderStatus::Pending);
}

#[tokio::test]
async fn test_query_polls_gateway() {
    let server = TestServer::start().await;
    let (_, body) = server.create("wechat", "99.99").await;
    let payment_no = body["data"]["paymentNo"].as_str().unwrap().to_string();

    server.wechat.set_query_state("SUCCESS");
    let (status, body) = server
        .get(&format!("/api/billing/payments/query/{}", payment_no))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], "SUCCESS");
    assert_eq!(server.wechat.query_count(), 1);
}

#[tokio::test]
async fn test_list_and_unknown_payment() {
    let server = TestServer::start().await;
    server.create("wechat", "99.99").await;

    let (_, body) = server
        .get(&format!("/api/billing/payments?userId={}", USER_ID))
        .await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = server
        .get("/api/billing/payments/query/PAY-does-not-exist")
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], 4001);
}
