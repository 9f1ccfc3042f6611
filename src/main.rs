//! Billing payments service
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌──────────────┐    ┌──────────┐
//! │  Gateway │───▶│   Payment    │───▶│   Provider   │───▶│ WeChat / │
//! │  (axum)  │    │  Lifecycle   │    │   Adapters   │    │ Stripe…  │
//! └──────────┘    └──────┬───────┘    └──────────────┘    └──────────┘
//!                        │
//!            ┌───────────┼─────────────┐
//!            ▼           ▼             ▼
//!      ┌──────────┐ ┌──────────┐ ┌──────────────┐
//!      │ Postgres │ │  Refund  │ │ Expiry Sweep │
//!      │  Store   │ │   Saga   │ │ (leader only)│
//!      └──────────┘ └──────────┘ └──────────────┘
//! ```
//!
//! Usage: `billing_payments [--env dev] [--port 8090]`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use billing_payments::alerts::{AlertSink, TracingAlertSink};
use billing_payments::config::AppConfig;
use billing_payments::gateway::{self, AppState};
use billing_payments::ledger::{HttpLedgerClient, InMemoryLedger, LedgerClient};
use billing_payments::logging::init_logging;
use billing_payments::payment::{
    AlwaysLeader, ExpirySweeper, InMemoryStore, LeaderElection, OrderRepository,
    PaymentLifecycleService, PaymentMethod, PaymentRepository, PgAdvisoryLeader, PgPaymentStore,
};
use billing_payments::providers::{
    AlipayQrAdapter, BalanceLedgerAdapter, PaddleTransactionAdapter, PayPalOrderAdapter,
    ProviderAdapter, ProviderError, ProviderRegistry, StripeHostedAdapter, StubAdapter,
    WechatNativeAdapter,
};
use billing_payments::saga::InlineSagaRunner;

fn arg_value(flags: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.windows(2)
        .find(|w| flags.contains(&w[0].as_str()))
        .map(|w| w[1].clone())
}

fn get_env() -> String {
    arg_value(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

fn get_port_override() -> Option<u16> {
    arg_value(&["--port"]).and_then(|p| p.parse().ok())
}

/// Real adapter for every configured gateway, stub for the rest
fn build_registry(
    config: &AppConfig,
    ledger: Arc<dyn LedgerClient>,
) -> Result<ProviderRegistry, ProviderError> {
    let providers = &config.providers;
    let stub = |name: &'static str| -> Arc<dyn ProviderAdapter> {
        warn!(provider = name, "No credentials configured, using stub adapter");
        Arc::new(StubAdapter::new(name, providers.stub_secret.clone()))
    };

    let wechat: Arc<dyn ProviderAdapter> = match &providers.wechat {
        Some(c) => Arc::new(WechatNativeAdapter::new(c.clone())?),
        None => stub("wechat"),
    };
    let alipay: Arc<dyn ProviderAdapter> = match &providers.alipay {
        Some(c) => Arc::new(AlipayQrAdapter::new(c.clone())?),
        None => stub("alipay"),
    };
    let stripe: Arc<dyn ProviderAdapter> = match &providers.stripe {
        Some(c) => Arc::new(StripeHostedAdapter::new(c.clone())),
        None => stub("stripe"),
    };
    let paypal: Arc<dyn ProviderAdapter> = match &providers.paypal {
        Some(c) => Arc::new(PayPalOrderAdapter::new(c.clone())),
        None => stub("paypal"),
    };
    let paddle: Arc<dyn ProviderAdapter> = match &providers.paddle {
        Some(c) => Arc::new(PaddleTransactionAdapter::new(c.clone())),
        None => stub("paddle"),
    };

    Ok(ProviderRegistry::new()
        .with(PaymentMethod::Wechat, wechat)
        .with(PaymentMethod::Alipay, alipay)
        .with(PaymentMethod::Stripe, stripe)
        .with(PaymentMethod::Paypal, paypal)
        .with(PaymentMethod::Paddle, paddle)
        .with(PaymentMethod::Balance, Arc::new(BalanceLedgerAdapter::new(ledger))))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _log_guard = init_logging(&config);

    info!("Starting billing payments service in {} mode", env);

    let alerts: Arc<dyn AlertSink> = Arc::new(TracingAlertSink);

    let ledger: Arc<dyn LedgerClient> = match &config.ledger.base_url {
        Some(url) => Arc::new(HttpLedgerClient::new(
            url.clone(),
            Duration::from_millis(config.ledger.timeout_ms),
        )?),
        None => {
            warn!("ledger.base_url not set, balance payments use an in-memory ledger");
            Arc::new(InMemoryLedger::new())
        }
    };

    let registry = build_registry(&config, ledger).context("failed to build provider adapters")?;
    let runner = Arc::new(InlineSagaRunner::new(config.runner_config()));

    let (payments, orders, leader): (
        Arc<dyn PaymentRepository>,
        Arc<dyn OrderRepository>,
        Arc<dyn LeaderElection>,
    ) = match &config.postgres_url {
        Some(url) => {
            let store = Arc::new(
                PgPaymentStore::connect(url)
                    .await
                    .context("failed to connect to PostgreSQL")?,
            );
            store.init_schema().await?;
            let leader = Arc::new(PgAdvisoryLeader::new(
                store.pool().clone(),
                PgAdvisoryLeader::DEFAULT_LOCK_KEY,
            ));
            (store.clone(), store, leader)
        }
        None => {
            warn!("postgres_url not set, payments are kept in memory");
            let store = Arc::new(InMemoryStore::new());
            (store.clone(), store, Arc::new(AlwaysLeader))
        }
    };

    let service = Arc::new(PaymentLifecycleService::new(
        payments,
        orders,
        registry,
        runner.clone(),
        alerts,
        config.payment_settings(),
    ));

    if config.expiry.enabled {
        let sweeper = ExpirySweeper::new(service.clone(), leader, config.sweeper_config());
        tokio::spawn(async move {
            sweeper.run().await;
        });
        info!(
            interval_secs = config.expiry.scan_interval_secs,
            "Expiry sweeper started"
        );
    }

    let port = get_port_override().unwrap_or(config.gateway.port);
    let state = Arc::new(AppState::new(service, runner));
    gateway::run_server(&config.gateway.host, port, state)
        .await
        .with_context(|| format!("gateway failed on {}:{}", config.gateway.host, port))?;

    Ok(())
}
