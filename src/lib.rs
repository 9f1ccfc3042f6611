//! Billing Payments
//!
//! Payment lifecycle for billing orders: creation and dispatch to a payment
//! gateway, webhook and poll reconciliation, saga-driven refunds and expiry
//! of abandoned payments.
//!
//! # Modules
//!
//! - [`payment`] - Payment state machine, service, repositories, expiry sweep
//! - [`providers`] - Gateway adapters (WeChat Pay, Alipay, Stripe, PayPal, Paddle, balance)
//! - [`ledger`] - Client for the internal balance ledger
//! - [`saga`] - Saga contract, in-process runner and the refund saga
//! - [`gateway`] - HTTP API (axum)
//! - [`alerts`] - Operational alerts
//! - [`money`] - Decimal amount helpers
//! - [`config`] / [`logging`] - Ambient setup

pub mod alerts;
pub mod config;
pub mod gateway;
pub mod ledger;
pub mod logging;
pub mod money;
pub mod payment;
pub mod providers;
pub mod saga;

// Convenient re-exports at crate root
pub use alerts::{AlertSink, TracingAlertSink};
pub use config::AppConfig;
pub use payment::{
    Payment, PaymentError, PaymentLifecycleService, PaymentMethod, PaymentSettings, PaymentStatus,
};
pub use providers::{ProviderAdapter, ProviderRegistry};
pub use saga::InlineSagaRunner;
