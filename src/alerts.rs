//! Operational alerts
//!
//! Alerts are best-effort: a failing sink is logged and never changes the
//! outcome of the operation that raised the alert.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlertError {
    #[error("Alert channel unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    /// Provider rejected or failed the create call
    PaymentCreationFailed,
    /// Provider refund may have gone through but the saga could not finish
    IrreversibleRefundFailure,
    /// Expiry sweep could not close an order at the provider
    CloseOrderFailed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub payment_no: Option<String>,
    pub message: String,
    pub context: serde_json::Value,
}

impl Alert {
    pub fn new(kind: AlertKind, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            payment_no: None,
            message: message.into(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_payment_no(mut self, payment_no: impl Into<String>) -> Self {
        self.payment_no = Some(payment_no.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: Alert) -> Result<(), AlertError>;
}

/// Emit through `sink`, swallowing its failure
pub async fn emit_best_effort(sink: &dyn AlertSink, alert: Alert) {
    let kind = alert.kind;
    if let Err(e) = sink.emit(alert).await {
        warn!(?kind, error = %e, "Alert sink failed; alert dropped");
    }
}

/// Default sink: structured `error!` events tagged `alert = true`
#[derive(Debug, Default, Clone)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn emit(&self, alert: Alert) -> Result<(), AlertError> {
        error!(
            alert = true,
            kind = ?alert.kind,
            severity = ?alert.severity,
            payment_no = alert.payment_no.as_deref().unwrap_or("-"),
            context = %alert.context,
            "{}",
            alert.message
        );
        Ok(())
    }
}

/// Recording sink for tests
pub mod recording {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingAlertSink {
        alerts: Mutex<Vec<Alert>>,
        fail: Mutex<bool>,
    }

    impl RecordingAlertSink {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every emit return an error (after recording)
        pub fn set_fail(&self, fail: bool) {
            if let Ok(mut f) = self.fail.lock() {
                *f = fail;
            }
        }

        pub fn alerts(&self) -> Vec<Alert> {
            self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
        }

        pub fn count(&self, kind: AlertKind) -> usize {
            self.alerts().iter().filter(|a| a.kind == kind).count()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingAlertSink {
        async fn emit(&self, alert: Alert) -> Result<(), AlertError> {
            if let Ok(mut alerts) = self.alerts.lock() {
                alerts.push(alert);
            }
            if self.fail.lock().map(|f| *f).unwrap_or(false) {
                return Err(AlertError::Unavailable("recording sink set to fail".into()));
            }
            Ok(())
        }
    }
}

pub use recording::RecordingAlertSink;
