//! Balance ledger client
//!
//! The ledger lives in another service. The payment core only checks,
//! deducts and refunds; every mutating call is idempotent on `order_id`.

pub mod http;
pub mod memory;

pub use http::HttpLedgerClient;
pub use memory::InMemoryLedger;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    #[error("Ledger unreachable: {0}")]
    Unavailable(String),

    #[error("Ledger rejected request: {0}")]
    Rejected(String),

    #[error("Unexpected ledger response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            LedgerError::Decode(e.to_string())
        } else {
            LedgerError::Unavailable(e.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceCheck {
    pub allowed: bool,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deduction {
    pub success: bool,
    pub transaction_id: String,
    pub new_balance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRefund {
    pub transaction_id: String,
    pub new_balance: Decimal,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn check_balance(&self, user_id: &str, amount: Decimal) -> Result<BalanceCheck, LedgerError>;

    /// Idempotent on `order_id`
    async fn deduct_balance(
        &self,
        user_id: &str,
        amount: Decimal,
        order_id: &str,
    ) -> Result<Deduction, LedgerError>;

    /// Idempotent on `order_id`
    async fn refund_balance(
        &self,
        user_id: &str,
        amount: Decimal,
        order_id: &str,
    ) -> Result<LedgerRefund, LedgerError>;
}
