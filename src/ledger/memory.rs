//! In-process ledger for local runs and tests

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{BalanceCheck, Deduction, LedgerClient, LedgerError, LedgerRefund};

#[derive(Default)]
pub struct InMemoryLedger {
    balances: DashMap<String, Decimal>,
    /// order_id -> deduction already applied
    deductions: DashMap<String, Deduction>,
    refunds: DashMap<String, LedgerRefund>,
    check_calls: AtomicUsize,
    deduct_calls: AtomicUsize,
    refund_calls: AtomicUsize,
    fail_deduct: Mutex<bool>,
    fail_refund: Mutex<bool>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, user_id: &str, balance: Decimal) {
        self.balances.insert(user_id.to_string(), balance);
    }

    pub fn balance(&self, user_id: &str) -> Decimal {
        self.balances.get(user_id).map(|b| *b).unwrap_or(Decimal::ZERO)
    }

    pub fn set_fail_deduct(&self, fail: bool) {
        if let Ok(mut f) = self.fail_deduct.lock() {
            *f = fail;
        }
    }

    pub fn set_fail_refund(&self, fail: bool) {
        if let Ok(mut f) = self.fail_refund.lock() {
            *f = fail;
        }
    }

    pub fn check_calls(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn deduct_calls(&self) -> usize {
        self.deduct_calls.load(Ordering::SeqCst)
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }

    fn flag(flag: &Mutex<bool>) -> bool {
        flag.lock().map(|f| *f).unwrap_or(false)
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn check_balance(&self, user_id: &str, amount: Decimal) -> Result<BalanceCheck, LedgerError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        let balance = self.balance(user_id);
        Ok(BalanceCheck {
            allowed: balance >= amount,
            balance,
        })
    }

    async fn deduct_balance(
        &self,
        user_id: &str,
        amount: Decimal,
        order_id: &str,
    ) -> Result<Deduction, LedgerError> {
        self.deduct_calls.fetch_add(1, Ordering::SeqCst);
        if Self::flag(&self.fail_deduct) {
            return Err(LedgerError::Unavailable("deduction failed".into()));
        }
        if let Some(existing) = self.deductions.get(order_id) {
            return Ok(existing.clone());
        }

        let mut balance = self.balances.entry(user_id.to_string()).or_insert(Decimal::ZERO);
        if *balance < amount {
            return Err(LedgerError::Rejected("insufficient balance".into()));
        }
        *balance -= amount;
        let deduction = Deduction {
            success: true,
            transaction_id: format!("LDG-{}", ulid::Ulid::new()),
            new_balance: *balance,
        };
        drop(balance);

        self.deductions.insert(order_id.to_string(), deduction.clone());
        Ok(deduction)
    }

    async fn refund_balance(
        &self,
        user_id: &str,
        amount: Decimal,
        order_id: &str,
    ) -> Result<LedgerRefund, LedgerError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        if Self::flag(&self.fail_refund) {
            return Err(LedgerError::Unavailable("refund failed".into()));
        }
        if let Some(existing) = self.refunds.get(order_id) {
            return Ok(existing.clone());
        }

        let mut balance = self.balances.entry(user_id.to_string()).or_insert(Decimal::ZERO);
        *balance += amount;
        let refund = LedgerRefund {
            transaction_id: format!("LDG-{}", ulid::Ulid::new()),
            new_balance: *balance,
        };
        drop(balance);

        self.refunds.insert(order_id.to_string(), refund.clone());
        Ok(refund)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_deduct_idempotent_on_order() {
        let ledger = InMemoryLedger::new();
        ledger.set_balance("user-123", dec!(200));

        let first = ledger.deduct_balance("user-123", dec!(99.99), "order-1").await.unwrap();
        let second = ledger.deduct_balance("user-123", dec!(99.99), "order-1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.balance("user-123"), dec!(100.01));
        assert_eq!(ledger.deduct_calls(), 2);
    }

    #[tokio::test]
    async fn test_check_and_refund() {
        let ledger = InMemoryLedger::new();
        ledger.set_balance("user-123", dec!(50));

        let check = ledger.check_balance("user-123", dec!(99.99)).await.unwrap();
        assert!(!check.allowed);
        assert_eq!(check.balance, dec!(50));

        ledger.refund_balance("user-123", dec!(10), "order-1").await.unwrap();
        ledger.refund_balance("user-123", dec!(10), "order-1").await.unwrap();
        assert_eq!(ledger.balance("user-123"), dec!(60));
    }
}
