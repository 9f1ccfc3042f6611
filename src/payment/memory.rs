//! In-memory payment/order store
//!
//! Backs local runs without PostgreSQL and all service-level tests. Each
//! conditional update holds the DashMap shard lock for the row while it checks
//! and writes, which gives the same single-row atomicity as the SQL CAS.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::error::PaymentError;
use super::repository::{
    OrderRepository, PaymentRepository, SettleUpdate, check_edge, classify, merge_metadata,
};
use super::state::{OrderStatus, PaymentStatus, Transition};
use super::types::{DispatchUpdate, Order, Payment, PaymentId, RefundCompletion};

#[derive(Default)]
pub struct InMemoryStore {
    payments: DashMap<PaymentId, Payment>,
    by_payment_no: DashMap<String, PaymentId>,
    orders: DashMap<String, Order>,
    /// Successful payment row writes (insert + applied updates)
    payment_writes: AtomicUsize,
    bulk_cancel_calls: AtomicUsize,
    /// `mark_order_refunded` errors while set
    fail_order_refund: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an order (orders are owned by the billing service)
    pub fn insert_order(&self, order: Order) {
        self.orders.insert(order.id.clone(), order);
    }

    /// Overwrite a stored payment, bypassing the state machine
    pub fn put_payment(&self, payment: Payment) {
        self.by_payment_no
            .insert(payment.payment_no.as_str().to_string(), payment.id);
        self.payments.insert(payment.id, payment);
    }

    pub fn payment_count(&self) -> usize {
        self.payments.len()
    }

    pub fn payment_writes(&self) -> usize {
        self.payment_writes.load(Ordering::SeqCst)
    }

    pub fn bulk_cancel_calls(&self) -> usize {
        self.bulk_cancel_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_order_refund(&self, fail: bool) {
        self.fail_order_refund.store(fail, Ordering::SeqCst);
    }

    /// Run `apply` on the row if its status is `expected`
    fn cas_payment(
        &self,
        id: PaymentId,
        expected: PaymentStatus,
        next: PaymentStatus,
        apply: impl FnOnce(&mut Payment),
    ) -> Result<Transition<PaymentStatus>, PaymentError> {
        check_edge(expected, next)?;
        let mut row = self
            .payments
            .get_mut(&id)
            .ok_or_else(|| PaymentError::payment_not_found(id))?;

        let outcome = classify(row.status, expected, next);
        if outcome.is_applied() {
            row.status = next;
            row.updated_at = Utc::now();
            apply(&mut row);
            self.payment_writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(outcome)
    }

    fn cas_order(
        &self,
        order_id: &str,
        expected: OrderStatus,
        next: OrderStatus,
        apply: impl FnOnce(&mut Order),
    ) -> Result<Transition<OrderStatus>, PaymentError> {
        let mut row = self
            .orders
            .get_mut(order_id)
            .ok_or_else(|| PaymentError::order_not_found(order_id))?;

        let outcome = classify(row.status, expected, next);
        if outcome.is_applied() {
            row.status = next;
            apply(&mut row);
        }
        Ok(outcome)
    }
}

#[async_trait]
impl PaymentRepository for InMemoryStore {
    async fn insert(&self, payment: &Payment) -> Result<(), PaymentError> {
        if self.by_payment_no.contains_key(payment.payment_no.as_str()) {
            return Err(PaymentError::DatabaseError(format!(
                "duplicate payment_no {}",
                payment.payment_no
            )));
        }
        self.put_payment(payment.clone());
        self.payment_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn find_by_id(&self, id: PaymentId) -> Result<Option<Payment>, PaymentError> {
        Ok(self.payments.get(&id).map(|p| p.clone()))
    }

    async fn find_by_payment_no(&self, payment_no: &str) -> Result<Option<Payment>, PaymentError> {
        let Some(id) = self.by_payment_no.get(payment_no).map(|id| *id) else {
            return Ok(None);
        };
        self.find_by_id(id).await
    }

    async fn list(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<Payment>, PaymentError> {
        let mut rows: Vec<Payment> = self
            .payments
            .iter()
            .filter(|p| user_id.is_none_or(|u| p.user_id == u))
            .map(|p| p.clone())
            .collect();
        // ULIDs sort by creation time
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn record_dispatch(
        &self,
        id: PaymentId,
        update: &DispatchUpdate,
    ) -> Result<Transition<PaymentStatus>, PaymentError> {
        self.cas_payment(id, PaymentStatus::Pending, update.status, |p| {
            p.transaction_id = update.transaction_id.clone();
            p.payment_url = update.payment_url.clone();
            p.client_secret = update.client_secret.clone();
            p.customer_id = update.customer_id.clone();
            p.paid_at = update.paid_at;
        })
    }

    async fn mark_failed(
        &self,
        id: PaymentId,
        reason: &str,
    ) -> Result<Transition<PaymentStatus>, PaymentError> {
        self.cas_payment(id, PaymentStatus::Pending, PaymentStatus::Failed, |p| {
            p.failure_reason = Some(reason.to_string());
        })
    }

    async fn settle(
        &self,
        id: PaymentId,
        update: &SettleUpdate,
    ) -> Result<Transition<PaymentStatus>, PaymentError> {
        self.cas_payment(id, PaymentStatus::Processing, update.status, |p| {
            if update.transaction_id.is_some() {
                p.transaction_id = update.transaction_id.clone();
            }
            if update.status == PaymentStatus::Success {
                p.paid_at = Some(update.at);
            }
            if let Some(payload) = &update.payload {
                merge_metadata(&mut p.metadata, "notification", payload.clone());
            }
        })
    }

    async fn transition(
        &self,
        id: PaymentId,
        expected: PaymentStatus,
        next: PaymentStatus,
    ) -> Result<Transition<PaymentStatus>, PaymentError> {
        self.cas_payment(id, expected, next, |p| {
            if expected == PaymentStatus::Refunded {
                p.refund_amount = None;
                p.refund_reason = None;
                p.refunded_at = None;
            }
        })
    }

    async fn mark_refunded(
        &self,
        id: PaymentId,
        completion: &RefundCompletion,
    ) -> Result<Transition<PaymentStatus>, PaymentError> {
        self.cas_payment(id, PaymentStatus::Refunding, PaymentStatus::Refunded, |p| {
            p.refund_amount = Some(completion.refund_amount);
            p.refund_reason = Some(completion.refund_reason.clone());
            p.refunded_at = Some(completion.refunded_at);
            merge_metadata(&mut p.metadata, "refund", completion.result.clone());
        })
    }

    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Payment>, PaymentError> {
        let mut rows: Vec<Payment> = self
            .payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Processing && p.is_expired(now))
            .map(|p| p.clone())
            .collect();
        rows.sort_by_key(|p| p.expires_at);
        rows.truncate(limit);
        Ok(rows)
    }
}

#[async_trait]
impl OrderRepository for InMemoryStore {
    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, PaymentError> {
        Ok(self.orders.get(order_id).map(|o| o.clone()))
    }

    async fn mark_order_paid(
        &self,
        order_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition<OrderStatus>, PaymentError> {
        self.cas_order(order_id, OrderStatus::Pending, OrderStatus::Paid, |o| {
            o.paid_at = Some(at);
        })
    }

    async fn mark_order_refunded(
        &self,
        order_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition<OrderStatus>, PaymentError> {
        if self.fail_order_refund.load(Ordering::SeqCst) {
            return Err(PaymentError::DatabaseError("orders_tb unavailable".into()));
        }
        self.cas_order(order_id, OrderStatus::Paid, OrderStatus::Refunded, |o| {
            o.refunded_at = Some(at);
        })
    }

    async fn transition_order(
        &self,
        order_id: &str,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<Transition<OrderStatus>, PaymentError> {
        self.cas_order(order_id, expected, next, |o| {
            if expected == OrderStatus::Refunded {
                o.refunded_at = None;
            }
        })
    }

    async fn cancel_pending_orders(&self, order_ids: &[String]) -> Result<u64, PaymentError> {
        self.bulk_cancel_calls.fetch_add(1, Ordering::SeqCst);
        let mut cancelled = 0;
        for order_id in order_ids {
            let Some(mut row) = self.orders.get_mut(order_id) else {
                continue;
            };
            if row.status == OrderStatus::Pending {
                row.status = OrderStatus::Cancelled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::types::PaymentMethod;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn pending_payment() -> Payment {
        Payment::new_pending(
            "order-1",
            "user-1",
            dec!(10.00),
            "CNY",
            PaymentMethod::Alipay,
            Duration::minutes(15),
        )
    }

    #[tokio::test]
    async fn test_cas_rejects_wrong_state() {
        let store = InMemoryStore::new();
        let payment = pending_payment();
        store.insert(&payment).await.unwrap();

        let outcome = store
            .transition(payment.id, PaymentStatus::Processing, PaymentStatus::Success)
            .await
            .unwrap();
        assert_eq!(outcome, Transition::Rejected(PaymentStatus::Pending));

        let stored = store.find_by_id(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert_eq!(store.payment_writes(), 1);
    }

    #[tokio::test]
    async fn test_settle_is_replay_safe() {
        let store = InMemoryStore::new();
        let mut payment = pending_payment();
        payment.status = PaymentStatus::Processing;
        store.insert(&payment).await.unwrap();

        let update = SettleUpdate {
            status: PaymentStatus::Success,
            transaction_id: Some("tx-1".into()),
            payload: Some(serde_json::json!({"trade_state": "SUCCESS"})),
            at: Utc::now(),
        };
        assert!(store.settle(payment.id, &update).await.unwrap().is_applied());
        assert_eq!(
            store.settle(payment.id, &update).await.unwrap(),
            Transition::Unchanged
        );

        let stored = store.find_by_payment_no(payment.payment_no.as_str()).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Success);
        assert_eq!(stored.transaction_id.as_deref(), Some("tx-1"));
        assert!(stored.paid_at.is_some());
        assert_eq!(stored.metadata["notification"]["trade_state"], "SUCCESS");
    }

    #[tokio::test]
    async fn test_undefined_edge_is_refused() {
        let store = InMemoryStore::new();
        let mut payment = pending_payment();
        payment.status = PaymentStatus::Cancelled;
        store.insert(&payment).await.unwrap();

        let err = store
            .transition(payment.id, PaymentStatus::Cancelled, PaymentStatus::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidState(_)));
        assert_eq!(
            store.find_by_id(payment.id).await.unwrap().unwrap().status,
            PaymentStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_refund_revert_clears_refund_fields() {
        let store = InMemoryStore::new();
        let mut payment = pending_payment();
        payment.status = PaymentStatus::Refunding;
        store.insert(&payment).await.unwrap();

        let completion = RefundCompletion {
            refund_amount: dec!(10.00),
            refund_reason: "duplicate".into(),
            refunded_at: Utc::now(),
            result: serde_json::json!({"refundId": "r-1"}),
        };
        assert!(store.mark_refunded(payment.id, &completion).await.unwrap().is_applied());
        assert!(store
            .transition(payment.id, PaymentStatus::Refunded, PaymentStatus::Refunding)
            .await
            .unwrap()
            .is_applied());

        let stored = store.find_by_id(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Refunding);
        assert!(stored.refund_amount.is_none());
        assert!(stored.refund_reason.is_none());
        assert!(stored.refunded_at.is_none());
    }

    #[tokio::test]
    async fn test_order_refund_requires_paid() {
        let store = InMemoryStore::new();
        store.insert_order(Order::new_pending("o1", "u1", dec!(1)));

        let outcome = store.mark_order_refunded("o1", Utc::now()).await.unwrap();
        assert_eq!(outcome, Transition::Rejected(OrderStatus::Pending));
        assert!(store.mark_order_paid("o1", Utc::now()).await.unwrap().is_applied());
        assert!(store.mark_order_refunded("o1", Utc::now()).await.unwrap().is_applied());
        assert_eq!(
            store.mark_order_refunded("o1", Utc::now()).await.unwrap(),
            Transition::Unchanged
        );

        let order = store.find_order("o1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Refunded);
        assert!(order.refunded_at.is_some());
    }

    #[tokio::test]
    async fn test_bulk_cancel_only_pending() {
        let store = InMemoryStore::new();
        store.insert_order(Order::new_pending("o1", "u1", dec!(1)));
        let mut paid = Order::new_pending("o2", "u1", dec!(1));
        paid.status = OrderStatus::Paid;
        store.insert_order(paid);

        let cancelled = store
            .cancel_pending_orders(&["o1".to_string(), "o2".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(cancelled, 1);
        assert_eq!(store.bulk_cancel_calls(), 1);
        assert_eq!(
            store.find_order("o2").await.unwrap().unwrap().status,
            OrderStatus::Paid
        );
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let store = InMemoryStore::new();
        let first = pending_payment();
        store.insert(&first).await.unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = pending_payment();
        store.insert(&second).await.unwrap();

        let rows = store.list(Some("user-1"), 100).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, second.id);
        assert!(store.list(Some("someone-else"), 100).await.unwrap().is_empty());
    }
}
