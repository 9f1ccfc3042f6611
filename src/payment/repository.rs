//! Persistence seams for payments and orders
//!
//! Every status write is a conditional (compare-and-set) update. Callers never
//! read-modify-write a status; they state the expected current status and get
//! back a [`Transition`] describing what happened.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::PaymentError;
use super::state::{OrderStatus, PaymentStatus, Transition};
use super::types::{DispatchUpdate, Order, Payment, PaymentId, RefundCompletion};

/// Status reported by a provider, reduced to what reconciliation can persist
#[derive(Debug, Clone)]
pub struct SettleUpdate {
    /// SUCCESS or CANCELLED
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    /// Raw notification or poll payload, stored under `metadata.notification`
    pub payload: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn insert(&self, payment: &Payment) -> Result<(), PaymentError>;

    async fn find_by_id(&self, id: PaymentId) -> Result<Option<Payment>, PaymentError>;

    async fn find_by_payment_no(&self, payment_no: &str) -> Result<Option<Payment>, PaymentError>;

    /// Newest first
    async fn list(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<Payment>, PaymentError>;

    /// PENDING -> `update.status` with the provider's create response
    async fn record_dispatch(
        &self,
        id: PaymentId,
        update: &DispatchUpdate,
    ) -> Result<Transition<PaymentStatus>, PaymentError>;

    /// PENDING -> FAILED with the adapter's message
    async fn mark_failed(
        &self,
        id: PaymentId,
        reason: &str,
    ) -> Result<Transition<PaymentStatus>, PaymentError>;

    /// PROCESSING -> SUCCESS | CANCELLED from a webhook or poll.
    ///
    /// `paid_at` is stamped only on SUCCESS.
    async fn settle(
        &self,
        id: PaymentId,
        update: &SettleUpdate,
    ) -> Result<Transition<PaymentStatus>, PaymentError>;

    /// Plain CAS on status. Runs check and write atomically.
    ///
    /// Leaving REFUNDED clears the refund fields. An edge outside the payment
    /// state machine is an error and writes nothing.
    async fn transition(
        &self,
        id: PaymentId,
        expected: PaymentStatus,
        next: PaymentStatus,
    ) -> Result<Transition<PaymentStatus>, PaymentError>;

    /// REFUNDING -> REFUNDED with refund fields and `metadata.refund`
    async fn mark_refunded(
        &self,
        id: PaymentId,
        completion: &RefundCompletion,
    ) -> Result<Transition<PaymentStatus>, PaymentError>;

    /// PROCESSING payments whose `expires_at` is before `now`, oldest first
    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Payment>, PaymentError>;
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn find_order(&self, order_id: &str) -> Result<Option<Order>, PaymentError>;

    /// PENDING -> PAID, single targeted update
    async fn mark_order_paid(
        &self,
        order_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition<OrderStatus>, PaymentError>;

    /// PAID -> REFUNDED; a replay reports `Unchanged`
    async fn mark_order_refunded(
        &self,
        order_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Transition<OrderStatus>, PaymentError>;

    async fn transition_order(
        &self,
        order_id: &str,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<Transition<OrderStatus>, PaymentError>;

    /// One bulk update: `status = CANCELLED WHERE id IN (..) AND status = PENDING`.
    ///
    /// Returns the number of orders cancelled.
    async fn cancel_pending_orders(&self, order_ids: &[String]) -> Result<u64, PaymentError>;
}

/// Classify the outcome of a CAS given the row's status before the write
pub(crate) fn classify<S: PartialEq + Copy>(current: S, expected: S, next: S) -> Transition<S> {
    if current == expected {
        Transition::Applied
    } else if current == next {
        Transition::Unchanged
    } else {
        Transition::Rejected(current)
    }
}

/// Refuse a payment CAS whose edge the state machine does not have
pub(crate) fn check_edge(expected: PaymentStatus, next: PaymentStatus) -> Result<(), PaymentError> {
    if expected.can_transition_to(next) {
        Ok(())
    } else {
        Err(PaymentError::InvalidState(format!(
            "{expected} -> {next} is not a payment transition"
        )))
    }
}

/// Merge `value` into `metadata[key]`, turning a non-object metadata into one
pub(crate) fn merge_metadata(metadata: &mut serde_json::Value, key: &str, value: serde_json::Value) {
    if !metadata.is_object() {
        *metadata = serde_json::Value::Object(Default::default());
    }
    if let Some(map) = metadata.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify() {
        use PaymentStatus::*;
        assert_eq!(classify(Processing, Processing, Success), Transition::Applied);
        assert_eq!(classify(Success, Processing, Success), Transition::Unchanged);
        assert_eq!(
            classify(Cancelled, Processing, Success),
            Transition::Rejected(Cancelled)
        );
    }

    #[test]
    fn test_check_edge() {
        use PaymentStatus::*;
        assert!(check_edge(Success, Refunding).is_ok());
        assert!(check_edge(Refunded, Refunding).is_ok());
        assert!(matches!(
            check_edge(Cancelled, Success),
            Err(PaymentError::InvalidState(_))
        ));
        assert!(check_edge(Processing, Refunding).is_err());
    }

    #[test]
    fn test_merge_metadata() {
        let mut meta = json!({"notification": {"a": 1}});
        merge_metadata(&mut meta, "refund", json!({"refundId": "r1"}));
        assert_eq!(meta["notification"]["a"], 1);
        assert_eq!(meta["refund"]["refundId"], "r1");

        let mut null_meta = serde_json::Value::Null;
        merge_metadata(&mut null_meta, "refund", json!(1));
        assert_eq!(null_meta, json!({"refund": 1}));
    }
}
