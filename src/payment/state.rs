//! Payment and Order State Definitions
//!
//! State IDs are stored in PostgreSQL as SMALLINT.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Payment FSM states
///
/// ```text
/// PENDING ──▶ PROCESSING ──▶ SUCCESS ──▶ REFUNDING ──▶ REFUNDED
///    │             │            ▲             │
///    │             ├──▶ CANCELLED └─────────────┘ (refund rejected)
///    ├──▶ SUCCESS  (BALANCE only)
///    └──▶ FAILED   (dispatch failure only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum PaymentStatus {
    /// Initial state - row persisted, provider not yet called
    Pending = 0,

    /// Provider accepted the create call, waiting for webhook/poll
    Processing = 10,

    /// Funds confirmed by the provider (or deducted from the ledger)
    Success = 20,

    /// Refund saga in flight. Owned exclusively by the saga.
    Refunding = 30,

    /// Terminal: refund completed
    Refunded = 40,

    /// Terminal: provider dispatch failed inside create_payment
    Failed = -10,

    /// Terminal: closed by the provider or by the expiry sweep
    Cancelled = -20,
}

impl PaymentStatus {
    /// No further automatic transition happens from these states.
    ///
    /// SUCCESS only leaves via an explicit refund request.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Success
                | PaymentStatus::Refunded
                | PaymentStatus::Failed
                | PaymentStatus::Cancelled
        )
    }

    /// `paid_at` is set iff the payment is in one of these states
    #[inline]
    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Success | PaymentStatus::Refunding | PaymentStatus::Refunded
        )
    }

    /// Allowed edges of the payment state machine
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Success)
                | (Pending, Failed)
                | (Processing, Success)
                | (Processing, Cancelled)
                | (Success, Refunding)
                | (Refunding, Refunded)
                | (Refunding, Success)
                | (Refunded, Refunding)
        )
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(PaymentStatus::Pending),
            10 => Some(PaymentStatus::Processing),
            20 => Some(PaymentStatus::Success),
            30 => Some(PaymentStatus::Refunding),
            40 => Some(PaymentStatus::Refunded),
            -10 => Some(PaymentStatus::Failed),
            -20 => Some(PaymentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Processing => "PROCESSING",
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::Refunding => "REFUNDING",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for PaymentStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        PaymentStatus::from_id(value).ok_or(())
    }
}

/// Order status (the order entity itself lives in the billing service)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i16)]
pub enum OrderStatus {
    Pending = 0,
    Paid = 10,
    Cancelled = -10,
    Refunded = -20,
}

impl OrderStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(OrderStatus::Pending),
            10 => Some(OrderStatus::Paid),
            -10 => Some(OrderStatus::Cancelled),
            -20 => Some(OrderStatus::Refunded),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(OrderStatus::Pending),
            "PAID" => Ok(OrderStatus::Paid),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            "REFUNDED" => Ok(OrderStatus::Refunded),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Outcome of a conditional (compare-and-set) status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// Row was in the expected state and has been moved
    Applied,
    /// Row was already in the target state (replay)
    Unchanged,
    /// Row is in some other state; nothing written
    Rejected(S),
}

impl<S> Transition<S> {
    #[inline]
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [PaymentStatus; 7] = [
        PaymentStatus::Pending,
        PaymentStatus::Processing,
        PaymentStatus::Success,
        PaymentStatus::Refunding,
        PaymentStatus::Refunded,
        PaymentStatus::Failed,
        PaymentStatus::Cancelled,
    ];

    #[test]
    fn test_terminal_states() {
        assert!(PaymentStatus::Success.is_terminal());
        assert!(PaymentStatus::Refunded.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(PaymentStatus::Cancelled.is_terminal());

        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(!PaymentStatus::Processing.is_terminal());
        assert!(!PaymentStatus::Refunding.is_terminal());
    }

    #[test]
    fn test_balance_skips_processing() {
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Success));
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Failed));
    }

    #[test]
    fn test_failed_only_from_pending() {
        for state in ALL {
            let allowed = state.can_transition_to(PaymentStatus::Failed);
            assert_eq!(allowed, state == PaymentStatus::Pending, "{state}");
        }
    }

    #[test]
    fn test_refunding_edges() {
        assert!(PaymentStatus::Success.can_transition_to(PaymentStatus::Refunding));
        assert!(PaymentStatus::Refunding.can_transition_to(PaymentStatus::Refunded));
        assert!(PaymentStatus::Refunding.can_transition_to(PaymentStatus::Success));
        assert!(!PaymentStatus::Processing.can_transition_to(PaymentStatus::Refunding));
        assert!(!PaymentStatus::Cancelled.can_transition_to(PaymentStatus::Success));
    }

    #[test]
    fn test_paid_states() {
        for state in ALL {
            let expected = matches!(
                state,
                PaymentStatus::Success | PaymentStatus::Refunding | PaymentStatus::Refunded
            );
            assert_eq!(state.is_paid(), expected);
        }
    }

    #[test]
    fn test_state_id_roundtrip() {
        for state in ALL {
            assert_eq!(PaymentStatus::from_id(state.id()), Some(state));
        }
        assert!(PaymentStatus::from_id(999).is_none());
        assert_eq!(OrderStatus::from_id(OrderStatus::Refunded.id()), Some(OrderStatus::Refunded));
    }

    #[test]
    fn test_display() {
        assert_eq!(PaymentStatus::Processing.to_string(), "PROCESSING");
        assert_eq!(OrderStatus::Paid.to_string(), "PAID");
        assert_eq!("cancelled".parse::<OrderStatus>(), Ok(OrderStatus::Cancelled));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&PaymentStatus::Refunding).unwrap();
        assert_eq!(json, "\"REFUNDING\"");
    }
}
