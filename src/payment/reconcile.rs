//! Provider status vocabulary -> payment status
//!
//! Webhooks and polling go through the same two functions so a race between
//! them can only ever agree.

use crate::providers::ProviderStatus;

use super::state::PaymentStatus;

/// WeChat `trade_state` / Alipay `trade_status` vocabulary
pub fn map_trade_state(raw: &str) -> ProviderStatus {
    match raw {
        "SUCCESS" | "TRADE_SUCCESS" | "TRADE_FINISHED" => ProviderStatus::Success,
        "CLOSED" | "REVOKED" | "TRADE_CLOSED" => ProviderStatus::Cancelled,
        "NOTPAY" | "USERPAYING" | "WAIT_BUYER_PAY" => ProviderStatus::Processing,
        "PAYERROR" => ProviderStatus::Failed,
        _ => ProviderStatus::Unknown,
    }
}

/// Status a PROCESSING payment moves to, or `None` to ignore.
///
/// Only success-equivalent and closed-equivalent states are persisted; a
/// provider-side failure leaves the payment for the expiry sweep.
pub fn reconciled_status(status: ProviderStatus) -> Option<PaymentStatus> {
    match status {
        ProviderStatus::Success => Some(PaymentStatus::Success),
        ProviderStatus::Cancelled => Some(PaymentStatus::Cancelled),
        ProviderStatus::Pending
        | ProviderStatus::Processing
        | ProviderStatus::Failed
        | ProviderStatus::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_vocabulary() {
        for raw in ["SUCCESS", "TRADE_SUCCESS", "TRADE_FINISHED"] {
            assert_eq!(
                reconciled_status(map_trade_state(raw)),
                Some(PaymentStatus::Success),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_closed_vocabulary() {
        for raw in ["CLOSED", "REVOKED", "TRADE_CLOSED"] {
            assert_eq!(
                reconciled_status(map_trade_state(raw)),
                Some(PaymentStatus::Cancelled),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_everything_else_ignored() {
        for raw in ["NOTPAY", "WAIT_BUYER_PAY", "PAYERROR", "REFUND", "", "success"] {
            assert_eq!(reconciled_status(map_trade_state(raw)), None, "{raw}");
        }
    }
}
