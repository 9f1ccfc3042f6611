//! Payment Core Types

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::state::{OrderStatus, PaymentStatus};

/// Payment ID - ULID-based primary key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PaymentId(ulid::Ulid);

impl PaymentId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for PaymentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PaymentId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

impl Serialize for PaymentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for PaymentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Human-auditable payment number: `PAY<unix millis><4-digit random>`
///
/// Also used as the merchant-side reference (`out_trade_no`) at every gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentNo(String);

impl PaymentNo {
    pub const PREFIX: &'static str = "PAY";
    pub const REFUND_PREFIX: &'static str = "RF";

    /// Allocate a new payment number
    pub fn generate() -> Self {
        Self::with_prefix(Self::PREFIX)
    }

    /// Refund number in the same format, `RF<unix millis><4-digit random>`
    pub fn generate_refund() -> Self {
        Self::with_prefix(Self::REFUND_PREFIX)
    }

    fn with_prefix(prefix: &str) -> Self {
        let millis = Utc::now().timestamp_millis();
        let random: u16 = rand::thread_rng().gen_range(0..10_000);
        Self(format!("{}{}{:04}", prefix, millis, random))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for PaymentNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PaymentNo {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PaymentNo {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Payment method (one provider adapter per method)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Wechat,
    Alipay,
    Balance,
    Stripe,
    Paypal,
    Paddle,
}

impl PaymentMethod {
    pub const ALL: [PaymentMethod; 6] = [
        PaymentMethod::Wechat,
        PaymentMethod::Alipay,
        PaymentMethod::Balance,
        PaymentMethod::Stripe,
        PaymentMethod::Paypal,
        PaymentMethod::Paddle,
    ];

    /// Lowercase name, also the path segment of the notify URL
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Wechat => "wechat",
            PaymentMethod::Alipay => "alipay",
            PaymentMethod::Balance => "balance",
            PaymentMethod::Stripe => "stripe",
            PaymentMethod::Paypal => "paypal",
            PaymentMethod::Paddle => "paddle",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wechat" => Ok(PaymentMethod::Wechat),
            "alipay" => Ok(PaymentMethod::Alipay),
            "balance" => Ok(PaymentMethod::Balance),
            "stripe" => Ok(PaymentMethod::Stripe),
            "paypal" => Ok(PaymentMethod::Paypal),
            "paddle" => Ok(PaymentMethod::Paddle),
            other => Err(format!("unsupported payment method: {other}")),
        }
    }
}

/// Payment record stored in PostgreSQL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: PaymentId,
    pub payment_no: PaymentNo,
    pub order_id: String,
    pub user_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    /// Provider-assigned reference, null until dispatch
    pub transaction_id: Option<String>,
    pub payment_url: Option<String>,
    pub client_secret: Option<String>,
    pub customer_id: Option<String>,
    pub failure_reason: Option<String>,
    pub refund_amount: Option<Decimal>,
    pub refund_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    /// Raw provider payloads (`notification`, `refund`)
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Create a new payment in PENDING state
    pub fn new_pending(
        order_id: impl Into<String>,
        user_id: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
        method: PaymentMethod,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PaymentId::new(),
            payment_no: PaymentNo::generate(),
            order_id: order_id.into(),
            user_id: user_id.into(),
            amount,
            currency: currency.into(),
            method,
            status: PaymentStatus::Pending,
            transaction_id: None,
            payment_url: None,
            client_secret: None,
            customer_id: None,
            failure_reason: None,
            refund_amount: None,
            refund_reason: None,
            paid_at: None,
            refunded_at: None,
            expires_at: now + ttl,
            metadata: serde_json::Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
        }
    }

    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

impl fmt::Display for Payment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Payment[{}] order={} user={} {} {} via {} status={}",
            self.payment_no,
            self.order_id,
            self.user_id,
            self.amount,
            self.currency,
            self.method,
            self.status
        )
    }
}

/// Order as seen by the payment core (owned by the billing service)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub amount: Decimal,
    pub status: OrderStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new_pending(id: impl Into<String>, user_id: impl Into<String>, amount: Decimal) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            amount,
            status: OrderStatus::Pending,
            paid_at: None,
            refunded_at: None,
        }
    }
}

/// Payment creation request
#[derive(Debug, Clone)]
pub struct CreatePaymentRequest {
    pub order_id: String,
    pub method: PaymentMethod,
    pub amount: Decimal,
    /// Caller-asserted user; falls back to the order owner when absent
    pub user_id: Option<String>,
}

impl CreatePaymentRequest {
    pub fn new(order_id: impl Into<String>, method: PaymentMethod, amount: Decimal) -> Self {
        Self {
            order_id: order_id.into(),
            method,
            amount,
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Refund request
#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub amount: Decimal,
    pub reason: String,
}

/// Result of a refund submission
///
/// The saga runs asynchronously; `payment` is the record as read right after
/// submission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundSubmission {
    pub saga_id: String,
    pub payment: Payment,
}

/// Fields written when a refund completes (saga step UPDATE_PAYMENT_STATUS)
#[derive(Debug, Clone)]
pub struct RefundCompletion {
    pub refund_amount: Decimal,
    pub refund_reason: String,
    pub refunded_at: DateTime<Utc>,
    /// Provider refund result, merged into `metadata.refund`
    pub result: serde_json::Value,
}

/// Fields written when the provider accepts the create call
#[derive(Debug, Clone)]
pub struct DispatchUpdate {
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub payment_url: Option<String>,
    pub client_secret: Option<String>,
    pub customer_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_payment_no_format() {
        let no = PaymentNo::generate();
        let s = no.as_str();
        assert!(s.starts_with("PAY"));
        // PAY + 13-digit millis + 4-digit random
        assert_eq!(s.len(), 3 + 13 + 4);
        assert!(s[3..].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_payment_id_roundtrip() {
        let id = PaymentId::new();
        let parsed: PaymentId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let json = serde_json::to_string(&id).unwrap();
        let back: PaymentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("WECHAT".parse::<PaymentMethod>(), Ok(PaymentMethod::Wechat));
        assert_eq!("paddle".parse::<PaymentMethod>(), Ok(PaymentMethod::Paddle));
        assert!("bitcoin".parse::<PaymentMethod>().is_err());
        for method in PaymentMethod::ALL {
            assert_eq!(method.as_str().parse::<PaymentMethod>(), Ok(method));
        }
    }

    #[test]
    fn test_new_pending_payment() {
        let payment = Payment::new_pending(
            "order-1",
            "user-1",
            dec!(99.99),
            "CNY",
            PaymentMethod::Wechat,
            Duration::minutes(15),
        );

        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.transaction_id.is_none());
        assert!(payment.paid_at.is_none());
        assert_eq!(payment.expires_at - payment.created_at, Duration::minutes(15));
        assert!(!payment.is_expired(payment.created_at));
        assert!(payment.is_expired(payment.created_at + Duration::minutes(16)));
    }
}
