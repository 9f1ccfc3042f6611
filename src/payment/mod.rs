//! Payment Lifecycle
//!
//! Creates payments against billing orders, dispatches them to an external
//! gateway (or the internal balance ledger), reconciles their status from
//! webhooks and polling, refunds them through a saga and cancels the ones
//! that expire.
//!
//! # State Machine
//!
//! ```text
//! PENDING → PROCESSING → SUCCESS → REFUNDING → REFUNDED
//!    │          ↓           ▲          │
//!    │      CANCELLED       └──────────┘ (refund rolled back)
//!    ├→ SUCCESS (BALANCE)
//!    └→ FAILED  (dispatch failure)
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Persist-Before-Call**: the PENDING row exists before any gateway call
//! 2. **Conditional Writes**: every status change is `UPDATE … WHERE status = expected`
//! 3. **Terminal Absorption**: replayed webhooks against SUCCESS/CANCELLED are no-ops
//! 4. **Refund Ownership**: only the refund saga moves a payment into or out of REFUNDING

pub mod db;
pub mod error;
pub mod expiry;
pub mod memory;
pub mod reconcile;
pub mod repository;
pub mod service;
pub mod state;
pub mod types;


pub use db::PgPaymentStore;
pub use error::PaymentError;
pub use expiry::{AlwaysLeader, ExpirySweeper, LeaderElection, PgAdvisoryLeader, SweeperConfig};
pub use memory::InMemoryStore;
pub use repository::{OrderRepository, PaymentRepository};
pub use service::{PaymentLifecycleService, PaymentSettings, ReconcileOutcome, SweepReport};
pub use state::{OrderStatus, PaymentStatus, Transition};
pub use types::{
    CreatePaymentRequest, Order, Payment, PaymentId, PaymentMethod, PaymentNo, RefundRequest,
    RefundSubmission,
};
