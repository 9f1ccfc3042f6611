//! Saga contract
//!
//! A saga is an ordered list of steps, each with an `execute` and a
//! `compensate`. The engine runs steps in order; when one fails for good it
//! compensates the completed steps in reverse. Both halves must be idempotent
//! because the engine may re-run them.
//!
//! A step may be a pivot: an external effect that cannot be undone. Once a
//! pivot has started, rollback stops at it. The pivot's own `compensate` runs
//! (it raises the operator alert) and the steps before it are left as they
//! are. The one exception is a pivot that fails with [`SagaError::Rejected`],
//! which proves the effect never happened.

pub mod refund;
pub mod runner;

pub use refund::{
    RefundDeps, RefundSagaContext, RefundSagaSettings, RefundStep, RefundStepKind,
    refund_saga_definition,
};
pub use runner::{InlineSagaRunner, RunnerConfig, SagaRecord, SagaStatus};

use async_trait::async_trait;
use thiserror::Error;

/// Values produced by steps, visible to later steps and to compensation
pub type SagaState = serde_json::Map<String, serde_json::Value>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SagaError {
    #[error("Step {step} failed: {message}")]
    StepFailed { step: &'static str, message: String },

    #[error("Saga timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The step's external side definitely did not act
    #[error("Step {step} rejected: {message}")]
    Rejected { step: &'static str, message: String },

    #[error("A saga is already running for {0}")]
    AlreadyRunning(String),
}

impl SagaError {
    pub fn step(step: &'static str, message: impl ToString) -> Self {
        SagaError::StepFailed {
            step,
            message: message.to_string(),
        }
    }

    pub fn rejected(step: &'static str, message: impl ToString) -> Self {
        SagaError::Rejected {
            step,
            message: message.to_string(),
        }
    }

    #[inline]
    pub fn is_rejection(&self) -> bool {
        matches!(self, SagaError::Rejected { .. })
    }
}

#[async_trait]
pub trait SagaStep: Send + Sync {
    type Context: Send + Sync;

    fn name(&self) -> &'static str;

    /// Irreversible once started; see the module docs
    fn is_pivot(&self) -> bool {
        false
    }

    /// Returns entries to merge into the saga state
    async fn execute(&self, ctx: &Self::Context, state: &SagaState) -> Result<SagaState, SagaError>;

    async fn compensate(&self, ctx: &Self::Context, state: &SagaState) -> Result<(), SagaError>;
}

#[derive(Debug, Clone)]
pub struct SagaDefinition<S> {
    pub saga_type: &'static str,
    /// Logical id; at most one saga per key runs at a time
    pub key: String,
    pub timeout_ms: u64,
    /// Re-attempts per step after the first failure
    pub max_retries: u32,
    pub steps: Vec<S>,
}

impl<S: SagaStep> SagaDefinition<S> {
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

/// Saga engine entry point
#[async_trait]
pub trait SagaSubmitter<S: SagaStep>: Send + Sync {
    /// Accept the saga and return its id; execution continues in the background
    async fn execute_saga(
        &self,
        definition: SagaDefinition<S>,
        context: S::Context,
    ) -> Result<String, SagaError>;
}
