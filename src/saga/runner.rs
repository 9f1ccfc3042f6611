//! In-process saga runner
//!
//! Runs each saga on its own tokio task: steps in order, each retried up to
//! `max_retries` times with a fixed delay, all under one global deadline. On
//! failure the completed steps are compensated in reverse, stopping at a pivot
//! step that has started; compensation errors are logged and never rethrown.
//! Nothing is persisted, so a process crash loses in-flight sagas. Finished
//! records are kept for `record_ttl` so callers can poll the outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{SagaDefinition, SagaError, SagaState, SagaStep, SagaSubmitter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    Running,
    Completed,
    Compensated,
    /// Failed after its pivot started; rolled back to the pivot only
    Halted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaRecord {
    pub saga_id: String,
    pub saga_type: &'static str,
    pub key: String,
    pub status: SagaStatus,
    pub completed_steps: Vec<&'static str>,
    pub compensated_steps: Vec<&'static str>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub retry_delay: Duration,
    /// How long a finished record stays queryable
    pub record_ttl: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(500),
            record_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Default)]
struct Shared {
    records: DashMap<String, SagaRecord>,
    /// key -> saga_id of the running saga
    running: DashMap<String, String>,
    /// Tasks not yet finished or awaited
    handles: DashMap<String, JoinHandle<()>>,
}

pub struct InlineSagaRunner {
    config: RunnerConfig,
    shared: Arc<Shared>,
}

impl InlineSagaRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn status(&self, saga_id: &str) -> Option<SagaRecord> {
        self.shared.records.get(saga_id).map(|r| r.clone())
    }

    /// Wait for a saga to finish and return its final record
    pub async fn wait(&self, saga_id: &str) -> Option<SagaRecord> {
        if let Some((_, handle)) = self.shared.handles.remove(saga_id) {
            if let Err(e) = handle.await {
                error!(saga_id, error = %e, "Saga task panicked");
            }
        }
        self.status(saga_id)
    }

    /// Sagas currently executing
    pub fn running_count(&self) -> usize {
        self.shared.running.len()
    }

    /// Records held, running or finished
    pub fn record_count(&self) -> usize {
        self.shared.records.len()
    }

    /// Drop finished records older than `record_ttl`
    fn evict_finished(&self) {
        let Ok(ttl) = chrono::Duration::from_std(self.config.record_ttl) else {
            return;
        };
        let cutoff = Utc::now() - ttl;
        let before = self.shared.records.len();
        self.shared
            .records
            .retain(|_, r| r.finished_at.is_none_or(|at| at > cutoff));
        let evicted = before.saturating_sub(self.shared.records.len());
        if evicted > 0 {
            debug!(evicted, "Evicted finished saga records");
        }
    }
}

impl Default for InlineSagaRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

#[async_trait]
impl<S> SagaSubmitter<S> for InlineSagaRunner
where
    S: SagaStep + 'static,
    S::Context: 'static,
{
    async fn execute_saga(
        &self,
        definition: SagaDefinition<S>,
        context: S::Context,
    ) -> Result<String, SagaError> {
        let saga_id = ulid::Ulid::new().to_string();

        match self.shared.running.entry(definition.key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SagaError::AlreadyRunning(definition.key));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(saga_id.clone());
            }
        }

        self.evict_finished();
        self.shared.records.insert(
            saga_id.clone(),
            SagaRecord {
                saga_id: saga_id.clone(),
                saga_type: definition.saga_type,
                key: definition.key.clone(),
                status: SagaStatus::Running,
                completed_steps: Vec::new(),
                compensated_steps: Vec::new(),
                error: None,
                started_at: Utc::now(),
                finished_at: None,
            },
        );

        info!(
            saga_id = %saga_id,
            saga_type = definition.saga_type,
            key = %definition.key,
            steps = definition.steps.len(),
            "Saga accepted"
        );

        let shared = self.shared.clone();
        let retry_delay = self.config.retry_delay;
        let id = saga_id.clone();
        let handle = tokio::spawn(async move {
            run_saga(&shared, &id, definition, context, retry_delay).await;
            shared.handles.remove(&id);
        });
        self.shared.handles.insert(saga_id.clone(), handle);
        // The task may have finished before its handle was stored
        let finished = self
            .shared
            .records
            .get(&saga_id)
            .is_none_or(|r| r.status != SagaStatus::Running);
        if finished {
            self.shared.handles.remove(&saga_id);
        }

        Ok(saga_id)
    }
}

async fn run_saga<S: SagaStep>(
    shared: &Shared,
    saga_id: &str,
    definition: SagaDefinition<S>,
    context: S::Context,
    retry_delay: Duration,
) {
    let deadline = Instant::now() + Duration::from_millis(definition.timeout_ms);
    let mut state = SagaState::new();
    let mut completed = 0usize;
    let mut pivot: Option<usize> = None;
    let mut failure: Option<SagaError> = None;

    for (index, step) in definition.steps.iter().enumerate() {
        if pivot.is_none() && step.is_pivot() {
            pivot = Some(index);
        }
        let attempt = execute_with_retries(step, &context, &state, definition.max_retries, retry_delay);
        match tokio::time::timeout_at(deadline, attempt).await {
            Ok(Ok(output)) => {
                state.extend(output);
                completed += 1;
                if let Some(mut record) = shared.records.get_mut(saga_id) {
                    record.completed_steps.push(step.name());
                }
                debug!(saga_id, step = step.name(), "Saga step completed");
            }
            Ok(Err(e)) => {
                if pivot == Some(index) && e.is_rejection() {
                    pivot = None;
                }
                failure = Some(e);
                break;
            }
            Err(_) => {
                failure = Some(SagaError::Timeout {
                    timeout_ms: definition.timeout_ms,
                });
                break;
            }
        }
    }

    let status = match &failure {
        None => {
            info!(saga_id, saga_type = definition.saga_type, "Saga completed");
            SagaStatus::Completed
        }
        Some(e) => {
            // A started pivot is compensated even if it never returned
            let (from, to) = match pivot {
                Some(p) => (p, completed.max(p + 1)),
                None => (0, completed),
            };
            warn!(
                saga_id,
                saga_type = definition.saga_type,
                error = %e,
                pivot_reached = pivot.is_some(),
                "Saga failed; compensating"
            );
            for step in definition.steps[from..to].iter().rev() {
                match step.compensate(&context, &state).await {
                    Ok(()) => {
                        if let Some(mut record) = shared.records.get_mut(saga_id) {
                            record.compensated_steps.push(step.name());
                        }
                    }
                    Err(ce) => {
                        error!(saga_id, step = step.name(), error = %ce, "Compensation failed");
                    }
                }
            }
            if pivot.is_some() {
                SagaStatus::Halted
            } else {
                SagaStatus::Compensated
            }
        }
    };

    if let Some(mut record) = shared.records.get_mut(saga_id) {
        record.status = status;
        record.error = failure.map(|e| e.to_string());
        record.finished_at = Some(Utc::now());
    }
    shared.running.remove(&definition.key);
}

/// A rejection only counts if no earlier attempt failed ambiguously
async fn execute_with_retries<S: SagaStep>(
    step: &S,
    context: &S::Context,
    state: &SagaState,
    max_retries: u32,
    retry_delay: Duration,
) -> Result<SagaState, SagaError> {
    let mut attempt = 0u32;
    let mut ambiguous = false;
    loop {
        match step.execute(context, state).await {
            Ok(output) => return Ok(output),
            Err(e) => {
                ambiguous |= !e.is_rejection();
                if attempt >= max_retries {
                    return Err(match e {
                        SagaError::Rejected { step: name, message } if ambiguous => {
                            SagaError::StepFailed { step: name, message }
                        }
                        other => other,
                    });
                }
                attempt += 1;
                warn!(step = step.name(), attempt, error = %e, "Saga step failed; retrying");
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}
