//! Saga execution driver
//!
//! Runs steps in order against registry agents, checkpointing after every
//! transition, and rolls completed steps back in reverse completion order
//! when a required step fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::config::SagaSettings;
use crate::error::{Result, SyndicateError};
use crate::message::Message;
use crate::protocol::AgentId;
use crate::registry::AgentRegistry;
use crate::saga::persistence::SagaStore;
use crate::saga::{CommandResult, CommandStatus, SagaState, SagaStatus, SagaStep};

/// Sender id stamped on messages the engine dispatches
const ENGINE_ID: &str = "saga-engine";

/// Undo for one step, registered under the step's name.
///
/// May run more than once for the same step if the process dies
/// mid-compensation, so implementations must be idempotent.
#[async_trait]
pub trait CompensatingAction: Send + Sync {
    async fn compensate(&self, step: &SagaStep, result: &CommandResult) -> std::result::Result<(), String>;
}

/// Outcome counts of one resume sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeSummary {
    pub resumed: usize,
    pub completed: usize,
    pub compensated: usize,
    pub failed: usize,
    pub conflicts: usize,
}

/// Drives sagas to a terminal status
pub struct SagaEngine {
    registry: Arc<AgentRegistry>,
    sagas: SagaStore,
    compensators: HashMap<String, Arc<dyn CompensatingAction>>,
    settings: SagaSettings,
}

impl SagaEngine {
    pub fn new(registry: Arc<AgentRegistry>, sagas: SagaStore, settings: SagaSettings) -> Self {
        Self {
            registry,
            sagas,
            compensators: HashMap::new(),
            settings,
        }
    }

    /// Register the undo action for steps named `step_name`
    pub fn with_compensator(mut self, step_name: impl Into<String>, action: Arc<dyn CompensatingAction>) -> Self {
        self.compensators.insert(step_name.into(), action);
        self
    }

    pub fn store(&self) -> &SagaStore {
        &self.sagas
    }

    /// Create, checkpoint and run a new saga
    pub async fn start(&self, name: impl Into<String>, steps: Vec<SagaStep>) -> Result<SagaState> {
        let mut state = SagaState::new(name, steps)?;
        self.sagas.checkpoint_saga(&mut state).await?;
        info!(saga_id = %state.id, name = %state.name, steps = state.steps.len(), "Saga started");
        self.run(state).await
    }

    /// Execute from `current_step_index` until the saga is terminal
    #[instrument(skip(self, state), fields(saga_id = %state.id))]
    pub async fn run(&self, mut state: SagaState) -> Result<SagaState> {
        while state.status == SagaStatus::InProgress {
            let Some(step) = state.current_step().cloned() else {
                return self.sagas.complete_saga(&state.id, SagaStatus::Completed, None).await;
            };

            if state.is_completed(&step.id) {
                debug!(step_id = %step.id, "Skipping completed step");
                state.current_step_index += 1;
                self.sagas.checkpoint_saga(&mut state).await?;
                continue;
            }

            let result = self.execute_step(&state, &step).await;
            let succeeded = result.status == CommandStatus::Success;
            let errors = result.errors.join("; ");
            state.results.insert(step.command_id.clone(), result);

            if succeeded {
                state.completed_step_ids.push(step.id.clone());
                state.current_step_index += 1;
                self.sagas.checkpoint_saga(&mut state).await?;
            } else if !step.required {
                warn!(step_id = %step.id, errors = %errors, "Optional step failed, continuing");
                state.current_step_index += 1;
                self.sagas.checkpoint_saga(&mut state).await?;
            } else {
                warn!(step_id = %step.id, errors = %errors, "Required step failed, compensating");
                state.compensation_reason = Some(format!("step {} failed: {}", step.id, errors));
                return self.compensate(state).await;
            }
        }

        Ok(state)
    }

    /// Continue a saga from its checkpoint
    pub async fn resume(&self, id: &str) -> Result<SagaState> {
        let state = self
            .sagas
            .load_saga_state(id)
            .await?
            .ok_or_else(|| SyndicateError::SagaNotFound(id.to_string()))?;

        match state.status {
            SagaStatus::InProgress => self.run(state).await,
            SagaStatus::Compensating => self.compensate(state).await,
            _ => Ok(state),
        }
    }

    /// Roll back completed steps, newest first.
    ///
    /// Ends COMPENSATED when every undo succeeds. A failing undo ends the
    /// saga FAILED and is not retried.
    #[instrument(skip(self, state), fields(saga_id = %state.id))]
    pub async fn compensate(&self, mut state: SagaState) -> Result<SagaState> {
        if state.status.is_terminal() {
            return Err(SyndicateError::InvalidTransition(format!(
                "saga {} is already {}",
                state.id,
                state.status.as_str()
            )));
        }

        if state.status != SagaStatus::Compensating {
            state.status = SagaStatus::Compensating;
            if state.compensation_reason.is_none() {
                state.compensation_reason = Some("compensation requested".into());
            }
            self.sagas.checkpoint_saga(&mut state).await?;
        }

        let completed: Vec<String> = state.completed_step_ids.iter().rev().cloned().collect();
        for step_id in completed {
            let Some(step) = state.step(&step_id).cloned() else {
                continue;
            };
            let Some(result) = state.results.get(&step.command_id).cloned() else {
                continue;
            };
            if result.status == CommandStatus::Compensated {
                continue;
            }

            if let Some(action) = self.compensators.get(&step.name) {
                if let Err(e) = action.compensate(&step, &result).await {
                    error!(step_id = %step.id, error = %e, "Compensation failed, manual intervention required");
                    return self
                        .sagas
                        .complete_saga(
                            &state.id,
                            SagaStatus::Failed,
                            Some(format!("compensation of step {} failed: {}", step.id, e)),
                        )
                        .await;
                }
            }

            if let Some(entry) = state.results.get_mut(&step.command_id) {
                entry.status = CommandStatus::Compensated;
            }
            self.sagas.checkpoint_saga(&mut state).await?;
            debug!(step_id = %step.id, "Step compensated");
        }

        let done = self
            .sagas
            .complete_saga(&state.id, SagaStatus::Compensated, None)
            .await?;
        info!(saga_id = %done.id, "Saga compensated");
        Ok(done)
    }

    /// Resume every IN_PROGRESS or COMPENSATING saga.
    ///
    /// Per-saga failures are counted, not propagated, except persistence
    /// failures which abort the sweep.
    #[instrument(skip(self))]
    pub async fn resume_incomplete(&self) -> Result<ResumeSummary> {
        let mut summary = ResumeSummary::default();

        for state in self.sagas.find_incomplete_sagas().await? {
            summary.resumed += 1;
            let id = state.id.clone();
            let outcome = match state.status {
                SagaStatus::Compensating => self.compensate(state).await,
                _ => self.run(state).await,
            };

            match outcome {
                Ok(done) => match done.status {
                    SagaStatus::Completed => summary.completed += 1,
                    SagaStatus::Compensated => summary.compensated += 1,
                    SagaStatus::Failed => summary.failed += 1,
                    _ => {}
                },
                Err(SyndicateError::SagaConflict { .. }) => {
                    debug!(saga_id = %id, "Saga owned by another driver");
                    summary.conflicts += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(saga_id = %id, error = %e, "Saga resume failed");
                    summary.failed += 1;
                }
            }
        }

        if summary.resumed > 0 {
            info!(?summary, "Resume sweep finished");
        }
        Ok(summary)
    }

    /// Run one step with its deadline and retry budget
    async fn execute_step(&self, state: &SagaState, step: &SagaStep) -> CommandResult {
        let started = Instant::now();
        let failed = |errors: Vec<String>| CommandResult {
            command_id: step.command_id.clone(),
            manager_id: step.target_manager.clone(),
            status: CommandStatus::Failed,
            data: Value::Null,
            errors,
            execution_time_ms: started.elapsed().as_millis() as u64,
        };

        let Some(agent) = self.registry.instantiate(step.target_manager.as_str()) else {
            return failed(vec![format!("unknown agent: {}", step.target_manager)]);
        };

        let mut payload = step.payload.clone();
        if !step.dependencies.is_empty() {
            if let Some(fields) = payload.as_object_mut() {
                fields.insert("dependencies".into(), state.dependency_outputs(step));
            }
        }
        let message = Message::new(AgentId::new(ENGINE_ID), step.target_manager.clone(), payload)
            .with_priority(step.priority);

        let deadline = Duration::from_millis(step.timeout_ms.unwrap_or(self.settings.default_step_timeout_ms));
        let max_attempts = step.retries.saturating_add(1);
        let mut errors = Vec::new();

        for attempt in 1..=max_attempts {
            let agent = Arc::clone(&agent);
            let attempt_message = message.clone();
            let mut handle = tokio::spawn(async move { agent.execute(&attempt_message).await });

            match tokio::time::timeout(deadline, &mut handle).await {
                Ok(Ok(report)) if report.is_success() => {
                    debug!(step_id = %step.id, attempt, "Step succeeded");
                    return CommandResult {
                        command_id: step.command_id.clone(),
                        manager_id: step.target_manager.clone(),
                        status: CommandStatus::Success,
                        data: report.data,
                        errors: Vec::new(),
                        execution_time_ms: started.elapsed().as_millis() as u64,
                    };
                }
                Ok(Ok(report)) => {
                    errors = if report.errors.is_empty() {
                        vec![format!("agent ended {:?}", report.status)]
                    } else {
                        report.errors
                    };
                }
                Ok(Err(join_error)) => {
                    errors = vec![format!("agent aborted: {}", join_error)];
                }
                Err(_) => {
                    handle.abort();
                    errors = vec![format!("timed out after {} ms", deadline.as_millis())];
                }
            }

            if attempt < max_attempts {
                warn!(step_id = %step.id, attempt, errors = ?errors, "Step attempt failed, retrying");
                tokio::time::sleep(Duration::from_millis(self.settings.retry_backoff_ms)).await;
            }
        }

        let mut result = failed(errors);
        result.data = json!({ "attempts": max_attempts });
        result
    }
}
