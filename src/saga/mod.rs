//! Saga data model
//!
//! A saga is an ordered list of immutable [`SagaStep`]s plus a cumulative
//! [`SagaState`] that is checkpointed after every step transition.
//!
//! ```text
//!            required step fails
//! IN_PROGRESS ───────────────────▶ COMPENSATING ──▶ COMPENSATED
//!      │                                │
//!      │ all steps done                 │ compensating action fails
//!      ▼                                ▼
//!  COMPLETED                          FAILED
//! ```

pub mod engine;
pub mod persistence;

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, SyndicateError};
use crate::protocol::{AgentId, Priority};

pub use engine::{CompensatingAction, ResumeSummary, SagaEngine};
pub use persistence::SagaStore;

/// One step of a saga. Immutable once the saga is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    pub id: String,
    pub name: String,
    /// Key into [`SagaState::results`]
    pub command_id: String,
    pub target_manager: AgentId,
    pub payload: Value,
    pub priority: Priority,
    /// Command ids whose results this step consumes
    pub dependencies: Vec<String>,
    /// A failed required step triggers compensation
    pub required: bool,
    /// Per-attempt deadline; the engine default applies when absent
    pub timeout_ms: Option<u64>,
    /// Extra attempts after the first failure
    pub retries: u32,
}

impl SagaStep {
    pub fn new(id: impl Into<String>, target_manager: impl Into<AgentId>, payload: Value) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            command_id: format!("cmd-{}", id),
            id,
            target_manager: target_manager.into(),
            payload,
            priority: Priority::Normal,
            dependencies: Vec::new(),
            required: true,
            timeout_ms: None,
            retries: 0,
        }
    }

    /// Name used to look up the compensating action
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn command_id(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = command_id.into();
        self
    }

    pub fn depends_on(mut self, command_id: impl Into<String>) -> Self {
        self.dependencies.push(command_id.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    InProgress,
    Compensating,
    Compensated,
    Completed,
    Failed,
}

impl SagaStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Compensated | SagaStatus::Completed | SagaStatus::Failed
        )
    }

    /// Stored representation, used in store queries
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::InProgress => "IN_PROGRESS",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Compensated => "COMPENSATED",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Success,
    Failed,
    Compensated,
}

/// Outcome of one executed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub manager_id: AgentId,
    pub status: CommandStatus,
    pub data: Value,
    pub errors: Vec<String>,
    pub execution_time_ms: u64,
}

/// Cumulative, checkpointed state of one saga
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaState {
    pub id: String,
    pub name: String,
    pub status: SagaStatus,
    /// The step at this index has not executed yet
    pub current_step_index: usize,
    /// Step ids in completion order
    pub completed_step_ids: Vec<String>,
    pub results: BTreeMap<String, CommandResult>,
    pub steps: Vec<SagaStep>,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only when the saga ends FAILED
    pub error: Option<String>,
    /// Why compensation began
    pub compensation_reason: Option<String>,
    /// Bumped on every checkpoint
    #[serde(default)]
    pub version: u64,
}

impl SagaState {
    /// Validate the step list and build a fresh IN_PROGRESS state.
    ///
    /// Step ids and command ids must be unique and every dependency must
    /// name the command of an earlier step.
    pub fn new(name: impl Into<String>, steps: Vec<SagaStep>) -> Result<Self> {
        if steps.is_empty() {
            return Err(SyndicateError::InvalidSaga("a saga needs at least one step".into()));
        }

        let mut step_ids = HashSet::new();
        let mut earlier_commands = HashSet::new();
        for step in &steps {
            if !step_ids.insert(step.id.as_str()) {
                return Err(SyndicateError::InvalidSaga(format!("duplicate step id: {}", step.id)));
            }
            if let Some(missing) = step
                .dependencies
                .iter()
                .find(|dep| !earlier_commands.contains(dep.as_str()))
            {
                return Err(SyndicateError::InvalidSaga(format!(
                    "step {} depends on {} which is not an earlier command",
                    step.id, missing
                )));
            }
            if !earlier_commands.insert(step.command_id.as_str()) {
                return Err(SyndicateError::InvalidSaga(format!(
                    "duplicate command id: {}",
                    step.command_id
                )));
            }
        }

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            status: SagaStatus::InProgress,
            current_step_index: 0,
            completed_step_ids: Vec::new(),
            results: BTreeMap::new(),
            steps,
            started_at: now,
            last_checkpoint_at: now,
            completed_at: None,
            error: None,
            compensation_reason: None,
            version: 0,
        })
    }

    pub fn current_step(&self) -> Option<&SagaStep> {
        self.steps.get(self.current_step_index)
    }

    pub fn step(&self, step_id: &str) -> Option<&SagaStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn is_completed(&self, step_id: &str) -> bool {
        self.completed_step_ids.iter().any(|id| id == step_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Outputs of the step's dependencies, keyed by command id
    pub fn dependency_outputs(&self, step: &SagaStep) -> Value {
        let outputs: Map<String, Value> = step
            .dependencies
            .iter()
            .filter_map(|command_id| {
                self.results
                    .get(command_id)
                    .map(|result| (command_id.clone(), result.data.clone()))
            })
            .collect();
        Value::Object(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn steps() -> Vec<SagaStep> {
        vec![
            SagaStep::new("research", "research-manager", json!({"goal": "competitor research"})),
            SagaStep::new("draft", "content-manager", json!({"goal": "draft copy"}))
                .depends_on("cmd-research")
                .retries(2),
        ]
    }

    #[test]
    fn test_new_saga_starts_in_progress() {
        let state = SagaState::new("campaign", steps()).unwrap();

        assert_eq!(state.status, SagaStatus::InProgress);
        assert_eq!(state.current_step_index, 0);
        assert_eq!(state.current_step().unwrap().id, "research");
        assert!(state.results.is_empty());
        assert_eq!(state.version, 0);
    }

    #[test]
    fn test_step_builder_defaults() {
        let step = SagaStep::new("send", "outreach-manager", json!({}));
        assert_eq!(step.command_id, "cmd-send");
        assert_eq!(step.name, "send");
        assert!(step.required);
        assert!(!step.clone().optional().required);
        assert_eq!(step.timeout(500).timeout_ms, Some(500));
    }

    #[test]
    fn test_rejects_invalid_step_lists() {
        assert!(SagaState::new("empty", vec![]).is_err());

        let duplicate = vec![
            SagaStep::new("a", "m", json!({})),
            SagaStep::new("a", "m", json!({})).command_id("other"),
        ];
        assert!(matches!(SagaState::new("dup", duplicate), Err(SyndicateError::InvalidSaga(_))));

        let forward_dependency = vec![
            SagaStep::new("a", "m", json!({})).depends_on("cmd-b"),
            SagaStep::new("b", "m", json!({})),
        ];
        assert!(SagaState::new("forward", forward_dependency).is_err());
    }

    #[test]
    fn test_dependency_outputs() {
        let mut state = SagaState::new("campaign", steps()).unwrap();
        state.results.insert(
            "cmd-research".into(),
            CommandResult {
                command_id: "cmd-research".into(),
                manager_id: AgentId::new("research-manager"),
                status: CommandStatus::Success,
                data: json!({"competitors": ["acme"]}),
                errors: vec![],
                execution_time_ms: 3,
            },
        );

        let draft = state.steps[1].clone();
        assert_eq!(
            state.dependency_outputs(&draft),
            json!({"cmd-research": {"competitors": ["acme"]}})
        );
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_value(SagaStatus::InProgress).unwrap(), json!("IN_PROGRESS"));
        assert_eq!(SagaStatus::Compensating.as_str(), "COMPENSATING");
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
    }
}
