//! Multi-channel outreach sequences
//!
//! Each enrollment walks a subject through a sequence of timed steps:
//!
//! ```text
//!  active ──▶ completed
//!    │
//!    └─────▶ stopped
//! ```
//!
//! Conditions attached to a step (a bounce, a reply, ...) can advance,
//! jump, terminate, or substitute a fallback step.

pub mod engine;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, SyndicateError};

pub use engine::{ChannelSender, RecordingSender, SendReceipt, SendRequest, Sequencer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Linkedin,
    Sms,
    Phone,
}

/// Observed signal about a subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    EmailBounced,
    EmailOpened,
    Replied,
    LinkClicked,
    NoResponse,
    Unsubscribed,
}

/// What a matching condition does to the enrollment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConditionAction {
    Advance,
    JumpTo { next_step_index: usize },
    /// End the sequence; the enrollment completes
    Terminate,
    /// Run this step instead of the one the condition is attached to
    Fallback { step: Box<SequenceStep> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCondition {
    pub kind: ConditionKind,
    pub action: ConditionAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStep {
    pub channel: Channel,
    /// Wait before this step runs, counted from the previous one
    pub delay_minutes: u32,
    pub subject: Option<String>,
    /// Body with `{{placeholder}}` slots
    pub template: String,
    #[serde(default)]
    pub conditions: Vec<StepCondition>,
}

impl SequenceStep {
    pub fn new(channel: Channel, delay_minutes: u32, template: impl Into<String>) -> Self {
        Self {
            channel,
            delay_minutes,
            subject: None,
            template: template.into(),
            conditions: Vec::new(),
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn on(mut self, kind: ConditionKind, action: ConditionAction) -> Self {
        self.conditions.push(StepCondition { kind, action });
        self
    }

    pub fn condition(&self, kind: ConditionKind) -> Option<&ConditionAction> {
        self.conditions
            .iter()
            .find(|c| c.kind == kind)
            .map(|c| &c.action)
    }

    pub fn delay(&self) -> Duration {
        Duration::minutes(i64::from(self.delay_minutes))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceStats {
    pub enrolled: u64,
    pub completed: u64,
    pub stopped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub id: String,
    pub name: String,
    pub steps: Vec<SequenceStep>,
    pub stats: SequenceStats,
    pub created_at: DateTime<Utc>,
}

impl Sequence {
    /// Steps must be non-empty and every jump must land on a real step
    pub fn new(name: impl Into<String>, steps: Vec<SequenceStep>) -> Result<Self> {
        if steps.is_empty() {
            return Err(SyndicateError::InvalidSequence("a sequence needs at least one step".into()));
        }
        for (index, step) in steps.iter().enumerate() {
            for condition in &step.conditions {
                if let ConditionAction::JumpTo { next_step_index } = condition.action {
                    if next_step_index >= steps.len() {
                        return Err(SyndicateError::InvalidSequence(format!(
                            "step {} jumps to missing step {}",
                            index, next_step_index
                        )));
                    }
                }
            }
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            steps,
            stats: SequenceStats::default(),
            created_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentStatus {
    Active,
    Stopped,
    Completed,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Stopped => "stopped",
            EnrollmentStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Sent,
    Failed,
}

/// Record of one step execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedStep {
    pub step_index: usize,
    pub channel: Channel,
    pub outcome: StepOutcome,
    /// A fallback step ran in place of the configured one
    pub substituted: bool,
    pub executed_at: DateTime<Utc>,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceEnrollment {
    pub id: String,
    pub sequence_id: String,
    pub subject_id: String,
    pub status: EnrollmentStatus,
    pub current_step_index: usize,
    pub executed_steps: Vec<ExecutedStep>,
    pub next_execution_at: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
    /// Conditions observed so far
    #[serde(default)]
    pub signals: Vec<ConditionKind>,
    pub enrolled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
}

impl SequenceEnrollment {
    pub fn is_active(&self) -> bool {
        self.status == EnrollmentStatus::Active
    }

    pub fn has_signal(&self, kind: ConditionKind) -> bool {
        self.signals.contains(&kind)
    }

    /// Index of the step whose conditions apply to a new signal
    pub fn condition_step_index(&self) -> usize {
        self.executed_steps
            .last()
            .map(|step| step.step_index)
            .unwrap_or(self.current_step_index)
    }
}

/// Fill `{{subject_id}}` and `{{key}}` slots from metadata. Unknown slots
/// are left as written.
pub fn render_template(template: &str, subject_id: &str, metadata: &Map<String, Value>) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            rendered.push_str(&rest[start..]);
            return rendered;
        };

        let key = after[..end].trim();
        let value = match key {
            "subject_id" => Some(subject_id.to_string()),
            _ => metadata.get(key).and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            }),
        };
        match value {
            Some(value) => rendered.push_str(&value),
            None => rendered.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }

    rendered.push_str(rest);
    rendered
}
