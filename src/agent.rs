//! Agent seam and the leaf-tier specialist

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::manager::Manager;
use crate::message::{Message, Signal};
use crate::protocol::{AgentId, AgentIdentity};
use crate::report::Report;

/// Anything that turns a message into a report.
///
/// Implemented directly by [`Specialist`] and, by delegation, by [`Manager`].
/// `execute` never fails across this boundary: every problem is reported.
#[async_trait]
pub trait Agent: Send + Sync {
    fn identity(&self) -> &AgentIdentity;

    fn id(&self) -> &AgentId {
        self.identity().id()
    }

    async fn execute(&self, message: &Message) -> Report;

    /// Take delivery of a routed signal and execute its message.
    ///
    /// This agent is appended to the signal's hops first; an expired signal
    /// or one without hops left is reported FAILED and never executed.
    async fn handle_signal(&self, signal: &mut Signal) -> Report {
        if let Err(e) = signal.record_hop(self.id()) {
            warn!(agent_id = %self.id(), signal_id = %signal.id, error = %e, "Dropping undeliverable signal");
            return Report::failed(self.id().clone(), signal.payload.id, [e.to_string()]);
        }
        self.execute(&signal.payload).await
    }

    /// Downcast for manager-only queries
    fn as_manager(&self) -> Option<&Manager> {
        None
    }
}

/// Shared handle to any agent
pub type AgentHandle = Arc<dyn Agent>;

/// Check a task payload: must be a non-empty object carrying every required field.
pub fn validate_payload(payload: &Value, required: &[&str]) -> Vec<String> {
    let Some(fields) = payload.as_object() else {
        return vec!["payload must be a JSON object".to_string()];
    };
    if fields.is_empty() {
        return vec!["payload is empty".to_string()];
    }

    required
        .iter()
        .filter(|field| match fields.get(**field) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        })
        .map(|field| format!("missing required field: {}", field))
        .collect()
}

/// The bounded unit of work a specialist performs
#[async_trait]
pub trait SpecialistTask: Send + Sync {
    /// Payload fields that must be present and non-blank
    fn required_fields(&self) -> &[&'static str] {
        &[]
    }

    async fn perform(&self, payload: &Value) -> Result<Value, String>;
}

/// Adapts a plain function into a [`SpecialistTask`]
pub struct FnTask<F> {
    required: Vec<&'static str>,
    f: F,
}

impl<F> FnTask<F>
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
{
    pub fn new(required: &[&'static str], f: F) -> Self {
        Self {
            required: required.to_vec(),
            f,
        }
    }
}

#[async_trait]
impl<F> SpecialistTask for FnTask<F>
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
{
    fn required_fields(&self) -> &[&'static str] {
        &self.required
    }

    async fn perform(&self, payload: &Value) -> Result<Value, String> {
        (self.f)(payload)
    }
}

/// Leaf-tier agent executing one bounded task
pub struct Specialist {
    identity: AgentIdentity,
    task: Arc<dyn SpecialistTask>,
}

impl Specialist {
    pub fn new(identity: AgentIdentity, task: Arc<dyn SpecialistTask>) -> Self {
        debug!(agent_id = %identity.id(), "Creating specialist");
        Self { identity, task }
    }

    /// Build a specialist around a synchronous function
    pub fn from_fn<F>(identity: AgentIdentity, required: &[&'static str], f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self::new(identity, Arc::new(FnTask::new(required, f)))
    }
}

#[async_trait]
impl Agent for Specialist {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    #[instrument(skip(self, message), fields(agent_id = %self.identity.id(), task_id = %message.id))]
    async fn execute(&self, message: &Message) -> Report {
        let errors = validate_payload(&message.payload, self.task.required_fields());
        if !errors.is_empty() {
            warn!(errors = ?errors, "Rejected invalid payload");
            return Report::failed(self.identity.id().clone(), message.id, errors);
        }

        match self.task.perform(&message.payload).await {
            Ok(data) => {
                debug!("Task completed");
                Report::completed(self.identity.id().clone(), message.id, data)
            }
            Err(e) => {
                warn!(error = %e, "Task failed");
                Report::failed(self.identity.id().clone(), message.id, [e])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentStatus, AgentTier};
    use crate::report::ReportStatus;
    use chrono::Duration;
    use serde_json::json;

    fn create_test_specialist() -> Specialist {
        let identity = AgentIdentity::new(
            "trend-scout",
            "Trend Scout",
            "research",
            AgentTier::Specialist,
            AgentStatus::Functional,
            ["trends"],
            Some(AgentId::new("research-manager")),
        )
        .unwrap();

        Specialist::from_fn(identity, &["industry"], |payload| {
            let industry = payload["industry"].as_str().unwrap_or_default();
            if industry == "void" {
                return Err("no data for industry".into());
            }
            Ok(json!({ "industry": industry, "trends": ["ai"] }))
        })
    }

    fn message(payload: Value) -> Message {
        Message::new("research-manager", "trend-scout", payload)
    }

    // === Validation Tests ===

    #[test]
    fn test_validate_payload_shapes() {
        assert_eq!(validate_payload(&json!(null), &[]).len(), 1);
        assert_eq!(validate_payload(&json!([1, 2]), &[]).len(), 1);
        assert_eq!(validate_payload(&json!({}), &[]), vec!["payload is empty"]);
        assert!(validate_payload(&json!({"a": 1}), &[]).is_empty());
    }

    #[test]
    fn test_validate_payload_required_fields() {
        let errors = validate_payload(&json!({"a": "", "b": null, "c": 0}), &["a", "b", "c", "d"]);
        assert_eq!(
            errors,
            vec![
                "missing required field: a",
                "missing required field: b",
                "missing required field: d",
            ]
        );
    }

    // === Execute Tests ===

    #[tokio::test]
    async fn test_execute_completed() {
        let specialist = create_test_specialist();
        let msg = message(json!({"industry": "saas"}));

        let report = specialist.execute(&msg).await;

        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.task_id, msg.id);
        assert_eq!(report.data["industry"], "saas");
    }

    #[tokio::test]
    async fn test_execute_empty_payload_fails() {
        let specialist = create_test_specialist();

        let report = specialist.execute(&message(json!({}))).await;

        assert_eq!(report.status, ReportStatus::Failed);
        assert!(!report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_execute_task_error_is_reported() {
        let specialist = create_test_specialist();

        let report = specialist.execute(&message(json!({"industry": "void"}))).await;

        assert_eq!(report.status, ReportStatus::Failed);
        assert_eq!(report.errors, vec!["no data for industry"]);
    }

    // === Signal Tests ===

    #[tokio::test]
    async fn test_handle_signal_unwraps_message() {
        let specialist = create_test_specialist();
        let msg = message(json!({"industry": "fintech"}));
        let mut signal = Signal::direct(msg.clone());

        let report = specialist.handle_signal(&mut signal).await;

        assert!(report.is_success());
        assert_eq!(report.task_id, msg.id);
    }

    #[tokio::test]
    async fn test_handle_signal_appends_hop() {
        let specialist = create_test_specialist();
        let mut signal = Signal::direct(message(json!({"industry": "fintech"})));
        assert_eq!(signal.hops, vec![AgentId::new("research-manager")]);

        specialist.handle_signal(&mut signal).await;
        specialist.handle_signal(&mut signal).await;

        assert_eq!(
            signal.hops,
            vec![
                AgentId::new("research-manager"),
                AgentId::new("trend-scout"),
                AgentId::new("trend-scout"),
            ]
        );
    }

    #[tokio::test]
    async fn test_handle_signal_out_of_hops_fails() {
        let specialist = create_test_specialist();
        let mut signal = Signal::direct(message(json!({"industry": "fintech"}))).with_max_hops(2);

        let first = specialist.handle_signal(&mut signal).await;
        let second = specialist.handle_signal(&mut signal).await;

        assert!(first.is_success());
        assert_eq!(second.status, ReportStatus::Failed);
        assert!(second.errors[0].contains("no hops left"));
        assert_eq!(signal.hops.len(), 2);
    }

    #[tokio::test]
    async fn test_handle_expired_signal() {
        let specialist = create_test_specialist();
        let mut signal = Signal::direct(message(json!({"industry": "fintech"})))
            .with_ttl(Duration::seconds(-5));

        let report = specialist.handle_signal(&mut signal).await;

        assert_eq!(report.status, ReportStatus::Failed);
        assert!(report.errors[0].contains("expired"));
        assert_eq!(signal.hops.len(), 1);
    }

    #[test]
    fn test_specialist_is_not_manager() {
        let specialist = create_test_specialist();
        assert!(specialist.as_manager().is_none());
        assert_eq!(specialist.id().as_str(), "trend-scout");
    }
}
