//! Fixtures shared by unit tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::{Agent, AgentHandle, Specialist};
use crate::manager::Manager;
use crate::message::Message;
use crate::protocol::{AgentId, AgentIdentity, AgentStatus, AgentTier};
use crate::report::Report;
use crate::routing::{KeywordRouter, RoutingRule};

pub fn identity(id: &str, tier: AgentTier, status: AgentStatus, reports_to: Option<&str>) -> AgentIdentity {
    AgentIdentity::new(
        id,
        id.replace('-', " "),
        "test",
        tier,
        status,
        [format!("{}-capability", id)],
        reports_to.map(AgentId::new),
    )
    .expect("valid test identity")
}

/// Completes with the payload echoed back
pub fn echo_specialist(id: &str, manager: &str) -> AgentHandle {
    let agent_id = id.to_string();
    Arc::new(Specialist::from_fn(
        identity(id, AgentTier::Specialist, AgentStatus::Tested, Some(manager)),
        &[],
        move |payload| Ok(json!({ "echo": payload, "by": agent_id })),
    ))
}

/// Always fails its task
pub fn failing_specialist(id: &str, manager: &str) -> AgentHandle {
    Arc::new(Specialist::from_fn(
        identity(id, AgentTier::Specialist, AgentStatus::Shell, Some(manager)),
        &[],
        |_| Err("upstream provider unavailable".to_string()),
    ))
}

/// Panics inside `execute`
pub struct PanickingAgent {
    identity: AgentIdentity,
}

pub fn panicking_specialist(id: &str, manager: &str) -> AgentHandle {
    Arc::new(PanickingAgent {
        identity: identity(id, AgentTier::Specialist, AgentStatus::Functional, Some(manager)),
    })
}

#[async_trait]
impl Agent for PanickingAgent {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    async fn execute(&self, _message: &Message) -> Report {
        panic!("specialist blew up")
    }
}

/// Sleeps before completing; tracks how many run at once
pub struct SlowAgent {
    identity: AgentIdentity,
    delay: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl SlowAgent {
    pub fn new(id: &str, manager: &str, delay: Duration, active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> Self {
        Self {
            identity: identity(id, AgentTier::Specialist, AgentStatus::Functional, Some(manager)),
            delay,
            active,
            peak,
        }
    }
}

#[async_trait]
impl Agent for SlowAgent {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    async fn execute(&self, message: &Message) -> Report {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Report::completed(self.identity.id().clone(), message.id, json!({ "slept_ms": self.delay.as_millis() as u64 }))
    }
}

/// Counts executions; fails while `failures_left` > 0
pub struct FlakyAgent {
    identity: AgentIdentity,
    pub calls: AtomicUsize,
    failures_left: AtomicUsize,
}

impl FlakyAgent {
    pub fn new(id: &str, tier: AgentTier, failures: usize) -> Self {
        Self {
            identity: identity(id, tier, AgentStatus::Functional, None),
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl Agent for FlakyAgent {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    async fn execute(&self, message: &Message) -> Report {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Report::failed(self.identity.id().clone(), message.id, ["transient failure"]);
        }
        Report::completed(self.identity.id().clone(), message.id, json!({ "payload": message.payload }))
    }
}

/// A manager routing `research` to two echo specialists and `broken` to a failing one
pub fn research_manager() -> Manager {
    Manager::builder(identity("research-manager", AgentTier::Manager, AgentStatus::Functional, Some("orchestrator")))
        .delegate(echo_specialist("competitor-analyst", "research-manager"))
        .delegate(echo_specialist("trend-scout", "research-manager"))
        .delegate(failing_specialist("broken-scout", "research-manager"))
        .router(Arc::new(
            KeywordRouter::default()
                .with_rule(RoutingRule::keywords("competitor-analyst", ["competitor", "research"]))
                .with_rule(RoutingRule::keywords("trend-scout", ["trend", "research"]))
                .with_rule(RoutingRule::keywords("broken-scout", ["broken"])),
        ))
        .build()
}

pub fn goal(goal: &str) -> Value {
    json!({ "goal": goal })
}
