//! Built-in agent table of the sales platform
//!
//! ```text
//! orchestrator
//! ├── research-manager  ── lead-researcher, competitor-analyst
//! ├── outreach-manager  ── email-writer, sms-writer (shell)
//! └── content-manager   ── blog-writer, social-writer
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agent::SpecialistTask;
use crate::config::DelegationSettings;
use crate::error::Result;
use crate::events::EventRule;
use crate::protocol::{AgentId, AgentIdentity, AgentStatus, AgentTier};
use crate::registry::Registration;
use crate::routing::{extract_intent, KeywordRouter, RoutingRule, INTENT_FIELDS};

pub const ORCHESTRATOR_ID: &str = "orchestrator";

struct ManagerDef {
    id: &'static str,
    name: &'static str,
    capabilities: &'static [&'static str],
    keywords: &'static [&'static str],
}

struct SpecialistDef {
    id: &'static str,
    name: &'static str,
    manager: &'static str,
    status: AgentStatus,
    capabilities: &'static [&'static str],
    keywords: &'static [&'static str],
}

const MANAGERS: &[ManagerDef] = &[
    ManagerDef {
        id: "research-manager",
        name: "Research Manager",
        capabilities: &["research"],
        keywords: &["research", "competitor", "market", "lead", "prospect"],
    },
    ManagerDef {
        id: "outreach-manager",
        name: "Outreach Manager",
        capabilities: &["outreach"],
        keywords: &["outreach", "email", "sms", "follow up", "follow-up"],
    },
    ManagerDef {
        id: "content-manager",
        name: "Content Manager",
        capabilities: &["content"],
        keywords: &["content", "blog", "article", "social", "post"],
    },
];

const SPECIALISTS: &[SpecialistDef] = &[
    SpecialistDef {
        id: "lead-researcher",
        name: "Lead Researcher",
        manager: "research-manager",
        status: AgentStatus::Tested,
        capabilities: &["lead-profiling"],
        keywords: &["lead", "prospect", "research"],
    },
    SpecialistDef {
        id: "competitor-analyst",
        name: "Competitor Analyst",
        manager: "research-manager",
        status: AgentStatus::Functional,
        capabilities: &["competitive-analysis"],
        keywords: &["competitor", "market"],
    },
    SpecialistDef {
        id: "email-writer",
        name: "Email Writer",
        manager: "outreach-manager",
        status: AgentStatus::Tested,
        capabilities: &["email-copy"],
        keywords: &["email", "outreach", "follow up", "follow-up"],
    },
    SpecialistDef {
        id: "sms-writer",
        name: "SMS Writer",
        manager: "outreach-manager",
        status: AgentStatus::Shell,
        capabilities: &["sms-copy"],
        keywords: &["sms"],
    },
    SpecialistDef {
        id: "blog-writer",
        name: "Blog Writer",
        manager: "content-manager",
        status: AgentStatus::Functional,
        capabilities: &["long-form"],
        keywords: &["blog", "article", "content"],
    },
    SpecialistDef {
        id: "social-writer",
        name: "Social Writer",
        manager: "content-manager",
        status: AgentStatus::Functional,
        capabilities: &["social-copy"],
        keywords: &["social", "post"],
    },
];

/// Produces a structured draft for the incoming intent
struct DraftTask {
    kind: &'static str,
}

#[async_trait]
impl SpecialistTask for DraftTask {
    async fn perform(&self, payload: &Value) -> std::result::Result<Value, String> {
        let intent = extract_intent(payload)
            .ok_or_else(|| format!("payload must include one of: {}", INTENT_FIELDS.join(", ")))?;
        Ok(json!({
            "kind": self.kind,
            "intent": intent,
            "draft": format!("{} for: {}", self.kind, intent),
            "context": payload.get("event").cloned().unwrap_or(Value::Null),
        }))
    }
}

/// Placeholder for an agent that has no working implementation yet
struct UnavailableTask;

#[async_trait]
impl SpecialistTask for UnavailableTask {
    async fn perform(&self, _payload: &Value) -> std::result::Result<Value, String> {
        Err("no working implementation".to_string())
    }
}

fn task_for(def: &SpecialistDef) -> Arc<dyn SpecialistTask> {
    if def.status.is_functional() {
        Arc::new(DraftTask { kind: def.capabilities[0] })
    } else {
        Arc::new(UnavailableTask)
    }
}

/// Registration table for every built-in agent
pub fn default_registrations(settings: &DelegationSettings) -> Result<Vec<Registration>> {
    let mut table = Vec::with_capacity(1 + MANAGERS.len() + SPECIALISTS.len());

    let mut top_router = KeywordRouter::default();
    for manager in MANAGERS {
        top_router = top_router.with_rule(RoutingRule::keywords(manager.id, manager.keywords.iter().copied()));
    }
    table.push(Registration::orchestrator(
        AgentIdentity::new(
            ORCHESTRATOR_ID,
            "Orchestrator",
            "routes goals to managers",
            AgentTier::Orchestrator,
            AgentStatus::Functional,
            ["orchestration"],
            None,
        )?,
        Arc::new(top_router),
        settings.max_concurrency,
    ));

    for manager in MANAGERS {
        let router = SPECIALISTS
            .iter()
            .filter(|s| s.manager == manager.id)
            .fold(KeywordRouter::default(), |router, s| {
                router.with_rule(RoutingRule::keywords(s.id, s.keywords.iter().copied()))
            });
        table.push(Registration::manager(
            AgentIdentity::new(
                manager.id,
                manager.name,
                "delegates to specialists",
                AgentTier::Manager,
                AgentStatus::Functional,
                manager.capabilities.iter().copied(),
                Some(AgentId::new(ORCHESTRATOR_ID)),
            )?,
            Arc::new(router),
            settings.max_concurrency,
        ));
    }

    for specialist in SPECIALISTS {
        table.push(Registration::specialist(
            AgentIdentity::new(
                specialist.id,
                specialist.name,
                "bounded task",
                AgentTier::Specialist,
                specialist.status,
                specialist.capabilities.iter().copied(),
                Some(AgentId::new(specialist.manager)),
            )?,
            task_for(specialist),
        ));
    }

    Ok(table)
}

/// Event rules wiring inbound platform events to managers
pub fn default_event_rules() -> Vec<EventRule> {
    vec![
        EventRule::new("research-new-lead", "lead.created", "research-manager", "research the new lead"),
        EventRule::new("follow-up-reply", "email.replied", "outreach-manager", "draft a follow up email"),
        EventRule::new("content-request", "content.requested", "content-manager", "write a blog article"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::registry::AgentRegistry;
    use crate::report::ReportStatus;
    use serde_json::json;

    fn registry() -> AgentRegistry {
        AgentRegistry::new(default_registrations(&DelegationSettings::default()).unwrap()).unwrap()
    }

    #[test]
    fn test_table_is_consistent() {
        let registry = registry();

        assert_eq!(registry.count(), 1 + MANAGERS.len() + SPECIALISTS.len());
        assert_eq!(registry.list_by_tier(AgentTier::Manager).len(), 3);
        assert_eq!(registry.tier_of("sms-writer"), Some(AgentTier::Specialist));
        assert!(registry.instantiate(ORCHESTRATOR_ID).is_some());
    }

    #[tokio::test]
    async fn test_goal_reaches_specialist_through_every_tier() {
        let registry = registry();
        let orchestrator = registry.instantiate(ORCHESTRATOR_ID).unwrap();

        let report = orchestrator
            .execute(&Message::new("caller", ORCHESTRATOR_ID, json!({"goal": "research competitor pricing"})))
            .await;

        assert_eq!(report.status, ReportStatus::Completed);
        let manager = &report.data["results"]["research-manager"];
        assert_eq!(manager["status"], "COMPLETED");
    }

    #[tokio::test]
    async fn test_shell_specialist_fails_in_isolation() {
        let registry = registry();
        let outreach = registry.instantiate("outreach-manager").unwrap();

        let report = outreach
            .execute(&Message::new("caller", "outreach-manager", json!({"goal": "sms and email follow up"})))
            .await;

        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.data["execution"]["attempted"], 2);
        assert_eq!(report.data["execution"]["failed"], 1);

        let capability = outreach.as_manager().unwrap().get_capability_report();
        assert_eq!(capability.specialists.len(), 2);
    }

    #[tokio::test]
    async fn test_every_agent_rejects_payload_without_intent() {
        let registry = registry();

        for id in registry.list_ids() {
            let agent = registry.instantiate(id.as_str()).unwrap();
            for payload in [json!({}), json!({"industry": "saas"})] {
                let report = agent.execute(&Message::new("caller", id.clone(), payload.clone())).await;
                assert_eq!(report.status, ReportStatus::Failed, "{} accepted {}", id, payload);
                assert!(!report.errors.is_empty(), "{} gave no errors for {}", id, payload);
            }
        }
    }

    #[tokio::test]
    async fn test_draft_carries_intent() {
        let registry = registry();
        let writer = registry.instantiate("blog-writer").unwrap();

        let report = writer
            .execute(&Message::new("caller", "blog-writer", json!({"task": "launch post"})))
            .await;

        assert_eq!(report.status, ReportStatus::Completed);
        assert_eq!(report.data["intent"], "launch post");
        assert_eq!(report.data["draft"], "long-form for: launch post");
    }

    #[test]
    fn test_event_rules_target_registered_managers() {
        let registry = registry();
        for rule in default_event_rules() {
            assert!(registry.contains(rule.target.as_str()), "{}", rule.name);
        }
    }
}
