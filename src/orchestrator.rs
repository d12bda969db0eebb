//! Top-tier orchestrator
//!
//! The orchestrator is not a separate type: it is a [`Manager`] whose
//! delegates are managers. Routing, fan-out, isolation and aggregation are
//! exactly the manager's, applied one tier up.

use std::sync::Arc;

use tracing::info;

use crate::agent::AgentHandle;
use crate::error::{Result, SyndicateError};
use crate::manager::{Manager, ManagerBuilder};
use crate::protocol::{AgentIdentity, AgentTier};
use crate::routing::RoutingStrategy;

/// Builds an L1 [`Manager`] and checks that every delegate is a manager
pub struct OrchestratorBuilder {
    identity: AgentIdentity,
    managers: Vec<AgentHandle>,
    router: Option<Arc<dyn RoutingStrategy>>,
    max_concurrency: Option<usize>,
}

impl Manager {
    pub fn orchestrator(identity: AgentIdentity) -> OrchestratorBuilder {
        OrchestratorBuilder {
            identity,
            managers: Vec::new(),
            router: None,
            max_concurrency: None,
        }
    }
}

impl OrchestratorBuilder {
    pub fn manager(mut self, manager: AgentHandle) -> Self {
        self.managers.push(manager);
        self
    }

    pub fn managers(mut self, managers: impl IntoIterator<Item = AgentHandle>) -> Self {
        self.managers.extend(managers);
        self
    }

    pub fn router(mut self, router: Arc<dyn RoutingStrategy>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn build(self) -> Result<Manager> {
        if self.identity.tier() != AgentTier::Orchestrator {
            return Err(SyndicateError::InvalidIdentity(format!(
                "{} is {} but an orchestrator must be L1",
                self.identity.id(),
                self.identity.tier()
            )));
        }

        if let Some(not_manager) = self.managers.iter().find(|m| m.as_manager().is_none()) {
            return Err(SyndicateError::Registry(format!(
                "orchestrator {} cannot delegate to {}: not a manager",
                self.identity.id(),
                not_manager.id()
            )));
        }

        info!(
            orchestrator_id = %self.identity.id(),
            managers = self.managers.len(),
            "Creating orchestrator"
        );

        let mut builder = ManagerBuilder::new(self.identity).delegates(self.managers);
        if let Some(router) = self.router {
            builder = builder.router(router);
        }
        if let Some(max) = self.max_concurrency {
            builder = builder.max_concurrency(max);
        }
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::message::Message;
    use crate::protocol::AgentStatus;
    use crate::report::ReportStatus;
    use crate::routing::{KeywordRouter, RoutingRule};
    use crate::testing::{echo_specialist, goal, identity, research_manager};
    use serde_json::json;

    fn create_test_orchestrator() -> Manager {
        let content = Manager::builder(identity("content-manager", AgentTier::Manager, AgentStatus::Functional, Some("orchestrator")))
            .delegate(echo_specialist("copywriter", "content-manager"))
            .router(Arc::new(
                KeywordRouter::default().with_rule(RoutingRule::keywords("copywriter", ["copy", "blog"])),
            ))
            .build();

        Manager::orchestrator(identity("orchestrator", AgentTier::Orchestrator, AgentStatus::Functional, None))
            .manager(Arc::new(research_manager()))
            .manager(Arc::new(content))
            .router(Arc::new(
                KeywordRouter::default()
                    .with_rule(RoutingRule::keywords("research-manager", ["research", "competitor", "trend"]))
                    .with_rule(RoutingRule::keywords("content-manager", ["copy", "blog"])),
            ))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_orchestrator_recurses_through_managers() {
        let orchestrator = create_test_orchestrator();
        let msg = Message::new("user", "orchestrator", goal("competitor research"));

        let report = orchestrator.execute(&msg).await;

        assert_eq!(report.status, ReportStatus::Completed);
        let research = &report.data["results"]["research-manager"];
        assert_eq!(research["status"], "COMPLETED");
        assert_eq!(research["data"]["execution"]["succeeded"], 2);
    }

    #[tokio::test]
    async fn test_composite_goal_reaches_several_managers() {
        let orchestrator = create_test_orchestrator();
        let msg = Message::new("user", "orchestrator", goal("trend research and a blog post"));

        let report = orchestrator.execute(&msg).await;

        assert_eq!(report.data["execution"]["attempted"], 2);
        assert_eq!(report.data["execution"]["succeeded"], 2);
    }

    #[tokio::test]
    async fn test_orchestrator_miss_is_blocked() {
        let orchestrator = create_test_orchestrator();
        let report = orchestrator
            .execute(&Message::new("user", "orchestrator", goal("file taxes")))
            .await;

        assert_eq!(report.status, ReportStatus::Blocked);
    }

    #[tokio::test]
    async fn test_orchestrator_rejects_empty_payload() {
        let orchestrator = create_test_orchestrator();
        let report = orchestrator
            .execute(&Message::new("user", "orchestrator", json!(null)))
            .await;

        assert_eq!(report.status, ReportStatus::Failed);
        assert!(!report.errors.is_empty());
    }

    #[test]
    fn test_orchestrator_rejects_specialist_delegates() {
        let result = Manager::orchestrator(identity("orchestrator", AgentTier::Orchestrator, AgentStatus::Functional, None))
            .manager(echo_specialist("copywriter", "orchestrator"))
            .build();

        assert!(matches!(result, Err(SyndicateError::Registry(_))));
    }

    #[test]
    fn test_orchestrator_requires_l1_identity() {
        let result = Manager::orchestrator(identity("lead", AgentTier::Manager, AgentStatus::Functional, None)).build();
        assert!(matches!(result, Err(SyndicateError::InvalidIdentity(_))));
    }
}
