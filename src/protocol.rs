//! Identifiers and identity types shared by every tier

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyndicateError};

/// Stable registry identifier of an agent (e.g. `research-manager`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a single message; doubles as the task id of its report
    MessageId
);
uuid_id!(
    /// Correlates every message spawned from one inbound goal
    TraceId
);
uuid_id!(
    /// Identifier of a routed signal
    SignalId
);
uuid_id!(
    /// Correlates a runtime command with the notices it produces
    SubmissionId
);

/// Build maturity of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Referenced but never written
    Ghost,
    /// Planned, no code yet
    Unbuilt,
    /// Skeleton that cannot complete work
    Shell,
    /// Does real work
    Functional,
    /// Does real work and is covered by tests
    Tested,
}

impl AgentStatus {
    pub fn is_functional(&self) -> bool {
        matches!(self, AgentStatus::Functional | AgentStatus::Tested)
    }
}

/// Position of an agent in the delegation hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTier {
    /// L1: routes goals to managers
    Orchestrator,
    /// L2: routes intents to specialists
    Manager,
    /// L3: executes one bounded task
    Specialist,
}

impl AgentTier {
    pub fn level(&self) -> u8 {
        match self {
            AgentTier::Orchestrator => 1,
            AgentTier::Manager => 2,
            AgentTier::Specialist => 3,
        }
    }

    /// Tier an agent of this tier must report to
    pub fn parent_tier(&self) -> Option<AgentTier> {
        match self {
            AgentTier::Orchestrator => None,
            AgentTier::Manager => Some(AgentTier::Orchestrator),
            AgentTier::Specialist => Some(AgentTier::Manager),
        }
    }
}

impl fmt::Display for AgentTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.level())
    }
}

/// Message priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Immutable description of an agent, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    id: AgentId,
    name: String,
    role: String,
    tier: AgentTier,
    status: AgentStatus,
    capabilities: BTreeSet<String>,
    reports_to: Option<AgentId>,
}

impl AgentIdentity {
    /// Create an identity. At least one capability is required.
    pub fn new<I, S>(
        id: impl Into<AgentId>,
        name: impl Into<String>,
        role: impl Into<String>,
        tier: AgentTier,
        status: AgentStatus,
        capabilities: I,
        reports_to: Option<AgentId>,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        let capabilities: BTreeSet<String> = capabilities
            .into_iter()
            .map(Into::into)
            .filter(|c: &String| !c.trim().is_empty())
            .collect();

        if id.as_str().trim().is_empty() {
            return Err(SyndicateError::InvalidIdentity("agent id is empty".into()));
        }
        if capabilities.is_empty() {
            return Err(SyndicateError::InvalidIdentity(format!(
                "{} declares no capabilities",
                id
            )));
        }

        Ok(Self {
            id,
            name: name.into(),
            role: role.into(),
            tier,
            status,
            capabilities,
            reports_to,
        })
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn tier(&self) -> AgentTier {
        self.tier
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    pub fn reports_to(&self) -> Option<&AgentId> {
        self.reports_to.as_ref()
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_requires_capabilities() {
        let result = AgentIdentity::new(
            "copywriter",
            "Copywriter",
            "content",
            AgentTier::Specialist,
            AgentStatus::Functional,
            Vec::<String>::new(),
            None,
        );
        assert!(matches!(result, Err(SyndicateError::InvalidIdentity(_))));
    }

    #[test]
    fn test_identity_drops_blank_capabilities() {
        let identity = AgentIdentity::new(
            "copywriter",
            "Copywriter",
            "content",
            AgentTier::Specialist,
            AgentStatus::Tested,
            ["copy", " "],
            Some(AgentId::new("content-manager")),
        )
        .unwrap();

        assert_eq!(identity.capabilities().len(), 1);
        assert!(identity.has_capability("copy"));
        assert_eq!(identity.reports_to().map(AgentId::as_str), Some("content-manager"));
    }

    #[test]
    fn test_tier_levels() {
        assert_eq!(AgentTier::Orchestrator.level(), 1);
        assert_eq!(AgentTier::Specialist.parent_tier(), Some(AgentTier::Manager));
        assert_eq!(AgentTier::Manager.to_string(), "L2");
    }

    #[test]
    fn test_status_serializes_screaming() {
        let json = serde_json::to_string(&AgentStatus::Functional).unwrap();
        assert_eq!(json, "\"FUNCTIONAL\"");
        assert!(!AgentStatus::Shell.is_functional());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
