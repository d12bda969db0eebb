//! Reporting lines between registered agents

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::protocol::{AgentId, AgentStatus, AgentTier};

/// Node in the agent hierarchy
#[derive(Debug, Clone)]
struct HierarchyNode {
    tier: AgentTier,
    parent: Option<AgentId>,
    children: Vec<AgentId>,
}

/// Serialisable view of the hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTree {
    pub agent_id: AgentId,
    pub tier: AgentTier,
    pub status: Option<AgentStatus>,
    pub children: Vec<AgentTree>,
}

/// Tree of agents (orchestrator → managers → specialists)
#[derive(Debug, Clone)]
pub struct AgentHierarchy {
    /// All nodes by agent ID
    nodes: HashMap<AgentId, HierarchyNode>,
    /// First agent added without a parent
    root: Option<AgentId>,
}

impl AgentHierarchy {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            root: None,
        }
    }

    /// Add an agent under `parent_id`. Parents must be added before children.
    pub fn add_agent(&mut self, agent_id: AgentId, tier: AgentTier, parent_id: Option<AgentId>) {
        if parent_id.is_none() && self.root.is_none() {
            self.root = Some(agent_id.clone());
        }

        if let Some(pid) = &parent_id {
            if let Some(parent) = self.nodes.get_mut(pid) {
                parent.children.push(agent_id.clone());
            }
        }

        self.nodes.insert(
            agent_id,
            HierarchyNode {
                tier,
                parent: parent_id,
                children: Vec::new(),
            },
        );
    }

    pub fn root(&self) -> Option<&AgentId> {
        self.root.as_ref()
    }

    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.nodes.contains_key(agent_id)
    }

    pub fn tier(&self, agent_id: &AgentId) -> Option<AgentTier> {
        self.nodes.get(agent_id).map(|n| n.tier)
    }

    pub fn parent(&self, agent_id: &AgentId) -> Option<&AgentId> {
        self.nodes.get(agent_id).and_then(|n| n.parent.as_ref())
    }

    /// Children in insertion order
    pub fn children(&self, agent_id: &AgentId) -> Vec<AgentId> {
        self.nodes
            .get(agent_id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Ancestors of an agent, nearest first. Empty for roots and unknown ids.
    pub fn chain_of_command(&self, agent_id: &AgentId) -> Vec<AgentId> {
        let mut chain = Vec::new();
        let mut current = self.parent(agent_id);
        while let Some(id) = current {
            if chain.contains(id) {
                break;
            }
            chain.push(id.clone());
            current = self.parent(id);
        }
        chain
    }

    /// Distance from the root
    pub fn depth(&self, agent_id: &AgentId) -> usize {
        self.chain_of_command(agent_id).len()
    }

    /// Every agent below `agent_id`, depth-first in insertion order
    pub fn descendants(&self, agent_id: &AgentId) -> Vec<AgentId> {
        let mut found = Vec::new();
        let mut stack: Vec<AgentId> = self.children(agent_id).into_iter().rev().collect();
        while let Some(id) = stack.pop() {
            stack.extend(self.children(&id).into_iter().rev());
            found.push(id);
        }
        found
    }

    /// Agents of one tier, sorted
    pub fn agents_at_tier(&self, tier: AgentTier) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.tier == tier)
            .map(|(id, _)| id.clone())
            .collect();
        agents.sort();
        agents
    }

    /// Convert to a serialisable tree rooted at the root agent
    pub fn to_tree(&self, statuses: &HashMap<AgentId, AgentStatus>) -> Option<AgentTree> {
        self.root
            .as_ref()
            .map(|root| self.build_tree_node(root, statuses))
    }

    fn build_tree_node(&self, agent_id: &AgentId, statuses: &HashMap<AgentId, AgentStatus>) -> AgentTree {
        let node = self.nodes.get(agent_id);

        AgentTree {
            agent_id: agent_id.clone(),
            tier: node.map(|n| n.tier).unwrap_or(AgentTier::Specialist),
            status: statuses.get(agent_id).copied(),
            children: node
                .map(|n| n.children.as_slice())
                .unwrap_or_default()
                .iter()
                .map(|child| self.build_tree_node(child, statuses))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for AgentHierarchy {
    fn default() -> Self {
        Self::new()
    }
}
