//! Agent registry: the static registration table plus an instance cache
//!
//! Constructed once at process start and shared by reference. Unknown ids
//! yield `None`, never an error.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::agent::{AgentHandle, Specialist, SpecialistTask};
use crate::error::{Result, SyndicateError};
use crate::hierarchy::{AgentHierarchy, AgentTree};
use crate::manager::Manager;
use crate::protocol::{AgentId, AgentIdentity, AgentTier};
use crate::routing::RoutingStrategy;

/// Builds an agent. Receives the registry so delegating agents can
/// instantiate their children.
pub type AgentFactory = Arc<dyn Fn(&AgentRegistry, &AgentIdentity) -> Option<AgentHandle> + Send + Sync>;

/// One row of the registration table
#[derive(Clone)]
pub struct Registration {
    identity: AgentIdentity,
    factory: AgentFactory,
}

impl Registration {
    pub fn new<F>(identity: AgentIdentity, factory: F) -> Self
    where
        F: Fn(&AgentRegistry, &AgentIdentity) -> Option<AgentHandle> + Send + Sync + 'static,
    {
        Self {
            identity,
            factory: Arc::new(factory),
        }
    }

    /// Leaf agent running `task`
    pub fn specialist(identity: AgentIdentity, task: Arc<dyn SpecialistTask>) -> Self {
        Self::new(identity, move |_, identity| {
            Some(Arc::new(Specialist::new(identity.clone(), Arc::clone(&task))) as AgentHandle)
        })
    }

    /// Manager delegating to every registered agent that reports to it
    pub fn manager(identity: AgentIdentity, router: Arc<dyn RoutingStrategy>, max_concurrency: usize) -> Self {
        Self::new(identity, move |registry, identity| {
            let manager = Manager::builder(identity.clone())
                .delegates(registry.instantiate_children(identity.id()))
                .router(Arc::clone(&router))
                .max_concurrency(max_concurrency)
                .build();
            Some(Arc::new(manager) as AgentHandle)
        })
    }

    /// Orchestrator delegating to every registered manager that reports to it
    pub fn orchestrator(identity: AgentIdentity, router: Arc<dyn RoutingStrategy>, max_concurrency: usize) -> Self {
        Self::new(identity, move |registry, identity| {
            let built = Manager::orchestrator(identity.clone())
                .managers(registry.instantiate_children(identity.id()))
                .router(Arc::clone(&router))
                .max_concurrency(max_concurrency)
                .build();
            match built {
                Ok(orchestrator) => Some(Arc::new(orchestrator) as AgentHandle),
                Err(e) => {
                    warn!(agent_id = %identity.id(), error = %e, "Failed to build orchestrator");
                    None
                }
            }
        })
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Constructs and caches agents by id
pub struct AgentRegistry {
    registrations: Vec<Registration>,
    index: HashMap<AgentId, usize>,
    hierarchy: AgentHierarchy,
    instances: RwLock<HashMap<AgentId, AgentHandle>>,
}

impl AgentRegistry {
    /// Validate the table and build the hierarchy.
    ///
    /// Rejects duplicate ids, `reports_to` pointing at unregistered agents,
    /// and tier inversions.
    pub fn new(registrations: Vec<Registration>) -> Result<Self> {
        let mut index = HashMap::new();
        for (position, registration) in registrations.iter().enumerate() {
            let id = registration.identity.id().clone();
            if index.insert(id.clone(), position).is_some() {
                return Err(SyndicateError::Registry(format!("duplicate agent id: {}", id)));
            }
        }

        for registration in &registrations {
            let identity = &registration.identity;
            let Some(parent_id) = identity.reports_to() else {
                continue;
            };
            let parent = index
                .get(parent_id)
                .map(|&i| &registrations[i].identity)
                .ok_or_else(|| {
                    SyndicateError::Registry(format!(
                        "{} reports to unregistered agent {}",
                        identity.id(),
                        parent_id
                    ))
                })?;
            if identity.tier().parent_tier() != Some(parent.tier()) {
                return Err(SyndicateError::Registry(format!(
                    "{} ({}) cannot report to {} ({})",
                    identity.id(),
                    identity.tier(),
                    parent.id(),
                    parent.tier()
                )));
            }
        }

        let mut ordered: Vec<&Registration> = registrations.iter().collect();
        ordered.sort_by_key(|r| r.identity.tier().level());
        let mut hierarchy = AgentHierarchy::new();
        for registration in ordered {
            let identity = &registration.identity;
            hierarchy.add_agent(identity.id().clone(), identity.tier(), identity.reports_to().cloned());
        }

        info!(agents = registrations.len(), "Agent registry ready");

        Ok(Self {
            registrations,
            index,
            hierarchy,
            instances: RwLock::new(HashMap::new()),
        })
    }

    fn registration(&self, id: &str) -> Option<&Registration> {
        self.index
            .get(&AgentId::new(id))
            .map(|&position| &self.registrations[position])
    }

    /// Build (or fetch the cached) agent. `None` for unknown ids.
    pub fn instantiate(&self, id: &str) -> Option<AgentHandle> {
        let agent_id = AgentId::new(id);
        if let Some(agent) = self.instances.read().get(&agent_id) {
            debug!(agent_id = %agent_id, "Registry cache hit");
            return Some(Arc::clone(agent));
        }

        let Some(registration) = self.registration(id) else {
            debug!(agent_id = %agent_id, "Unknown agent id");
            return None;
        };

        // No lock held here: manager factories re-enter the registry.
        let agent = (registration.factory)(self, &registration.identity)?;

        let mut instances = self.instances.write();
        let cached = instances.entry(agent_id.clone()).or_insert(agent);
        debug!(agent_id = %agent_id, "Agent instantiated");
        Some(Arc::clone(cached))
    }

    /// Instantiate every agent registered as reporting to `parent`
    pub fn instantiate_children(&self, parent: &AgentId) -> Vec<AgentHandle> {
        self.registrations
            .iter()
            .filter(|r| r.identity.reports_to() == Some(parent))
            .filter_map(|r| {
                let child = self.instantiate(r.identity.id().as_str());
                if child.is_none() {
                    warn!(parent = %parent, child = %r.identity.id(), "Child agent could not be built");
                }
                child
            })
            .collect()
    }

    /// Ids in registration order
    pub fn list_ids(&self) -> Vec<AgentId> {
        self.registrations
            .iter()
            .map(|r| r.identity.id().clone())
            .collect()
    }

    /// Ids of one tier, in registration order
    pub fn list_by_tier(&self, tier: AgentTier) -> Vec<AgentId> {
        self.registrations
            .iter()
            .filter(|r| r.identity.tier() == tier)
            .map(|r| r.identity.id().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.registrations.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registration(id).is_some()
    }

    pub fn tier_of(&self, id: &str) -> Option<AgentTier> {
        self.registration(id).map(|r| r.identity.tier())
    }

    pub fn identity(&self, id: &str) -> Option<&AgentIdentity> {
        self.registration(id).map(|r| &r.identity)
    }

    /// Number of agents built so far
    pub fn cached_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Agents above `id`, nearest first
    pub fn chain_of_command(&self, id: &str) -> Vec<AgentId> {
        self.hierarchy.chain_of_command(&AgentId::new(id))
    }

    pub fn hierarchy(&self) -> &AgentHierarchy {
        &self.hierarchy
    }

    /// Hierarchy annotated with each agent's build status
    pub fn tree(&self) -> Option<AgentTree> {
        let statuses = self
            .registrations
            .iter()
            .map(|r| (r.identity.id().clone(), r.identity.status()))
            .collect();
        self.hierarchy.to_tree(&statuses)
    }
}
