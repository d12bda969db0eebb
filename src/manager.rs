//! Mid-tier delegation: route an intent to delegates, run them, aggregate

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::agent::{validate_payload, Agent, AgentHandle};
use crate::message::{Message, Signal};
use crate::protocol::{AgentId, AgentIdentity, AgentStatus, AgentTier};
use crate::report::{Report, ReportStatus};
use crate::routing::{extract_intent, KeywordRouter, RoutingStrategy, INTENT_FIELDS};

/// Fan-out bound used when none is configured
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Observed outcomes of one delegate
#[derive(Debug, Clone, Default)]
struct DelegateRecord {
    last: Option<ReportStatus>,
    completed: u64,
    failed: u64,
}

/// Status line for one delegate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateStatus {
    pub id: AgentId,
    pub name: String,
    pub tier: AgentTier,
    pub status: AgentStatus,
    pub last_result: Option<ReportStatus>,
    pub completed: u64,
    pub failed: u64,
}

/// Functional vs. total delegates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionalCount {
    pub functional: usize,
    pub total: usize,
}

/// Summary of what a manager can actually do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub manager_id: AgentId,
    pub specialists: Vec<AgentId>,
    pub functional: usize,
    pub total: usize,
    /// Some delegate has produced a COMPLETED report
    pub actually_works: bool,
    /// Routing targets that name no delegate of this manager
    pub unrouted: Vec<AgentId>,
}

/// An agent that delegates to other agents.
///
/// Used for both L2 managers (delegates are specialists) and the L1
/// orchestrator (delegates are managers).
pub struct Manager {
    identity: AgentIdentity,
    delegates: Vec<AgentHandle>,
    router: Arc<dyn RoutingStrategy>,
    max_concurrency: usize,
    records: RwLock<HashMap<AgentId, DelegateRecord>>,
}

impl Manager {
    pub fn builder(identity: AgentIdentity) -> ManagerBuilder {
        ManagerBuilder::new(identity)
    }

    pub fn delegates(&self) -> &[AgentHandle] {
        &self.delegates
    }

    pub fn delegate(&self, id: &AgentId) -> Option<&AgentHandle> {
        self.delegates.iter().find(|d| d.id() == id)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Delegates the router would pick for an intent, dropping unknown targets
    pub fn resolve(&self, intent: &str) -> Vec<AgentHandle> {
        self.router
            .route(intent)
            .into_iter()
            .filter_map(|target| {
                let found = self.delegate(&target).cloned();
                if found.is_none() {
                    warn!(manager_id = %self.identity.id(), target = %target, "Routing rule names an unknown delegate");
                }
                found
            })
            .collect()
    }

    pub fn get_specialist_statuses(&self) -> Vec<DelegateStatus> {
        let records = self.records.read();
        self.delegates
            .iter()
            .map(|d| {
                let identity = d.identity();
                let record = records.get(identity.id()).cloned().unwrap_or_default();
                DelegateStatus {
                    id: identity.id().clone(),
                    name: identity.name().to_string(),
                    tier: identity.tier(),
                    status: identity.status(),
                    last_result: record.last,
                    completed: record.completed,
                    failed: record.failed,
                }
            })
            .collect()
    }

    pub fn get_functional_specialist_count(&self) -> FunctionalCount {
        FunctionalCount {
            functional: self
                .delegates
                .iter()
                .filter(|d| d.identity().status().is_functional())
                .count(),
            total: self.delegates.len(),
        }
    }

    pub fn get_capability_report(&self) -> CapabilityReport {
        let count = self.get_functional_specialist_count();
        CapabilityReport {
            manager_id: self.identity.id().clone(),
            specialists: self.delegates.iter().map(|d| d.id().clone()).collect(),
            functional: count.functional,
            total: count.total,
            actually_works: self.records.read().values().any(|r| r.completed > 0),
            unrouted: self.unrouted_targets(),
        }
    }

    /// Targets the router can produce that no delegate answers to
    pub fn unrouted_targets(&self) -> Vec<AgentId> {
        self.router
            .targets()
            .into_iter()
            .filter(|target| self.delegate(target).is_none())
            .collect()
    }

    fn record(&self, report: &Report) {
        let mut records = self.records.write();
        let record = records.entry(report.agent_id.clone()).or_default();
        record.last = Some(report.status);
        match report.status {
            ReportStatus::Completed => record.completed += 1,
            ReportStatus::Failed => record.failed += 1,
            _ => {}
        }
    }

    async fn dispatch(&self, message: &Message, parent: Option<&Signal>) -> Report {
        let started = Instant::now();

        let errors = validate_payload(&message.payload, &[]);
        if !errors.is_empty() {
            warn!(errors = ?errors, "Rejected invalid payload");
            return Report::failed(self.identity.id().clone(), message.id, errors);
        }

        let Some(intent) = extract_intent(&message.payload) else {
            return Report::failed(
                self.identity.id().clone(),
                message.id,
                [format!("payload must include one of: {}", INTENT_FIELDS.join(", "))],
            );
        };

        let targets = self.resolve(&intent);
        if targets.is_empty() {
            info!(intent = %intent, "No delegate matched intent");
            return Report::blocked(
                self.identity.id().clone(),
                message.id,
                json!({
                    "delegated": false,
                    "intent": intent,
                    "reason": "no delegate matched the intent",
                    "available": self.delegates.iter().map(|d| d.id().to_string()).collect::<Vec<_>>(),
                }),
            );
        }

        debug!(
            targets = ?targets.iter().map(|t| t.id().to_string()).collect::<Vec<_>>(),
            "Delegating"
        );

        let reports = self.fan_out(message, parent, targets).await;
        self.aggregate(message, intent, reports, started)
    }

    /// Run delegates concurrently (bounded). A delegate that panics is
    /// reported as FAILED; siblings keep running. Output follows input order.
    async fn fan_out(&self, message: &Message, parent: Option<&Signal>, targets: Vec<AgentHandle>) -> Vec<Report> {
        let me = self.identity.id().clone();

        let mut indexed: Vec<(usize, Report)> = stream::iter(targets.into_iter().enumerate())
            .map(|(index, delegate): (usize, AgentHandle)| {
                let child = message.delegate_to(&me, delegate.id());
                let delivery = match parent {
                    Some(signal) => Delivery::Signal(signal.forward(child)),
                    None => Delivery::Message(child),
                };
                run_delegate(index, delegate, delivery)
            })
            .boxed()
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, report)| report).collect()
    }

    fn aggregate(&self, message: &Message, intent: String, reports: Vec<Report>, started: Instant) -> Report {
        let attempted = reports.len();
        let succeeded = reports.iter().filter(|r| r.is_success()).count();

        let mut results = Map::new();
        let mut errors = Vec::new();
        for report in &reports {
            self.record(report);
            if !report.is_success() {
                if report.errors.is_empty() {
                    errors.push(format!("{}: ended {:?}", report.agent_id, report.status));
                } else {
                    errors.push(format!("{}: {}", report.agent_id, report.errors.join("; ")));
                }
            }
            results.insert(
                report.agent_id.to_string(),
                json!({
                    "status": report.status,
                    "data": report.data,
                    "errors": report.errors,
                }),
            );
        }

        let status = if succeeded > 0 {
            ReportStatus::Completed
        } else {
            ReportStatus::Failed
        };

        info!(
            manager_id = %self.identity.id(),
            attempted,
            succeeded,
            "Delegation finished"
        );

        let mut report = Report::new(
            self.identity.id().clone(),
            message.id,
            status,
            json!({
                "intent": intent,
                "delegated": true,
                "results": Value::Object(results),
                "execution": {
                    "attempted": attempted,
                    "succeeded": succeeded,
                    "failed": attempted - succeeded,
                    "duration_ms": started.elapsed().as_millis() as u64,
                },
            }),
        );
        report.errors = errors;
        report
    }
}

/// What a delegate receives: a bare message, or a signal when the
/// manager was itself reached through one
enum Delivery {
    Message(Message),
    Signal(Signal),
}

/// Run one delegate on its own task so a panic stays contained.
///
/// Spawning happens when the future is first polled, which keeps the
/// fan-out concurrency bound intact.
async fn run_delegate(index: usize, delegate: AgentHandle, delivery: Delivery) -> (usize, Report) {
    let delegate_id = delegate.id().clone();
    let task_id = match &delivery {
        Delivery::Message(message) => message.id,
        Delivery::Signal(signal) => signal.payload.id,
    };
    let handle = tokio::spawn(async move {
        match delivery {
            Delivery::Message(message) => delegate.execute(&message).await,
            Delivery::Signal(mut signal) => delegate.handle_signal(&mut signal).await,
        }
    });
    let report = match handle.await {
        Ok(report) => report,
        Err(e) => {
            warn!(delegate = %delegate_id, error = %e, "Delegate aborted");
            Report::failed(delegate_id, task_id, [format!("delegate aborted: {}", e)])
        }
    };
    (index, report)
}

#[async_trait]
impl Agent for Manager {
    fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    #[instrument(skip(self, message), fields(agent_id = %self.identity.id(), task_id = %message.id))]
    async fn execute(&self, message: &Message) -> Report {
        self.dispatch(message, None).await
    }

    /// Record this hop, then pass the signal on to every routed delegate
    #[instrument(skip(self, signal), fields(agent_id = %self.identity.id(), signal_id = %signal.id))]
    async fn handle_signal(&self, signal: &mut Signal) -> Report {
        if let Err(e) = signal.record_hop(self.identity.id()) {
            warn!(error = %e, "Dropping undeliverable signal");
            return Report::failed(self.identity.id().clone(), signal.payload.id, [e.to_string()]);
        }
        let signal: &Signal = signal;
        self.dispatch(&signal.payload, Some(signal)).await
    }

    fn as_manager(&self) -> Option<&Manager> {
        Some(self)
    }
}

/// Builder for [`Manager`]
pub struct ManagerBuilder {
    identity: AgentIdentity,
    delegates: Vec<AgentHandle>,
    router: Option<Arc<dyn RoutingStrategy>>,
    max_concurrency: usize,
}

impl ManagerBuilder {
    pub fn new(identity: AgentIdentity) -> Self {
        Self {
            identity,
            delegates: Vec::new(),
            router: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    pub fn delegate(mut self, delegate: AgentHandle) -> Self {
        self.delegates.push(delegate);
        self
    }

    pub fn delegates(mut self, delegates: impl IntoIterator<Item = AgentHandle>) -> Self {
        self.delegates.extend(delegates);
        self
    }

    pub fn router(mut self, router: Arc<dyn RoutingStrategy>) -> Self {
        self.router = Some(router);
        self
    }

    /// Clamped to at least one
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn build(self) -> Manager {
        info!(
            manager_id = %self.identity.id(),
            delegates = self.delegates.len(),
            "Creating manager"
        );

        let manager = Manager {
            identity: self.identity,
            delegates: self.delegates,
            router: self
                .router
                .unwrap_or_else(|| Arc::new(KeywordRouter::default())),
            max_concurrency: self.max_concurrency,
            records: RwLock::new(HashMap::new()),
        };

        let unrouted = manager.unrouted_targets();
        if !unrouted.is_empty() {
            warn!(manager_id = %manager.identity.id(), unrouted = ?unrouted, "Routing rules name unknown delegates");
        }
        manager
    }
}
