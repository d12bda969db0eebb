//! Event log, deduplication and replay
//!
//! Ingestion is at-least-once: an entry is persisted unconfirmed before any
//! action is dispatched and confirmed only after every dispatched action
//! settled. An event counts as processed only once a confirmed entry with its
//! dedup key exists, so a crash between persist and confirm leaves an entry
//! for the replay sweep instead of losing the event.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, SyndicateError};
use crate::message::{Message, MessageType};
use crate::protocol::AgentId;
use crate::registry::AgentRegistry;
use crate::report::ReportStatus;
use crate::store::{timestamp_value, DocumentStore, DocumentStoreExt, Query, SortOrder};

const EVENT_LOG: &str = "event_log";
const PIPELINE_ID: &str = "event-pipeline";

/// An event as received from a source, before logging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingEvent {
    pub event_type: String,
    pub source: String,
    pub payload: Value,
    /// Source-supplied idempotency key; overrides the content hash
    pub idempotency_key: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl IncomingEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            payload,
            idempotency_key: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Stable key: the source's idempotency key when given, otherwise a
    /// SHA-256 over type, source and payload. Arrival time is excluded.
    pub fn dedup_key(&self) -> String {
        if let Some(key) = &self.idempotency_key {
            return format!("idem:{}:{}", self.source, key);
        }

        let mut hasher = Sha256::new();
        hasher.update(self.event_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.source.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.payload.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Outcome of one rule's action for an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchedAction {
    pub rule: String,
    pub target: AgentId,
    pub status: ReportStatus,
}

impl DispatchedAction {
    /// COMPLETED and BLOCKED settle an action; it is never dispatched again
    pub fn is_settled(&self) -> bool {
        matches!(self.status, ReportStatus::Completed | ReportStatus::Blocked)
    }
}

/// Durable record of one ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: Value,
    pub dedup_key: String,
    pub matched_rules: Vec<String>,
    pub dispatched_actions: Vec<DispatchedAction>,
    pub processing_time_ms: u64,
    pub confirmed: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl EventLogEntry {
    /// Unconfirmed entry for an incoming event
    pub fn from_event(event: &IncomingEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event.event_type.clone(),
            timestamp: event.received_at,
            source: event.source.clone(),
            payload: event.payload.clone(),
            dedup_key: event.dedup_key(),
            matched_rules: Vec::new(),
            dispatched_actions: Vec::new(),
            processing_time_ms: 0,
            confirmed: false,
            confirmed_at: None,
        }
    }
}

/// Event log bookkeeping over a [`DocumentStore`]
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn DocumentStore>,
}

impl EventLog {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Insert a new entry. Entries are always stored unconfirmed.
    pub async fn persist_event_log(&self, entry: &EventLogEntry) -> Result<()> {
        let mut entry = entry.clone();
        entry.confirmed = false;
        entry.confirmed_at = None;
        self.store.create_doc(EVENT_LOG, &entry.id, &entry).await?;
        debug!(event_id = %entry.id, dedup_key = %entry.dedup_key, "Event logged");
        Ok(())
    }

    /// Overwrite an entry's bookkeeping (matched rules, actions, timing)
    pub async fn update_event_log(&self, entry: &EventLogEntry) -> Result<()> {
        self.store.put_doc(EVENT_LOG, &entry.id, entry).await
    }

    pub async fn get_event(&self, id: &str) -> Result<Option<EventLogEntry>> {
        self.store.get_doc(EVENT_LOG, id).await
    }

    /// Mark an entry confirmed. Confirming twice is a no-op.
    pub async fn confirm_event(&self, id: &str) -> Result<()> {
        let mut entry = self
            .get_event(id)
            .await?
            .ok_or_else(|| SyndicateError::EventNotFound(id.to_string()))?;
        if entry.confirmed {
            return Ok(());
        }

        entry.confirmed = true;
        entry.confirmed_at = Some(Utc::now());
        self.store.put_doc(EVENT_LOG, id, &entry).await?;
        info!(event_id = %id, event_type = %entry.event_type, "Event confirmed");
        Ok(())
    }

    /// True only when a confirmed entry carries `dedup_key`
    pub async fn is_event_processed(&self, dedup_key: &str) -> Result<bool> {
        let query = Query::new()
            .eq("dedup_key", dedup_key)
            .eq("confirmed", true)
            .limit(1);
        Ok(!self.store.query(EVENT_LOG, &query).await?.is_empty())
    }

    /// Unconfirmed entries from the trailing window, oldest first
    pub async fn find_unconfirmed_events(&self, window_minutes: u32) -> Result<Vec<EventLogEntry>> {
        let since = Utc::now() - Duration::minutes(i64::from(window_minutes));
        let query = Query::new()
            .eq("confirmed", false)
            .gte("timestamp", timestamp_value(since))
            .order_by("timestamp", SortOrder::Asc);
        self.store.query_docs(EVENT_LOG, &query).await
    }

    /// Delete confirmed entries older than `max_age_days`. Unconfirmed
    /// entries are kept whatever their age.
    pub async fn cleanup_confirmed_events(&self, max_age_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        let query = Query::new()
            .eq("confirmed", true)
            .lt("timestamp", timestamp_value(cutoff));

        let mut deleted = 0;
        for entry in self.store.query_docs::<EventLogEntry>(EVENT_LOG, &query).await? {
            if self.store.delete(EVENT_LOG, &entry.id).await? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(deleted, max_age_days, "Cleaned up confirmed events");
        }
        Ok(deleted)
    }
}

/// Maps an event type (and optional payload conditions) to an agent goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRule {
    pub name: String,
    pub event_type: String,
    /// `(field, value)` pairs the payload must carry
    pub conditions: Vec<(String, Value)>,
    pub target: AgentId,
    pub goal: String,
}

impl EventRule {
    pub fn new(
        name: impl Into<String>,
        event_type: impl Into<String>,
        target: impl Into<AgentId>,
        goal: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            event_type: event_type.into(),
            conditions: Vec::new(),
            target: target.into(),
            goal: goal.into(),
        }
    }

    pub fn when(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, event_type: &str, payload: &Value) -> bool {
        self.event_type == event_type
            && self
                .conditions
                .iter()
                .all(|(field, expected)| payload.get(field) == Some(expected))
    }
}

/// Result of [`EventPipeline::ingest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// A confirmed entry with the same dedup key exists
    Duplicate { dedup_key: String },
    Processed {
        event_id: String,
        dispatched: usize,
        failed: usize,
        confirmed: bool,
    },
}

/// Outcome counts of one replay sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub replayed: usize,
    /// Confirmed without dispatch because a sibling entry already was
    pub superseded: usize,
    pub still_pending: usize,
}

/// Dedup, persist, dispatch to agents, confirm
pub struct EventPipeline {
    log: EventLog,
    registry: Arc<AgentRegistry>,
    rules: Vec<EventRule>,
}

impl EventPipeline {
    pub fn new(log: EventLog, registry: Arc<AgentRegistry>) -> Self {
        Self {
            log,
            registry,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: EventRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    #[instrument(skip(self, event), fields(event_type = %event.event_type, source = %event.source))]
    pub async fn ingest(&self, event: IncomingEvent) -> Result<IngestOutcome> {
        let dedup_key = event.dedup_key();
        if self.log.is_event_processed(&dedup_key).await? {
            debug!(dedup_key = %dedup_key, "Duplicate event ignored");
            return Ok(IngestOutcome::Duplicate { dedup_key });
        }

        let entry = EventLogEntry::from_event(&event);
        self.log.persist_event_log(&entry).await?;
        self.process(entry).await
    }

    /// Re-dispatch entries stuck between persist and confirm
    #[instrument(skip(self))]
    pub async fn replay_unconfirmed(&self, window_minutes: u32) -> Result<ReplaySummary> {
        let mut summary = ReplaySummary::default();

        for entry in self.log.find_unconfirmed_events(window_minutes).await? {
            if self.log.is_event_processed(&entry.dedup_key).await? {
                self.log.confirm_event(&entry.id).await?;
                summary.superseded += 1;
                continue;
            }

            match self.process(entry).await? {
                IngestOutcome::Processed { confirmed: true, .. } => summary.replayed += 1,
                _ => summary.still_pending += 1,
            }
        }

        if summary != ReplaySummary::default() {
            info!(?summary, "Replay sweep finished");
        }
        Ok(summary)
    }

    /// Dispatch every matching rule, record actions, confirm on success.
    ///
    /// A rule whose recorded action already settled is not dispatched
    /// again on replay. A FAILED report, a panicking agent or an unknown
    /// target leaves the entry unconfirmed for replay.
    async fn process(&self, mut entry: EventLogEntry) -> Result<IngestOutcome> {
        let started = Instant::now();
        let matched: Vec<&EventRule> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(&entry.event_type, &entry.payload))
            .collect();

        entry.matched_rules = matched.iter().map(|rule| rule.name.clone()).collect();
        let previous = std::mem::take(&mut entry.dispatched_actions);

        let mut dispatched = 0;
        let mut failed = 0;
        for rule in &matched {
            if let Some(done) = previous.iter().find(|a| a.rule == rule.name && a.is_settled()) {
                debug!(event_id = %entry.id, rule = %rule.name, "Action already settled");
                entry.dispatched_actions.push(done.clone());
                continue;
            }

            let action = DispatchedAction {
                rule: rule.name.clone(),
                target: rule.target.clone(),
                status: self.dispatch(&entry, rule).await,
            };
            dispatched += 1;
            if !action.is_settled() {
                failed += 1;
            }
            entry.dispatched_actions.push(action);
            self.log.update_event_log(&entry).await?;
        }

        entry.processing_time_ms = started.elapsed().as_millis() as u64;
        self.log.update_event_log(&entry).await?;

        let confirmed = failed == 0;
        if confirmed {
            self.log.confirm_event(&entry.id).await?;
        } else {
            warn!(event_id = %entry.id, failed, "Event left unconfirmed for replay");
        }

        Ok(IngestOutcome::Processed {
            event_id: entry.id,
            dispatched,
            failed,
            confirmed,
        })
    }

    /// Run one rule's goal on its own task so a panicking agent fails the
    /// action instead of the pipeline
    async fn dispatch(&self, entry: &EventLogEntry, rule: &EventRule) -> ReportStatus {
        let Some(agent) = self.registry.instantiate(rule.target.as_str()) else {
            warn!(rule = %rule.name, target = %rule.target, "Event rule targets an unknown agent");
            return ReportStatus::Failed;
        };

        let message = Message::new(
            AgentId::new(PIPELINE_ID),
            rule.target.clone(),
            json!({
                "goal": rule.goal,
                "event_type": entry.event_type,
                "event": entry.payload,
            }),
        )
        .with_type(MessageType::Event);

        match tokio::spawn(async move { agent.execute(&message).await }).await {
            Ok(report) => report.status,
            Err(e) => {
                warn!(rule = %rule.name, target = %rule.target, error = %e, "Event action aborted");
                ReportStatus::Failed
            }
        }
    }
}
