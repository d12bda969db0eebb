//! Runtime event loop
//!
//! Callers submit [`Op`]s through a [`RuntimeChannel`] and read [`Notice`]s
//! back. Every notice carries the `sub_id` of the op that produced it.

use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::{ChannelPair, RuntimeChannel};
use crate::config::Settings;
use crate::error::{Result, SyndicateError};
use crate::events::{EventLog, EventPipeline, EventRule, IncomingEvent, IngestOutcome, ReplaySummary};
use crate::message::{Message, Signal};
use crate::protocol::{AgentId, Priority, SubmissionId};
use crate::registry::AgentRegistry;
use crate::report::{Report, Response};
use crate::saga::{CompensatingAction, ResumeSummary, SagaEngine, SagaStatus, SagaStep, SagaStore};
use crate::sequencer::{ChannelSender, ConditionKind, SequenceEnrollment, Sequencer};
use crate::store::DocumentStore;

const RUNTIME_ID: &str = "runtime";

/// Periodic background work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sweep {
    /// Resume incomplete sagas
    Sagas,
    /// Replay unconfirmed events
    Events,
    /// Execute due sequence steps
    Sequences,
    /// Delete old terminal sagas and confirmed events
    Retention,
}

impl Sweep {
    pub const ALL: [Sweep; 4] = [Sweep::Sagas, Sweep::Events, Sweep::Sequences, Sweep::Retention];
}

/// Commands accepted by the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    /// Send a goal to one registered agent
    Execute {
        sub_id: SubmissionId,
        target: AgentId,
        payload: Value,
        #[serde(default)]
        priority: Priority,
    },
    IngestEvent {
        sub_id: SubmissionId,
        event: IncomingEvent,
    },
    StartSaga {
        sub_id: SubmissionId,
        name: String,
        steps: Vec<SagaStep>,
    },
    Enroll {
        sub_id: SubmissionId,
        sequence_id: String,
        subject_id: String,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    Condition {
        sub_id: SubmissionId,
        enrollment_id: String,
        kind: ConditionKind,
    },
    Sweep {
        sub_id: SubmissionId,
        sweep: Sweep,
    },
    /// Run every sweep once
    Maintenance { sub_id: SubmissionId },
    Shutdown { sub_id: SubmissionId },
}

impl Op {
    pub fn sub_id(&self) -> SubmissionId {
        match self {
            Op::Execute { sub_id, .. }
            | Op::IngestEvent { sub_id, .. }
            | Op::StartSaga { sub_id, .. }
            | Op::Enroll { sub_id, .. }
            | Op::Condition { sub_id, .. }
            | Op::Sweep { sub_id, .. }
            | Op::Maintenance { sub_id }
            | Op::Shutdown { sub_id } => *sub_id,
        }
    }

    pub fn execute(target: impl Into<AgentId>, payload: Value) -> Self {
        Op::Execute {
            sub_id: SubmissionId::new(),
            target: target.into(),
            payload,
            priority: Priority::default(),
        }
    }

    pub fn ingest(event: IncomingEvent) -> Self {
        Op::IngestEvent {
            sub_id: SubmissionId::new(),
            event,
        }
    }

    pub fn start_saga(name: impl Into<String>, steps: Vec<SagaStep>) -> Self {
        Op::StartSaga {
            sub_id: SubmissionId::new(),
            name: name.into(),
            steps,
        }
    }

    pub fn sweep(sweep: Sweep) -> Self {
        Op::Sweep {
            sub_id: SubmissionId::new(),
            sweep,
        }
    }

    pub fn maintenance() -> Self {
        Op::Maintenance {
            sub_id: SubmissionId::new(),
        }
    }

    pub fn shutdown() -> Self {
        Op::Shutdown {
            sub_id: SubmissionId::new(),
        }
    }
}

/// Counts from sweeps; sweeps that did not run stay zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceSummary {
    pub sagas: ResumeSummary,
    pub events: ReplaySummary,
    pub sequence_steps: usize,
    pub sagas_cleaned: usize,
    pub events_cleaned: usize,
}

/// Notifications emitted by the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum Notice {
    Report {
        sub_id: SubmissionId,
        response: Response,
    },
    EventIngested {
        sub_id: SubmissionId,
        outcome: IngestOutcome,
    },
    SagaFinished {
        sub_id: SubmissionId,
        saga_id: String,
        status: SagaStatus,
    },
    Enrollment {
        sub_id: SubmissionId,
        enrollment: Box<SequenceEnrollment>,
    },
    Maintenance {
        sub_id: SubmissionId,
        summary: MaintenanceSummary,
    },
    Error {
        sub_id: SubmissionId,
        response: Response,
    },
    ShuttingDown { sub_id: SubmissionId },
}

/// Owns the agent registry and every durable engine
pub struct Runtime {
    registry: Arc<AgentRegistry>,
    sagas: SagaEngine,
    events: EventPipeline,
    sequencer: Sequencer,
    settings: Settings,
    op_rx: mpsc::UnboundedReceiver<Op>,
    notice_tx: mpsc::UnboundedSender<Notice>,
}

impl Runtime {
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn DocumentStore>,
        sender: Arc<dyn ChannelSender>,
        rules: Vec<EventRule>,
        settings: Settings,
        channels: ChannelPair,
    ) -> Self {
        let sagas = SagaEngine::new(
            Arc::clone(&registry),
            SagaStore::new(Arc::clone(&store)),
            settings.saga.clone(),
        );
        let events = rules.into_iter().fold(
            EventPipeline::new(EventLog::new(Arc::clone(&store)), Arc::clone(&registry)),
            EventPipeline::with_rule,
        );
        let sequencer = Sequencer::new(store, sender, settings.sequencer.clone());

        Self {
            registry,
            sagas,
            events,
            sequencer,
            settings,
            op_rx: channels.op_rx,
            notice_tx: channels.notice_tx,
        }
    }

    /// Create a runtime and the caller side of its channel
    pub fn with_channel(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn DocumentStore>,
        sender: Arc<dyn ChannelSender>,
        rules: Vec<EventRule>,
        settings: Settings,
    ) -> (Self, RuntimeChannel) {
        let (channel, pair) = RuntimeChannel::new();
        (Self::new(registry, store, sender, rules, settings, pair), channel)
    }

    pub fn with_compensator(mut self, step_name: impl Into<String>, action: Arc<dyn CompensatingAction>) -> Self {
        self.sagas = self.sagas.with_compensator(step_name, action);
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Process ops until shutdown or until every caller is gone.
    ///
    /// A failing op is reported as a `Notice::Error` and the loop goes on;
    /// a persistence failure stops the loop and is returned.
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<()> {
        info!(agents = self.registry.count(), "Starting syndicate runtime");

        while let Some(op) = self.op_rx.recv().await {
            let sub_id = op.sub_id();
            match self.handle_op(op).await {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break,
                Err(e) => {
                    error!(%sub_id, error = %e, "Error handling operation");
                    self.notify(Notice::Error {
                        sub_id,
                        response: Response::from_error(&e),
                    });
                    if e.is_fatal() {
                        return Err(e);
                    }
                }
            }
        }

        info!("Syndicate runtime stopped");
        Ok(())
    }

    async fn handle_op(&mut self, op: Op) -> Result<ControlFlow<()>> {
        match op {
            Op::Execute {
                sub_id,
                target,
                payload,
                priority,
            } => {
                let report = self.execute(&target, payload, priority).await?;
                self.notify(Notice::Report {
                    sub_id,
                    response: Response::from_report(report),
                });
            }
            Op::IngestEvent { sub_id, event } => {
                let outcome = self.events.ingest(event).await?;
                self.notify(Notice::EventIngested { sub_id, outcome });
            }
            Op::StartSaga { sub_id, name, steps } => {
                let state = self.sagas.start(name, steps).await?;
                self.notify(Notice::SagaFinished {
                    sub_id,
                    saga_id: state.id,
                    status: state.status,
                });
            }
            Op::Enroll {
                sub_id,
                sequence_id,
                subject_id,
                metadata,
            } => {
                let enrollment = self
                    .sequencer
                    .enroll_in_sequence(&sequence_id, &subject_id, metadata)
                    .await?;
                self.notify(Notice::Enrollment {
                    sub_id,
                    enrollment: Box::new(enrollment),
                });
            }
            Op::Condition {
                sub_id,
                enrollment_id,
                kind,
            } => {
                let enrollment = self.sequencer.handle_condition(&enrollment_id, kind).await?;
                self.notify(Notice::Enrollment {
                    sub_id,
                    enrollment: Box::new(enrollment),
                });
            }
            Op::Sweep { sub_id, sweep } => {
                let mut summary = MaintenanceSummary::default();
                self.run_sweep(sweep, &mut summary).await?;
                self.notify(Notice::Maintenance { sub_id, summary });
            }
            Op::Maintenance { sub_id } => {
                let summary = self.maintenance_tick().await?;
                self.notify(Notice::Maintenance { sub_id, summary });
            }
            Op::Shutdown { sub_id } => {
                info!(%sub_id, "Shutdown requested");
                self.notify(Notice::ShuttingDown { sub_id });
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn notify(&self, notice: Notice) {
        if self.notice_tx.send(notice).is_err() {
            debug!("No notice receiver left");
        }
    }

    /// Run one goal against a registered agent, isolating panics
    pub async fn execute(&self, target: &AgentId, payload: Value, priority: Priority) -> Result<Report> {
        let agent = self
            .registry
            .instantiate(target.as_str())
            .ok_or_else(|| SyndicateError::AgentNotFound(target.clone()))?;

        debug!(agent_id = %target, chain = ?self.registry.chain_of_command(target.as_str()), "Executing goal");

        let message = Message::new(AgentId::new(RUNTIME_ID), target.clone(), payload).with_priority(priority);
        let task_id = message.id;
        let mut signal = Signal::direct(message);
        let handle = tokio::spawn(async move { agent.handle_signal(&mut signal).await });

        Ok(match handle.await {
            Ok(report) => report,
            Err(e) => {
                warn!(agent_id = %target, error = %e, "Agent aborted");
                Report::failed(target.clone(), task_id, [format!("agent aborted: {}", e)])
            }
        })
    }

    /// Every sweep once: saga resume, event replay, due sequence steps,
    /// then retention cleanup.
    #[instrument(skip(self))]
    pub async fn maintenance_tick(&self) -> Result<MaintenanceSummary> {
        let mut summary = MaintenanceSummary::default();
        for sweep in Sweep::ALL {
            self.run_sweep(sweep, &mut summary).await?;
        }
        debug!(?summary, "Maintenance tick finished");
        Ok(summary)
    }

    /// Run one sweep, recording its counts in `summary`.
    ///
    /// Only a persistence failure is returned; anything else is logged so
    /// the remaining sweeps still run.
    pub async fn run_sweep(&self, sweep: Sweep, summary: &mut MaintenanceSummary) -> Result<()> {
        let outcome = match sweep {
            Sweep::Sagas => self
                .sagas
                .resume_incomplete()
                .await
                .map(|sagas| summary.sagas = sagas),
            Sweep::Events => self
                .events
                .replay_unconfirmed(self.settings.events.replay_window_minutes)
                .await
                .map(|events| summary.events = events),
            Sweep::Sequences => self
                .sequencer
                .process_due_sequence_steps(Utc::now())
                .await
                .map(|steps| summary.sequence_steps = steps),
            Sweep::Retention => {
                let sagas = self
                    .sagas
                    .store()
                    .cleanup_old_sagas(self.settings.saga.retention_days)
                    .await;
                let events = self
                    .events
                    .log()
                    .cleanup_confirmed_events(self.settings.events.retention_days)
                    .await;
                sagas.and_then(|sagas| {
                    summary.sagas_cleaned = sagas;
                    events.map(|events| summary.events_cleaned = events)
                })
            }
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(?sweep, error = %e, "Sweep failed");
                Ok(())
            }
        }
    }
}
