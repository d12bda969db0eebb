//! # Syndicate
//!
//! Tiered agent delegation with durable saga workflows.
//!
//! Goals enter an orchestrator, are routed by intent to managers, and are
//! fanned out to specialists. Long workflows run as sagas checkpointed to a
//! document store; inbound events are deduplicated and replayed; outreach
//! sequences walk subjects through timed multi-channel steps.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         ORCHESTRATOR (L1)                           │
//! │                 routes coarse goals to managers                     │
//! └────────────────────────────┬────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!   ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!   │   Manager   │     │   Manager   │     │   Manager   │
//!   │    (L2)     │     │    (L2)     │     │    (L2)     │
//!   └──────┬──────┘     └──────┬──────┘     └──────┬──────┘
//!          │                   │                   │
//!     ┌────┴────┐         ┌────┴────┐         ┌────┴────┐
//!     ▼         ▼         ▼         ▼         ▼         ▼
//!   ┌───┐     ┌───┐     ┌───┐     ┌───┐     ┌───┐     ┌───┐
//!   │S1 │     │S2 │     │S3 │     │S4 │     │S5 │     │S6 │   Specialists (L3)
//!   └───┘     └───┘     └───┘     └───┘     └───┘     └───┘
//!
//!   SagaEngine ──▶ SagaStore ──┐
//!   EventPipeline ─▶ EventLog ─┼──▶ DocumentStore
//!   Sequencer ─────────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Agent**: anything turning a [`Message`] into a [`Report`]
//! - **Manager**: an agent delegating to other agents with bounded concurrency
//! - **Saga**: a checkpointed multi-step workflow with compensation
//! - **Event log**: at-least-once ingestion record used for dedup and replay
//! - **Sequence**: timed outreach steps a subject is enrolled in

pub mod agent;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod hierarchy;
pub mod manager;
pub mod message;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod report;
pub mod routing;
pub mod runtime;
pub mod saga;
pub mod sequencer;
pub mod store;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentHandle, FnTask, Specialist, SpecialistTask};
pub use channel::{ChannelPair, RuntimeChannel};
pub use crate::config::Settings;
pub use error::{Result, SyndicateError};
pub use events::{DispatchedAction, EventLog, EventPipeline, EventRule, IncomingEvent, IngestOutcome};
pub use hierarchy::{AgentHierarchy, AgentTree};
pub use manager::{CapabilityReport, Manager};
pub use message::{Message, Signal};
pub use protocol::{AgentId, AgentIdentity, AgentStatus, AgentTier, Priority, SubmissionId};
pub use registry::{AgentRegistry, Registration};
pub use report::{Report, ReportStatus, Response};
pub use routing::{KeywordRouter, RoutingRule, RoutingStrategy};
pub use runtime::{Notice, Op, Runtime};
pub use saga::{SagaEngine, SagaState, SagaStatus, SagaStep, SagaStore};
pub use sequencer::{ChannelSender, Sequence, SequenceEnrollment, SequenceStep, Sequencer};
pub use store::{DocumentStore, InMemoryStore, Query};
