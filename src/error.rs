//! Syndicate error types

use thiserror::Error;

use crate::protocol::AgentId;
use crate::store::StoreError;

/// Errors that can occur in the syndicate
#[derive(Debug, Error)]
pub enum SyndicateError {
    /// Agent not registered
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// Identity rejected at construction
    #[error("Invalid agent identity: {0}")]
    InvalidIdentity(String),

    /// Registration table is inconsistent
    #[error("Registry error: {0}")]
    Registry(String),

    /// Signal can no longer be routed
    #[error("Signal error: {0}")]
    Signal(String),

    /// Saga not found
    #[error("Saga not found: {0}")]
    SagaNotFound(String),

    /// Saga definition rejected
    #[error("Invalid saga: {0}")]
    InvalidSaga(String),

    /// Another driver checkpointed the saga first
    #[error("Saga {id} was checkpointed concurrently (held version {held}, stored version {stored})")]
    SagaConflict { id: String, held: u64, stored: u64 },

    /// State machine transition not allowed
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Event log entry not found
    #[error("Event not found: {0}")]
    EventNotFound(String),

    /// Sequence definition rejected
    #[error("Invalid sequence: {0}")]
    InvalidSequence(String),

    /// Sequence not found
    #[error("Sequence not found: {0}")]
    SequenceNotFound(String),

    /// Enrollment not found
    #[error("Enrollment not found: {0}")]
    EnrollmentNotFound(String),

    /// Duplicate active enrollment
    #[error("Subject {subject_id} is already enrolled in sequence {sequence_id}")]
    AlreadyEnrolled {
        sequence_id: String,
        subject_id: String,
    },

    /// Enrollment step is being executed by another sweep
    #[error("Enrollment {0} is already executing")]
    EnrollmentBusy(String),

    /// Channel capability reported a failed send
    #[error("Channel send failed: {0}")]
    ChannelSend(String),

    /// Durable store failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Stored document could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Runtime channel error
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl SyndicateError {
    /// Whether the caller must treat durability as uncertain.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyndicateError::Persistence(_))
    }
}

impl From<::config::ConfigError> for SyndicateError {
    fn from(err: ::config::ConfigError) -> Self {
        SyndicateError::ConfigError(err.to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, SyndicateError>;
