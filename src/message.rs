//! Task envelopes passed between agents

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyndicateError};
use crate::protocol::{AgentId, MessageId, Priority, SignalId, TraceId};

/// Default hop budget for a routed signal
pub const DEFAULT_MAX_HOPS: usize = 8;

/// Default signal lifetime
pub const DEFAULT_SIGNAL_TTL_SECS: i64 = 300;

/// Kind of message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Task,
    Query,
    Event,
    Response,
}

/// A point-to-point task envelope. Never mutated once sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub from: AgentId,
    pub to: AgentId,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: Priority,
    pub payload: Value,
    pub requires_response: bool,
    pub trace_id: TraceId,
}

impl Message {
    /// Create a task message on a fresh trace
    pub fn new(from: impl Into<AgentId>, to: impl Into<AgentId>, payload: Value) -> Self {
        Self {
            id: MessageId::new(),
            timestamp: Utc::now(),
            from: from.into(),
            to: to.into(),
            message_type: MessageType::Task,
            priority: Priority::Normal,
            payload,
            requires_response: true,
            trace_id: TraceId::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_type(mut self, message_type: MessageType) -> Self {
        self.message_type = message_type;
        self
    }

    /// Derive the message a delegating agent sends one tier down.
    ///
    /// Keeps trace and priority; gets a new id and timestamp.
    pub fn delegate_to(&self, from: &AgentId, to: &AgentId) -> Self {
        Self {
            id: MessageId::new(),
            timestamp: Utc::now(),
            from: from.clone(),
            to: to.clone(),
            message_type: self.message_type,
            priority: self.priority,
            payload: self.payload.clone(),
            requires_response: self.requires_response,
            trace_id: self.trace_id,
        }
    }

}

/// How a signal is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Direct,
    Broadcast,
}

/// A routed wrapper around a message, tracking every agent it passes through
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: SignalId,
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub origin: AgentId,
    /// `None` for broadcast
    pub target: Option<AgentId>,
    pub payload: Message,
    pub hops: Vec<AgentId>,
    pub max_hops: usize,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Signal {
    /// Wrap a message for direct delivery to its recipient
    pub fn direct(message: Message) -> Self {
        let target = Some(message.to.clone());
        Self::build(SignalType::Direct, message, target)
    }

    /// Wrap a message for broadcast delivery
    pub fn broadcast(message: Message) -> Self {
        Self::build(SignalType::Broadcast, message, None)
    }

    /// Hand the signal on one tier down with a new message.
    ///
    /// Hops, hop budget and deadline carry over.
    pub fn forward(&self, payload: Message) -> Self {
        Self {
            id: SignalId::new(),
            signal_type: SignalType::Direct,
            origin: self.origin.clone(),
            target: Some(payload.to.clone()),
            payload,
            hops: self.hops.clone(),
            max_hops: self.max_hops,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }

    fn build(signal_type: SignalType, payload: Message, target: Option<AgentId>) -> Self {
        let created_at = Utc::now();
        Self {
            id: SignalId::new(),
            signal_type,
            origin: payload.from.clone(),
            target,
            hops: vec![payload.from.clone()],
            payload,
            max_hops: DEFAULT_MAX_HOPS,
            created_at,
            expires_at: created_at + Duration::seconds(DEFAULT_SIGNAL_TTL_SECS),
        }
    }

    pub fn with_max_hops(mut self, max_hops: usize) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.expires_at = self.created_at + ttl;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn hops_remaining(&self) -> usize {
        self.max_hops.saturating_sub(self.hops.len())
    }

    /// Whether the signal may still be delivered
    pub fn check_deliverable(&self, now: DateTime<Utc>) -> Result<()> {
        if self.is_expired(now) {
            return Err(SyndicateError::Signal(format!(
                "signal {} expired at {}",
                self.id, self.expires_at
            )));
        }
        if self.hops.len() > self.max_hops {
            return Err(SyndicateError::Signal(format!(
                "signal {} exceeded {} hops",
                self.id, self.max_hops
            )));
        }
        Ok(())
    }

    /// Append the agent now holding the signal
    pub fn record_hop(&mut self, agent: &AgentId) -> Result<()> {
        self.check_deliverable(Utc::now())?;
        if self.hops_remaining() == 0 {
            return Err(SyndicateError::Signal(format!(
                "signal {} has no hops left (max {})",
                self.id, self.max_hops
            )));
        }
        self.hops.push(agent.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message() -> Message {
        Message::new("orchestrator", "research-manager", json!({"goal": "research"}))
    }

    #[test]
    fn test_delegate_keeps_trace() {
        let parent = message().with_priority(Priority::High);
        let child = parent.delegate_to(&AgentId::new("research-manager"), &AgentId::new("trend-scout"));

        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.priority, Priority::High);
        assert_ne!(child.id, parent.id);
        assert_eq!(child.to.as_str(), "trend-scout");
        assert_eq!(child.payload, parent.payload);
    }

    #[test]
    fn test_message_type_serializes_as_type() {
        let value = serde_json::to_value(message()).unwrap();
        assert_eq!(value["type"], "task");
        assert_eq!(value["priority"], "NORMAL");
    }

    #[test]
    fn test_signal_hops() {
        let mut signal = Signal::direct(message()).with_max_hops(3);
        assert_eq!(signal.hops.len(), 1);

        signal.record_hop(&AgentId::new("research-manager")).unwrap();
        signal.record_hop(&AgentId::new("trend-scout")).unwrap();
        assert_eq!(signal.hops_remaining(), 0);

        let err = signal.record_hop(&AgentId::new("copywriter"));
        assert!(matches!(err, Err(SyndicateError::Signal(_))));
        assert_eq!(signal.hops.len(), 3);
    }

    #[test]
    fn test_forward_keeps_hops_and_deadline() {
        let mut signal = Signal::broadcast(message()).with_max_hops(4);
        signal.record_hop(&AgentId::new("research-manager")).unwrap();

        let child = message().delegate_to(&AgentId::new("research-manager"), &AgentId::new("trend-scout"));
        let forwarded = signal.forward(child.clone());

        assert_ne!(forwarded.id, signal.id);
        assert_eq!(forwarded.signal_type, SignalType::Direct);
        assert_eq!(forwarded.target, Some(AgentId::new("trend-scout")));
        assert_eq!(forwarded.hops, signal.hops);
        assert_eq!(forwarded.max_hops, 4);
        assert_eq!(forwarded.expires_at, signal.expires_at);
        assert_eq!(forwarded.payload, child);
    }

    #[test]
    fn test_signal_expiry() {
        let signal = Signal::broadcast(message()).with_ttl(Duration::seconds(-1));
        assert!(signal.target.is_none());
        assert!(signal.is_expired(Utc::now()));
        assert!(signal.check_deliverable(Utc::now()).is_err());
    }
}
