//! Intent routing rules
//!
//! A [`RoutingStrategy`] maps an intent to the ids of the delegates that should
//! handle it. The bundled [`KeywordRouter`] evaluates an ordered rule table;
//! every rule that matches contributes its target, so composite goals fan out.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::protocol::AgentId;

/// Payload fields checked, in order, for the intent text
pub const INTENT_FIELDS: &[&str] = &["goal", "intent", "task", "query"];

/// Pull the intent/goal text out of a payload
pub fn extract_intent(payload: &Value) -> Option<String> {
    INTENT_FIELDS
        .iter()
        .filter_map(|field| payload.get(*field).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Pluggable intent → delegate mapping
pub trait RoutingStrategy: Send + Sync {
    /// Targets for an intent, in routing order, without duplicates
    fn route(&self, intent: &str) -> Vec<AgentId>;

    /// Every target this strategy can produce
    fn targets(&self) -> Vec<AgentId>;
}

/// Predicate half of a routing rule
#[derive(Clone)]
pub enum Predicate {
    /// Any keyword appears in the intent
    AnyKeyword(Vec<String>),
    /// Every keyword appears in the intent
    AllKeywords(Vec<String>),
    /// Arbitrary check on the lowercased intent
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl Predicate {
    pub fn any<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::AnyKeyword(
            keywords
                .into_iter()
                .map(|k| Into::<String>::into(k).to_lowercase())
                .collect(),
        )
    }

    pub fn all<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::AllKeywords(
            keywords
                .into_iter()
                .map(|k| Into::<String>::into(k).to_lowercase())
                .collect(),
        )
    }

    /// `intent` is expected lowercased
    pub fn matches(&self, intent: &str) -> bool {
        match self {
            Predicate::AnyKeyword(keywords) => keywords.iter().any(|k| intent.contains(k.as_str())),
            Predicate::AllKeywords(keywords) => {
                !keywords.is_empty() && keywords.iter().all(|k| intent.contains(k.as_str()))
            }
            Predicate::Custom(f) => f(intent),
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::AnyKeyword(k) => f.debug_tuple("AnyKeyword").field(k).finish(),
            Predicate::AllKeywords(k) => f.debug_tuple("AllKeywords").field(k).finish(),
            Predicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// One (predicate → target) entry
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub name: String,
    pub predicate: Predicate,
    pub target: AgentId,
}

impl RoutingRule {
    pub fn new(name: impl Into<String>, predicate: Predicate, target: impl Into<AgentId>) -> Self {
        Self {
            name: name.into(),
            predicate,
            target: target.into(),
        }
    }

    /// Rule matching any of `keywords`, named after its target
    pub fn keywords<I, S>(target: impl Into<AgentId>, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let target = target.into();
        let name = target.as_str().to_string();
        Self::new(name, Predicate::any(keywords), target)
    }
}

/// Ordered keyword rule table
#[derive(Debug, Clone, Default)]
pub struct KeywordRouter {
    rules: Vec<RoutingRule>,
}

impl KeywordRouter {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self { rules }
    }

    pub fn with_rule(mut self, rule: RoutingRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Names of the rules matching an intent
    pub fn matching_rules(&self, intent: &str) -> Vec<&str> {
        let intent = intent.to_lowercase();
        self.rules
            .iter()
            .filter(|r| r.predicate.matches(&intent))
            .map(|r| r.name.as_str())
            .collect()
    }
}

impl RoutingStrategy for KeywordRouter {
    fn route(&self, intent: &str) -> Vec<AgentId> {
        let intent = intent.to_lowercase();
        let mut targets: Vec<AgentId> = Vec::new();
        for rule in &self.rules {
            if rule.predicate.matches(&intent) && !targets.contains(&rule.target) {
                targets.push(rule.target.clone());
            }
        }
        targets
    }

    fn targets(&self) -> Vec<AgentId> {
        let mut targets: Vec<AgentId> = Vec::new();
        for rule in &self.rules {
            if !targets.contains(&rule.target) {
                targets.push(rule.target.clone());
            }
        }
        targets
    }
}
