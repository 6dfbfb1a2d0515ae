//! Intent and response types for Accord
//!
//! An intent is one signed message from the initiator to the responder on a
//! relationship; a response is the responder's reply to a previously admitted
//! intent. Both are ephemeral: each becomes exactly one event on the chain.

use crate::{HumanId, IntentId, ParticipantId, RelationshipId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared intent type, a short string from the policy registry's
/// enumerated set (e.g. `greet`, `share`, `bye`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntentType(pub String);

impl IntentType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IntentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IntentType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Optional validity window for an intent. `None` on either side means
/// "immediate", meaning no bound in that direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
}

impl TimeWindow {
    /// A window with no bounds
    pub fn immediate() -> Self {
        Self::default()
    }

    /// Whether `now` falls inside the window
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        if let Some(not_before) = self.not_before {
            if now < not_before {
                return false;
            }
        }
        if let Some(not_after) = self.not_after {
            if now > not_after {
                return false;
            }
        }
        true
    }
}

/// Declared constraints on an intent. Conservative caps are published by the
/// policy registry; exceeding them raises the risk score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// How many times the caller may resubmit after rejection
    pub max_retries: u32,
    /// Hard deadline for acting on the intent
    pub deadline: Option<DateTime<Utc>>,
    /// Priority 0–9, higher is more urgent
    pub priority: u8,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_retries: 0,
            deadline: None,
            priority: 0,
        }
    }
}

/// A single inbound message on a relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// Relationship this intent targets
    pub relationship: RelationshipId,
    /// Unique identifier for this intent
    pub id: IntentId,
    /// Declared type from the policy registry's enumerated set
    pub intent_type: IntentType,
    /// Optional validity window
    pub window: TimeWindow,
    /// Free-form context payload
    pub context: serde_json::Value,
    /// Declared constraints
    pub constraints: Constraints,
    /// Declared sender (must be the relationship's initiator)
    pub sender: ParticipantId,
    /// Human binding declared for this message; policies may demand one
    pub human: Option<HumanId>,
    /// Hex Ed25519 signature over the canonical encoding
    pub signature: String,
}

impl Intent {
    /// The canonical signing body: every field except the signature itself,
    /// with sorted keys.
    pub fn signing_body(&self) -> serde_json::Value {
        serde_json::json!({
            "relationship": self.relationship.to_string(),
            "id": self.id.to_string(),
            "intent_type": self.intent_type.as_str(),
            "window": {
                "not_before": self.window.not_before.map(|t| t.to_rfc3339()),
                "not_after": self.window.not_after.map(|t| t.to_rfc3339()),
            },
            "context": &self.context,
            "constraints": {
                "max_retries": self.constraints.max_retries,
                "deadline": self.constraints.deadline.map(|t| t.to_rfc3339()),
                "priority": self.constraints.priority,
            },
            "sender": self.sender.as_str(),
            "human": self.human.as_ref().map(|h| h.as_str()),
        })
    }

    /// Length of the explanatory context in characters, used by the content
    /// filter and the risk score.
    pub fn context_len(&self) -> usize {
        match &self.context {
            serde_json::Value::String(s) => s.chars().count(),
            other => other.to_string().chars().count(),
        }
    }
}

/// Outcome a responder reports for an admitted intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResponseOutcome {
    /// Responder accepted and will act
    Accepted,
    /// Responder finished acting
    Completed,
    /// Responder declined
    Rejected { reason: String },
}

impl ResponseOutcome {
    /// Whether this outcome finalizes the intent (no further responses).
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected { .. })
    }
}

/// A responder-originated reply to a specific admitted intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Relationship the referenced intent lives on
    pub relationship: RelationshipId,
    /// The admitted intent being answered
    pub intent: IntentId,
    /// Reported outcome
    pub outcome: ResponseOutcome,
    /// Opaque response data
    pub data: serde_json::Value,
    /// Declared sender (must be the relationship's responder)
    pub sender: ParticipantId,
    /// Hex Ed25519 signature over the canonical encoding
    pub signature: String,
}

impl Response {
    /// The canonical signing body: every field except the signature itself.
    pub fn signing_body(&self) -> serde_json::Value {
        serde_json::json!({
            "relationship": self.relationship.to_string(),
            "intent": self.intent.to_string(),
            "outcome": &self.outcome,
            "data": &self.data,
            "sender": self.sender.as_str(),
        })
    }
}
