//! Relationship types for Accord
//!
//! A Relationship is the central long-lived object: "these two participants
//! know each other." It is directional (initiator → responder), carries a
//! trust level assigned at creation, a bounded depth counter, a timebox, an
//! immutable context snapshot, and the head of its event chain.

use crate::{AccordError, ChainHash, ParticipantId, RelationshipId, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Trust level 0–5 assigned at relationship creation.
///
/// Controls which intent types are admissible; higher levels unlock more.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TrustLevel(u8);

impl TrustLevel {
    pub const MIN: TrustLevel = TrustLevel(0);
    pub const MAX: TrustLevel = TrustLevel(5);

    /// Construct a trust level, rejecting values above 5.
    pub fn new(level: u8) -> Result<Self> {
        if level > 5 {
            return Err(AccordError::invalid_input(
                "trust_level",
                format!("must be 0-5, got {}", level),
            ));
        }
        Ok(Self(level))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// The next lower level, if any. Used by the policy registry's
    /// nearest-lower-level fallback.
    pub fn lower(&self) -> Option<TrustLevel> {
        self.0.checked_sub(1).map(TrustLevel)
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a relationship was closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Activity timebox ran out
    Expired,
    /// Depth counter hit its cap
    MaxDepthReached,
    /// Explicit close by a participant
    User,
    /// Conversation reached its goal
    Completed,
    /// Closed after an unrecoverable error
    Error,
    /// Closed after a gatekeeping violation
    Breach,
    /// Closed with work left open (enables re-engagement)
    Incomplete,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Expired => "expired",
            Self::MaxDepthReached => "max_depth_reached",
            Self::User => "user",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Breach => "breach",
            Self::Incomplete => "incomplete",
        };
        write!(f, "{}", s)
    }
}

/// Relationship state: active, or closed with a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RelationshipState {
    Active,
    Closed { reason: CloseReason },
}

impl RelationshipState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

/// Timebox policy fixed at creation. Exactly one mode applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimeboxPolicy {
    /// Expires after a period of inactivity (default 24 hours)
    ActivityBased {
        /// Idle period in hours before expiry
        idle_hours: i64,
    },
    /// Fixed appointment window
    AppointmentBased {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl TimeboxPolicy {
    /// Activity-based policy with the default 24-hour idle period.
    pub fn activity_default() -> Self {
        Self::ActivityBased { idle_hours: 24 }
    }

    /// Compute the expiry that follows from activity at `last_activity`.
    /// Appointment-based relationships expire at the window end regardless
    /// of activity.
    pub fn expires_after(&self, last_activity: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::ActivityBased { idle_hours } => last_activity + Duration::hours(*idle_hours),
            Self::AppointmentBased { end, .. } => *end,
        }
    }
}

/// Immutable key-value map supplied at relationship creation.
///
/// Keys are sorted (BTreeMap) so the snapshot canonicalizes deterministically.
pub type ContextSnapshot = BTreeMap<String, serde_json::Value>;

/// Key under which prior-consent grants live in the context snapshot.
pub const CONSENT_KEY: &str = "consent";

/// Key whose value is carried forward to a continuation relationship.
pub const OPEN_ITEMS_KEY: &str = "open_items";

/// Look up a positive consent entry for an intent type in a context snapshot.
///
/// Consent is granted when `context["consent"][intent_type]` is a truthy
/// value (boolean `true` or a non-empty signature string).
pub fn consent_granted(context: &ContextSnapshot, intent_type: &str) -> bool {
    let Some(consents) = context.get(CONSENT_KEY) else {
        return false;
    };
    match consents.get(intent_type) {
        Some(serde_json::Value::Bool(granted)) => *granted,
        Some(serde_json::Value::String(signature)) => !signature.is_empty(),
        _ => false,
    }
}

/// The central long-lived trust record between two participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Unique identifier
    pub id: RelationshipId,
    /// Party that sends intents (fixed at creation)
    pub initiator: ParticipantId,
    /// Party that receives intents and sends responses (fixed at creation)
    pub responder: ParticipantId,
    /// Trust level assigned at creation
    pub trust_level: TrustLevel,
    /// Active or closed
    pub state: RelationshipState,
    /// Count of admitted initiator-sent intents since creation
    pub depth: u32,
    /// Maximum depth before auto-close (default 5)
    pub max_depth: u32,
    /// Timebox mode fixed at creation
    pub timebox: TimeboxPolicy,
    /// When the relationship was created
    pub created_at: DateTime<Utc>,
    /// Last admission or response activity
    pub last_activity_at: DateTime<Utc>,
    /// When the relationship expires if nothing happens
    pub expires_at: DateTime<Utc>,
    /// Set exactly when the state becomes closed
    pub closed_at: Option<DateTime<Utc>>,
    /// Closed predecessor this relationship succeeds, if any
    pub continuation_of: Option<RelationshipId>,
    /// Immutable context supplied at creation
    pub context: ContextSnapshot,
    /// Continuity hash of the most recent event
    pub chain_head: ChainHash,
}

impl Relationship {
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Whether the timebox has run out at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether the depth counter has room for one more admission.
    pub fn has_depth_remaining(&self) -> bool {
        self.depth < self.max_depth
    }

    /// Check the record's structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.initiator == self.responder {
            return Err(AccordError::invalid_input(
                "participants",
                "initiator and responder must differ",
            ));
        }
        if self.depth > self.max_depth {
            return Err(AccordError::invalid_input(
                "depth",
                format!("{} exceeds max_depth {}", self.depth, self.max_depth),
            ));
        }
        if let TimeboxPolicy::AppointmentBased { start, end } = &self.timebox {
            if start >= end {
                return Err(AccordError::invalid_input(
                    "timebox",
                    "appointment start must precede end",
                ));
            }
        }
        if self.state.is_closed() && self.closed_at.is_none() {
            return Err(AccordError::invalid_input(
                "closed_at",
                "closed relationship must carry a closed-at timestamp",
            ));
        }
        Ok(())
    }
}

/// Builder for creating relationships.
#[derive(Debug, Clone)]
pub struct RelationshipBuilder {
    initiator: ParticipantId,
    responder: ParticipantId,
    trust_level: TrustLevel,
    max_depth: u32,
    timebox: TimeboxPolicy,
    continuation_of: Option<RelationshipId>,
    context: ContextSnapshot,
}

impl RelationshipBuilder {
    /// Create a new builder with default depth cap and activity timebox.
    pub fn new(
        initiator: ParticipantId,
        responder: ParticipantId,
        trust_level: TrustLevel,
    ) -> Self {
        Self {
            initiator,
            responder,
            trust_level,
            max_depth: 5,
            timebox: TimeboxPolicy::activity_default(),
            continuation_of: None,
            context: ContextSnapshot::new(),
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_timebox(mut self, timebox: TimeboxPolicy) -> Self {
        self.timebox = timebox;
        self
    }

    pub fn with_continuation_of(mut self, predecessor: RelationshipId) -> Self {
        self.continuation_of = Some(predecessor);
        self
    }

    pub fn with_context(mut self, context: ContextSnapshot) -> Self {
        self.context = context;
        self
    }

    pub fn with_context_entry(
        mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Build the record and check its invariants. The chain head starts at
    /// the genesis hash until the establishment event is sealed.
    pub fn build(self) -> Result<Relationship> {
        let now = Utc::now();
        let relationship = Relationship {
            id: RelationshipId::new(),
            initiator: self.initiator,
            responder: self.responder,
            trust_level: self.trust_level,
            state: RelationshipState::Active,
            depth: 0,
            max_depth: self.max_depth,
            expires_at: self.timebox.expires_after(now),
            timebox: self.timebox,
            created_at: now,
            last_activity_at: now,
            closed_at: None,
            continuation_of: self.continuation_of,
            context: self.context,
            chain_head: ChainHash::genesis(),
        };
        relationship.validate()?;
        Ok(relationship)
    }
}
