//! Accord Store - relationship and event persistence
//!
//! The store exclusively owns every relationship record and its event chain;
//! no other component mutates them directly. Mutations on a single
//! relationship are serialized; distinct relationships are fully
//! independent. Two backends ship: an in-memory store for embedded brokers
//! and tests, and a sled-backed store that is durable before acknowledging.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use accord_types::{
    ChainHash, CloseReason, Event, Relationship, RelationshipId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store error kinds
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("relationship {relationship_id} not found")]
    NotFound { relationship_id: String },

    #[error("active relationship already exists for {initiator} -> {responder}")]
    Duplicate {
        initiator: String,
        responder: String,
    },

    #[error("chain head conflict: expected {expected}, found {actual}")]
    ChainConflict {
        expected: ChainHash,
        actual: ChainHash,
    },

    #[error("chain is closed; no event may follow the terminal close")]
    ChainClosed,

    #[error("serialization failure: {message}")]
    Serialization { message: String },

    #[error("backend failure: {message}")]
    Backend { message: String },
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

/// Record mutations bundled atomically with an event append.
///
/// Rejection events pass `none()`: the event lands on the chain but depth
/// and activity accounting stay untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RecordUpdate {
    /// Set `last_activity_at` to this instant
    pub touch_activity: Option<DateTime<Utc>>,
    /// Increment the admitted-intent depth counter
    pub increment_depth: bool,
    /// Recompute `expires_at` (activity-based relationships on admission)
    pub new_expires_at: Option<DateTime<Utc>>,
}

impl RecordUpdate {
    /// No record mutation beyond the chain head.
    pub fn none() -> Self {
        Self::default()
    }

    /// Activity accounting for an admission.
    pub fn admission(now: DateTime<Utc>, new_expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            touch_activity: Some(now),
            increment_depth: true,
            new_expires_at,
        }
    }

    /// Activity accounting for a response (no depth, no timebox extension).
    pub fn response(now: DateTime<Utc>) -> Self {
        Self {
            touch_activity: Some(now),
            increment_depth: false,
            new_expires_at: None,
        }
    }

    fn apply(&self, relationship: &mut Relationship) {
        if let Some(at) = self.touch_activity {
            relationship.last_activity_at = at;
        }
        if self.increment_depth {
            relationship.depth += 1;
        }
        if let Some(expires_at) = self.new_expires_at {
            relationship.expires_at = expires_at;
        }
    }
}

/// Persistence seam for relationships and their event chains.
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// Persist a fully populated initial record. Fails with `Duplicate` when
    /// an active relationship with the same `(initiator, responder,
    /// continuation_of)` triple exists.
    async fn create(&self, relationship: Relationship) -> Result<RelationshipId>;

    /// Fetch the current record.
    async fn get(&self, id: &RelationshipId) -> Result<Relationship>;

    /// Append an event, atomic per relationship: re-reads the chain head,
    /// verifies `expected_head` matches, writes the event, advances the
    /// head, and applies the bundled record update. Fails with
    /// `ChainConflict` on a stale head (callers refresh and retry once).
    async fn append_event(
        &self,
        id: &RelationshipId,
        expected_head: ChainHash,
        event: Event,
        update: RecordUpdate,
    ) -> Result<ChainHash>;

    /// Transition state to closed. Used only by the lifecycle engine; the
    /// terminal close event must already be on the chain.
    async fn update_state(
        &self,
        id: &RelationshipId,
        reason: CloseReason,
        closed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// List events in sequence order, starting at `from_sequence`.
    async fn list_events(&self, id: &RelationshipId, from_sequence: u64) -> Result<Vec<Event>>;

    /// Snapshot of every active relationship, for the expiry sweep.
    async fn list_active(&self) -> Result<Vec<Relationship>>;
}

/// Index key for the duplicate check: active relationships are unique per
/// `(initiator, responder, continuation_of)` triple.
pub(crate) fn triple_key(relationship: &Relationship) -> String {
    format!(
        "{}|{}|{}",
        relationship.initiator,
        relationship.responder,
        relationship
            .continuation_of
            .map(|id| id.to_string())
            .unwrap_or_default()
    )
}
