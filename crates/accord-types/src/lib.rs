//! Accord Types - Canonical domain types for the intent-coordination broker
//!
//! This crate contains all foundational types for Accord with zero dependencies
//! on other accord crates. It defines the complete type system for:
//!
//! - Identity types (ParticipantId, RelationshipId, IntentId, etc.)
//! - Relationships: the long-lived, directional trust records
//! - Intents and responses: the messages that traverse a relationship
//! - Events: the append-only, hash-linked record of everything that happens
//! - The public error taxonomy surfaced to callers
//! - Canonical encoding shared by signing and continuity hashing
//!
//! # Architectural Invariants
//!
//! These types support the core Accord coordination invariants:
//!
//! 1. Every intent is admitted or rejected exactly once, against exactly one
//!    relationship
//! 2. State mutates only on admission; rejections leave counters untouched
//! 3. Event chains are append-only; `RelationshipClosed` is terminal
//! 4. The declared sender of an admitted intent is always the initiator

pub mod canonical;
pub mod error;
pub mod event;
pub mod identity;
pub mod intent;
pub mod relationship;

pub use error::*;
pub use event::*;
pub use identity::*;
pub use intent::*;
pub use relationship::*;

/// Version of the Accord types schema
pub const TYPES_VERSION: &str = "0.1.0";
