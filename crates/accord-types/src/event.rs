//! Event types for Accord
//!
//! Every relationship owns an append-only event log. Events are linked by
//! keyed continuity hashes: each event's hash covers the previous hash, the
//! sequence number, the kind, and the canonical payload, so any insertion,
//! deletion, or reordering breaks the chain at the point of tampering.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte continuity hash, hex-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainHash(#[serde(with = "hex_bytes")] pub [u8; 32]);

impl ChainHash {
    /// The fixed genesis value: all zeroes. The first event on every chain
    /// carries this as its previous hash.
    pub fn genesis() -> Self {
        Self([0u8; 32])
    }

    pub fn is_genesis(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(array))
    }
}

impl fmt::Display for ChainHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// The kinds of events a relationship chain records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Sequence 0: seals the creation parameters
    RelationshipEstablished,
    /// An intent passed every admission check
    IntentAdmitted,
    /// An intent failed an admission check (benign user error)
    IntentRejected,
    /// A responder answered an admitted intent
    ResponseRecorded,
    /// Terminal: nothing may follow this event
    RelationshipClosed,
    /// A successor relationship was opened from this closed one
    RelationshipContinued,
    /// A gatekeeping check failed in a way that signals misuse
    BreachAttempt,
}

impl EventKind {
    /// Stable wire name, also fed to the continuity hash.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RelationshipEstablished => "relationship_established",
            Self::IntentAdmitted => "intent_admitted",
            Self::IntentRejected => "intent_rejected",
            Self::ResponseRecorded => "response_recorded",
            Self::RelationshipClosed => "relationship_closed",
            Self::RelationshipContinued => "relationship_continued",
            Self::BreachAttempt => "breach_attempt",
        }
    }

    /// Whether this kind terminates the chain.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RelationshipClosed)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry in a relationship's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Dense sequence number, starting at 0
    pub sequence: u64,
    /// What happened
    pub kind: EventKind,
    /// When it was recorded
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Kind-specific payload, canonicalized before hashing
    pub payload: serde_json::Value,
    /// Hash of the previous event (genesis value at sequence 0)
    pub previous_hash: ChainHash,
    /// This event's continuity hash
    pub hash: ChainHash,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_hash() {
        let genesis = ChainHash::genesis();
        assert!(genesis.is_genesis());
        assert_eq!(genesis.to_string(), "0".repeat(64));
    }

    #[test]
    fn test_hash_hex_round_trip() {
        let hash = ChainHash([7u8; 32]);
        let parsed = ChainHash::from_hex(&hash.to_string()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_hash_serde_as_hex() {
        let hash = ChainHash([255u8; 32]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "ff".repeat(32)));
        let back: ChainHash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, back);
    }

    #[test]
    fn test_event_kind_wire_names() {
        assert_eq!(EventKind::IntentAdmitted.as_str(), "intent_admitted");
        assert_eq!(EventKind::BreachAttempt.as_str(), "breach_attempt");
        assert!(EventKind::RelationshipClosed.is_terminal());
        assert!(!EventKind::IntentAdmitted.is_terminal());
    }
}
