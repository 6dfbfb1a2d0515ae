//! Identity types for Accord
//!
//! All identity types are strongly typed wrappers to prevent accidental
//! mixing of different ID kinds. Broker-generated IDs wrap UUIDs; participant
//! and human identifiers are opaque strings minted by the external identity
//! subsystem and never interpreted here.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate UUID-backed ID types with common implementations
macro_rules! define_id_type {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from a string (with or without prefix)
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                let s = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the inner UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

// Broker-owned identity types
define_id_type!(RelationshipId, "rel", "Unique identifier for a relationship");
define_id_type!(IntentId, "intent", "Unique identifier for an intent message");
define_id_type!(EventId, "event", "Unique identifier for a chain event");
define_id_type!(DeliveryId, "dlv", "Unique identifier for a delivery attempt");
define_id_type!(CorrelationId, "corr", "Correlation identifier for internal-error lookup");

/// Opaque device identifier for a participant endpoint.
///
/// Minted and verified by the external identity subsystem; the broker stores
/// and compares it as a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Opaque human identifier optionally bound to a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HumanId(pub String);

impl HumanId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HumanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named endpoint: a device identifier optionally bound to a human.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Participant {
    /// Device identifier
    pub device: ParticipantId,
    /// Bound human identifier, if any
    pub human: Option<HumanId>,
}

impl Participant {
    /// A device-only participant
    pub fn device(id: impl Into<String>) -> Self {
        Self {
            device: ParticipantId::new(id),
            human: None,
        }
    }

    /// A device bound to a human
    pub fn bound(device: impl Into<String>, human: impl Into<String>) -> Self {
        Self {
            device: ParticipantId::new(device),
            human: Some(HumanId::new(human)),
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.human {
            Some(human) => write!(f, "{}@{}", self.device, human),
            None => write!(f, "{}", self.device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relationship_id_creation() {
        let id = RelationshipId::new();
        let s = id.to_string();
        assert!(s.starts_with("rel_"));
    }

    #[test]
    fn test_id_parsing() {
        let id = IntentId::new();
        let s = id.to_string();
        let parsed = IntentId::parse(&s).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_id_equality() {
        let uuid = Uuid::new_v4();
        let id1 = RelationshipId::from_uuid(uuid);
        let id2 = RelationshipId::from_uuid(uuid);
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_participant_display() {
        let p = Participant::device("dev-1");
        assert_eq!(p.to_string(), "dev-1");

        let bound = Participant::bound("dev-1", "alice");
        assert_eq!(bound.to_string(), "dev-1@alice");
    }
}
