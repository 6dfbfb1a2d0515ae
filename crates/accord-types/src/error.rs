//! Error types for Accord
//!
//! The public kinds surfaced to callers are exactly the admission-pipeline
//! and lifecycle failure kinds; internal failures collapse into a single
//! `Internal` category carrying a correlation identifier for operator lookup.

use crate::CorrelationId;
use thiserror::Error;

/// Result type for Accord operations
pub type Result<T> = std::result::Result<T, AccordError>;

/// Accord error taxonomy
#[derive(Debug, Clone, Error)]
pub enum AccordError {
    // ========================================================================
    // Authentication
    // ========================================================================

    /// Signature does not verify against the sender's key
    #[error("Bad signature from {sender}")]
    BadSignature { sender: String },

    /// Sender is not registered with the identity subsystem
    #[error("Unknown sender {sender}")]
    UnknownSender { sender: String },

    /// Declared human binding does not match the device's registration
    #[error("Human binding mismatch for {sender}")]
    BindingMismatch { sender: String },

    /// Sender's key is past its expiry
    #[error("Expired key for {sender}")]
    ExpiredKey { sender: String },

    // ========================================================================
    // Relationship lifecycle
    // ========================================================================

    /// No relationship with this identifier
    #[error("Unknown relationship {relationship_id}")]
    UnknownRelationship { relationship_id: String },

    /// Relationship exists but is closed
    #[error("Relationship {relationship_id} is closed")]
    ClosedRelationship { relationship_id: String },

    /// Depth counter reached its cap
    #[error("Relationship {relationship_id} depth cap {max_depth} reached")]
    DepthExceeded {
        relationship_id: String,
        max_depth: u32,
    },

    /// Activity timebox ran out
    #[error("Relationship {relationship_id} expired at {expired_at}")]
    Expired {
        relationship_id: String,
        expired_at: String,
    },

    /// Outside the appointment window under strict policy
    #[error("Intent outside appointment window for relationship {relationship_id}")]
    OutsideWindow { relationship_id: String },

    /// Close requested on an already-closed relationship
    #[error("Relationship {relationship_id} is already closed")]
    AlreadyClosed { relationship_id: String },

    /// Continuation participants differ from the predecessor's
    #[error("Continuation participants do not match predecessor {predecessor_id}")]
    ParticipantMismatch { predecessor_id: String },

    /// Continuation predecessor is still active
    #[error("Predecessor {predecessor_id} is still active")]
    PredecessorActive { predecessor_id: String },

    // ========================================================================
    // Policy
    // ========================================================================

    /// Intent type requires a higher trust level
    #[error("Intent type {intent_type} requires trust level {required}, relationship has {actual}")]
    TrustLevelInsufficient {
        intent_type: String,
        required: u8,
        actual: u8,
    },

    /// Policy requires prior consent and the context snapshot has none
    #[error("Intent type {intent_type} requires prior consent")]
    ConsentMissing { intent_type: String },

    /// Content filter rejected the intent
    #[error("Content filter rejected intent: {reason}")]
    FilterRejected { reason: String },

    /// Risk score fell below the trust level's threshold
    #[error("Risk score {score:.3} below threshold {threshold:.3} (signal: {signal})")]
    RiskTooLow {
        score: f64,
        threshold: f64,
        signal: String,
    },

    // ========================================================================
    // Protocol misuse
    // ========================================================================

    /// Declared sender is not the right party for this channel
    #[error("Wrong direction: {sender} may not send on this channel")]
    WrongDirection { sender: String },

    /// Response references an intent that was never admitted
    #[error("Intent {intent_id} was not admitted")]
    NotAdmitted { intent_id: String },

    /// Response references an intent that already has a final response
    #[error("Intent {intent_id} is already finalized")]
    AlreadyFinalized { intent_id: String },

    /// An active relationship with the same participant triple exists
    #[error("Duplicate relationship for {initiator} -> {responder}")]
    Duplicate {
        initiator: String,
        responder: String,
    },

    // ========================================================================
    // Capacity / time
    // ========================================================================

    /// Admission exceeded its total deadline
    #[error("Admission timed out after {deadline_ms} ms")]
    Timeout { deadline_ms: u64 },

    /// Delivery was never acknowledged within the ack window
    #[error("Delivery of intent {intent_id} timed out")]
    DeliveryTimeout { intent_id: String },

    /// Responder's pending queue is full
    #[error("Responder {responder} is overloaded")]
    ResponderOverloaded { responder: String },

    // ========================================================================
    // General
    // ========================================================================

    /// Internal error; retryable, never recorded on the relationship
    #[error("Internal error (correlation {correlation})")]
    Internal { correlation: CorrelationId },

    /// Invalid input
    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },

    /// Requester is not a party to the relationship
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },
}

impl AccordError {
    /// Create an internal error with a fresh correlation identifier
    pub fn internal() -> Self {
        Self::Internal {
            correlation: CorrelationId::new(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    /// Check if this is a retriable error
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Internal { .. } | Self::Timeout { .. })
    }

    /// Whether a failed admission records a breach-attempt event instead of
    /// a plain rejection. The distinction matters for oversight.
    pub fn is_breach(&self) -> bool {
        matches!(
            self,
            Self::ClosedRelationship { .. } | Self::OutsideWindow { .. }
        )
    }

    /// Get an error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BadSignature { .. } => "BAD_SIGNATURE",
            Self::UnknownSender { .. } => "UNKNOWN_SENDER",
            Self::BindingMismatch { .. } => "BINDING_MISMATCH",
            Self::ExpiredKey { .. } => "EXPIRED_KEY",
            Self::UnknownRelationship { .. } => "UNKNOWN_RELATIONSHIP",
            Self::ClosedRelationship { .. } => "CLOSED_RELATIONSHIP",
            Self::DepthExceeded { .. } => "DEPTH_EXCEEDED",
            Self::Expired { .. } => "EXPIRED",
            Self::OutsideWindow { .. } => "OUTSIDE_WINDOW",
            Self::AlreadyClosed { .. } => "ALREADY_CLOSED",
            Self::ParticipantMismatch { .. } => "PARTICIPANT_MISMATCH",
            Self::PredecessorActive { .. } => "PREDECESSOR_ACTIVE",
            Self::TrustLevelInsufficient { .. } => "TRUST_LEVEL_INSUFFICIENT",
            Self::ConsentMissing { .. } => "CONSENT_MISSING",
            Self::FilterRejected { .. } => "FILTER_REJECTED",
            Self::RiskTooLow { .. } => "RISK_TOO_LOW",
            Self::WrongDirection { .. } => "WRONG_DIRECTION",
            Self::NotAdmitted { .. } => "NOT_ADMITTED",
            Self::AlreadyFinalized { .. } => "ALREADY_FINALIZED",
            Self::Duplicate { .. } => "DUPLICATE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::DeliveryTimeout { .. } => "DELIVERY_TIMEOUT",
            Self::ResponderOverloaded { .. } => "RESPONDER_OVERLOADED",
            Self::Internal { .. } => "INTERNAL_ERROR",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = AccordError::DepthExceeded {
            relationship_id: "rel_x".to_string(),
            max_depth: 5,
        };
        assert_eq!(err.error_code(), "DEPTH_EXCEEDED");
    }

    #[test]
    fn test_retriable_errors() {
        assert!(AccordError::internal().is_retriable());
        assert!(AccordError::Timeout { deadline_ms: 2000 }.is_retriable());
        assert!(!AccordError::UnknownRelationship {
            relationship_id: "rel_x".to_string()
        }
        .is_retriable());
    }

    #[test]
    fn test_breach_classification() {
        assert!(AccordError::OutsideWindow {
            relationship_id: "rel_x".to_string()
        }
        .is_breach());
        assert!(AccordError::ClosedRelationship {
            relationship_id: "rel_x".to_string()
        }
        .is_breach());
        assert!(!AccordError::ConsentMissing {
            intent_type: "greet".to_string()
        }
        .is_breach());
    }
}
