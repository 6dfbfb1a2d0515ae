//! Request and receipt types for the broker's inbound surface
//!
//! Transport-agnostic: an embedding program maps these onto whatever
//! request/reply framing it uses.

use accord_types::{
    ChainHash, CloseReason, ContextSnapshot, Participant, ParticipantId, RelationshipId,
    TimeboxPolicy, TrustLevel,
};
use serde::{Deserialize, Serialize};

/// A signed proposal to establish a relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstablishProposal {
    /// The proposing initiator (device plus optional human binding)
    pub initiator: Participant,
    /// The intended responder
    pub responder: ParticipantId,
    /// Timebox mode; defaults to activity-based with the broker's idle hours
    pub timebox: Option<TimeboxPolicy>,
    /// Depth cap; defaults to the broker's configured cap
    pub max_depth: Option<u32>,
    /// Immutable context snapshot for the new relationship
    pub context: ContextSnapshot,
    /// Hex Ed25519 signature over the canonical encoding
    pub signature: String,
}

impl EstablishProposal {
    /// The canonical signing body: every field except the signature itself.
    pub fn signing_body(&self) -> serde_json::Value {
        serde_json::json!({
            "initiator": self.initiator.device.as_str(),
            "human": self.initiator.human.as_ref().map(|h| h.as_str()),
            "responder": self.responder.as_str(),
            "timebox": &self.timebox,
            "max_depth": self.max_depth,
            "context": &self.context,
        })
    }
}

/// Successful establishment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstablishReceipt {
    pub relationship: RelationshipId,
    pub trust_level: TrustLevel,
}

/// Successful admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentReceipt {
    /// Sequence of the admitted event on the relationship chain
    pub sequence: u64,
    pub admitted: bool,
    /// Final risk score recorded on the event
    pub risk_score: f64,
}

/// Successful response recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespondReceipt {
    /// Sequence of the response event on the relationship chain
    pub sequence: u64,
}

/// Summary returned by an explicit close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSummary {
    /// Total events on the chain, terminal close included
    pub total_events: u64,
    /// The chain's final continuity hash
    pub final_hash: ChainHash,
    /// Outcome classifier
    pub outcome: CloseReason,
}

/// Assigns the trust level for an initiator/responder pair at establishment.
///
/// `None` means the admission policy denies the pair outright.
pub trait TrustPolicy: Send + Sync {
    fn assess(&self, initiator: &ParticipantId, responder: &ParticipantId) -> Option<TrustLevel>;
}

/// Grants every pair the same configured level. The default for embedded
/// brokers; deployments substitute a directory-backed policy.
#[derive(Debug, Clone)]
pub struct UniformTrustPolicy {
    pub level: TrustLevel,
}

impl UniformTrustPolicy {
    pub fn new(level: TrustLevel) -> Self {
        Self { level }
    }
}

impl TrustPolicy for UniformTrustPolicy {
    fn assess(&self, _initiator: &ParticipantId, _responder: &ParticipantId) -> Option<TrustLevel> {
        Some(self.level)
    }
}

/// Per-pair trust assignments with a deny-by-default floor.
#[derive(Debug, Default)]
pub struct PairTrustPolicy {
    pairs: std::collections::HashMap<(ParticipantId, ParticipantId), TrustLevel>,
    /// Level granted to unlisted pairs; `None` denies them
    pub fallback: Option<TrustLevel>,
}

impl PairTrustPolicy {
    pub fn new(fallback: Option<TrustLevel>) -> Self {
        Self {
            pairs: Default::default(),
            fallback,
        }
    }

    pub fn grant(
        &mut self,
        initiator: ParticipantId,
        responder: ParticipantId,
        level: TrustLevel,
    ) {
        self.pairs.insert((initiator, responder), level);
    }
}

impl TrustPolicy for PairTrustPolicy {
    fn assess(&self, initiator: &ParticipantId, responder: &ParticipantId) -> Option<TrustLevel> {
        self.pairs
            .get(&(initiator.clone(), responder.clone()))
            .copied()
            .or(self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_policy_grants_everyone() {
        let policy = UniformTrustPolicy::new(TrustLevel::new(2).unwrap());
        assert_eq!(
            policy.assess(&ParticipantId::new("a"), &ParticipantId::new("b")),
            TrustLevel::new(2).ok()
        );
    }

    #[test]
    fn test_pair_policy_deny_by_default() {
        let mut policy = PairTrustPolicy::new(None);
        let p1 = ParticipantId::new("p1");
        let p2 = ParticipantId::new("p2");
        assert_eq!(policy.assess(&p1, &p2), None);

        policy.grant(p1.clone(), p2.clone(), TrustLevel::new(4).unwrap());
        assert_eq!(policy.assess(&p1, &p2), TrustLevel::new(4).ok());
        // direction matters
        assert_eq!(policy.assess(&p2, &p1), None);
    }

    #[test]
    fn test_proposal_signing_body_excludes_signature() {
        let proposal = EstablishProposal {
            initiator: Participant::device("p1"),
            responder: ParticipantId::new("p2"),
            timebox: None,
            max_depth: None,
            context: Default::default(),
            signature: "aabb".to_string(),
        };
        let body = proposal.signing_body();
        assert!(body.get("signature").is_none());
        assert_eq!(body["initiator"], "p1");
    }
}
