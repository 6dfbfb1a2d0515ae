//! Accord Chain - tamper-evident event chains
//!
//! Each relationship owns an append-only log whose entries are linked by
//! keyed BLAKE3 hashes: `H(key, previous_hash || canonical(sequence, kind,
//! payload))`. External verifiers replay the log and recompute every hash;
//! any insertion, deletion, or reordering breaks the chain at the point of
//! tampering. The key is a per-broker secret, so only the broker (or an
//! auditor it shares the key with) can extend or verify a chain.

use accord_crypto::ChainKey;
use accord_types::{canonical, ChainHash, Event, EventKind};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Chain verification failures, reporting where continuity broke.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("chain is empty")]
    Empty,

    #[error("first event must be relationship_established, found {found} at sequence {sequence}")]
    BadGenesis { sequence: u64, found: String },

    #[error("sequence gap at {expected}: found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("continuity broken at sequence {sequence}")]
    ContinuityBroken { sequence: u64 },

    #[error("event found after terminal close at sequence {sequence}")]
    EventAfterClose { sequence: u64 },
}

/// The hashed body of an event: everything the continuity hash covers apart
/// from the previous hash itself.
fn hash_body(sequence: u64, kind: EventKind, payload: &serde_json::Value) -> Vec<u8> {
    let body = serde_json::json!({
        "sequence": sequence,
        "type": kind.as_str(),
        "payload": payload,
    });
    canonical::to_bytes(&body)
}

/// Seal a new event onto a chain head.
///
/// The caller supplies the head it last observed; the store's append
/// compare-and-swaps on the same value, so a stale head surfaces as a
/// conflict there rather than a fork here.
pub fn seal(
    key: &ChainKey,
    previous_hash: ChainHash,
    sequence: u64,
    kind: EventKind,
    payload: serde_json::Value,
    timestamp: DateTime<Utc>,
) -> Event {
    let body = hash_body(sequence, kind, &payload);
    let hash = key.continuity_hash(&previous_hash, &body);
    Event {
        sequence,
        kind,
        timestamp,
        payload,
        previous_hash,
        hash,
    }
}

/// Recompute the hash an event should carry.
pub fn expected_hash(key: &ChainKey, event: &Event) -> ChainHash {
    let body = hash_body(event.sequence, event.kind, &event.payload);
    key.continuity_hash(&event.previous_hash, &body)
}

/// Verify a complete chain from its genesis event.
///
/// Checks: the first event is `relationship_established` with the genesis
/// previous-hash; sequences are dense; each event links to its predecessor's
/// hash; every hash recomputes; nothing follows a terminal close.
pub fn verify_chain(key: &ChainKey, events: &[Event]) -> Result<(), ChainError> {
    let first = events.first().ok_or(ChainError::Empty)?;
    if first.sequence != 0
        || first.kind != EventKind::RelationshipEstablished
        || !first.previous_hash.is_genesis()
    {
        return Err(ChainError::BadGenesis {
            sequence: first.sequence,
            found: first.kind.as_str().to_string(),
        });
    }

    let mut previous: Option<&Event> = None;
    let mut closed = false;
    for (index, event) in events.iter().enumerate() {
        let expected_sequence = index as u64;
        if event.sequence != expected_sequence {
            return Err(ChainError::SequenceGap {
                expected: expected_sequence,
                found: event.sequence,
            });
        }

        if closed {
            return Err(ChainError::EventAfterClose {
                sequence: event.sequence,
            });
        }

        if let Some(prev) = previous {
            if event.previous_hash != prev.hash {
                return Err(ChainError::ContinuityBroken {
                    sequence: event.sequence,
                });
            }
        }

        if expected_hash(key, event) != event.hash {
            return Err(ChainError::ContinuityBroken {
                sequence: event.sequence,
            });
        }

        closed = event.kind.is_terminal();
        previous = Some(event);
    }

    Ok(())
}

/// Replay a chain and return the head hash it reconstructs.
pub fn replay_head(key: &ChainKey, events: &[Event]) -> Result<ChainHash, ChainError> {
    verify_chain(key, events)?;
    // verify_chain rejects empty chains
    Ok(events[events.len() - 1].hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn test_key() -> ChainKey {
        ChainKey::from_bytes([42u8; 32])
    }

    fn build_chain(key: &ChainKey, kinds: &[EventKind]) -> Vec<Event> {
        let mut events = Vec::new();
        let mut head = ChainHash::genesis();
        for (sequence, kind) in kinds.iter().enumerate() {
            let event = seal(
                key,
                head,
                sequence as u64,
                *kind,
                json!({ "n": sequence }),
                Utc::now(),
            );
            head = event.hash;
            events.push(event);
        }
        events
    }

    fn normal_chain(key: &ChainKey) -> Vec<Event> {
        build_chain(
            key,
            &[
                EventKind::RelationshipEstablished,
                EventKind::IntentAdmitted,
                EventKind::ResponseRecorded,
                EventKind::IntentAdmitted,
            ],
        )
    }

    #[test]
    fn test_valid_chain_verifies() {
        let key = test_key();
        let events = normal_chain(&key);
        assert!(verify_chain(&key, &events).is_ok());
        assert_eq!(replay_head(&key, &events).unwrap(), events[3].hash);
    }

    #[test]
    fn test_empty_chain_rejected() {
        assert_eq!(verify_chain(&test_key(), &[]), Err(ChainError::Empty));
    }

    #[test]
    fn test_wrong_genesis_kind_rejected() {
        let key = test_key();
        let events = build_chain(&key, &[EventKind::IntentAdmitted]);
        assert!(matches!(
            verify_chain(&key, &events),
            Err(ChainError::BadGenesis { .. })
        ));
    }

    #[test]
    fn test_payload_tamper_detected_at_point() {
        let key = test_key();
        let mut events = normal_chain(&key);
        events[1].payload = json!({ "n": "flipped" });

        assert_eq!(
            verify_chain(&key, &events),
            Err(ChainError::ContinuityBroken { sequence: 1 })
        );
    }

    #[test]
    fn test_deletion_detected() {
        let key = test_key();
        let mut events = normal_chain(&key);
        events.remove(2);

        // removal shifts sequences, surfacing as a gap
        assert!(verify_chain(&key, &events).is_err());
    }

    #[test]
    fn test_reordering_detected() {
        let key = test_key();
        let mut events = normal_chain(&key);
        events.swap(1, 2);
        assert!(verify_chain(&key, &events).is_err());
    }

    #[test]
    fn test_wrong_key_fails_everywhere() {
        let key = test_key();
        let events = normal_chain(&key);
        let other = ChainKey::from_bytes([7u8; 32]);
        assert!(matches!(
            verify_chain(&other, &events),
            Err(ChainError::ContinuityBroken { sequence: 0 })
        ));
    }

    #[test]
    fn test_event_after_close_rejected() {
        let key = test_key();
        let events = build_chain(
            &key,
            &[
                EventKind::RelationshipEstablished,
                EventKind::RelationshipClosed,
                EventKind::IntentAdmitted,
            ],
        );
        assert_eq!(
            verify_chain(&key, &events),
            Err(ChainError::EventAfterClose { sequence: 2 })
        );
    }

    proptest! {
        /// Flipping any byte of any event's payload breaks verification.
        #[test]
        fn property_any_payload_tamper_detected(
            target in 0usize..4,
            replacement in "[a-z]{1,12}",
        ) {
            let key = test_key();
            let mut events = normal_chain(&key);
            let original = events[target].payload.clone();
            events[target].payload = json!({ "n": replacement });
            prop_assume!(events[target].payload != original);

            let result = verify_chain(&key, &events);
            prop_assert_eq!(
                result,
                Err(ChainError::ContinuityBroken { sequence: target as u64 })
            );
        }

        /// Chains of admitted/rejected/response events always verify when
        /// sealed in order with the same key.
        #[test]
        fn property_sealed_chains_verify(extra in proptest::collection::vec(0u8..3, 0..12)) {
            let key = test_key();
            let mut kinds = vec![EventKind::RelationshipEstablished];
            kinds.extend(extra.iter().map(|k| match k {
                0 => EventKind::IntentAdmitted,
                1 => EventKind::IntentRejected,
                _ => EventKind::ResponseRecorded,
            }));
            let events = build_chain(&key, &kinds);
            prop_assert!(verify_chain(&key, &events).is_ok());
        }
    }
}
