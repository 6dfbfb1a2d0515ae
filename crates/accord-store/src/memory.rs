//! In-memory relationship store
//!
//! Backs embedded brokers and the test suite. Each relationship lives in its
//! own slot behind an async mutex, so mutations on one relationship are
//! serialized while distinct relationships proceed independently.

use crate::{triple_key, RecordUpdate, RelationshipStore, Result, StoreError};
use accord_types::{
    ChainHash, CloseReason, Event, Relationship, RelationshipId, RelationshipState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

struct Slot {
    relationship: Relationship,
    events: Vec<Event>,
}

/// DashMap-backed store; slots are `Arc<Mutex<_>>` so the map shard lock is
/// released before any await.
#[derive(Default)]
pub struct MemoryStore {
    slots: DashMap<RelationshipId, Arc<Mutex<Slot>>>,
    /// Active `(initiator, responder, continuation_of)` triples
    active_triples: DashMap<String, RelationshipId>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &RelationshipId) -> Result<Arc<Mutex<Slot>>> {
        self.slots
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StoreError::NotFound {
                relationship_id: id.to_string(),
            })
    }
}

#[async_trait]
impl RelationshipStore for MemoryStore {
    async fn create(&self, relationship: Relationship) -> Result<RelationshipId> {
        let key = triple_key(&relationship);
        let id = relationship.id;

        match self.active_triples.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StoreError::Duplicate {
                    initiator: relationship.initiator.to_string(),
                    responder: relationship.responder.to_string(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(id);
            }
        }

        self.slots.insert(
            id,
            Arc::new(Mutex::new(Slot {
                relationship,
                events: Vec::new(),
            })),
        );
        Ok(id)
    }

    async fn get(&self, id: &RelationshipId) -> Result<Relationship> {
        let slot = self.slot(id)?;
        let guard = slot.lock().await;
        Ok(guard.relationship.clone())
    }

    async fn append_event(
        &self,
        id: &RelationshipId,
        expected_head: ChainHash,
        event: Event,
        update: RecordUpdate,
    ) -> Result<ChainHash> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;

        if guard
            .events
            .last()
            .map(|last| last.kind.is_terminal())
            .unwrap_or(false)
        {
            return Err(StoreError::ChainClosed);
        }

        let actual = guard.relationship.chain_head;
        if actual != expected_head {
            return Err(StoreError::ChainConflict {
                expected: expected_head,
                actual,
            });
        }

        let head = event.hash;
        guard.events.push(event);
        guard.relationship.chain_head = head;
        update.apply(&mut guard.relationship);
        Ok(head)
    }

    async fn update_state(
        &self,
        id: &RelationshipId,
        reason: CloseReason,
        closed_at: DateTime<Utc>,
    ) -> Result<()> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;

        let key = triple_key(&guard.relationship);
        guard.relationship.state = RelationshipState::Closed { reason };
        guard.relationship.closed_at = Some(closed_at);
        self.active_triples
            .remove_if(&key, |_, active_id| active_id == id);
        Ok(())
    }

    async fn list_events(&self, id: &RelationshipId, from_sequence: u64) -> Result<Vec<Event>> {
        let slot = self.slot(id)?;
        let guard = slot.lock().await;
        Ok(guard
            .events
            .iter()
            .filter(|event| event.sequence >= from_sequence)
            .cloned()
            .collect())
    }

    async fn list_active(&self) -> Result<Vec<Relationship>> {
        // snapshot the slots first so no shard lock is held across an await
        let slots: Vec<Arc<Mutex<Slot>>> = self
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut active = Vec::new();
        for slot in slots {
            let guard = slot.lock().await;
            if guard.relationship.is_active() {
                active.push(guard.relationship.clone());
            }
        }
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract;

    #[tokio::test]
    async fn test_create_get_round_trip() {
        contract::create_get_round_trip(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_duplicate_triple_rejected() {
        contract::duplicate_triple_rejected(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_append_advances_head_and_conflicts_on_stale() {
        contract::append_advances_head_and_conflicts_on_stale(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_rejections_leave_record_untouched() {
        contract::rejections_leave_record_untouched(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_nothing_appends_after_close() {
        contract::nothing_appends_after_close(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_list_events_from_sequence() {
        contract::list_events_from_sequence(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_closed_triple_can_be_recreated() {
        contract::closed_triple_can_be_recreated(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_distinct_relationships_are_independent() {
        let store = MemoryStore::new();
        let first = contract::sample_relationship();
        let mut second = contract::sample_relationship();
        second.initiator = accord_types::ParticipantId::new("p3");

        let first_genesis = first.chain_head;
        let id1 = store.create(first).await.unwrap();
        let id2 = store.create(second).await.unwrap();

        let event = contract::event_at(
            0,
            first_genesis,
            accord_types::EventKind::RelationshipEstablished,
        );
        store
            .append_event(&id1, first_genesis, event, RecordUpdate::none())
            .await
            .unwrap();

        assert_eq!(store.list_events(&id1, 0).await.unwrap().len(), 1);
        assert_eq!(store.list_events(&id2, 0).await.unwrap().len(), 0);
    }
}
