//! Sled-backed relationship store
//!
//! Durable before acknowledging: every mutation flushes before returning.
//! Three trees: the relationship records, the event logs keyed by
//! `(relationship, sequence)`, and an index of active participant triples
//! for the duplicate check.

use crate::{triple_key, RecordUpdate, RelationshipStore, Result, StoreError};
use accord_types::{
    ChainHash, CloseReason, Event, Relationship, RelationshipId, RelationshipState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

const RELATIONSHIPS_TREE: &str = "relationships";
const EVENTS_TREE: &str = "events";
const TRIPLES_TREE: &str = "active_triples";

pub struct SledStore {
    relationships: sled::Tree,
    events: sled::Tree,
    triples: sled::Tree,
    db: sled::Db,
    /// Per-relationship write locks; sled serializes individual operations
    /// but the append's read-check-write spans several.
    locks: DashMap<RelationshipId, Arc<Mutex<()>>>,
}

impl SledStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| StoreError::backend(e.to_string()))?;
        Self::from_db(db)
    }

    /// Open a temporary store backed by sled's in-memory mode.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StoreError::backend(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let relationships = db
            .open_tree(RELATIONSHIPS_TREE)
            .map_err(|e| StoreError::backend(e.to_string()))?;
        let events = db
            .open_tree(EVENTS_TREE)
            .map_err(|e| StoreError::backend(e.to_string()))?;
        let triples = db
            .open_tree(TRIPLES_TREE)
            .map_err(|e| StoreError::backend(e.to_string()))?;
        Ok(Self {
            relationships,
            events,
            triples,
            db,
            locks: DashMap::new(),
        })
    }

    fn lock_for(&self, id: &RelationshipId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(*id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn record_key(id: &RelationshipId) -> [u8; 16] {
        *id.as_uuid().as_bytes()
    }

    fn event_key(id: &RelationshipId, sequence: u64) -> [u8; 24] {
        let mut key = [0u8; 24];
        key[..16].copy_from_slice(id.as_uuid().as_bytes());
        key[16..].copy_from_slice(&sequence.to_be_bytes());
        key
    }

    fn load_record(&self, id: &RelationshipId) -> Result<Relationship> {
        let bytes = self
            .relationships
            .get(Self::record_key(id))
            .map_err(|e| StoreError::backend(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound {
                relationship_id: id.to_string(),
            })?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::serialization(e.to_string()))
    }

    fn save_record(&self, relationship: &Relationship) -> Result<()> {
        let bytes = serde_json::to_vec(relationship)
            .map_err(|e| StoreError::serialization(e.to_string()))?;
        self.relationships
            .insert(Self::record_key(&relationship.id), bytes)
            .map_err(|e| StoreError::backend(e.to_string()))?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| StoreError::backend(e.to_string()))?;
        Ok(())
    }

    fn last_event_is_terminal(&self, id: &RelationshipId) -> Result<bool> {
        let prefix = Self::record_key(id);
        let last = self
            .events
            .scan_prefix(prefix)
            .last()
            .transpose()
            .map_err(|e| StoreError::backend(e.to_string()))?;
        match last {
            Some((_, bytes)) => {
                let event: Event = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::serialization(e.to_string()))?;
                Ok(event.kind.is_terminal())
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl RelationshipStore for SledStore {
    async fn create(&self, relationship: Relationship) -> Result<RelationshipId> {
        let id = relationship.id;
        let key = triple_key(&relationship);

        // compare-and-swap makes the duplicate check atomic across callers
        let claimed = self
            .triples
            .compare_and_swap(
                key.as_bytes(),
                None::<&[u8]>,
                Some(&Self::record_key(&id)[..]),
            )
            .map_err(|e| StoreError::backend(e.to_string()))?;
        if claimed.is_err() {
            return Err(StoreError::Duplicate {
                initiator: relationship.initiator.to_string(),
                responder: relationship.responder.to_string(),
            });
        }

        self.save_record(&relationship)?;
        self.flush().await?;
        Ok(id)
    }

    async fn get(&self, id: &RelationshipId) -> Result<Relationship> {
        self.load_record(id)
    }

    async fn append_event(
        &self,
        id: &RelationshipId,
        expected_head: ChainHash,
        event: Event,
        update: RecordUpdate,
    ) -> Result<ChainHash> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut relationship = self.load_record(id)?;

        if self.last_event_is_terminal(id)? {
            return Err(StoreError::ChainClosed);
        }

        if relationship.chain_head != expected_head {
            return Err(StoreError::ChainConflict {
                expected: expected_head,
                actual: relationship.chain_head,
            });
        }

        let head = event.hash;
        let bytes =
            serde_json::to_vec(&event).map_err(|e| StoreError::serialization(e.to_string()))?;
        self.events
            .insert(Self::event_key(id, event.sequence), bytes)
            .map_err(|e| StoreError::backend(e.to_string()))?;

        relationship.chain_head = head;
        update.apply(&mut relationship);
        self.save_record(&relationship)?;
        self.flush().await?;
        Ok(head)
    }

    async fn update_state(
        &self,
        id: &RelationshipId,
        reason: CloseReason,
        closed_at: DateTime<Utc>,
    ) -> Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut relationship = self.load_record(id)?;
        let key = triple_key(&relationship);

        relationship.state = RelationshipState::Closed { reason };
        relationship.closed_at = Some(closed_at);
        self.save_record(&relationship)?;

        // release the triple so the pair can establish again
        let _ = self
            .triples
            .compare_and_swap(
                key.as_bytes(),
                Some(&Self::record_key(id)[..]),
                None::<&[u8]>,
            )
            .map_err(|e| StoreError::backend(e.to_string()))?;

        self.flush().await?;
        Ok(())
    }

    async fn list_events(&self, id: &RelationshipId, from_sequence: u64) -> Result<Vec<Event>> {
        // existence check so unknown IDs fail loudly rather than listing empty
        self.load_record(id)?;

        let start = Self::event_key(id, from_sequence);
        let end = Self::event_key(id, u64::MAX);
        let mut events = Vec::new();
        for item in self.events.range(start..=end) {
            let (_, bytes) = item.map_err(|e| StoreError::backend(e.to_string()))?;
            let event: Event = serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::serialization(e.to_string()))?;
            events.push(event);
        }
        Ok(events)
    }

    async fn list_active(&self) -> Result<Vec<Relationship>> {
        let mut active = Vec::new();
        for item in self.relationships.iter() {
            let (_, bytes) = item.map_err(|e| StoreError::backend(e.to_string()))?;
            let relationship: Relationship = serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::serialization(e.to_string()))?;
            if relationship.is_active() {
                active.push(relationship);
            }
        }
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract;

    fn store() -> SledStore {
        SledStore::temporary().unwrap()
    }

    #[tokio::test]
    async fn test_create_get_round_trip() {
        contract::create_get_round_trip(&store()).await;
    }

    #[tokio::test]
    async fn test_duplicate_triple_rejected() {
        contract::duplicate_triple_rejected(&store()).await;
    }

    #[tokio::test]
    async fn test_append_advances_head_and_conflicts_on_stale() {
        contract::append_advances_head_and_conflicts_on_stale(&store()).await;
    }

    #[tokio::test]
    async fn test_rejections_leave_record_untouched() {
        contract::rejections_leave_record_untouched(&store()).await;
    }

    #[tokio::test]
    async fn test_nothing_appends_after_close() {
        contract::nothing_appends_after_close(&store()).await;
    }

    #[tokio::test]
    async fn test_list_events_from_sequence() {
        contract::list_events_from_sequence(&store()).await;
    }

    #[tokio::test]
    async fn test_closed_triple_can_be_recreated() {
        contract::closed_triple_can_be_recreated(&store()).await;
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let relationship = contract::sample_relationship();
        let id = relationship.id;

        {
            let store = SledStore::open(dir.path()).unwrap();
            store.create(relationship.clone()).await.unwrap();
        }

        let reopened = SledStore::open(dir.path()).unwrap();
        let loaded = reopened.get(&id).await.unwrap();
        assert_eq!(loaded, relationship);
    }
}
