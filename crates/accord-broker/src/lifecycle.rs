//! Lifecycle engine: closing, expiry sweeps, and chain bookkeeping
//!
//! Close is idempotent and always the chain's terminal event. Auto-close is
//! evaluated at admission time (timebox and depth checks) and by a periodic
//! sweep; admission-time enforcement stays authoritative, so nothing is
//! admitted past expiry even between sweeps.

use crate::api::CloseSummary;
use accord_crypto::ChainKey;
use accord_delivery::DeliveryHub;
use accord_store::{RecordUpdate, RelationshipStore, StoreError};
use accord_types::{
    AccordError, ChainHash, CloseReason, EventKind, IntentId, RelationshipId, Result,
    TimeboxPolicy,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Map a store failure onto the public taxonomy.
pub(crate) fn map_store_error(error: StoreError, relationship_id: &RelationshipId) -> AccordError {
    match error {
        StoreError::NotFound { .. } => AccordError::UnknownRelationship {
            relationship_id: relationship_id.to_string(),
        },
        StoreError::Duplicate {
            initiator,
            responder,
        } => AccordError::Duplicate {
            initiator,
            responder,
        },
        StoreError::ChainClosed => AccordError::ClosedRelationship {
            relationship_id: relationship_id.to_string(),
        },
        StoreError::ChainConflict { .. }
        | StoreError::Serialization { .. }
        | StoreError::Backend { .. } => {
            let failure = AccordError::internal();
            tracing::error!(%error, relationship = %relationship_id, broker_error = %failure, "store failure");
            failure
        }
    }
}

/// Seal and append one event, retrying exactly once after a chain conflict
/// with a refreshed head. Returns the event's sequence and the new head.
pub(crate) async fn append_sealed(
    store: &dyn RelationshipStore,
    key: &ChainKey,
    relationship_id: &RelationshipId,
    kind: EventKind,
    payload: serde_json::Value,
    update: RecordUpdate,
    now: DateTime<Utc>,
) -> Result<(u64, ChainHash)> {
    let mut attempts = 0;
    loop {
        let relationship = store
            .get(relationship_id)
            .await
            .map_err(|e| map_store_error(e, relationship_id))?;
        let sequence = store
            .list_events(relationship_id, 0)
            .await
            .map_err(|e| map_store_error(e, relationship_id))?
            .len() as u64;

        let event = accord_chain::seal(
            key,
            relationship.chain_head,
            sequence,
            kind,
            payload.clone(),
            now,
        );
        match store
            .append_event(relationship_id, relationship.chain_head, event, update)
            .await
        {
            Ok(head) => return Ok((sequence, head)),
            Err(StoreError::ChainConflict { .. }) if attempts == 0 => {
                attempts += 1;
                continue;
            }
            Err(error) => return Err(map_store_error(error, relationship_id)),
        }
    }
}

/// Close a relationship: finalize its pending deliveries, append the
/// terminal event, and flip the record. Idempotent: a second close returns
/// `AlreadyClosed` without touching the chain.
pub(crate) async fn close(
    store: &dyn RelationshipStore,
    key: &ChainKey,
    hub: &Arc<DeliveryHub>,
    relationship_id: &RelationshipId,
    reason: CloseReason,
    now: DateTime<Utc>,
) -> Result<CloseSummary> {
    let relationship = store
        .get(relationship_id)
        .await
        .map_err(|e| map_store_error(e, relationship_id))?;
    if !relationship.is_active() {
        return Err(AccordError::AlreadyClosed {
            relationship_id: relationship_id.to_string(),
        });
    }

    // cancel outstanding deliveries and finalize each cancelled intent on
    // the chain before the terminal event lands
    let cancelled = hub.cancel_relationship(relationship_id);
    for intent in &cancelled {
        finalize_cancelled(store, key, relationship_id, *intent, now).await?;
    }

    let depth = relationship.depth;
    let events_before = store
        .list_events(relationship_id, 0)
        .await
        .map_err(|e| map_store_error(e, relationship_id))?
        .len() as u64;

    let payload = serde_json::json!({
        "reason": reason.clone(),
        "depth": depth,
        "event_count": events_before,
    });
    let (sequence, final_hash) = append_sealed(
        store,
        key,
        relationship_id,
        EventKind::RelationshipClosed,
        payload,
        RecordUpdate::none(),
        now,
    )
    .await?;

    store
        .update_state(relationship_id, reason.clone(), now)
        .await
        .map_err(|e| map_store_error(e, relationship_id))?;

    tracing::info!(
        relationship = %relationship_id,
        %reason,
        cancelled = cancelled.len(),
        "relationship closed"
    );

    Ok(CloseSummary {
        total_events: sequence + 1,
        final_hash,
        outcome: reason,
    })
}

/// Record the system response that finalizes a cancelled pending intent.
async fn finalize_cancelled(
    store: &dyn RelationshipStore,
    key: &ChainKey,
    relationship_id: &RelationshipId,
    intent: IntentId,
    now: DateTime<Utc>,
) -> Result<()> {
    let payload = serde_json::json!({
        "intent": intent.to_string(),
        "outcome": { "outcome": "rejected", "reason": "relationship_closed" },
        "final": true,
        "system": true,
    });
    append_sealed(
        store,
        key,
        relationship_id,
        EventKind::ResponseRecorded,
        payload,
        RecordUpdate::none(),
        now,
    )
    .await?;
    Ok(())
}

/// One pass of the expiry sweep: close every activity-based relationship
/// whose timebox ran out. Stateless, hence resumable at any time.
pub(crate) async fn sweep_expired(
    store: &dyn RelationshipStore,
    key: &ChainKey,
    hub: &Arc<DeliveryHub>,
    now: DateTime<Utc>,
) -> usize {
    let active = match store.list_active().await {
        Ok(active) => active,
        Err(error) => {
            tracing::warn!(%error, "sweep could not list relationships");
            return 0;
        }
    };

    let mut closed = 0;
    for relationship in active {
        let activity_based = matches!(relationship.timebox, TimeboxPolicy::ActivityBased { .. });
        if activity_based && relationship.is_expired_at(now) {
            match close(store, key, hub, &relationship.id, CloseReason::Expired, now).await {
                Ok(_) => closed += 1,
                // lost the race with an admission-time auto-close
                Err(AccordError::AlreadyClosed { .. }) => {}
                Err(error) => {
                    tracing::warn!(%error, relationship = %relationship.id, "sweep close failed");
                }
            }
        }
    }
    closed
}
