//! Accord Delivery - subscription fanout with acknowledged, at-most-once
//! delivery
//!
//! Each participant gets a bounded mailbox per role (responder for intent
//! pushes, initiator for response pushes). A pump task per mailbox feeds the
//! current subscription session one frame at a time and waits for the ack:
//! an ack marks the frame delivered; a timeout requeues it exactly once and
//! then reports it timed out; a dropped session requeues without charging the
//! attempt. Heartbeats run while the session is idle; two missed heartbeats
//! close the session.
//!
//! # Protocol
//!
//! Frames flow hub → subscriber, subscriber messages flow back:
//!
//! ```json
//! { "type": "intent", "delivery": "dlv_...", "sequence": 3, ... }
//! { "type": "heartbeat", "at": "2025-01-01T10:00:00Z" }
//! ```
//!
//! ```json
//! { "type": "ack", "delivery": "dlv_..." }
//! { "type": "pong" }
//! ```

mod mailbox;

pub use mailbox::{Mailbox, QueuedDelivery};

use accord_types::{DeliveryId, Intent, IntentId, ParticipantId, RelationshipId, Response};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Delivery configuration
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// How long a subscriber has to acknowledge a frame
    pub ack_timeout: std::time::Duration,
    /// Idle-session heartbeat cadence
    pub heartbeat_interval: std::time::Duration,
    /// Bounded pending-queue size per mailbox
    pub queue_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            ack_timeout: std::time::Duration::from_secs(10),
            heartbeat_interval: std::time::Duration::from_secs(5),
            queue_size: 64,
        }
    }
}

/// Delivery errors
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("pending queue full for {participant}")]
    QueueFull { participant: ParticipantId },

    #[error("delivery hub is shut down")]
    ShutDown,
}

/// Frames pushed to a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// An admitted intent, for responder subscriptions
    Intent {
        delivery: DeliveryId,
        relationship: RelationshipId,
        /// Admission sequence on the relationship chain
        sequence: u64,
        intent: Intent,
    },
    /// A recorded response, for initiator subscriptions
    Response {
        delivery: DeliveryId,
        relationship: RelationshipId,
        intent: IntentId,
        response: Response,
    },
    /// Idle keep-alive; answer with a pong
    Heartbeat { at: DateTime<Utc> },
}

impl Frame {
    pub fn delivery_id(&self) -> Option<DeliveryId> {
        match self {
            Self::Intent { delivery, .. } | Self::Response { delivery, .. } => Some(*delivery),
            Self::Heartbeat { .. } => None,
        }
    }
}

/// Messages a subscriber sends back on its control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriberMessage {
    /// Acknowledge receipt of a frame
    Ack { delivery: DeliveryId },
    /// Heartbeat answer
    Pong,
}

/// What happened to a pushed frame. Consumed by the broker, which finalizes
/// timed-out intent deliveries on the relationship chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    TimedOut,
    Cancelled,
}

/// Report emitted for every non-heartbeat frame the hub stops tracking.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub participant: ParticipantId,
    pub relationship: RelationshipId,
    /// Set for intent deliveries; responses carry the intent they answer
    pub intent: IntentId,
    pub outcome: DeliveryOutcome,
}

/// A subscriber's handle: a stream of frames plus the control channel back.
pub struct SubscriptionStream {
    frames: flume::Receiver<Frame>,
    control: flume::Sender<SubscriberMessage>,
}

impl SubscriptionStream {
    /// Receive the next frame; `None` when the session was replaced or the
    /// hub shut down.
    pub async fn next_frame(&self) -> Option<Frame> {
        self.frames.recv_async().await.ok()
    }

    /// Acknowledge a frame.
    pub fn ack(&self, delivery: DeliveryId) {
        let _ = self.control.send(SubscriberMessage::Ack { delivery });
    }

    /// Answer a heartbeat.
    pub fn pong(&self) {
        let _ = self.control.send(SubscriberMessage::Pong);
    }
}

/// Which channel a mailbox serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Responder,
    Initiator,
}

/// The delivery hub: one mailbox per (participant, role), pumped by a task
/// each, plus the report channel the broker drains.
pub struct DeliveryHub {
    config: DeliveryConfig,
    mailboxes: DashMap<(ParticipantId, Role), Arc<Mailbox>>,
    reports_tx: flume::Sender<DeliveryReport>,
    reports_rx: flume::Receiver<DeliveryReport>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl DeliveryHub {
    pub fn new(config: DeliveryConfig) -> Self {
        let (reports_tx, reports_rx) = flume::unbounded();
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Self {
            config,
            mailboxes: DashMap::new(),
            reports_tx,
            reports_rx,
            shutdown,
        }
    }

    fn mailbox(&self, participant: &ParticipantId, role: Role) -> Arc<Mailbox> {
        let key = (participant.clone(), role);
        let entry = self.mailboxes.entry(key).or_insert_with(|| {
            let mailbox = Arc::new(Mailbox::new(
                participant.clone(),
                self.config.queue_size,
            ));
            tokio::spawn(mailbox::pump(
                Arc::clone(&mailbox),
                self.config.clone(),
                self.reports_tx.clone(),
                self.shutdown.subscribe(),
            ));
            mailbox
        });
        Arc::clone(entry.value())
    }

    /// Open (or replace) the responder-side subscription for a participant.
    pub fn subscribe_as_responder(&self, participant: &ParticipantId) -> SubscriptionStream {
        self.subscribe(participant, Role::Responder)
    }

    /// Open (or replace) the initiator-side subscription for a participant.
    pub fn subscribe_as_initiator(&self, participant: &ParticipantId) -> SubscriptionStream {
        self.subscribe(participant, Role::Initiator)
    }

    fn subscribe(&self, participant: &ParticipantId, role: Role) -> SubscriptionStream {
        let mailbox = self.mailbox(participant, role);
        let (frames_tx, frames_rx) = flume::bounded(self.config.queue_size);
        let (control_tx, control_rx) = flume::unbounded();
        mailbox.attach_session(frames_tx, control_rx);
        SubscriptionStream {
            frames: frames_rx,
            control: control_tx,
        }
    }

    /// Queue an admitted intent for its responder. Fails when the bounded
    /// queue is full. The admission pipeline checks `responder_overloaded`
    /// first, so this surfaces only on races.
    pub fn push_intent(
        &self,
        responder: &ParticipantId,
        relationship: RelationshipId,
        sequence: u64,
        intent: Intent,
    ) -> Result<DeliveryId, DeliveryError> {
        let delivery = DeliveryId::new();
        let intent_id = intent.id;
        let mailbox = self.mailbox(responder, Role::Responder);
        mailbox.enqueue(QueuedDelivery {
            delivery,
            relationship,
            intent: intent_id,
            sequence,
            frame: Frame::Intent {
                delivery,
                relationship,
                sequence,
                intent,
            },
            attempts: 0,
        })?;
        Ok(delivery)
    }

    /// Queue a recorded response for the initiator.
    pub fn push_response(
        &self,
        initiator: &ParticipantId,
        relationship: RelationshipId,
        sequence: u64,
        response: Response,
    ) -> Result<DeliveryId, DeliveryError> {
        let delivery = DeliveryId::new();
        let intent = response.intent;
        let mailbox = self.mailbox(initiator, Role::Initiator);
        mailbox.enqueue(QueuedDelivery {
            delivery,
            relationship,
            intent,
            sequence,
            frame: Frame::Response {
                delivery,
                relationship,
                intent,
                response,
            },
            attempts: 0,
        })?;
        Ok(delivery)
    }

    /// Backpressure signal for the admission pipeline's risk step.
    pub fn responder_overloaded(&self, responder: &ParticipantId) -> bool {
        self.mailboxes
            .get(&(responder.clone(), Role::Responder))
            .map(|mailbox| mailbox.is_full())
            .unwrap_or(false)
    }

    /// Drop every queued delivery for a relationship, reporting each as
    /// cancelled. Returns the intent IDs of cancelled intent pushes so the
    /// caller can finalize them on the chain.
    pub fn cancel_relationship(&self, relationship: &RelationshipId) -> Vec<IntentId> {
        let mut cancelled = Vec::new();
        for entry in self.mailboxes.iter() {
            let removed = entry.value().remove_for_relationship(relationship);
            for delivery in removed {
                let is_intent = matches!(delivery.frame, Frame::Intent { .. });
                let report = DeliveryReport {
                    participant: entry.value().participant().clone(),
                    relationship: *relationship,
                    intent: delivery.intent,
                    outcome: DeliveryOutcome::Cancelled,
                };
                let _ = self.reports_tx.send(report);
                if is_intent {
                    cancelled.push(delivery.intent);
                }
            }
        }
        cancelled
    }

    /// The report stream. Clone-cheap; the broker drains it.
    pub fn reports(&self) -> flume::Receiver<DeliveryReport> {
        self.reports_rx.clone()
    }

    /// Stop every pump; queued deliveries are reported cancelled.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_types::{Constraints, IntentType, TimeWindow};
    use serde_json::json;

    fn intent_for(relationship: RelationshipId) -> Intent {
        Intent {
            relationship,
            id: IntentId::new(),
            intent_type: IntentType::new("greet"),
            window: TimeWindow::immediate(),
            context: json!("hello"),
            constraints: Constraints::default(),
            sender: ParticipantId::new("p1"),
            human: None,
            signature: String::new(),
        }
    }

    fn fast_config() -> DeliveryConfig {
        DeliveryConfig {
            ack_timeout: std::time::Duration::from_millis(80),
            heartbeat_interval: std::time::Duration::from_millis(40),
            queue_size: 4,
        }
    }

    #[tokio::test]
    async fn test_push_then_ack_is_delivered() {
        let hub = DeliveryHub::new(fast_config());
        let responder = ParticipantId::new("p2");
        let stream = hub.subscribe_as_responder(&responder);
        let relationship = RelationshipId::new();

        hub.push_intent(&responder, relationship, 1, intent_for(relationship))
            .unwrap();

        let frame = stream.next_frame().await.unwrap();
        let delivery = frame.delivery_id().unwrap();
        stream.ack(delivery);

        let report = hub.reports().recv_async().await.unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Delivered);
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_unacked_delivery_requeues_once_then_times_out() {
        let hub = DeliveryHub::new(fast_config());
        let responder = ParticipantId::new("p2");
        let stream = hub.subscribe_as_responder(&responder);
        let relationship = RelationshipId::new();

        hub.push_intent(&responder, relationship, 1, intent_for(relationship))
            .unwrap();

        // receive twice without acking: original attempt plus the single requeue
        let first = stream.next_frame().await.unwrap();
        assert!(matches!(first, Frame::Intent { .. }));
        let second = stream.next_frame().await.unwrap();
        assert!(matches!(second, Frame::Intent { .. }));

        let report = hub.reports().recv_async().await.unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::TimedOut);
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_queue_bound_enforced() {
        let hub = DeliveryHub::new(fast_config());
        let responder = ParticipantId::new("p2");
        let relationship = RelationshipId::new();

        // no session attached: pushes accumulate in the pending queue
        for _ in 0..4 {
            hub.push_intent(&responder, relationship, 1, intent_for(relationship))
                .unwrap();
        }
        assert!(hub.responder_overloaded(&responder));
        assert!(matches!(
            hub.push_intent(&responder, relationship, 5, intent_for(relationship)),
            Err(DeliveryError::QueueFull { .. })
        ));
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_intra_relationship_order_preserved() {
        let hub = DeliveryHub::new(fast_config());
        let responder = ParticipantId::new("p2");
        let relationship = RelationshipId::new();

        for sequence in 1..=3u64 {
            hub.push_intent(&responder, relationship, sequence, intent_for(relationship))
                .unwrap();
        }

        let stream = hub.subscribe_as_responder(&responder);
        for expected in 1..=3u64 {
            let frame = stream.next_frame().await.unwrap();
            match frame {
                Frame::Intent {
                    delivery, sequence, ..
                } => {
                    assert_eq!(sequence, expected);
                    stream.ack(delivery);
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_relationship_drains_pending() {
        let hub = DeliveryHub::new(fast_config());
        let responder = ParticipantId::new("p2");
        let relationship = RelationshipId::new();
        let other = RelationshipId::new();

        let intent = intent_for(relationship);
        let kept = intent_for(other);
        hub.push_intent(&responder, relationship, 1, intent.clone())
            .unwrap();
        hub.push_intent(&responder, other, 1, kept).unwrap();

        let cancelled = hub.cancel_relationship(&relationship);
        assert_eq!(cancelled, vec![intent.id]);
        assert!(!hub.responder_overloaded(&responder));

        let report = hub.reports().recv_async().await.unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Cancelled);
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_responses_reach_initiator_stream() {
        let hub = DeliveryHub::new(fast_config());
        let initiator = ParticipantId::new("p1");
        let stream = hub.subscribe_as_initiator(&initiator);
        let relationship = RelationshipId::new();
        let intent_id = IntentId::new();

        let response = Response {
            relationship,
            intent: intent_id,
            outcome: accord_types::ResponseOutcome::Completed,
            data: json!({}),
            sender: ParticipantId::new("p2"),
            signature: String::new(),
        };
        hub.push_response(&initiator, relationship, 4, response)
            .unwrap();

        let frame = stream.next_frame().await.unwrap();
        match frame {
            Frame::Response { intent, .. } => assert_eq!(intent, intent_id),
            other => panic!("unexpected frame {:?}", other),
        }
        hub.shutdown();
    }

    #[tokio::test]
    async fn test_heartbeats_flow_while_idle() {
        let hub = DeliveryHub::new(fast_config());
        let responder = ParticipantId::new("p2");
        let stream = hub.subscribe_as_responder(&responder);

        let frame = stream.next_frame().await.unwrap();
        assert!(matches!(frame, Frame::Heartbeat { .. }));
        stream.pong();
        hub.shutdown();
    }
}
