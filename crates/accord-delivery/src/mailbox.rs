//! Per-participant mailboxes and their pump tasks
//!
//! A mailbox owns the bounded pending queue for one (participant, role)
//! channel and at most one live session. The pump drains the queue into the
//! session one frame at a time, enforcing the ack window, the single
//! requeue, and idle heartbeats.

use crate::{
    DeliveryConfig, DeliveryError, DeliveryOutcome, DeliveryReport, Frame, SubscriberMessage,
};
use accord_types::{DeliveryId, IntentId, ParticipantId, RelationshipId};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// One queued frame awaiting delivery.
#[derive(Debug, Clone)]
pub struct QueuedDelivery {
    pub delivery: DeliveryId,
    pub relationship: RelationshipId,
    /// The intent this frame carries or answers
    pub intent: IntentId,
    /// Admission sequence, for intra-relationship ordering diagnostics
    pub sequence: u64,
    pub frame: Frame,
    /// Timeout attempts so far; one requeue is allowed
    pub attempts: u32,
}

#[derive(Clone)]
pub(crate) struct Session {
    pub epoch: u64,
    pub frames: flume::Sender<Frame>,
    pub control: flume::Receiver<SubscriberMessage>,
}

pub struct Mailbox {
    participant: ParticipantId,
    capacity: usize,
    queue: Mutex<VecDeque<QueuedDelivery>>,
    session: Mutex<Option<Session>>,
    next_epoch: Mutex<u64>,
    notify: Notify,
}

impl Mailbox {
    pub(crate) fn new(participant: ParticipantId, capacity: usize) -> Self {
        Self {
            participant,
            capacity,
            queue: Mutex::new(VecDeque::new()),
            session: Mutex::new(None),
            next_epoch: Mutex::new(0),
            notify: Notify::new(),
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn is_full(&self) -> bool {
        self.queue.lock().len() >= self.capacity
    }

    pub(crate) fn enqueue(&self, delivery: QueuedDelivery) -> Result<(), DeliveryError> {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                return Err(DeliveryError::QueueFull {
                    participant: self.participant.clone(),
                });
            }
            queue.push_back(delivery);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Put an undelivered frame back at the front. Deliberately ignores the
    /// capacity bound: the frame already held a slot.
    fn requeue_front(&self, delivery: QueuedDelivery) {
        self.queue.lock().push_front(delivery);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<QueuedDelivery> {
        self.queue.lock().pop_front()
    }

    pub(crate) fn remove_for_relationship(
        &self,
        relationship: &RelationshipId,
    ) -> Vec<QueuedDelivery> {
        let mut queue = self.queue.lock();
        let mut removed = Vec::new();
        queue.retain(|queued| {
            if queued.relationship == *relationship {
                removed.push(queued.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub(crate) fn attach_session(
        &self,
        frames: flume::Sender<Frame>,
        control: flume::Receiver<SubscriberMessage>,
    ) {
        let epoch = {
            let mut next = self.next_epoch.lock();
            *next += 1;
            *next
        };
        *self.session.lock() = Some(Session {
            epoch,
            frames,
            control,
        });
        self.notify.notify_one();
    }

    fn current_session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    fn session_epoch(&self) -> Option<u64> {
        self.session.lock().as_ref().map(|session| session.epoch)
    }

    /// Drop the session if it is still the given one.
    fn clear_session(&self, epoch: u64) {
        let mut session = self.session.lock();
        if session.as_ref().map(|s| s.epoch) == Some(epoch) {
            *session = None;
        }
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }

    fn drain_all(&self) -> Vec<QueuedDelivery> {
        self.queue.lock().drain(..).collect()
    }
}

fn report(
    reports: &flume::Sender<DeliveryReport>,
    mailbox: &Mailbox,
    queued: &QueuedDelivery,
    outcome: DeliveryOutcome,
) {
    let _ = reports.send(DeliveryReport {
        participant: mailbox.participant.clone(),
        relationship: queued.relationship,
        intent: queued.intent,
        outcome,
    });
}

/// The per-mailbox pump task. Runs until shutdown.
pub(crate) async fn pump(
    mailbox: Arc<Mailbox>,
    config: DeliveryConfig,
    reports: flume::Sender<DeliveryReport>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            for queued in mailbox.drain_all() {
                report(&reports, &mailbox, &queued, DeliveryOutcome::Cancelled);
            }
            return;
        }

        match mailbox.current_session() {
            Some(session) => {
                serve_session(&mailbox, session, &config, &reports, &mut shutdown).await;
            }
            None => {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = mailbox.notified() => {}
                }
            }
        }
    }
}

enum AckWait {
    Acked,
    SessionGone,
    Deadline,
}

/// Serve one session until it is replaced, dropped, or the hub shuts down.
async fn serve_session(
    mailbox: &Mailbox,
    session: Session,
    config: &DeliveryConfig,
    reports: &flume::Sender<DeliveryReport>,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) {
    let mut missed_heartbeats = 0u32;
    let start = tokio::time::Instant::now() + config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(start, config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            return;
        }
        if mailbox.session_epoch() != Some(session.epoch) {
            return;
        }

        let Some(mut item) = mailbox.pop() else {
            // idle: heartbeat, or wake on new work / pong / session loss
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = mailbox.notified() => {}
                message = session.control.recv_async() => match message {
                    Ok(SubscriberMessage::Pong) => missed_heartbeats = 0,
                    Ok(SubscriberMessage::Ack { .. }) => {}
                    Err(_) => {
                        mailbox.clear_session(session.epoch);
                        return;
                    }
                },
                _ = heartbeat.tick() => {
                    let sent = tokio::time::timeout(
                        config.ack_timeout,
                        session.frames.send_async(Frame::Heartbeat { at: Utc::now() }),
                    )
                    .await;
                    if !matches!(sent, Ok(Ok(()))) {
                        // receiver dropped, or so far behind the frame
                        // channel cannot even take a heartbeat
                        mailbox.clear_session(session.epoch);
                        return;
                    }
                    missed_heartbeats += 1;
                    if missed_heartbeats >= 2 {
                        tracing::debug!(
                            participant = %mailbox.participant,
                            "closing subscription after missed heartbeats"
                        );
                        mailbox.clear_session(session.epoch);
                        return;
                    }
                }
            }
            continue;
        };

        let sent = tokio::time::timeout(
            config.ack_timeout,
            session.frames.send_async(item.frame.clone()),
        )
        .await;
        if !matches!(sent, Ok(Ok(()))) {
            // session dropped or wedged mid-send; not charged as a timeout
            // attempt
            mailbox.requeue_front(item);
            mailbox.clear_session(session.epoch);
            return;
        }

        let deadline = tokio::time::sleep(config.ack_timeout);
        tokio::pin!(deadline);
        let wait = loop {
            tokio::select! {
                message = session.control.recv_async() => match message {
                    Ok(SubscriberMessage::Ack { delivery }) if delivery == item.delivery => {
                        break AckWait::Acked;
                    }
                    Ok(SubscriberMessage::Pong) => missed_heartbeats = 0,
                    Ok(SubscriberMessage::Ack { .. }) => {
                        // stale ack from a requeued frame
                    }
                    Err(_) => break AckWait::SessionGone,
                },
                _ = &mut deadline => break AckWait::Deadline,
            }
        };

        match wait {
            AckWait::Acked => {
                report(reports, mailbox, &item, DeliveryOutcome::Delivered);
            }
            AckWait::SessionGone => {
                mailbox.requeue_front(item);
                mailbox.clear_session(session.epoch);
                return;
            }
            AckWait::Deadline => {
                if item.attempts == 0 {
                    item.attempts = 1;
                    mailbox.requeue_front(item);
                } else {
                    tracing::debug!(
                        participant = %mailbox.participant,
                        intent = %item.intent,
                        "delivery unacknowledged after requeue"
                    );
                    report(reports, mailbox, &item, DeliveryOutcome::TimedOut);
                }
            }
        }
    }
}
