//! The broker facade
//!
//! Wires the verifier, store, policy registry, chain key, and delivery hub
//! into the transport-agnostic request/reply surface. One call per verb;
//! every mutation is durable before the reply returns.

use crate::admission::{self, CheckFailure, EvalInput};
use crate::api::{
    CloseSummary, EstablishProposal, EstablishReceipt, IntentReceipt, RespondReceipt, TrustPolicy,
};
use crate::config::BrokerConfig;
use crate::lifecycle::{self, append_sealed, map_store_error};
use accord_delivery::{DeliveryHub, DeliveryOutcome, DeliveryReport, SubscriptionStream};
use accord_identity::{AuthFailure, IdentityVerifier};
use accord_policy::PolicyRegistry;
use accord_store::{RecordUpdate, RelationshipStore};
use accord_types::{
    canonical, AccordError, ChainHash, CloseReason, ContextSnapshot, Event, EventKind, Intent,
    ParticipantId, Relationship, RelationshipBuilder, RelationshipId, Response, Result,
    TimeboxPolicy, OPEN_ITEMS_KEY,
};
use chrono::Utc;
use std::sync::Arc;

pub struct Broker {
    verifier: Arc<dyn IdentityVerifier>,
    store: Arc<dyn RelationshipStore>,
    policies: Arc<PolicyRegistry>,
    trust: Arc<dyn TrustPolicy>,
    hub: Arc<DeliveryHub>,
    config: BrokerConfig,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl Broker {
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        store: Arc<dyn RelationshipStore>,
        policies: Arc<PolicyRegistry>,
        trust: Arc<dyn TrustPolicy>,
        config: BrokerConfig,
    ) -> Self {
        let hub = Arc::new(DeliveryHub::new(config.delivery()));
        let (shutdown, _) = tokio::sync::watch::channel(false);
        Self {
            verifier,
            store,
            policies,
            trust,
            hub,
            config,
            shutdown,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Stop the sweeper, the delivery pumps, and the report finalizer.
    pub fn shutdown(&self) {
        self.hub.shutdown();
        let _ = self.shutdown.send(true);
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe_as_responder(&self, participant: &ParticipantId) -> SubscriptionStream {
        self.hub.subscribe_as_responder(participant)
    }

    pub fn subscribe_as_initiator(&self, participant: &ParticipantId) -> SubscriptionStream {
        self.hub.subscribe_as_initiator(participant)
    }

    // ========================================================================
    // establish / continue_from
    // ========================================================================

    /// Verify an establishment proposal's signature, human binding included.
    async fn verify_proposal(&self, proposal: &EstablishProposal) -> Result<()> {
        let message = canonical::to_bytes(&proposal.signing_body());
        self.verifier
            .verify(
                &message,
                &proposal.initiator.device,
                proposal.initiator.human.as_ref(),
                &proposal.signature,
            )
            .await
            .map_err(map_auth_failure)
    }

    /// Create a new relationship from a signed proposal.
    #[tracing::instrument(skip_all, fields(initiator = %proposal.initiator.device, responder = %proposal.responder))]
    pub async fn establish(&self, proposal: EstablishProposal) -> Result<EstablishReceipt> {
        self.verify_proposal(&proposal).await?;
        self.create_relationship(proposal, None, ContextSnapshot::new())
            .await
    }

    /// Create a successor relationship referring back to a closed one.
    #[tracing::instrument(skip_all, fields(predecessor = %predecessor))]
    pub async fn continue_from(
        &self,
        predecessor: RelationshipId,
        proposal: EstablishProposal,
    ) -> Result<EstablishReceipt> {
        self.verify_proposal(&proposal).await?;

        let prior = self
            .store
            .get(&predecessor)
            .await
            .map_err(|e| map_store_error(e, &predecessor))?;
        if prior.is_active() {
            return Err(AccordError::PredecessorActive {
                predecessor_id: predecessor.to_string(),
            });
        }
        if prior.initiator != proposal.initiator.device || prior.responder != proposal.responder {
            return Err(AccordError::ParticipantMismatch {
                predecessor_id: predecessor.to_string(),
            });
        }

        // only the open items survive the predecessor's context
        let mut inherited = ContextSnapshot::new();
        if let Some(open_items) = prior.context.get(OPEN_ITEMS_KEY) {
            inherited.insert(OPEN_ITEMS_KEY.to_string(), open_items.clone());
        }

        let receipt = self
            .create_relationship(proposal, Some(predecessor), inherited)
            .await?;

        append_sealed(
            self.store.as_ref(),
            &self.config.chain_key,
            &receipt.relationship,
            EventKind::RelationshipContinued,
            serde_json::json!({ "predecessor": predecessor.to_string() }),
            RecordUpdate::none(),
            Utc::now(),
        )
        .await?;

        Ok(receipt)
    }

    async fn create_relationship(
        &self,
        proposal: EstablishProposal,
        continuation_of: Option<RelationshipId>,
        inherited: ContextSnapshot,
    ) -> Result<EstablishReceipt> {
        let initiator = proposal.initiator.device.clone();
        let trust_level = self
            .trust
            .assess(&initiator, &proposal.responder)
            .ok_or_else(|| {
                AccordError::unauthorized("admission policy denies this participant pair")
            })?;

        let mut context = proposal.context;
        for (key, value) in inherited {
            context.insert(key, value);
        }

        let mut builder = RelationshipBuilder::new(
            initiator,
            proposal.responder.clone(),
            trust_level,
        )
        .with_max_depth(proposal.max_depth.unwrap_or(self.config.default_max_depth))
        .with_timebox(proposal.timebox.unwrap_or(TimeboxPolicy::ActivityBased {
            idle_hours: self.config.default_timebox_hours,
        }))
        .with_context(context);
        if let Some(predecessor) = continuation_of {
            builder = builder.with_continuation_of(predecessor);
        }
        let relationship = builder.build()?;
        let id = relationship.id;

        let established = serde_json::json!({
            "initiator": relationship.initiator.as_str(),
            "responder": relationship.responder.as_str(),
            "trust_level": relationship.trust_level.value(),
            "max_depth": relationship.max_depth,
            "timebox": &relationship.timebox,
            "continuation_of": relationship.continuation_of.map(|p| p.to_string()),
            "context": &relationship.context,
        });

        self.store
            .create(relationship)
            .await
            .map_err(|e| map_store_error(e, &id))?;

        append_sealed(
            self.store.as_ref(),
            &self.config.chain_key,
            &id,
            EventKind::RelationshipEstablished,
            established,
            RecordUpdate::none(),
            Utc::now(),
        )
        .await?;

        tracing::info!(relationship = %id, trust = %trust_level, "relationship established");
        Ok(EstablishReceipt {
            relationship: id,
            trust_level,
        })
    }

    // ========================================================================
    // send_intent: the admission pipeline
    // ========================================================================

    /// Submit an intent on an existing relationship. Runs the full admission
    /// pipeline exactly once under the configured deadline.
    #[tracing::instrument(skip_all, fields(relationship = %intent.relationship, intent_type = %intent.intent_type))]
    pub async fn send_intent(&self, intent: Intent) -> Result<IntentReceipt> {
        let deadline = self.config.admission_deadline;
        match tokio::time::timeout(deadline, self.admit(&intent)).await {
            Ok(result) => result,
            Err(_) => {
                let error = AccordError::Timeout {
                    deadline_ms: deadline.as_millis() as u64,
                };
                // best-effort rejection event; the admission itself was cut off
                self.record_rejection(&intent, &error, EventKind::IntentRejected)
                    .await;
                Err(error)
            }
        }
    }

    async fn admit(&self, intent: &Intent) -> Result<IntentReceipt> {
        let message = canonical::to_bytes(&intent.signing_body());
        self.verifier
            .verify(
                &message,
                &intent.sender,
                intent.human.as_ref(),
                &intent.signature,
            )
            .await
            .map_err(map_auth_failure)?;

        let relationship_id = intent.relationship;
        let relationship = self
            .store
            .get(&relationship_id)
            .await
            .map_err(|e| map_store_error(e, &relationship_id))?;

        // 1. Closed relationships admit nothing; the chain is terminal, so
        //    the misuse signal goes to the oversight log rather than the chain.
        if !relationship.is_active() {
            let flagged = match self
                .policies
                .lookup(&intent.intent_type, relationship.trust_level)
            {
                accord_policy::PolicyLookup::Entry(entry) => entry.forbidden_on_closed,
                accord_policy::PolicyLookup::UnknownType => true,
            };
            if flagged {
                tracing::warn!(
                    relationship = %relationship_id,
                    sender = %intent.sender,
                    intent_type = %intent.intent_type,
                    "breach attempt on closed relationship"
                );
            }
            return Err(AccordError::ClosedRelationship {
                relationship_id: relationship_id.to_string(),
            });
        }

        let events = self
            .store
            .list_events(&relationship_id, 0)
            .await
            .map_err(|e| map_store_error(e, &relationship_id))?;
        let now = Utc::now();

        let outcome = admission::evaluate(
            &EvalInput {
                relationship: &relationship,
                events: &events,
                policies: self.policies.as_ref(),
                config: &self.config,
                responder_overloaded: self.hub.responder_overloaded(&relationship.responder),
                now,
            },
            intent,
        );

        let admitted = match outcome {
            Ok(admitted) => admitted,
            Err(failure) => return Err(self.record_failure(intent, failure).await),
        };

        // 9. Admit: the single state-mutating step.
        let payload = serde_json::json!({
            "intent": intent.id.to_string(),
            "intent_type": intent.intent_type.as_str(),
            "sender": intent.sender.as_str(),
            "digest": accord_crypto::digest_canonical(&intent.signing_body()),
            "risk_score": admitted.risk.score,
            "policy_version": admitted.policy_version,
            "within_grace": admitted.within_grace,
            "emergency_override": admitted.emergency_override,
            "legal_hold": admitted.legal_hold,
        });
        let new_expires_at = match relationship.timebox {
            TimeboxPolicy::ActivityBased { .. } => Some(relationship.timebox.expires_after(now)),
            TimeboxPolicy::AppointmentBased { .. } => None,
        };
        let (sequence, _) = append_sealed(
            self.store.as_ref(),
            &self.config.chain_key,
            &relationship_id,
            EventKind::IntentAdmitted,
            payload,
            RecordUpdate::admission(now, new_expires_at),
            now,
        )
        .await?;

        if let Err(error) = self.hub.push_intent(
            &relationship.responder,
            relationship_id,
            sequence,
            intent.clone(),
        ) {
            // the risk step saw a free slot; the race loses the delivery, not
            // the admission
            tracing::warn!(%error, relationship = %relationship_id, "admitted intent not queued");
        }

        if admitted.oversight_copy {
            tracing::info!(
                relationship = %relationship_id,
                intent = %intent.id,
                sequence,
                "oversight copy of admitted intent"
            );
        }

        Ok(IntentReceipt {
            sequence,
            admitted: true,
            risk_score: admitted.risk.score,
        })
    }

    /// Record a pipeline failure on the chain and, where required, auto-close.
    async fn record_failure(&self, intent: &Intent, failure: CheckFailure) -> AccordError {
        let kind = failure.event_kind();
        let error = failure.error().clone();
        self.record_rejection(intent, &error, kind).await;

        if kind == EventKind::BreachAttempt {
            tracing::warn!(
                relationship = %intent.relationship,
                sender = %intent.sender,
                code = error.error_code(),
                "breach attempt"
            );
        }

        if let CheckFailure::RejectAndClose(_, reason) = failure {
            if let Err(close_error) = lifecycle::close(
                self.store.as_ref(),
                &self.config.chain_key,
                &self.hub,
                &intent.relationship,
                reason,
                Utc::now(),
            )
            .await
            {
                tracing::warn!(%close_error, relationship = %intent.relationship, "auto-close failed");
            }
        }

        error
    }

    /// Append the rejection (or breach) event for a failed admission.
    /// Best-effort: failures here are logged, never surfaced over the
    /// original rejection.
    async fn record_rejection(&self, intent: &Intent, error: &AccordError, kind: EventKind) {
        let payload = serde_json::json!({
            "intent": intent.id.to_string(),
            "intent_type": intent.intent_type.as_str(),
            "sender": intent.sender.as_str(),
            "error": error.error_code(),
            "detail": error.to_string(),
        });
        if let Err(append_error) = append_sealed(
            self.store.as_ref(),
            &self.config.chain_key,
            &intent.relationship,
            kind,
            payload,
            RecordUpdate::none(),
            Utc::now(),
        )
        .await
        {
            tracing::warn!(
                %append_error,
                relationship = %intent.relationship,
                "could not record rejection event"
            );
        }
    }

    // ========================================================================
    // respond
    // ========================================================================

    /// Record a responder's reply to an admitted intent and push it to the
    /// initiator's subscription.
    #[tracing::instrument(skip_all, fields(relationship = %response.relationship, intent = %response.intent))]
    pub async fn respond(&self, response: Response) -> Result<RespondReceipt> {
        let message = canonical::to_bytes(&response.signing_body());
        self.verifier
            .verify(&message, &response.sender, None, &response.signature)
            .await
            .map_err(map_auth_failure)?;

        let relationship_id = response.relationship;
        let relationship = self
            .store
            .get(&relationship_id)
            .await
            .map_err(|e| map_store_error(e, &relationship_id))?;
        if !relationship.is_active() {
            return Err(AccordError::ClosedRelationship {
                relationship_id: relationship_id.to_string(),
            });
        }

        // responders answer on this channel; initiators use send_intent
        if response.sender != relationship.responder {
            return Err(AccordError::WrongDirection {
                sender: response.sender.to_string(),
            });
        }

        let events = self
            .store
            .list_events(&relationship_id, 0)
            .await
            .map_err(|e| map_store_error(e, &relationship_id))?;
        let intent_key = response.intent.to_string();
        let admitted = events.iter().any(|event| {
            event.kind == EventKind::IntentAdmitted && event.payload["intent"] == intent_key
        });
        if !admitted {
            return Err(AccordError::NotAdmitted {
                intent_id: intent_key,
            });
        }
        let finalized = events.iter().any(|event| {
            event.kind == EventKind::ResponseRecorded
                && event.payload["intent"] == intent_key
                && event.payload["final"] == serde_json::Value::Bool(true)
        });
        if finalized {
            return Err(AccordError::AlreadyFinalized {
                intent_id: intent_key,
            });
        }

        let now = Utc::now();
        let payload = serde_json::json!({
            "intent": intent_key,
            "outcome": &response.outcome,
            "data_digest": accord_crypto::digest_canonical(&response.data),
            "final": response.outcome.is_final(),
            "sender": response.sender.as_str(),
            "system": false,
        });
        // responses touch the activity clock but, by default, never extend
        // the timebox
        let update = RecordUpdate {
            touch_activity: Some(now),
            increment_depth: false,
            new_expires_at: if self.config.extend_timebox_on_response
                && matches!(relationship.timebox, TimeboxPolicy::ActivityBased { .. })
            {
                Some(relationship.timebox.expires_after(now))
            } else {
                None
            },
        };
        let (sequence, _) = append_sealed(
            self.store.as_ref(),
            &self.config.chain_key,
            &relationship_id,
            EventKind::ResponseRecorded,
            payload,
            update,
            now,
        )
        .await?;

        if let Err(error) = self.hub.push_response(
            &relationship.initiator,
            relationship_id,
            sequence,
            response.clone(),
        ) {
            tracing::warn!(%error, relationship = %relationship_id, "response not queued");
        }

        Ok(RespondReceipt { sequence })
    }

    // ========================================================================
    // close / reads / verification
    // ========================================================================

    /// Explicit close with a reason.
    #[tracing::instrument(skip_all, fields(relationship = %relationship_id))]
    pub async fn close(
        &self,
        relationship_id: RelationshipId,
        reason: CloseReason,
    ) -> Result<CloseSummary> {
        lifecycle::close(
            self.store.as_ref(),
            &self.config.chain_key,
            &self.hub,
            &relationship_id,
            reason,
            Utc::now(),
        )
        .await
    }

    /// Read a relationship record. The requester must be a party to it.
    pub async fn get_relationship(
        &self,
        relationship_id: RelationshipId,
        requester: &ParticipantId,
    ) -> Result<Relationship> {
        let relationship = self
            .store
            .get(&relationship_id)
            .await
            .map_err(|e| map_store_error(e, &relationship_id))?;
        self.authorize_party(&relationship, requester)?;
        Ok(relationship)
    }

    /// Read a relationship's events in sequence order.
    pub async fn get_events(
        &self,
        relationship_id: RelationshipId,
        requester: &ParticipantId,
        from_sequence: u64,
    ) -> Result<Vec<Event>> {
        let relationship = self
            .store
            .get(&relationship_id)
            .await
            .map_err(|e| map_store_error(e, &relationship_id))?;
        self.authorize_party(&relationship, requester)?;
        self.store
            .list_events(&relationship_id, from_sequence)
            .await
            .map_err(|e| map_store_error(e, &relationship_id))
    }

    fn authorize_party(
        &self,
        relationship: &Relationship,
        requester: &ParticipantId,
    ) -> Result<()> {
        if requester != &relationship.initiator && requester != &relationship.responder {
            return Err(AccordError::unauthorized(
                "requester is not a party to this relationship",
            ));
        }
        Ok(())
    }

    /// Replay a relationship's chain and return the head it reconstructs;
    /// fails if any event was tampered with.
    pub async fn verify_chain(&self, relationship_id: RelationshipId) -> Result<ChainHash> {
        let events = self
            .store
            .list_events(&relationship_id, 0)
            .await
            .map_err(|e| map_store_error(e, &relationship_id))?;
        accord_chain::replay_head(&self.config.chain_key, &events).map_err(|error| {
            tracing::error!(%error, relationship = %relationship_id, "chain verification failed");
            AccordError::internal()
        })
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    /// Run one expiry sweep immediately. Returns how many relationships were
    /// closed.
    pub async fn sweep_once(&self) -> usize {
        lifecycle::sweep_expired(
            self.store.as_ref(),
            &self.config.chain_key,
            &self.hub,
            Utc::now(),
        )
        .await
    }

    /// Spawn the periodic expiry sweep.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        let mut shutdown = broker.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broker.config.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let closed = broker.sweep_once().await;
                        if closed > 0 {
                            tracing::info!(closed, "expiry sweep closed relationships");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Spawn the task that finalizes timed-out deliveries on the chain.
    pub fn spawn_delivery_finalizer(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let broker = Arc::clone(self);
        let reports = broker.hub.reports();
        tokio::spawn(async move {
            while let Ok(report) = reports.recv_async().await {
                if report.outcome == DeliveryOutcome::TimedOut {
                    broker.finalize_delivery_timeout(&report).await;
                }
            }
        })
    }

    async fn finalize_delivery_timeout(&self, report: &DeliveryReport) {
        let payload = serde_json::json!({
            "intent": report.intent.to_string(),
            "outcome": { "outcome": "rejected", "reason": "delivery_timeout" },
            "final": true,
            "system": true,
        });
        if let Err(error) = append_sealed(
            self.store.as_ref(),
            &self.config.chain_key,
            &report.relationship,
            EventKind::ResponseRecorded,
            payload,
            RecordUpdate::none(),
            Utc::now(),
        )
        .await
        {
            tracing::warn!(
                %error,
                relationship = %report.relationship,
                intent = %report.intent,
                "could not finalize timed-out delivery"
            );
        }
    }
}

fn map_auth_failure(failure: AuthFailure) -> AccordError {
    match failure {
        AuthFailure::UnknownSender(sender) => AccordError::UnknownSender {
            sender: sender.to_string(),
        },
        AuthFailure::BadSignature(sender) => AccordError::BadSignature {
            sender: sender.to_string(),
        },
        AuthFailure::BindingMismatch(sender) => AccordError::BindingMismatch {
            sender: sender.to_string(),
        },
        AuthFailure::ExpiredKey(sender) => AccordError::ExpiredKey {
            sender: sender.to_string(),
        },
    }
}
