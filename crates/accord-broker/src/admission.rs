//! The admission pipeline's ordered checks
//!
//! Evaluation is pure: it reads the relationship record, its event log, and
//! the policy registry, and either clears the intent for admission or names
//! the first failing check. All state mutation happens afterwards, in the
//! broker, and only on the admit path. Each failure carries how it must be
//! recorded: a plain rejection event, a breach-attempt event, or a rejection
//! followed by an auto-close.

use crate::config::BrokerConfig;
use accord_policy::{PolicyLookup, PolicyRegistry, RiskInputs, RiskScore};
use accord_types::{
    consent_granted, AccordError, CloseReason, Event, EventKind, Intent, Relationship,
    TimeboxPolicy,
};
use chrono::{DateTime, Utc};

/// How a failed check is recorded on the relationship chain.
#[derive(Debug)]
pub(crate) enum CheckFailure {
    /// One `IntentRejected` event
    Reject(AccordError),
    /// One `BreachAttempt` event, a misuse signal surfaced to oversight
    Breach(AccordError),
    /// One `IntentRejected` event, then the relationship auto-closes
    RejectAndClose(AccordError, CloseReason),
}

impl CheckFailure {
    pub(crate) fn error(&self) -> &AccordError {
        match self {
            Self::Reject(error) | Self::Breach(error) | Self::RejectAndClose(error, _) => error,
        }
    }

    pub(crate) fn event_kind(&self) -> EventKind {
        match self {
            Self::Breach(_) => EventKind::BreachAttempt,
            _ => EventKind::IntentRejected,
        }
    }
}

/// Everything the checks read.
pub(crate) struct EvalInput<'a> {
    pub relationship: &'a Relationship,
    pub events: &'a [Event],
    pub policies: &'a PolicyRegistry,
    pub config: &'a BrokerConfig,
    /// Backpressure signal from the delivery hub
    pub responder_overloaded: bool,
    pub now: DateTime<Utc>,
}

/// A cleared admission, ready for the single mutating step.
#[derive(Debug)]
pub(crate) struct Admitted {
    /// Admission happened inside a grace margin rather than the strict window
    pub within_grace: bool,
    /// A top-priority intent used the policy's emergency override to bypass
    /// the appointment window
    pub emergency_override: bool,
    pub risk: RiskScore,
    pub policy_version: String,
    pub oversight_copy: bool,
    pub legal_hold: bool,
}

/// How the admission instant relates to the relationship's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowOutcome {
    OnTime,
    WithinGrace,
    EmergencyOverride,
}

/// Run checks 2 through 8 in order. Check 1 (existence and active state) is
/// the caller's lookup. The first failure terminates.
pub(crate) fn evaluate(input: &EvalInput<'_>, intent: &Intent) -> Result<Admitted, CheckFailure> {
    let relationship = input.relationship;

    // 2. Sender direction: only the initiator sends intents. The first
    //    loop-prevention barrier.
    if intent.sender != relationship.initiator {
        return Err(CheckFailure::Reject(AccordError::WrongDirection {
            sender: intent.sender.to_string(),
        }));
    }

    // 3. Trust-level floor, from the policy entry.
    let entry = match input
        .policies
        .lookup(&intent.intent_type, relationship.trust_level)
    {
        PolicyLookup::Entry(entry) => entry,
        PolicyLookup::UnknownType => {
            return Err(CheckFailure::Reject(AccordError::FilterRejected {
                reason: format!("intent type '{}' is not registered", intent.intent_type),
            }));
        }
    };
    if entry.trust_floor > relationship.trust_level {
        return Err(CheckFailure::Reject(AccordError::TrustLevelInsufficient {
            intent_type: intent.intent_type.to_string(),
            required: entry.trust_floor.value(),
            actual: relationship.trust_level.value(),
        }));
    }

    // 4. Timebox / appointment window.
    let window = check_window(input, intent, entry)?;

    // 5. Depth cap. Responses never count; only admitted intents do.
    if !relationship.has_depth_remaining() {
        return Err(CheckFailure::RejectAndClose(
            AccordError::DepthExceeded {
                relationship_id: relationship.id.to_string(),
                max_depth: relationship.max_depth,
            },
            CloseReason::MaxDepthReached,
        ));
    }

    // 6. Prior consent, looked up in the immutable context snapshot.
    if entry.requires_consent && !consent_granted(&relationship.context, intent.intent_type.as_str())
    {
        return Err(CheckFailure::Reject(AccordError::ConsentMissing {
            intent_type: intent.intent_type.to_string(),
        }));
    }

    // Policies may demand a fresh human binding on every message of this
    // type; the verifier has already checked any binding that was declared.
    if entry.requires_hid_rebinding && intent.human.is_none() {
        return Err(CheckFailure::Reject(AccordError::BindingMismatch {
            sender: intent.sender.to_string(),
        }));
    }

    // 7. Content filter.
    if let Err(reason) = entry.content.check(&intent.context, intent.context_len()) {
        return Err(CheckFailure::Reject(AccordError::FilterRejected { reason }));
    }

    // 8. Risk score against the trust level's threshold.
    let inputs = risk_inputs(input, intent);
    let risk = input.policies.risk_weights().compute(&inputs);
    let threshold = input.policies.risk_threshold(relationship.trust_level);
    if risk.score < threshold {
        return Err(CheckFailure::Reject(AccordError::RiskTooLow {
            score: risk.score,
            threshold,
            signal: risk.dominant_signal.clone(),
        }));
    }

    Ok(Admitted {
        within_grace: window == WindowOutcome::WithinGrace,
        emergency_override: window == WindowOutcome::EmergencyOverride,
        risk,
        policy_version: entry.version.clone(),
        oversight_copy: entry.oversight_copy,
        legal_hold: entry.legal_hold,
    })
}

/// Step 4: the relationship's timebox mode crossed with the policy's
/// appointment enforcement.
fn check_window(
    input: &EvalInput<'_>,
    intent: &Intent,
    entry: &accord_policy::PolicyEntry,
) -> Result<WindowOutcome, CheckFailure> {
    use accord_policy::AppointmentMode;

    let relationship = input.relationship;
    let now = input.now;
    let mode = entry.appointment;

    // the intent's own declared window binds regardless of mode
    if !intent.window.contains(now) {
        return Err(CheckFailure::Reject(AccordError::OutsideWindow {
            relationship_id: relationship.id.to_string(),
        }));
    }

    // a top-priority intent may bypass the appointment window when the
    // policy allows emergencies
    let emergency = entry.emergency_override_allowed && intent.constraints.priority == 9;

    match (&relationship.timebox, mode) {
        (TimeboxPolicy::ActivityBased { .. }, AppointmentMode::None) => {
            if relationship.is_expired_at(now) {
                return Err(CheckFailure::RejectAndClose(
                    AccordError::Expired {
                        relationship_id: relationship.id.to_string(),
                        expired_at: relationship.expires_at.to_rfc3339(),
                    },
                    CloseReason::Expired,
                ));
            }
            Ok(WindowOutcome::OnTime)
        }
        // the policy demands an appointment the relationship does not have
        (TimeboxPolicy::ActivityBased { .. }, _) => {
            Err(CheckFailure::Reject(AccordError::OutsideWindow {
                relationship_id: relationship.id.to_string(),
            }))
        }
        (TimeboxPolicy::AppointmentBased { start, end }, AppointmentMode::GracePeriod) => {
            if now >= *start && now <= *end {
                return Ok(WindowOutcome::OnTime);
            }
            let grace = input.config.grace_period;
            if now >= *start - grace && now <= *end + grace {
                // inside the margin lowers trust in the admitted event via
                // the within_grace tag
                return Ok(WindowOutcome::WithinGrace);
            }
            if emergency {
                return Ok(WindowOutcome::EmergencyOverride);
            }
            Err(CheckFailure::Reject(AccordError::OutsideWindow {
                relationship_id: relationship.id.to_string(),
            }))
        }
        (TimeboxPolicy::AppointmentBased { start, end }, _) => {
            // strict to the second; the window end itself is admissible
            if now >= *start && now <= *end {
                return Ok(WindowOutcome::OnTime);
            }
            if emergency {
                return Ok(WindowOutcome::EmergencyOverride);
            }
            let error = AccordError::OutsideWindow {
                relationship_id: relationship.id.to_string(),
            };
            Err(match mode {
                AppointmentMode::Strict => CheckFailure::Breach(error),
                _ => CheckFailure::Reject(error),
            })
        }
    }
}

/// Step 8's deterministic signals, every one recoverable from the event log
/// plus the relationship record.
fn risk_inputs(input: &EvalInput<'_>, intent: &Intent) -> RiskInputs {
    let config = input.config;
    let caps = input.policies.constraint_caps();
    let constraints = &intent.constraints;

    let rejection_cutoff = input.now - config.recent_rejection_window;
    let recent_rejections = input
        .events
        .iter()
        .filter(|event| {
            matches!(
                event.kind,
                EventKind::IntentRejected | EventKind::BreachAttempt
            ) && event.timestamp >= rejection_cutoff
        })
        .count() as u32;

    let deadline_cap = input.now + chrono::Duration::hours(caps.max_deadline_hours);
    let constraints_exceed_caps = constraints.max_retries > caps.max_retries
        || constraints.priority > caps.max_priority
        || constraints
            .deadline
            .map(|deadline| deadline > deadline_cap)
            .unwrap_or(false);

    RiskInputs {
        short_context: intent.context_len() < config.risk_min_context_len,
        recent_rejections,
        constraints_exceed_caps,
        within_probation: input.now - input.relationship.created_at < config.probation_window,
        responder_overloaded: input.responder_overloaded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_policy::{AppointmentMode, ContentRules, PolicyEntry, PolicyRegistry};
    use accord_types::{
        Constraints, IntentId, IntentType, ParticipantId, RelationshipBuilder, TimeWindow,
        TrustLevel,
    };
    use chrono::Duration;
    use serde_json::json;

    fn level(n: u8) -> TrustLevel {
        TrustLevel::new(n).unwrap()
    }

    fn registry() -> PolicyRegistry {
        PolicyRegistry::builder()
            .entry_from_floor("greet", PolicyEntry::baseline(level(0)))
            .entry_from_floor("share", PolicyEntry::baseline(level(3)))
            .entry_from_floor(
                "visit",
                PolicyEntry::baseline(level(0)).with_appointment(AppointmentMode::Strict),
            )
            .entry_from_floor(
                "confide",
                PolicyEntry::baseline(level(0)).with_consent_required(),
            )
            .build()
    }

    fn config() -> BrokerConfig {
        BrokerConfig {
            risk_min_context_len: 0,
            probation_window: Duration::zero(),
            ..Default::default()
        }
    }

    fn relationship(trust: u8) -> Relationship {
        let mut relationship = RelationshipBuilder::new(
            ParticipantId::new("p1"),
            ParticipantId::new("p2"),
            level(trust),
        )
        .build()
        .unwrap();
        // outside any probation window
        relationship.created_at = Utc::now() - Duration::hours(2);
        relationship
    }

    fn intent(relationship: &Relationship, intent_type: &str) -> Intent {
        Intent {
            relationship: relationship.id,
            id: IntentId::new(),
            intent_type: IntentType::new(intent_type),
            window: TimeWindow::immediate(),
            context: json!("a perfectly reasonable explanation"),
            constraints: Constraints::default(),
            sender: relationship.initiator.clone(),
            human: None,
            signature: String::new(),
        }
    }

    fn eval(
        relationship: &Relationship,
        events: &[Event],
        policies: &PolicyRegistry,
        config: &BrokerConfig,
        the_intent: &Intent,
    ) -> Result<Admitted, CheckFailure> {
        evaluate(
            &EvalInput {
                relationship,
                events,
                policies,
                config,
                responder_overloaded: false,
                now: Utc::now(),
            },
            the_intent,
        )
    }

    #[test]
    fn test_clean_intent_admitted() {
        let relationship = relationship(1);
        let policies = registry();
        let config = config();
        let result = eval(
            &relationship,
            &[],
            &policies,
            &config,
            &intent(&relationship, "greet"),
        );
        let admitted = result.expect("should admit");
        assert!(!admitted.within_grace);
        assert_eq!(admitted.risk.score, 1.0);
    }

    #[test]
    fn test_wrong_direction_rejected_first() {
        let relationship = relationship(1);
        let policies = registry();
        let config = config();
        let mut bad = intent(&relationship, "greet");
        bad.sender = relationship.responder.clone();

        let failure = eval(&relationship, &[], &policies, &config, &bad).unwrap_err();
        assert!(matches!(
            failure,
            CheckFailure::Reject(AccordError::WrongDirection { .. })
        ));
    }

    #[test]
    fn test_trust_floor_enforced() {
        let relationship = relationship(1);
        let policies = registry();
        let config = config();
        let failure = eval(
            &relationship,
            &[],
            &policies,
            &config,
            &intent(&relationship, "share"),
        )
        .unwrap_err();
        // floor 3 against trust 1; unreachable at this level, so the lookup
        // itself comes back empty
        assert!(matches!(
            failure,
            CheckFailure::Reject(
                AccordError::FilterRejected { .. } | AccordError::TrustLevelInsufficient { .. }
            )
        ));
    }

    #[test]
    fn test_unregistered_type_rejected() {
        let relationship = relationship(5);
        let policies = registry();
        let config = config();
        let failure = eval(
            &relationship,
            &[],
            &policies,
            &config,
            &intent(&relationship, "launch_missiles"),
        )
        .unwrap_err();
        assert!(matches!(
            failure,
            CheckFailure::Reject(AccordError::FilterRejected { .. })
        ));
    }

    #[test]
    fn test_expired_activity_timebox_closes() {
        let mut relationship = relationship(1);
        relationship.expires_at = Utc::now() - Duration::hours(1);
        let policies = registry();
        let config = config();

        let failure = eval(
            &relationship,
            &[],
            &policies,
            &config,
            &intent(&relationship, "greet"),
        )
        .unwrap_err();
        assert!(matches!(
            failure,
            CheckFailure::RejectAndClose(AccordError::Expired { .. }, CloseReason::Expired)
        ));
    }

    #[test]
    fn test_strict_window_inclusive_end() {
        let now = Utc::now();
        let mut relationship = relationship(1);
        relationship.timebox = TimeboxPolicy::AppointmentBased {
            start: now - Duration::minutes(15),
            end: now + Duration::seconds(2),
        };
        relationship.expires_at = now + Duration::seconds(2);
        let policies = registry();
        let config = config();

        // inside the window
        assert!(eval(
            &relationship,
            &[],
            &policies,
            &config,
            &intent(&relationship, "visit"),
        )
        .is_ok());

        // past the end it is a breach attempt
        relationship.timebox = TimeboxPolicy::AppointmentBased {
            start: now - Duration::minutes(30),
            end: now - Duration::seconds(1),
        };
        let failure = eval(
            &relationship,
            &[],
            &policies,
            &config,
            &intent(&relationship, "visit"),
        )
        .unwrap_err();
        assert!(matches!(
            failure,
            CheckFailure::Breach(AccordError::OutsideWindow { .. })
        ));
    }

    #[test]
    fn test_grace_window_tags_admission() {
        let now = Utc::now();
        let policies = PolicyRegistry::builder()
            .entry_from_floor(
                "visit",
                PolicyEntry::baseline(level(0)).with_appointment(AppointmentMode::GracePeriod),
            )
            .build();
        let config = config();

        let mut relationship = relationship(1);
        // window ended a minute ago; default grace is five minutes
        relationship.timebox = TimeboxPolicy::AppointmentBased {
            start: now - Duration::minutes(20),
            end: now - Duration::minutes(1),
        };

        let admitted = eval(
            &relationship,
            &[],
            &policies,
            &config,
            &intent(&relationship, "visit"),
        )
        .expect("grace admits");
        assert!(admitted.within_grace);

        // beyond the grace margin it is a plain rejection
        relationship.timebox = TimeboxPolicy::AppointmentBased {
            start: now - Duration::minutes(40),
            end: now - Duration::minutes(10),
        };
        let failure = eval(
            &relationship,
            &[],
            &policies,
            &config,
            &intent(&relationship, "visit"),
        )
        .unwrap_err();
        assert!(matches!(
            failure,
            CheckFailure::Reject(AccordError::OutsideWindow { .. })
        ));
    }

    #[test]
    fn test_depth_cap_closes() {
        let mut relationship = relationship(1);
        relationship.max_depth = 2;
        relationship.depth = 2;
        let policies = registry();
        let config = config();

        let failure = eval(
            &relationship,
            &[],
            &policies,
            &config,
            &intent(&relationship, "greet"),
        )
        .unwrap_err();
        assert!(matches!(
            failure,
            CheckFailure::RejectAndClose(
                AccordError::DepthExceeded { .. },
                CloseReason::MaxDepthReached
            )
        ));
    }

    #[test]
    fn test_consent_required() {
        let relationship = relationship(1);
        let policies = registry();
        let config = config();

        let failure = eval(
            &relationship,
            &[],
            &policies,
            &config,
            &intent(&relationship, "confide"),
        )
        .unwrap_err();
        assert!(matches!(
            failure,
            CheckFailure::Reject(AccordError::ConsentMissing { .. })
        ));

        // with consent in the snapshot the same intent clears
        let mut consented = relationship.clone();
        consented.context.insert(
            accord_types::CONSENT_KEY.to_string(),
            json!({ "confide": true }),
        );
        assert!(eval(
            &consented,
            &[],
            &policies,
            &config,
            &intent(&consented, "confide"),
        )
        .is_ok());
    }

    #[test]
    fn test_content_filter() {
        let policies = PolicyRegistry::builder()
            .entry_from_floor(
                "greet",
                PolicyEntry::baseline(level(0)).with_content(ContentRules {
                    min_context_len: 10,
                    forbidden_tokens: vec!["shutdown".to_string()],
                    required_fields: vec![],
                }),
            )
            .build();
        let config = config();
        let relationship = relationship(1);

        let mut short = intent(&relationship, "greet");
        short.context = json!("hi");
        let failure = eval(&relationship, &[], &policies, &config, &short).unwrap_err();
        assert!(matches!(
            failure,
            CheckFailure::Reject(AccordError::FilterRejected { .. })
        ));

        let mut forbidden = intent(&relationship, "greet");
        forbidden.context = json!("please shutdown the reactor");
        assert!(eval(&relationship, &[], &policies, &config, &forbidden).is_err());
    }

    #[test]
    fn test_emergency_override_bypasses_strict_window() {
        let now = Utc::now();
        let policies = PolicyRegistry::builder()
            .entry_from_floor(
                "evacuate",
                PolicyEntry::baseline(level(0))
                    .with_appointment(AppointmentMode::Strict)
                    .with_emergency_override(),
            )
            .build();
        let config = config();

        // high trust so the priority-9 constraint signal alone cannot sink
        // the risk score
        let mut relationship = relationship(5);
        relationship.timebox = TimeboxPolicy::AppointmentBased {
            start: now - Duration::minutes(30),
            end: now - Duration::minutes(10),
        };

        // ordinary priority: a breach, as usual
        let routine = intent(&relationship, "evacuate");
        assert!(matches!(
            eval(&relationship, &[], &policies, &config, &routine),
            Err(CheckFailure::Breach(_))
        ));

        // top priority uses the override and is tagged as such
        let mut urgent = intent(&relationship, "evacuate");
        urgent.constraints.priority = 9;
        let admitted = eval(&relationship, &[], &policies, &config, &urgent)
            .expect("override admits");
        assert!(admitted.emergency_override);
        assert!(!admitted.within_grace);
    }

    #[test]
    fn test_hid_rebinding_requires_declared_human() {
        let policies = PolicyRegistry::builder()
            .entry_from_floor(
                "sign_contract",
                PolicyEntry::baseline(level(0)).with_hid_rebinding(),
            )
            .build();
        let config = config();
        let relationship = relationship(1);

        let anonymous = intent(&relationship, "sign_contract");
        assert!(matches!(
            eval(&relationship, &[], &policies, &config, &anonymous),
            Err(CheckFailure::Reject(AccordError::BindingMismatch { .. }))
        ));

        let mut bound = intent(&relationship, "sign_contract");
        bound.human = Some(accord_types::HumanId::new("alice"));
        assert!(eval(&relationship, &[], &policies, &config, &bound).is_ok());
    }

    #[test]
    fn test_backpressure_rejects_at_risk_step() {
        let relationship = relationship(5);
        let policies = registry();
        let config = config();

        let failure = evaluate(
            &EvalInput {
                relationship: &relationship,
                events: &[],
                policies: &policies,
                config: &config,
                responder_overloaded: true,
                now: Utc::now(),
            },
            &intent(&relationship, "greet"),
        )
        .unwrap_err();
        match failure {
            CheckFailure::Reject(AccordError::RiskTooLow { signal, .. }) => {
                assert_eq!(signal, "responder_overloaded");
            }
            other => panic!("unexpected failure {:?}", other),
        }
    }

    #[test]
    fn test_recent_rejections_raise_risk() {
        let relationship = relationship(0);
        let policies = registry();
        let config = config();

        // trust 0 threshold is 0.9; two recent rejections deduct 0.3
        let events: Vec<Event> = (0..2)
            .map(|sequence| Event {
                sequence,
                kind: EventKind::IntentRejected,
                timestamp: Utc::now() - Duration::minutes(5),
                payload: json!({}),
                previous_hash: accord_types::ChainHash::genesis(),
                hash: accord_types::ChainHash::genesis(),
            })
            .collect();

        let failure = eval(
            &relationship,
            &events,
            &policies,
            &config,
            &intent(&relationship, "greet"),
        )
        .unwrap_err();
        assert!(matches!(
            failure,
            CheckFailure::Reject(AccordError::RiskTooLow { .. })
        ));
    }
}
