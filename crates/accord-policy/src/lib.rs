//! Accord Policy - declarative admission rules
//!
//! The registry holds one entry per `(intent type, trust level)` pair with a
//! closed, compile-time schema; extensions go through new fields here, not
//! through opaque map keys. Lookups are pure and lock-free: the registry is
//! immutable at runtime and replaced wholesale by a management reload.

pub mod risk;

pub use risk::{RiskInputs, RiskScore, RiskWeights};

use accord_types::{IntentType, TrustLevel};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How the appointment window is enforced for an intent type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentMode {
    /// No appointment requirement
    None,
    /// Allow a grace margin on both sides of the window; admissions in the
    /// margin are tagged `within_grace`
    GracePeriod,
    /// The window is enforced to the second; violations are breach attempts
    Strict,
}

/// Content rules applied by the admission pipeline's filter step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRules {
    /// Minimum context length in characters
    pub min_context_len: usize,
    /// Tokens that must not appear in the context
    pub forbidden_tokens: Vec<String>,
    /// Fields that must be present when the context is an object
    pub required_fields: Vec<String>,
}

impl ContentRules {
    /// Check an intent's context against these rules. Returns the reason for
    /// the first violated rule.
    pub fn check(&self, context: &serde_json::Value, context_len: usize) -> Result<(), String> {
        if context_len < self.min_context_len {
            return Err(format!(
                "context length {} below minimum {}",
                context_len, self.min_context_len
            ));
        }

        let rendered = match context {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        for token in &self.forbidden_tokens {
            if rendered.contains(token.as_str()) {
                return Err(format!("context contains forbidden token '{}'", token));
            }
        }

        for field in &self.required_fields {
            let present = context
                .as_object()
                .map(|map| map.contains_key(field.as_str()))
                .unwrap_or(false);
            if !present {
                return Err(format!("context missing required field '{}'", field));
            }
        }

        Ok(())
    }
}

/// One declarative admission rule, keyed by `(intent type, trust level)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEntry {
    /// Minimum relationship trust level for this intent type
    pub trust_floor: TrustLevel,
    /// Appointment window enforcement
    pub appointment: AppointmentMode,
    /// Whether the context snapshot must carry prior consent
    pub requires_consent: bool,
    /// Content filter rules
    pub content: ContentRules,
    /// Copy the admitted event to the oversight channel
    pub oversight_copy: bool,
    /// Mark events for legal hold retention
    pub legal_hold: bool,
    /// Emergency intents may bypass the appointment window
    pub emergency_override_allowed: bool,
    /// Reject outright when the relationship is closed (breach signal)
    pub forbidden_on_closed: bool,
    /// Require a fresh human binding at admission time
    pub requires_hid_rebinding: bool,
    /// Version recorded on admitted events
    pub version: String,
}

impl PolicyEntry {
    /// A permissive baseline for a given trust floor.
    pub fn baseline(trust_floor: TrustLevel) -> Self {
        Self {
            trust_floor,
            appointment: AppointmentMode::None,
            requires_consent: false,
            content: ContentRules::default(),
            oversight_copy: false,
            legal_hold: false,
            emergency_override_allowed: false,
            forbidden_on_closed: true,
            requires_hid_rebinding: false,
            version: "v1".to_string(),
        }
    }

    pub fn with_appointment(mut self, mode: AppointmentMode) -> Self {
        self.appointment = mode;
        self
    }

    pub fn with_consent_required(mut self) -> Self {
        self.requires_consent = true;
        self
    }

    pub fn with_content(mut self, content: ContentRules) -> Self {
        self.content = content;
        self
    }

    pub fn with_oversight_copy(mut self) -> Self {
        self.oversight_copy = true;
        self
    }

    pub fn with_emergency_override(mut self) -> Self {
        self.emergency_override_allowed = true;
        self
    }

    pub fn with_hid_rebinding(mut self) -> Self {
        self.requires_hid_rebinding = true;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

/// Outcome of a registry lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyLookup<'a> {
    /// The entry governing this admission
    Entry(&'a PolicyEntry),
    /// The intent type is not registered at any trust level; admission is
    /// denied conservatively
    UnknownType,
}

/// Conservative caps on declared intent constraints. Exceeding any of them
/// fires the `constraints_exceed_caps` risk signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstraintCaps {
    pub max_retries: u32,
    pub max_priority: u8,
    pub max_deadline_hours: i64,
}

impl Default for ConstraintCaps {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_priority: 7,
            max_deadline_hours: 24,
        }
    }
}

/// The policy registry: pure lookups keyed by `(intent_type, trust_level)`.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    entries: HashMap<(IntentType, u8), PolicyEntry>,
    /// Risk threshold per trust level 0-5; a score below the threshold for
    /// the relationship's level is rejected
    thresholds: [f64; 6],
    weights: RiskWeights,
    caps: ConstraintCaps,
}

impl PolicyRegistry {
    pub fn builder() -> PolicyRegistryBuilder {
        PolicyRegistryBuilder::default()
    }

    /// Look up the entry for an intent type at a trust level.
    ///
    /// On a miss at the exact level, falls back to the nearest lower level
    /// registered for the same type. A type registered at no level at all is
    /// `UnknownType` and admission is denied.
    pub fn lookup(&self, intent_type: &IntentType, trust_level: TrustLevel) -> PolicyLookup<'_> {
        let mut level = Some(trust_level);
        while let Some(current) = level {
            if let Some(entry) = self.entries.get(&(intent_type.clone(), current.value())) {
                return PolicyLookup::Entry(entry);
            }
            level = current.lower();
        }
        PolicyLookup::UnknownType
    }

    /// Whether any entry exists for this intent type.
    pub fn knows_type(&self, intent_type: &IntentType) -> bool {
        self.entries.keys().any(|(known, _)| known == intent_type)
    }

    /// The risk threshold for a trust level.
    pub fn risk_threshold(&self, trust_level: TrustLevel) -> f64 {
        self.thresholds[trust_level.value() as usize]
    }

    /// The risk weights in force. Documented here so scores are reproducible
    /// from the event log.
    pub fn risk_weights(&self) -> &RiskWeights {
        &self.weights
    }

    /// The conservative constraint caps in force.
    pub fn constraint_caps(&self) -> &ConstraintCaps {
        &self.caps
    }
}

/// Builder used at startup and by the management reload path.
#[derive(Debug, Default)]
pub struct PolicyRegistryBuilder {
    entries: HashMap<(IntentType, u8), PolicyEntry>,
    thresholds: Option<[f64; 6]>,
    weights: Option<RiskWeights>,
    caps: Option<ConstraintCaps>,
}

impl PolicyRegistryBuilder {
    /// Register an entry for an intent type at a specific trust level.
    pub fn entry(
        mut self,
        intent_type: impl Into<IntentType>,
        trust_level: TrustLevel,
        entry: PolicyEntry,
    ) -> Self {
        self.entries
            .insert((intent_type.into(), trust_level.value()), entry);
        self
    }

    /// Register the same entry for every trust level at or above its floor.
    pub fn entry_from_floor(mut self, intent_type: impl Into<IntentType>, entry: PolicyEntry) -> Self {
        let intent_type = intent_type.into();
        for level in entry.trust_floor.value()..=TrustLevel::MAX.value() {
            self.entries
                .insert((intent_type.clone(), level), entry.clone());
        }
        self
    }

    pub fn thresholds(mut self, thresholds: [f64; 6]) -> Self {
        self.thresholds = Some(thresholds);
        self
    }

    pub fn weights(mut self, weights: RiskWeights) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn caps(mut self, caps: ConstraintCaps) -> Self {
        self.caps = Some(caps);
        self
    }

    pub fn build(self) -> PolicyRegistry {
        PolicyRegistry {
            entries: self.entries,
            // Stricter thresholds at low trust: a fresh pair must look clean,
            // an established one tolerates more signals.
            thresholds: self.thresholds.unwrap_or([0.9, 0.7, 0.6, 0.5, 0.4, 0.3]),
            weights: self.weights.unwrap_or_default(),
            caps: self.caps.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn level(n: u8) -> TrustLevel {
        TrustLevel::new(n).unwrap()
    }

    fn registry() -> PolicyRegistry {
        PolicyRegistry::builder()
            .entry_from_floor("greet", PolicyEntry::baseline(level(0)))
            .entry("share", level(2), PolicyEntry::baseline(level(2)))
            .build()
    }

    #[test]
    fn test_exact_lookup() {
        let registry = registry();
        match registry.lookup(&IntentType::new("share"), level(2)) {
            PolicyLookup::Entry(entry) => assert_eq!(entry.trust_floor, level(2)),
            other => panic!("expected entry, got {:?}", other),
        }
    }

    #[test]
    fn test_nearest_lower_level_fallback() {
        let registry = registry();
        // "share" is only registered at level 2; level 4 falls back to it
        assert!(matches!(
            registry.lookup(&IntentType::new("share"), level(4)),
            PolicyLookup::Entry(_)
        ));
        // below the registered level there is nothing to fall back to
        assert_eq!(
            registry.lookup(&IntentType::new("share"), level(1)),
            PolicyLookup::UnknownType
        );
    }

    #[test]
    fn test_unregistered_type_denied() {
        let registry = registry();
        assert_eq!(
            registry.lookup(&IntentType::new("launch"), level(5)),
            PolicyLookup::UnknownType
        );
        assert!(!registry.knows_type(&IntentType::new("launch")));
        assert!(registry.knows_type(&IntentType::new("greet")));
    }

    #[test]
    fn test_thresholds_tighten_at_low_trust() {
        let registry = registry();
        assert!(registry.risk_threshold(level(0)) > registry.risk_threshold(level(5)));
    }

    #[test]
    fn test_content_rules_min_length() {
        let rules = ContentRules {
            min_context_len: 5,
            ..Default::default()
        };
        assert!(rules.check(&json!("hi"), 2).is_err());
        assert!(rules.check(&json!("hello there"), 11).is_ok());
    }

    #[test]
    fn test_content_rules_forbidden_tokens() {
        let rules = ContentRules {
            forbidden_tokens: vec!["rm -rf".to_string()],
            ..Default::default()
        };
        assert!(rules.check(&json!("please rm -rf /"), 15).is_err());
        assert!(rules.check(&json!("please tidy up"), 14).is_ok());
    }

    #[test]
    fn test_content_rules_required_fields() {
        let rules = ContentRules {
            required_fields: vec!["purpose".to_string()],
            ..Default::default()
        };
        assert!(rules.check(&json!({ "purpose": "demo" }), 19).is_ok());
        assert!(rules.check(&json!({ "other": 1 }), 11).is_err());
        // a plain string context cannot satisfy required fields
        assert!(rules.check(&json!("purpose: demo"), 13).is_err());
    }
}
