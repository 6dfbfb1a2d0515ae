//! Deterministic risk scoring
//!
//! The admission pipeline's final gate computes a score in [0.0, 1.0] from a
//! small set of boolean/count signals, every one of which is recoverable from
//! the event log plus the relationship record. The score starts at 1.0 and
//! each firing signal subtracts its weight; the result is clamped to [0, 1]
//! and compared against the trust level's threshold.

use serde::{Deserialize, Serialize};

/// The deterministic signals feeding the risk score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskInputs {
    /// Explanatory context shorter than the configured minimum
    pub short_context: bool,
    /// Count of rejection events within the recent-rejection window
    pub recent_rejections: u32,
    /// Declared constraints exceed the conservative caps
    pub constraints_exceed_caps: bool,
    /// Relationship is still inside its first-contact probation window
    pub within_probation: bool,
    /// The responder's pending queue is full (backpressure)
    pub responder_overloaded: bool,
}

/// Per-signal weights. Defaults are chosen so that a single soft signal
/// (short context, probation) passes at mid trust, while backpressure alone
/// sinks the score to zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskWeights {
    pub short_context: f64,
    pub per_recent_rejection: f64,
    /// Subtracted at most this much for recent rejections, however many
    pub recent_rejections_cap: f64,
    pub constraints_exceed_caps: f64,
    pub within_probation: f64,
    pub responder_overloaded: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            short_context: 0.25,
            per_recent_rejection: 0.15,
            recent_rejections_cap: 0.45,
            constraints_exceed_caps: 0.3,
            within_probation: 0.2,
            responder_overloaded: 1.0,
        }
    }
}

/// A computed score plus the signal that cost the most.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    /// Final score in [0.0, 1.0]; higher is safer
    pub score: f64,
    /// Name of the dominant signal, or "none" when nothing fired
    pub dominant_signal: String,
}

impl RiskWeights {
    /// Compute the score for a set of inputs.
    pub fn compute(&self, inputs: &RiskInputs) -> RiskScore {
        let mut deductions: Vec<(&'static str, f64)> = Vec::new();

        if inputs.short_context {
            deductions.push(("short_context", self.short_context));
        }
        if inputs.recent_rejections > 0 {
            let amount = (self.per_recent_rejection * inputs.recent_rejections as f64)
                .min(self.recent_rejections_cap);
            deductions.push(("recent_rejections", amount));
        }
        if inputs.constraints_exceed_caps {
            deductions.push(("constraints_exceed_caps", self.constraints_exceed_caps));
        }
        if inputs.within_probation {
            deductions.push(("first_contact_probation", self.within_probation));
        }
        if inputs.responder_overloaded {
            deductions.push(("responder_overloaded", self.responder_overloaded));
        }

        let total: f64 = deductions.iter().map(|(_, amount)| amount).sum();
        let score = (1.0 - total).clamp(0.0, 1.0);

        let dominant_signal = deductions
            .iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(name, _)| (*name).to_string())
            .unwrap_or_else(|| "none".to_string());

        RiskScore {
            score,
            dominant_signal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_inputs_score_one() {
        let score = RiskWeights::default().compute(&RiskInputs::default());
        assert_eq!(score.score, 1.0);
        assert_eq!(score.dominant_signal, "none");
    }

    #[test]
    fn test_backpressure_sinks_score() {
        let score = RiskWeights::default().compute(&RiskInputs {
            responder_overloaded: true,
            ..Default::default()
        });
        assert_eq!(score.score, 0.0);
        assert_eq!(score.dominant_signal, "responder_overloaded");
    }

    #[test]
    fn test_rejection_deduction_is_capped() {
        let weights = RiskWeights::default();
        let few = weights.compute(&RiskInputs {
            recent_rejections: 2,
            ..Default::default()
        });
        let many = weights.compute(&RiskInputs {
            recent_rejections: 50,
            ..Default::default()
        });
        assert!(few.score > many.score);
        assert_eq!(many.score, 1.0 - weights.recent_rejections_cap);
    }

    #[test]
    fn test_dominant_signal_is_largest_deduction() {
        let score = RiskWeights::default().compute(&RiskInputs {
            short_context: true,
            constraints_exceed_caps: true,
            ..Default::default()
        });
        assert_eq!(score.dominant_signal, "constraints_exceed_caps");
    }

    #[test]
    fn test_same_inputs_same_score() {
        let inputs = RiskInputs {
            short_context: true,
            recent_rejections: 1,
            within_probation: true,
            ..Default::default()
        };
        let weights = RiskWeights::default();
        assert_eq!(weights.compute(&inputs), weights.compute(&inputs));
    }
}
