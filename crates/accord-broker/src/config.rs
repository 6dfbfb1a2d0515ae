//! Broker configuration
//!
//! Every knob has a default; `from_env` overrides from `ACCORD_*` variables.

use accord_crypto::ChainKey;
use accord_delivery::DeliveryConfig;
use std::time::Duration;

/// Configuration for a broker instance.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Default idle hours for activity-based timeboxes
    pub default_timebox_hours: i64,
    /// Default per-relationship depth cap
    pub default_max_depth: u32,
    /// Total deadline for one admission run
    pub admission_deadline: Duration,
    /// How long a subscriber has to acknowledge a delivery
    pub ack_timeout: Duration,
    /// Idle-session heartbeat cadence
    pub heartbeat_interval: Duration,
    /// Bounded pending-intent queue per responder
    pub responder_queue_size: usize,
    /// Grace margin for appointment windows under grace-period policy
    pub grace_period: chrono::Duration,
    /// Cadence of the expiry sweep
    pub sweep_interval: Duration,
    /// First-contact probation window (risk signal)
    pub probation_window: chrono::Duration,
    /// How far back rejections count as "recent" (risk signal)
    pub recent_rejection_window: chrono::Duration,
    /// Context shorter than this fires the short-context risk signal
    pub risk_min_context_len: usize,
    /// Whether a response recomputes the activity timebox. Off by default so
    /// silent responders cannot keep a relationship alive.
    pub extend_timebox_on_response: bool,
    /// Per-broker continuity-hash key
    pub chain_key: ChainKey,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_timebox_hours: 24,
            default_max_depth: 5,
            admission_deadline: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            responder_queue_size: 64,
            grace_period: chrono::Duration::minutes(5),
            sweep_interval: Duration::from_secs(60),
            probation_window: chrono::Duration::hours(1),
            recent_rejection_window: chrono::Duration::hours(1),
            risk_min_context_len: 16,
            extend_timebox_on_response: false,
            // ephemeral key; deployments load one via ACCORD_CHAIN_KEY
            chain_key: ChainKey::generate(),
        }
    }
}

impl BrokerConfig {
    /// Build from the environment, falling back to defaults field by field.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(hours) = env_parse::<i64>("ACCORD_TIMEBOX_HOURS") {
            config.default_timebox_hours = hours;
        }
        if let Some(depth) = env_parse::<u32>("ACCORD_MAX_DEPTH") {
            config.default_max_depth = depth;
        }
        if let Some(ms) = env_parse::<u64>("ACCORD_ADMISSION_DEADLINE_MS") {
            config.admission_deadline = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("ACCORD_ACK_TIMEOUT_SECS") {
            config.ack_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("ACCORD_HEARTBEAT_SECS") {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(size) = env_parse::<usize>("ACCORD_RESPONDER_QUEUE_SIZE") {
            config.responder_queue_size = size;
        }
        if let Some(secs) = env_parse::<i64>("ACCORD_GRACE_PERIOD_SECS") {
            config.grace_period = chrono::Duration::seconds(secs);
        }
        if let Some(secs) = env_parse::<u64>("ACCORD_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Ok(hex_key) = std::env::var("ACCORD_CHAIN_KEY") {
            match ChainKey::from_hex(hex_key.trim()) {
                Ok(key) => config.chain_key = key,
                Err(error) => {
                    tracing::warn!(%error, "ignoring malformed ACCORD_CHAIN_KEY");
                }
            }
        }

        config
    }

    /// The delivery-subsystem view of this configuration.
    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            ack_timeout: self.ack_timeout,
            heartbeat_interval: self.heartbeat_interval,
            queue_size: self.responder_queue_size,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.default_timebox_hours, 24);
        assert_eq!(config.default_max_depth, 5);
        assert_eq!(config.admission_deadline, Duration::from_secs(2));
        assert_eq!(config.responder_queue_size, 64);
        assert_eq!(config.grace_period, chrono::Duration::minutes(5));
        assert!(!config.extend_timebox_on_response);
    }

    #[test]
    fn test_delivery_view() {
        let config = BrokerConfig::default();
        let delivery = config.delivery();
        assert_eq!(delivery.ack_timeout, config.ack_timeout);
        assert_eq!(delivery.queue_size, config.responder_queue_size);
    }
}
