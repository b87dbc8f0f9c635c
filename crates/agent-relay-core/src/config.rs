//! Relay tuning knobs.

use std::env;
use std::time::Duration;

/// Relay configuration.
///
/// `Default` gives production values; every field can be overridden through
/// the environment via [`RelayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How long one dispatched action may run before the sequence fails.
    pub action_timeout: Duration,
    /// Upper bound on a whole sequence, regardless of per-action progress.
    pub sequence_timeout: Duration,
    /// Interval between relay-initiated PINGs.
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered PINGs before a forced disconnect.
    pub heartbeat_misses: u32,
    /// Sequences allowed to wait behind the running one; 0 rejects while busy.
    pub queue_depth: usize,
    /// Abort the remainder of a sequence when an action reports an error.
    pub abort_on_error: bool,
    /// Protocol violations tolerated before the connection is closed.
    pub violation_limit: u32,
    /// How long a fresh connection may take to send REGISTER.
    pub register_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(10),
            sequence_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_misses: 3,
            queue_depth: 4,
            abort_on_error: true,
            violation_limit: 5,
            register_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Build a config from the environment, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            action_timeout: env_secs("RELAY_ACTION_TIMEOUT_SECS", default.action_timeout),
            sequence_timeout: env_secs("RELAY_SEQUENCE_TIMEOUT_SECS", default.sequence_timeout),
            heartbeat_interval: env_secs("RELAY_HEARTBEAT_SECS", default.heartbeat_interval),
            heartbeat_misses: env_parse("RELAY_HEARTBEAT_MISSES", default.heartbeat_misses),
            queue_depth: env_parse("RELAY_QUEUE_DEPTH", default.queue_depth),
            abort_on_error: env_bool("RELAY_ABORT_ON_ERROR", default.abort_on_error),
            violation_limit: env_parse("RELAY_VIOLATION_LIMIT", default.violation_limit),
            register_timeout: env_secs("RELAY_REGISTER_TIMEOUT_SECS", default.register_timeout),
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map_or(default, Duration::from_secs)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key).map_or(default, |v| v == "1" || v.eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.action_timeout, Duration::from_secs(10));
        assert_eq!(config.queue_depth, 4);
        assert!(config.abort_on_error);
    }
}
