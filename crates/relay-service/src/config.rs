//! Relay configuration.
//!
//! Configuration is loaded from environment variables. Numeric values that
//! fail to parse are rejected rather than silently defaulted.

use common::config::ObservabilityConfig;
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default disconnect grace period in seconds.
pub const DEFAULT_DISCONNECT_GRACE_PERIOD_SECONDS: u64 = 30;

/// Default maximum number of concurrent calls.
pub const DEFAULT_MAX_CALLS: usize = 1000;

/// Default maximum members per call. Mesh topology, so kept small.
pub const DEFAULT_MAX_PARTICIPANTS_PER_CALL: usize = 16;

/// Default relay instance ID prefix.
pub const DEFAULT_RELAY_ID_PREFIX: &str = "relay";

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket server bind address (default: "0.0.0.0:8080").
    pub bind_address: SocketAddr,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: SocketAddr,

    /// Unique identifier for this relay instance.
    pub relay_id: String,

    /// Maximum concurrent calls this relay will host.
    pub max_calls: usize,

    /// Maximum roster size for a single call.
    pub max_participants_per_call: usize,

    /// How long a dropped user keeps call memberships (default: 30).
    pub disconnect_grace_period_seconds: u64,

    /// Logging configuration.
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = parse_or(vars, "RELAY_BIND_ADDRESS", DEFAULT_BIND_ADDRESS)?;
        let health_bind_address =
            parse_or(vars, "RELAY_HEALTH_BIND_ADDRESS", DEFAULT_HEALTH_BIND_ADDRESS)?;

        let max_calls = parse_or(vars, "RELAY_MAX_CALLS", DEFAULT_MAX_CALLS)?;
        let max_participants_per_call = parse_or(
            vars,
            "RELAY_MAX_PARTICIPANTS_PER_CALL",
            DEFAULT_MAX_PARTICIPANTS_PER_CALL,
        )?;
        if max_participants_per_call < 2 {
            return Err(ConfigError::InvalidValue(
                "RELAY_MAX_PARTICIPANTS_PER_CALL must be at least 2".to_string(),
            ));
        }

        let disconnect_grace_period_seconds = parse_or(
            vars,
            "RELAY_DISCONNECT_GRACE_PERIOD_SECONDS",
            DEFAULT_DISCONNECT_GRACE_PERIOD_SECONDS,
        )?;

        // Generate relay instance ID
        let relay_id = vars.get("RELAY_ID").cloned().unwrap_or_else(|| {
            let hostname = vars
                .get("HOSTNAME")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_RELAY_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            health_bind_address,
            relay_id,
            max_calls,
            max_participants_per_call,
            disconnect_grace_period_seconds,
            observability: ObservabilityConfig::from_vars(vars, "RELAY"),
        })
    }

    /// Disconnect grace period as a `Duration`.
    #[must_use]
    pub fn disconnect_grace_period(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_period_seconds)
    }
}

/// Parse `key` from `vars`, falling back to `default` when unset.
fn parse_or<T, D>(vars: &HashMap<String, String>, key: &str, default: D) -> Result<T, ConfigError>
where
    T: FromStr,
    D: ToString,
{
    let raw = vars.get(key).cloned().unwrap_or_else(|| default.to_string());
    raw.parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&HashMap::new()).expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), DEFAULT_BIND_ADDRESS);
        assert_eq!(
            config.health_bind_address.to_string(),
            DEFAULT_HEALTH_BIND_ADDRESS
        );
        assert_eq!(config.max_calls, DEFAULT_MAX_CALLS);
        assert_eq!(
            config.max_participants_per_call,
            DEFAULT_MAX_PARTICIPANTS_PER_CALL
        );
        assert_eq!(config.disconnect_grace_period(), Duration::from_secs(30));
        assert!(config.relay_id.starts_with("relay-"));
        assert!(!config.observability.json_logs);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let vars = HashMap::from([
            ("RELAY_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string()),
            (
                "RELAY_HEALTH_BIND_ADDRESS".to_string(),
                "127.0.0.1:9001".to_string(),
            ),
            ("RELAY_ID".to_string(), "relay-custom-001".to_string()),
            ("RELAY_MAX_CALLS".to_string(), "50".to_string()),
            (
                "RELAY_MAX_PARTICIPANTS_PER_CALL".to_string(),
                "8".to_string(),
            ),
            (
                "RELAY_DISCONNECT_GRACE_PERIOD_SECONDS".to_string(),
                "45".to_string(),
            ),
            ("RELAY_JSON_LOGS".to_string(), "true".to_string()),
        ]);

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "127.0.0.1:9000");
        assert_eq!(config.health_bind_address.to_string(), "127.0.0.1:9001");
        assert_eq!(config.relay_id, "relay-custom-001");
        assert_eq!(config.max_calls, 50);
        assert_eq!(config.max_participants_per_call, 8);
        assert_eq!(config.disconnect_grace_period_seconds, 45);
        assert!(config.observability.json_logs);
    }

    #[test]
    fn test_from_vars_rejects_unparseable_number() {
        let vars = HashMap::from([("RELAY_MAX_CALLS".to_string(), "lots".to_string())]);

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(v)) if v == "RELAY_MAX_CALLS=lots"));
    }

    #[test]
    fn test_from_vars_rejects_bad_bind_address() {
        let vars = HashMap::from([("RELAY_BIND_ADDRESS".to_string(), "nowhere".to_string())]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_from_vars_rejects_single_member_calls() {
        let vars = HashMap::from([(
            "RELAY_MAX_PARTICIPANTS_PER_CALL".to_string(),
            "1".to_string(),
        )]);
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
