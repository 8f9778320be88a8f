//! Call client configuration.

use crate::session::SessionConfig;
use crate::signaling::BackoffConfig;

use common::config::ObservabilityConfig;
use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default REST request timeout in seconds.
pub const DEFAULT_API_TIMEOUT_SECONDS: u64 = 10;

/// Default time a call survives a dropped signaling connection.
pub const DEFAULT_RECONNECT_GRACE_SECONDS: u64 = 30;

/// Default outgoing call timeout; zero disables it.
pub const DEFAULT_OUTGOING_CALL_TIMEOUT_SECONDS: u64 = 0;

/// Default first reconnect delay in milliseconds.
pub const DEFAULT_RECONNECT_INITIAL_BACKOFF_MS: u64 = 500;

/// Default reconnect delay cap in milliseconds.
pub const DEFAULT_RECONNECT_MAX_BACKOFF_MS: u64 = 30_000;

/// Call client configuration.
#[derive(Clone)]
pub struct Config {
    /// Base URL of the call REST API (e.g. `https://api.example.com`).
    pub api_base_url: String,

    /// Bearer token for the REST API.
    /// Protected by `SecretString` to prevent accidental logging.
    pub api_token: Option<SecretString>,

    /// Relay WebSocket URL (e.g. `wss://relay.example.com/ws`).
    pub signaling_url: String,

    /// REST request timeout (default: 10).
    pub api_timeout_seconds: u64,

    /// How long an active call survives a signaling drop (default: 30).
    pub reconnect_grace_seconds: u64,

    /// Unanswered outgoing call timeout; 0 disables (default: 0).
    pub outgoing_call_timeout_seconds: u64,

    /// First reconnect delay (default: 500).
    pub reconnect_initial_backoff_ms: u64,

    /// Reconnect delay cap (default: 30000).
    pub reconnect_max_backoff_ms: u64,

    /// Logging configuration for embedders.
    pub observability: ObservabilityConfig,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_base_url", &self.api_base_url)
            .field(
                "api_token",
                &self.api_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("signaling_url", &self.signaling_url)
            .field("api_timeout_seconds", &self.api_timeout_seconds)
            .field("reconnect_grace_seconds", &self.reconnect_grace_seconds)
            .field(
                "outgoing_call_timeout_seconds",
                &self.outgoing_call_timeout_seconds,
            )
            .field(
                "reconnect_initial_backoff_ms",
                &self.reconnect_initial_backoff_ms,
            )
            .field("reconnect_max_backoff_ms", &self.reconnect_max_backoff_ms)
            .field("observability", &self.observability)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

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
        let api_base_url = vars
            .get("CALL_API_BASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("CALL_API_BASE_URL".to_string()))?
            .trim_end_matches('/')
            .to_string();
        if !(api_base_url.starts_with("http://") || api_base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue(
                "CALL_API_BASE_URL must be an http(s) URL".to_string(),
            ));
        }

        let signaling_url = vars
            .get("CALL_SIGNALING_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("CALL_SIGNALING_URL".to_string()))?
            .clone();
        if !(signaling_url.starts_with("ws://") || signaling_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "CALL_SIGNALING_URL must be a ws(s) URL".to_string(),
            ));
        }

        let api_token = vars
            .get("CALL_API_TOKEN")
            .filter(|t| !t.is_empty())
            .map(|t| SecretString::from(t.clone()));

        let api_timeout_seconds =
            parse_or(vars, "CALL_API_TIMEOUT_SECONDS", DEFAULT_API_TIMEOUT_SECONDS)?;
        let reconnect_grace_seconds = parse_or(
            vars,
            "CALL_RECONNECT_GRACE_SECONDS",
            DEFAULT_RECONNECT_GRACE_SECONDS,
        )?;
        let outgoing_call_timeout_seconds = parse_or(
            vars,
            "CALL_OUTGOING_TIMEOUT_SECONDS",
            DEFAULT_OUTGOING_CALL_TIMEOUT_SECONDS,
        )?;
        let reconnect_initial_backoff_ms = parse_or(
            vars,
            "CALL_RECONNECT_INITIAL_BACKOFF_MS",
            DEFAULT_RECONNECT_INITIAL_BACKOFF_MS,
        )?;
        let reconnect_max_backoff_ms = parse_or(
            vars,
            "CALL_RECONNECT_MAX_BACKOFF_MS",
            DEFAULT_RECONNECT_MAX_BACKOFF_MS,
        )?;

        if reconnect_initial_backoff_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "CALL_RECONNECT_INITIAL_BACKOFF_MS must be greater than 0".to_string(),
            ));
        }
        if reconnect_initial_backoff_ms > reconnect_max_backoff_ms {
            return Err(ConfigError::InvalidValue(
                "CALL_RECONNECT_INITIAL_BACKOFF_MS must not exceed CALL_RECONNECT_MAX_BACKOFF_MS"
                    .to_string(),
            ));
        }

        Ok(Config {
            api_base_url,
            api_token,
            signaling_url,
            api_timeout_seconds,
            reconnect_grace_seconds,
            outgoing_call_timeout_seconds,
            reconnect_initial_backoff_ms,
            reconnect_max_backoff_ms,
            observability: ObservabilityConfig::from_vars(vars, "CALL"),
        })
    }

    /// REST request timeout as a `Duration`.
    #[must_use]
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_seconds)
    }

    /// Timing settings for the session actor.
    #[must_use]
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            reconnect_grace: Duration::from_secs(self.reconnect_grace_seconds),
            outgoing_call_timeout: (self.outgoing_call_timeout_seconds > 0)
                .then(|| Duration::from_secs(self.outgoing_call_timeout_seconds)),
        }
    }

    /// Reconnect backoff for the signaling transport.
    #[must_use]
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.reconnect_initial_backoff_ms),
            max: Duration::from_millis(self.reconnect_max_backoff_ms),
        }
    }
}

/// Parse `key` from `vars`, falling back to `default` when unset.
fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match vars.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            (
                "CALL_API_BASE_URL".to_string(),
                "https://api.example.com/".to_string(),
            ),
            (
                "CALL_SIGNALING_URL".to_string(),
                "wss://relay.example.com/ws".to_string(),
            ),
        ])
    }

    #[test]
    fn test_from_vars_defaults() {
        let config = Config::from_vars(&base_vars()).unwrap();

        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(config.signaling_url, "wss://relay.example.com/ws");
        assert!(config.api_token.is_none());
        assert_eq!(config.api_timeout_seconds, DEFAULT_API_TIMEOUT_SECONDS);
        assert_eq!(config.reconnect_grace_seconds, DEFAULT_RECONNECT_GRACE_SECONDS);

        let session = config.session();
        assert_eq!(session.reconnect_grace, Duration::from_secs(30));
        assert!(session.outgoing_call_timeout.is_none());

        let backoff = config.backoff();
        assert_eq!(backoff.initial, Duration::from_millis(500));
        assert_eq!(backoff.max, Duration::from_secs(30));
    }

    #[test]
    fn test_from_vars_custom_values() {
        let mut vars = base_vars();
        vars.insert("CALL_API_TOKEN".to_string(), "tok-123".to_string());
        vars.insert("CALL_OUTGOING_TIMEOUT_SECONDS".to_string(), "45".to_string());
        vars.insert("CALL_RECONNECT_GRACE_SECONDS".to_string(), "10".to_string());
        vars.insert("CALL_JSON_LOGS".to_string(), "true".to_string());

        let config = Config::from_vars(&vars).unwrap();

        assert_eq!(config.api_token.as_ref().unwrap().expose_secret(), "tok-123");
        assert_eq!(
            config.session().outgoing_call_timeout,
            Some(Duration::from_secs(45))
        );
        assert_eq!(config.session().reconnect_grace, Duration::from_secs(10));
        assert!(config.observability.json_logs);
    }

    #[test]
    fn test_missing_required_vars() {
        let mut vars = base_vars();
        vars.remove("CALL_SIGNALING_URL");
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::MissingEnvVar(ref v)) if v == "CALL_SIGNALING_URL"
        ));

        assert!(matches!(
            Config::from_vars(&HashMap::new()),
            Err(ConfigError::MissingEnvVar(ref v)) if v == "CALL_API_BASE_URL"
        ));
    }

    #[test]
    fn test_invalid_urls_rejected() {
        let mut vars = base_vars();
        vars.insert(
            "CALL_SIGNALING_URL".to_string(),
            "https://relay.example.com".to_string(),
        );
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut vars = base_vars();
        vars.insert("CALL_API_BASE_URL".to_string(), "api.example.com".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        let mut vars = base_vars();
        vars.insert("CALL_RECONNECT_GRACE_SECONDS".to_string(), "soon".to_string());
        match Config::from_vars(&vars) {
            Err(ConfigError::InvalidValue(msg)) => {
                assert_eq!(msg, "CALL_RECONNECT_GRACE_SECONDS=soon");
            }
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn test_backoff_bounds_validated() {
        let mut vars = base_vars();
        vars.insert("CALL_RECONNECT_INITIAL_BACKOFF_MS".to_string(), "5000".to_string());
        vars.insert("CALL_RECONNECT_MAX_BACKOFF_MS".to_string(), "1000".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));

        let mut vars = base_vars();
        vars.insert("CALL_RECONNECT_INITIAL_BACKOFF_MS".to_string(), "0".to_string());
        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_debug_redacts_token() {
        let mut vars = base_vars();
        vars.insert("CALL_API_TOKEN".to_string(), "super-secret-token".to_string());
        let config = Config::from_vars(&vars).unwrap();

        let debug_output = format!("{config:?}");
        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super-secret-token"));
    }
}
