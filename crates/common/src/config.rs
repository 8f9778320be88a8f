//! Common configuration types for Callmesh components.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default tracing filter when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Observability configuration shared by the relay binary and embedders of
/// the call client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing filter directive (`RUST_LOG` syntax)
    pub log_filter: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// Read `RUST_LOG` and `<prefix>_JSON_LOGS` from a variable map.
    ///
    /// Anything other than `true`/`1` disables JSON output.
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>, prefix: &str) -> Self {
        let log_filter = vars
            .get("RUST_LOG")
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let json_logs = vars
            .get(&format!("{prefix}_JSON_LOGS"))
            .is_some_and(|v| v == "true" || v == "1");

        Self {
            log_filter,
            json_logs,
        }
    }
}
