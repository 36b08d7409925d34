//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Static deployment parameters for the scheduler service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of actuator channels (ids 1..=N)
    pub actuator_count: u8,
    /// Shared sensor polling cadence for all conditions
    pub poll_interval_secs: u64,
    /// Source tag attached to audit log records
    pub log_source: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            actuator_count: 4,
            poll_interval_secs: 5,
            log_source: "scheduler".to_string(),
        }
    }
}

impl EngineConfig {
    /// Build a config from `RELAY_ACTUATORS` and `RELAY_POLL_SECS`, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(count) = parse_var::<u8>(&lookup, "RELAY_ACTUATORS") {
            config.actuator_count = count;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "RELAY_POLL_SECS") {
            config.poll_interval_secs = secs;
        }
        config
    }

    /// Polling cadence as a duration (never zero)
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Ignoring malformed {}={:?}, using default", name, raw);
            None
        }
    }
}
