//! Engine configuration loaded from the environment.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::mediator::{ShutdownMode, DEFAULT_TERMINATION_TIMEOUT};

/// Default bound on how long a finished outer subscription waits for its
/// in-flight events.
pub const DEFAULT_OUTER_TERMINATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables shared by the processors of one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of inner pipelines when completion may happen on another thread.
    pub concurrency: usize,
    /// Maximum events in flight per outer subscription.
    pub max_inflight: usize,
    /// How long a graceful stop waits for in-flight invocations.
    pub termination_timeout: Duration,
    /// How long a completed upstream waits for its stragglers. `None` waits
    /// forever.
    pub outer_termination_timeout: Option<Duration>,
    pub shutdown_mode: ShutdownMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_inflight: 256,
            termination_timeout: DEFAULT_TERMINATION_TIMEOUT,
            outer_termination_timeout: Some(DEFAULT_OUTER_TERMINATION_TIMEOUT),
            shutdown_mode: ShutdownMode::Graceful,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables (and `.env`), falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup("ENGINE_CONCURRENCY") {
            config.concurrency = raw
                .trim()
                .parse::<usize>()
                .context("ENGINE_CONCURRENCY must be a positive integer")?
                .max(1);
        }
        if let Some(raw) = lookup("ENGINE_MAX_INFLIGHT") {
            config.max_inflight = raw
                .trim()
                .parse::<usize>()
                .context("ENGINE_MAX_INFLIGHT must be a positive integer")?
                .max(1);
        }
        if let Some(raw) = lookup("ENGINE_TERMINATION_TIMEOUT_MS") {
            let millis = raw
                .trim()
                .parse::<u64>()
                .context("ENGINE_TERMINATION_TIMEOUT_MS must be milliseconds")?;
            config.termination_timeout = Duration::from_millis(millis);
        }
        if let Some(raw) = lookup("ENGINE_OUTER_TERMINATION_TIMEOUT_MS") {
            let millis = raw
                .trim()
                .parse::<i64>()
                .context("ENGINE_OUTER_TERMINATION_TIMEOUT_MS must be milliseconds")?;
            // Negative disables the timeout.
            config.outer_termination_timeout =
                u64::try_from(millis).ok().map(Duration::from_millis);
        }
        if let Some(raw) = lookup("ENGINE_SHUTDOWN_MODE") {
            config.shutdown_mode = raw
                .parse::<ShutdownMode>()
                .map_err(anyhow::Error::msg)
                .context("ENGINE_SHUTDOWN_MODE must be 'graceful' or 'immediate'")?;
        }

        Ok(config)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight.max(1);
        self
    }

    pub fn with_termination_timeout(mut self, timeout: Duration) -> Self {
        self.termination_timeout = timeout;
        self
    }

    pub fn with_outer_termination_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.outer_termination_timeout = timeout;
        self
    }

    pub fn with_shutdown_mode(mut self, mode: ShutdownMode) -> Self {
        self.shutdown_mode = mode;
        self
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.concurrency >= 1);
    }

    #[test]
    fn test_reads_all_variables() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("ENGINE_CONCURRENCY", "4"),
            ("ENGINE_MAX_INFLIGHT", "16"),
            ("ENGINE_TERMINATION_TIMEOUT_MS", "250"),
            ("ENGINE_OUTER_TERMINATION_TIMEOUT_MS", "-1"),
            ("ENGINE_SHUTDOWN_MODE", "Immediate"),
        ]))
        .unwrap();

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_inflight, 16);
        assert_eq!(config.termination_timeout, Duration::from_millis(250));
        assert_eq!(config.outer_termination_timeout, None);
        assert_eq!(config.shutdown_mode, ShutdownMode::Immediate);
    }

    #[test]
    fn test_shutdown_mode_serde_matches_env_spelling() {
        let mode: ShutdownMode = serde_json::from_str("\"immediate\"").unwrap();
        assert_eq!(mode, ShutdownMode::Immediate);
        assert_eq!(serde_json::to_string(&ShutdownMode::Graceful).unwrap(), "\"graceful\"");
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = EngineConfig::from_lookup(lookup(&[("ENGINE_CONCURRENCY", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("ENGINE_CONCURRENCY"));

        let err = EngineConfig::from_lookup(lookup(&[("ENGINE_SHUTDOWN_MODE", "eventually")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("unknown shutdown mode"));
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        let config = EngineConfig::from_lookup(lookup(&[("ENGINE_CONCURRENCY", "0")])).unwrap();
        assert_eq!(config.concurrency, 1);
    }
}
