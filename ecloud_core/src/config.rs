//! Orchestrator configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::EcloudError;
use crate::protocol::TickId;

/// Run description handed to every vehicle client on registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioInfo {
    /// Scenario name (for logging and reports)
    pub name: String,

    /// Application categories, e.g. `["single"]` or `["platoon"]`
    pub application: Vec<String>,

    /// Simulator version string
    pub version: String,

    /// Opaque scenario configuration forwarded verbatim to clients
    pub config: String,
}

impl Default for ScenarioInfo {
    fn default() -> Self {
        Self {
            name: "ecloud-scenario".to_string(),
            application: vec!["single".to_string()],
            version: "0.9.12".to_string(),
            config: String::new(),
        }
    }
}

/// Configuration for an orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Cohort size; ticking starts once this many clients registered (default: 1)
    pub expected_agents: usize,

    /// Tick id of the first broadcast (default: 0)
    pub initial_tick_id: TickId,

    /// Per-tick collection deadline in milliseconds (default: 5000)
    pub tick_timeout_ms: u64,

    /// Deadline for the final REQUEST_DEBUG collection (default: 2000)
    pub debug_timeout_ms: u64,

    /// Step rounds after which the run finishes on its own (default: unlimited)
    pub max_ticks: Option<u64>,

    /// Buffered broadcasts per client stream (default: 8)
    pub stream_capacity: usize,

    /// Buffered requests into the orchestrator loop (default: 1024)
    pub request_capacity: usize,

    /// Scenario description for registration replies
    pub scenario: ScenarioInfo,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            expected_agents: 1,
            initial_tick_id: 0,
            tick_timeout_ms: 5_000,
            debug_timeout_ms: 2_000,
            max_ticks: None,
            stream_capacity: 8,
            request_capacity: 1024,
            scenario: ScenarioInfo::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a config for a cohort of `expected_agents` clients.
    pub fn new(expected_agents: usize) -> Self {
        Self {
            expected_agents,
            ..Self::default()
        }
    }

    /// Sets the per-tick deadline.
    pub fn with_tick_timeout(mut self, timeout: Duration) -> Self {
        self.tick_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the debug collection deadline.
    pub fn with_debug_timeout(mut self, timeout: Duration) -> Self {
        self.debug_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the first tick id.
    pub fn with_initial_tick(mut self, tick_id: TickId) -> Self {
        self.initial_tick_id = tick_id;
        self
    }

    /// Caps the number of step rounds.
    pub fn with_max_ticks(mut self, max_ticks: u64) -> Self {
        self.max_ticks = Some(max_ticks);
        self
    }

    pub fn with_scenario(mut self, scenario: ScenarioInfo) -> Self {
        self.scenario = scenario;
        self
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_millis(self.tick_timeout_ms)
    }

    pub fn debug_timeout(&self) -> Duration {
        Duration::from_millis(self.debug_timeout_ms)
    }

    /// Parses a JSON config. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, EcloudError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EcloudError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.expected_agents, 1);
        assert_eq!(config.initial_tick_id, 0);
        assert_eq!(config.tick_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_ticks, None);
    }

    #[test]
    fn test_config_builders() {
        let config = OrchestratorConfig::new(16)
            .with_tick_timeout(Duration::from_millis(250))
            .with_initial_tick(1)
            .with_max_ticks(300);

        assert_eq!(config.expected_agents, 16);
        assert_eq!(config.tick_timeout_ms, 250);
        assert_eq!(config.initial_tick_id, 1);
        assert_eq!(config.max_ticks, Some(300));
    }

    #[test]
    fn test_config_partial_json() {
        let config = OrchestratorConfig::from_json_str(
            r#"{ "expected_agents": 8, "scenario": { "name": "ecloud_4lane" } }"#,
        )
        .unwrap();

        assert_eq!(config.expected_agents, 8);
        assert_eq!(config.scenario.name, "ecloud_4lane");
        // Unspecified fields keep defaults
        assert_eq!(config.scenario.application, vec!["single".to_string()]);
        assert_eq!(config.debug_timeout_ms, 2_000);
    }

    #[test]
    fn test_config_bad_json() {
        let err = OrchestratorConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, EcloudError::Codec(_)));
    }
}
