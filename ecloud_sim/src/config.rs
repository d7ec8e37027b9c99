//! Simulation run configuration.

use ecloud_core::{OrchestratorConfig, ScenarioInfo};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of vehicle clients to spawn
    pub num_agents: usize,

    /// World tick in milliseconds (CARLA `fixed_delta_seconds`)
    pub world_tick_ms: u64,

    /// Ticks of driving before a route is exhausted
    pub route_ticks: u64,

    /// Tick budget after which the driver finishes the run
    pub max_ticks: u64,

    /// Nominal vehicle speed in m/s
    pub base_speed: f64,

    /// Per-step speed jitter std-dev in m/s
    pub speed_noise_std: f64,

    /// Orchestrator settings; `expected_agents` is overridden by `num_agents`
    pub orchestrator: OrchestratorConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_agents: 4,
            world_tick_ms: 50,
            route_ticks: 20,
            max_ticks: 60,
            base_speed: 10.0,
            speed_noise_std: 0.2,
            orchestrator: OrchestratorConfig::default()
                .with_tick_timeout(Duration::from_millis(250))
                .with_debug_timeout(Duration::from_millis(250)),
        }
    }
}

impl SimConfig {
    pub fn world_tick(&self) -> Duration {
        Duration::from_millis(self.world_tick_ms)
    }

    /// World tick in seconds, as used by the vehicle dynamics.
    pub fn dt(&self) -> f64 {
        self.world_tick().as_secs_f64()
    }

    /// Tick budget of a run: the tighter of the driver's and the orchestrator's.
    pub fn tick_budget(&self) -> u64 {
        self.orchestrator
            .max_ticks
            .map_or(self.max_ticks, |max| max.min(self.max_ticks))
    }

    /// Orchestrator config for one scenario run.
    pub fn orchestrator_for(&self, scenario_name: &str) -> OrchestratorConfig {
        let mut config = self.orchestrator.clone();
        config.expected_agents = self.num_agents;
        config.scenario = ScenarioInfo {
            name: scenario_name.to_string(),
            ..config.scenario
        };
        config
    }
}
