//! Lockstep protocol scenarios.

use crate::vehicle::Fault;
use ecloud_core::TickId;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// ECL-001: every vehicle drives the whole route
    Lockstep,

    /// ECL-002: some vehicles finish early and leave the barrier
    EarlyFinish,

    /// ECL-003: one vehicle stops answering mid-run
    Unresponsive,

    /// ECL-004: one vehicle's step fails and it reports a neutral result
    StepFailure,

    /// ECL-005: early finish, step failure and a silent vehicle in one run
    Mixed,

    /// ECL-006: routes outlast the tick budget; the driver finishes the run
    StepLimit,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Lockstep,
            ScenarioId::EarlyFinish,
            ScenarioId::Unresponsive,
            ScenarioId::StepFailure,
            ScenarioId::Mixed,
            ScenarioId::StepLimit,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Lockstep => "lockstep",
            ScenarioId::EarlyFinish => "early_finish",
            ScenarioId::Unresponsive => "unresponsive",
            ScenarioId::StepFailure => "step_failure",
            ScenarioId::Mixed => "mixed",
            ScenarioId::StepLimit => "step_limit",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Lockstep => "All vehicles drive the full route in lockstep",
            ScenarioId::EarlyFinish => "Every other vehicle finishes early, the rest keep ticking",
            ScenarioId::Unresponsive => "Last vehicle hangs at tick 5 and is excused after the timeout",
            ScenarioId::StepFailure => "First vehicle's controller fails at tick 4",
            ScenarioId::Mixed => "Early finish + step failure + hang in one run",
            ScenarioId::StepLimit => "Routes longer than the tick budget, graceful finish",
        }
    }

    /// True if a cohort of `num_vehicles` gets a vehicle that stops answering.
    pub fn expects_degraded(&self, num_vehicles: usize) -> bool {
        (0..num_vehicles).any(|v| matches!(self.fault_for(v, num_vehicles), Fault::HangAt(_)))
    }

    /// Fault injected into vehicle `vehicle` of `num_vehicles`.
    pub fn fault_for(&self, vehicle: usize, num_vehicles: usize) -> Fault {
        let last = num_vehicles.saturating_sub(1);
        match self {
            ScenarioId::Lockstep | ScenarioId::StepLimit => Fault::None,
            ScenarioId::EarlyFinish if vehicle % 2 == 1 => Fault::FinishAt(3 + vehicle as TickId),
            ScenarioId::EarlyFinish => Fault::None,
            ScenarioId::Unresponsive if vehicle == last => Fault::HangAt(5),
            ScenarioId::Unresponsive => Fault::None,
            ScenarioId::StepFailure if vehicle == 0 => Fault::FailAt(4),
            ScenarioId::StepFailure => Fault::None,
            ScenarioId::Mixed => match vehicle {
                _ if num_vehicles >= 3 && vehicle == last => Fault::HangAt(6),
                0 => Fault::FinishAt(2),
                1 => Fault::FailAt(4),
                _ => Fault::None,
            },
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lockstep" | "ecl-001" => Ok(ScenarioId::Lockstep),
            "early_finish" | "earlyfinish" | "ecl-002" => Ok(ScenarioId::EarlyFinish),
            "unresponsive" | "ecl-003" => Ok(ScenarioId::Unresponsive),
            "step_failure" | "stepfailure" | "ecl-004" => Ok(ScenarioId::StepFailure),
            "mixed" | "ecl-005" => Ok(ScenarioId::Mixed),
            "step_limit" | "steplimit" | "ecl-006" => Ok(ScenarioId::StepLimit),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
