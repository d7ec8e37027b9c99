//! Simulated vehicle - a point-mass client driving along planner waypoints.

use async_trait::async_trait;
use ecloud_core::{
    Payload, Registration, SessionIndex, StepComputation, StepError, StepInput, StepResult, TickId,
};
use nalgebra::Vector3;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::planner::{WaypointFragment, LANE_WIDTH};

/// Misbehaviour injected into a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Fault {
    #[default]
    None,
    /// Reports its terminal condition at this tick
    FinishAt(TickId),
    /// Step fails from this tick on
    FailAt(TickId),
    /// Never answers from this tick on
    HangAt(TickId),
}

/// Result value of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub tick_id: TickId,
    pub position: Vector3<f64>,
    pub speed: f64,
    pub distance: f64,
}

/// Snapshot answered for REQUEST_DEBUG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleDebug {
    pub session_index: Option<SessionIndex>,
    pub scenario: Option<String>,
    pub steps: u64,
    pub last_tick: Option<TickId>,
    pub position: Vector3<f64>,
    pub distance: f64,
    pub fault: Fault,
}

/// Point-mass vehicle implementing [`StepComputation`].
pub struct SimulatedVehicle {
    seed: u64,
    rng: ChaCha8Rng,
    speed_noise_std: f64,
    dt: f64,
    fault: Fault,

    session_index: Option<SessionIndex>,
    scenario: Option<String>,
    position: Vector3<f64>,
    speed: f64,
    distance: f64,
    steps: u64,
    last_tick: Option<TickId>,
}

impl SimulatedVehicle {
    /// Creates a vehicle with world tick `dt` in seconds.
    ///
    /// The jitter stream is re-derived from `seed` and the session index on
    /// registration, so trajectories do not depend on registration order.
    pub fn new(seed: u64, dt: f64) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            speed_noise_std: 0.2,
            dt,
            fault: Fault::None,
            session_index: None,
            scenario: None,
            position: Vector3::zeros(),
            speed: 0.0,
            distance: 0.0,
            steps: 0,
            last_tick: None,
        }
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.fault = fault;
        self
    }

    /// Sets the std-dev of the per-step speed jitter (m/s).
    pub fn with_speed_noise(mut self, std: f64) -> Self {
        self.speed_noise_std = std.max(0.0);
        self
    }

    pub fn fault(&self) -> Fault {
        self.fault
    }

    pub fn position(&self) -> Vector3<f64> {
        self.position
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn state(&self, tick_id: TickId) -> VehicleState {
        VehicleState {
            tick_id,
            position: self.position,
            speed: self.speed,
            distance: self.distance,
        }
    }

    /// Moves toward the first waypoint of the fragment.
    fn drive(&mut self, fragment: &WaypointFragment) {
        let Some(target) = fragment.waypoints.first() else {
            self.speed = 0.0;
            return;
        };

        let jitter = Normal::new(0.0, self.speed_noise_std)
            .map(|normal| normal.sample(&mut self.rng))
            .unwrap_or(0.0);
        let speed = (fragment.target_speed + jitter).max(0.0);

        let to_target = target - self.position;
        let remaining = to_target.norm();
        let travel = (speed * self.dt).min(remaining);
        if remaining > f64::EPSILON {
            self.position += to_target / remaining * travel;
        }

        self.speed = speed;
        self.distance += travel;
    }
}

#[async_trait]
impl StepComputation for SimulatedVehicle {
    fn on_registered(&mut self, registration: &Registration) {
        let index = registration.assigned_index;
        self.session_index = Some(index);
        self.rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(index as u64));
        self.scenario = Some(registration.scenario.name.clone());
        self.position = Vector3::new(0.0, index as f64 * LANE_WIDTH, 0.0);
    }

    async fn compute_step(&mut self, input: StepInput) -> Result<StepResult, StepError> {
        let tick_id = input.tick_id;
        self.last_tick = Some(tick_id);

        match self.fault {
            Fault::HangAt(at) if tick_id >= at => {
                debug!("Vehicle {:?} hanging at tick {}", self.session_index, tick_id);
                return std::future::pending().await;
            }
            Fault::FailAt(at) if tick_id >= at => {
                return Err(StepError::failed(format!("controller fault at tick {}", tick_id)));
            }
            _ => {}
        }

        let fragment: WaypointFragment = match input.instruction {
            Some(payload) => payload.decode()?,
            None => return Err(StepError::failed("STEP without waypoints")),
        };

        self.drive(&fragment);
        self.steps += 1;

        let finished = fragment.is_exhausted()
            || matches!(self.fault, Fault::FinishAt(at) if tick_id >= at);
        let value = Payload::encode(&self.state(tick_id))?;

        if finished {
            Ok(StepResult::terminal(value))
        } else {
            Ok(StepResult::running(value))
        }
    }

    fn diagnostics(&self) -> Payload {
        let snapshot = VehicleDebug {
            session_index: self.session_index,
            scenario: self.scenario.clone(),
            steps: self.steps,
            last_tick: self.last_tick,
            position: self.position,
            distance: self.distance,
            fault: self.fault,
        };
        Payload::encode(&snapshot).unwrap_or_default()
    }

    fn neutral_result(&self) -> Payload {
        // Stopped in place
        let stopped = VehicleState {
            tick_id: self.last_tick.unwrap_or_default(),
            position: self.position,
            speed: 0.0,
            distance: self.distance,
        };
        Payload::encode(&stopped).unwrap_or_default()
    }
}
