//! Route planner - per-vehicle waypoint fragments for each tick.

use ecloud_core::{Payload, SessionIndex, TickId, WaypointSource};
use nalgebra::Vector3;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Lateral distance between neighbouring lanes in meters.
pub const LANE_WIDTH: f64 = 3.5;

/// Waypoints handed to one vehicle for one tick.
///
/// An empty fragment means the route is exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaypointFragment {
    pub tick_id: TickId,
    pub waypoints: Vec<Vector3<f64>>,
    pub target_speed: f64,
}

impl WaypointFragment {
    pub fn is_exhausted(&self) -> bool {
        self.waypoints.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Route {
    first_tick: TickId,
    lane_y: f64,
    target_speed: f64,
}

/// Straight-lane route planner, one lane per session.
pub struct RoutePlanner {
    rng: ChaCha8Rng,
    routes: HashMap<SessionIndex, Route>,

    /// Ticks of driving before a route is exhausted
    route_ticks: u64,

    /// Waypoints per fragment
    horizon: usize,

    /// Nominal speed in m/s
    base_speed: f64,

    /// Standard deviation of target speed across vehicles
    speed_std: f64,

    /// World tick in seconds
    dt: f64,
}

impl RoutePlanner {
    pub fn new(seed: u64, route_ticks: u64, dt: f64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            routes: HashMap::new(),
            route_ticks,
            horizon: 3,
            base_speed: 10.0,
            speed_std: 1.0,
            dt,
        }
    }

    /// Sets the nominal speed and the standard deviation across vehicles.
    pub fn with_speed(mut self, base_speed: f64, spread_std: f64) -> Self {
        self.base_speed = base_speed;
        self.speed_std = spread_std.max(0.0);
        self
    }

    pub fn with_horizon(mut self, horizon: usize) -> Self {
        self.horizon = horizon.max(1);
        self
    }

    pub fn route_ticks(&self) -> u64 {
        self.route_ticks
    }

    /// Builds the fragment for `session_index` at `tick_id`.
    pub fn fragment(&mut self, session_index: SessionIndex, tick_id: TickId) -> WaypointFragment {
        let rng = &mut self.rng;
        let (base_speed, speed_std) = (self.base_speed, self.speed_std);
        let route = self.routes.entry(session_index).or_insert_with(|| {
            let spread = Normal::new(0.0, speed_std)
                .map(|normal| normal.sample(rng))
                .unwrap_or(0.0);
            Route {
                first_tick: tick_id,
                lane_y: session_index as f64 * LANE_WIDTH,
                target_speed: (base_speed + spread).max(1.0),
            }
        });

        let step = tick_id.saturating_sub(route.first_tick);
        if step >= self.route_ticks {
            return WaypointFragment {
                tick_id,
                waypoints: Vec::new(),
                target_speed: 0.0,
            };
        }

        let spacing = route.target_speed * self.dt;
        let waypoints = (1..=self.horizon as u64)
            .map(|ahead| Vector3::new((step + ahead) as f64 * spacing, route.lane_y, 0.0))
            .collect();

        WaypointFragment {
            tick_id,
            waypoints,
            target_speed: route.target_speed,
        }
    }
}

impl WaypointSource for RoutePlanner {
    fn next_payload_for(&mut self, session_index: SessionIndex, tick_id: TickId) -> Payload {
        let fragment = self.fragment(session_index, tick_id);
        Payload::encode(&fragment).unwrap_or_else(|e| {
            warn!("Failed to encode waypoints for session {}: {}", session_index, e);
            Payload::empty()
        })
    }
}
