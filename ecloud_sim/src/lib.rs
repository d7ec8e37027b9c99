//! eCloud Lockstep Simulation Harness
//!
//! This crate drives the full eCloud orchestrator against simulated vehicle
//! clients, deterministically where it matters.
//!
//! # Core Principle: One World Tick, One Barrier
//!
//! The world advances only after every ACTIVE vehicle has answered:
//! - **Time**: Virtual clock advances by the world tick after each barrier
//! - **Clients**: Each vehicle runs its own [`ecloud_core::AgentProxy`] task
//! - **Randomness**: Routes and speed jitter derive from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ScenarioRunner                        │
//! │  ┌──────────────┐  trigger  ┌──────────────────────────┐    │
//! │  │  TickDriver  │──────────►│      Orchestrator        │    │
//! │  │ (world tick) │◄──────────│ (barrier + RoutePlanner) │    │
//! │  └──────────────┘  report   └──────────────────────────┘    │
//! │                              │ STEP/DEBUG/END    ▲ updates  │
//! │                         ┌────▼────┐         ┌────┴────┐     │
//! │                         │ Vehicle │   ...   │ Vehicle │     │
//! │                         │   #0    │         │   #N    │     │
//! │                         └─────────┘         └─────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use ecloud_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 4).run(ScenarioId::Mixed);
//! assert!(result.passed);
//! ```

mod config;
mod context;
mod driver;
mod exporter;
mod planner;
mod runner;
pub mod scenarios;
mod vehicle;

pub use config::SimConfig;
pub use context::SimContext;
pub use driver::TickDriver;
pub use exporter::{SimExport, TickFrame, VehiclePosition};
pub use planner::{RoutePlanner, WaypointFragment, LANE_WIDTH};
pub use runner::{write_json_summary, ScenarioResult, ScenarioRunner, VehicleSample};
pub use vehicle::{Fault, SimulatedVehicle, VehicleDebug, VehicleState};
