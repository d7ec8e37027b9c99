//! Interfaces to the domain logic that plugs into the lockstep core.
//!
//! The core never looks inside a step, a waypoint or a debug snapshot:
//!
//! - [`StepComputation`] runs on the client, once per STEP broadcast
//! - [`WaypointSource`] runs on the orchestrator, once per session per tick
//! - [`TelemetrySink`] receives every accepted step update
//! - [`DiagnosticsSink`] receives the final run diagnostics

use async_trait::async_trait;
use thiserror::Error;

use crate::diagnostics::RunDiagnostics;
use crate::protocol::{AgentUpdate, Payload, Registration, SessionIndex, TickId};

/// Input for one step.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub tick_id: TickId,
    /// Per-agent instruction broadcast with the tick.
    pub instruction: Option<Payload>,
}

/// Outcome of one step.
///
/// `is_terminal` replaces any in-band "simulation is over" marker: the
/// value is always a real result.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub value: Payload,
    pub is_terminal: bool,
}

impl StepResult {
    /// A step that keeps the agent in the run.
    pub fn running(value: Payload) -> Self {
        Self {
            value,
            is_terminal: false,
        }
    }

    /// The agent's final step.
    pub fn terminal(value: Payload) -> Self {
        Self {
            value,
            is_terminal: true,
        }
    }
}

/// Unrecoverable local failure of a step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Step computation failed: {0}")]
    Failed(String),

    #[error("Malformed instruction: {0}")]
    Instruction(#[from] serde_json::Error),
}

impl StepError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Per-agent simulation step (physics, perception, planning, control).
#[async_trait]
pub trait StepComputation: Send + 'static {
    /// Called once with the registration reply, before the first tick.
    fn on_registered(&mut self, _registration: &Registration) {}

    /// Computes one step.
    async fn compute_step(&mut self, input: StepInput) -> Result<StepResult, StepError>;

    /// Diagnostic snapshot returned for REQUEST_DEBUG.
    fn diagnostics(&self) -> Payload;

    /// Result reported in place of a failed step (a stopped vehicle).
    fn neutral_result(&self) -> Payload {
        Payload::empty()
    }
}

/// Orchestrator-side source of the per-agent instruction for each tick.
pub trait WaypointSource: Send + 'static {
    fn next_payload_for(&mut self, session_index: SessionIndex, tick_id: TickId) -> Payload;
}

impl<F> WaypointSource for F
where
    F: FnMut(SessionIndex, TickId) -> Payload + Send + 'static,
{
    fn next_payload_for(&mut self, session_index: SessionIndex, tick_id: TickId) -> Payload {
        (*self)(session_index, tick_id)
    }
}

/// Receives every step update counted by a barrier.
pub trait TelemetrySink: Send + 'static {
    fn on_update(&mut self, update: &AgentUpdate);
}

impl<F> TelemetrySink for F
where
    F: FnMut(&AgentUpdate) + Send + 'static,
{
    fn on_update(&mut self, update: &AgentUpdate) {
        (*self)(update)
    }
}

/// Receives the diagnostics of a finished run.
pub trait DiagnosticsSink: Send + 'static {
    fn on_finished(&mut self, diagnostics: &RunDiagnostics);
}

impl<F> DiagnosticsSink for F
where
    F: FnMut(&RunDiagnostics) + Send + 'static,
{
    fn on_finished(&mut self, diagnostics: &RunDiagnostics) {
        (*self)(diagnostics)
    }
}
