//! Scenario runner - executes lockstep scenarios against a full orchestrator.

use crate::config::SimConfig;
use crate::context::SimContext;
use crate::driver::TickDriver;
use crate::planner::RoutePlanner;
use crate::scenarios::ScenarioId;
use crate::vehicle::{Fault, SimulatedVehicle, VehicleDebug, VehicleState};

use ecloud_core::{
    AgentProxy, AgentUpdate, DoneReason, EcloudError, LocalTransport, Orchestrator,
    OrchestratorConfig, ProxyOutcome, RunDiagnostics, SessionIndex, TickId, TickReport,
};
use ecloud_env::{AgentIdentity, EcloudContext};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One accepted step update, decoded.
#[derive(Debug, Clone)]
pub struct VehicleSample {
    pub tick_id: TickId,
    pub session_index: SessionIndex,
    pub state: VehicleState,
}

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Completed step rounds
    pub total_ticks: u64,

    /// Final virtual time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    pub diagnostics: Option<RunDiagnostics>,
    pub reports: Vec<TickReport>,
    pub samples: Vec<VehicleSample>,
}

impl ScenarioResult {
    fn failed(scenario: ScenarioId, seed: u64, reason: String) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            failure_reason: Some(reason),
            diagnostics: None,
            reports: Vec::new(),
            samples: Vec::new(),
        }
    }
}

/// What a scenario run must look like to pass.
struct Expectation {
    faults: Vec<Fault>,
    first_tick: TickId,
    /// Ticks of driving before a route is exhausted
    route_ticks: u64,
    /// Driver tick budget
    max_ticks: u64,
}

impl Expectation {
    /// Last tick the driver will trigger.
    fn budget_last(&self) -> Option<TickId> {
        self.max_ticks.checked_sub(1).map(|n| self.first_tick + n)
    }

    /// Tick at which a vehicle leaves the barrier if the budget allows it.
    fn end_tick(&self, fault: Fault) -> TickId {
        let route_end = self.first_tick + self.route_ticks;
        match fault {
            Fault::FinishAt(at) | Fault::FailAt(at) | Fault::HangAt(at) => {
                at.max(self.first_tick).min(route_end)
            }
            Fault::None => route_end,
        }
    }

    fn within_budget(&self, tick_id: TickId) -> bool {
        self.budget_last().is_some_and(|last| tick_id <= last)
    }

    /// Done reason the vehicle must end with, and the tick it must end at.
    fn outcome(&self, fault: Fault) -> Option<(DoneReason, TickId)> {
        let end = self.end_tick(fault);
        if !self.within_budget(end) {
            return None;
        }
        let route_end = self.first_tick + self.route_ticks;
        let reason = match fault {
            Fault::HangAt(at) if at.max(self.first_tick) <= route_end => DoneReason::Unresponsive,
            Fault::FailAt(at) if at.max(self.first_tick) <= route_end => DoneReason::LocalFailure,
            _ => DoneReason::Finished,
        };
        Some((reason, end))
    }

    /// Completed step rounds.
    fn ticks(&self) -> u64 {
        let last_end = self
            .faults
            .iter()
            .map(|f| self.end_tick(*f))
            .max()
            .unwrap_or(self.first_tick);
        (last_end - self.first_tick + 1).min(self.max_ticks)
    }

    /// Vehicles that go silent before the run ends.
    fn hung(&self) -> usize {
        self.faults
            .iter()
            .filter(|f| matches!(self.outcome(**f), Some((DoneReason::Unresponsive, _))))
            .count()
    }
}

/// Runs lockstep scenarios.
pub struct ScenarioRunner {
    config: SimConfig,

    /// Grace period for proxies to report after the run ended
    collect_timeout: Duration,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_agents: usize) -> Self {
        Self::from_config(SimConfig {
            seed,
            num_agents,
            ..SimConfig::default()
        })
    }

    pub fn from_config(config: SimConfig) -> Self {
        Self {
            config,
            collect_timeout: Duration::from_secs(2),
        }
    }

    /// Sets the tick budget.
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.config.max_ticks = ticks;
        self
    }

    /// Sets the per-tick collection deadline.
    pub fn with_tick_timeout(mut self, timeout: Duration) -> Self {
        self.config.orchestrator.tick_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Uses `config` as the base orchestrator config.
    pub fn with_orchestrator_config(mut self, config: OrchestratorConfig) -> Self {
        self.config.orchestrator = config;
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Runs a scenario on a fresh runtime and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build();

        match runtime {
            Ok(runtime) => runtime.block_on(self.run_async(scenario)),
            Err(e) => ScenarioResult::failed(scenario, self.config.seed, format!("runtime: {}", e)),
        }
    }

    /// Runs a scenario on the current runtime.
    pub async fn run_async(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.config.seed);
        debug!("  {}", scenario.description());

        let expectation = self.expectation(scenario);
        match self.execute(scenario, &expectation).await {
            Ok(result) => result,
            Err(e) => ScenarioResult::failed(scenario, self.config.seed, e.to_string()),
        }
    }

    fn expectation(&self, scenario: ScenarioId) -> Expectation {
        let n = self.config.num_agents;
        let route_ticks = match scenario {
            ScenarioId::StepLimit => self.config.tick_budget().saturating_mul(4).max(1),
            _ => self.config.route_ticks,
        };

        Expectation {
            faults: (0..n).map(|v| scenario.fault_for(v, n)).collect(),
            first_tick: self.config.orchestrator.initial_tick_id,
            route_ticks,
            max_ticks: self.config.tick_budget(),
        }
    }

    async fn execute(
        &self,
        scenario: ScenarioId,
        expectation: &Expectation,
    ) -> Result<ScenarioResult, EcloudError> {
        let seed = self.config.seed;
        let context = SimContext::shared(seed);

        let planner = RoutePlanner::new(
            context.derive_seed(u64::MAX),
            expectation.route_ticks,
            self.config.dt(),
        )
        .with_speed(self.config.base_speed, 1.0);
        let noise_seed = context.derive_seed(u64::MAX - 1);

        let samples: Arc<Mutex<Vec<VehicleSample>>> = Arc::new(Mutex::new(Vec::new()));
        let telemetry = {
            let samples = Arc::clone(&samples);
            move |update: &AgentUpdate| {
                if let Ok(state) = update.payload.decode::<VehicleState>() {
                    if let Ok(mut samples) = samples.lock() {
                        samples.push(VehicleSample {
                            tick_id: update.tick_id,
                            session_index: update.session_index,
                            state,
                        });
                    }
                }
            }
        };

        let (mut orchestrator, handle) = Orchestrator::new(self.config.orchestrator_for(scenario.name()));
        let reports = orchestrator.tick_reports();
        let orchestrator = orchestrator
            .with_waypoints(planner)
            .with_telemetry(telemetry)
            .with_diagnostics(|diagnostics: &RunDiagnostics| {
                for session in &diagnostics.sessions {
                    let snapshot = diagnostics
                        .debug_payload(session.index)
                        .and_then(|payload| payload.decode::<VehicleDebug>().ok());
                    debug!(
                        "  session {} ({}): {:?} at {:?}, steps={:?} distance={:?}",
                        session.index,
                        session.identity,
                        session.done_reason,
                        session.done_at_tick,
                        snapshot.as_ref().map(|s| s.steps),
                        snapshot.as_ref().map(|s| s.distance)
                    );
                }
            });
        let orchestrator_task = tokio::spawn(orchestrator.run());

        // One proxy task per vehicle
        let transport = Arc::new(LocalTransport::new(handle.clone()));
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let mut identities = Vec::with_capacity(expectation.faults.len());

        for (vehicle, fault) in expectation.faults.iter().enumerate() {
            let vehicle_seed = context.derive_seed(vehicle as u64);
            let identity = AgentIdentity::from_seed(vehicle_seed);
            identities.push(identity);

            let step = SimulatedVehicle::new(noise_seed, self.config.dt())
                .with_speed_noise(self.config.speed_noise_std)
                .with_fault(*fault);
            let proxy = AgentProxy::new(Arc::clone(&context), Arc::clone(&transport), step, identity);

            let outcome_tx = outcome_tx.clone();
            context.spawn(&format!("vehicle-{}", vehicle), async move {
                let _ = outcome_tx.send((vehicle, proxy.run().await));
            });
        }
        drop(outcome_tx);

        let driver = TickDriver::new(Arc::clone(&context), handle.clone(), reports)
            .with_world_tick(self.config.world_tick())
            .with_first_tick(expectation.first_tick)
            .with_budget(expectation.max_ticks);
        drop(handle);
        let reports = driver.run().await?;

        let diagnostics = orchestrator_task
            .await
            .map_err(|e| EcloudError::Env(ecloud_env::EnvError::ContextError(e.to_string())))?;

        let hung = expectation.hung();
        let mut outcomes: HashMap<usize, Result<ProxyOutcome, EcloudError>> = HashMap::new();
        while outcomes.len() < expectation.faults.len() - hung {
            match tokio::time::timeout(self.collect_timeout, outcome_rx.recv()).await {
                Ok(Some((vehicle, outcome))) => {
                    outcomes.insert(vehicle, outcome);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("Timed out waiting for vehicle outcomes");
                    break;
                }
            }
        }

        let samples = samples.lock().map(|s| s.clone()).unwrap_or_default();
        let failure = evaluate(expectation, &identities, &diagnostics, &reports, &outcomes);

        let passed = failure.is_none();
        if passed {
            info!("✓ {} complete: {}", scenario.name(), diagnostics.summary());
        } else {
            warn!("✗ {} failed: {}", scenario.name(), failure.as_deref().unwrap_or("unknown"));
        }

        Ok(ScenarioResult {
            scenario,
            seed,
            passed,
            total_ticks: diagnostics.ticks_completed,
            final_time_secs: context.now().as_secs_f64(),
            failure_reason: failure,
            diagnostics: Some(diagnostics),
            reports,
            samples,
        })
    }
}

/// Writes the CI summary of `results` as pretty-printed JSON.
pub fn write_json_summary<W: Write>(mut writer: W, results: &[ScenarioResult]) -> std::io::Result<()> {
    let failed = results.iter().filter(|r| !r.passed).count();
    let summary = serde_json::json!({
        "total": results.len(),
        "passed": results.len() - failed,
        "failed": failed,
        "results": results.iter().map(|r| {
            let agents = r.diagnostics.as_ref().map_or(0, |d| d.sessions.len());
            serde_json::json!({
                "scenario": r.scenario.name(),
                "seed": r.seed,
                "passed": r.passed,
                "ticks": r.total_ticks,
                "time_secs": r.final_time_secs,
                "degraded": r.diagnostics.as_ref().map(|d| d.is_degraded()),
                "expected_degraded": r.scenario.expects_degraded(agents),
                "failure_reason": r.failure_reason,
            })
        }).collect::<Vec<_>>(),
    });
    serde_json::to_writer_pretty(&mut writer, &summary)?;
    writeln!(writer)
}

/// Checks a finished run against its expectation. Returns the first failure.
fn evaluate(
    expectation: &Expectation,
    identities: &[AgentIdentity],
    diagnostics: &RunDiagnostics,
    reports: &[TickReport],
    outcomes: &HashMap<usize, Result<ProxyOutcome, EcloudError>>,
) -> Option<String> {
    if let Some(window) = reports.windows(2).find(|w| w[1].tick_id != w[0].tick_id + 1) {
        return Some(format!(
            "Tick ids not consecutive: {} then {}",
            window[0].tick_id, window[1].tick_id
        ));
    }

    let ticks = expectation.ticks();
    if diagnostics.ticks_completed != ticks {
        return Some(format!(
            "Expected {} ticks, completed {}",
            ticks, diagnostics.ticks_completed
        ));
    }

    for (vehicle, (fault, identity)) in expectation.faults.iter().zip(identities).enumerate() {
        let Some(session) = diagnostics.sessions.iter().find(|s| s.identity == *identity) else {
            return Some(format!("Vehicle {} never registered", vehicle));
        };

        let expected = expectation.outcome(*fault);
        let actual = session.done_reason.zip(session.done_at_tick);
        if actual != expected {
            return Some(format!(
                "Vehicle {} (session {}) ended {:?}, expected {:?}",
                vehicle, session.index, actual, expected
            ));
        }

        if let Some((_, end)) = expected {
            // Nothing from the vehicle after it left the barrier
            if reports
                .iter()
                .any(|r| r.tick_id > end && r.replied.contains(&session.index))
            {
                return Some(format!("Vehicle {} answered after leaving at tick {}", vehicle, end));
            }
        }

        if matches!(expected, Some((DoneReason::Unresponsive, _))) {
            continue;
        }
        match outcomes.get(&vehicle) {
            Some(Ok(outcome)) if outcome.ended_cleanly && outcome.debug_answered => {}
            Some(Ok(outcome)) => {
                return Some(format!(
                    "Vehicle {} did not end cleanly (ended={}, debug={})",
                    vehicle, outcome.ended_cleanly, outcome.debug_answered
                ));
            }
            Some(Err(e)) => return Some(format!("Vehicle {} failed: {}", vehicle, e)),
            None => return Some(format!("Vehicle {} never reported an outcome", vehicle)),
        }
    }

    let hung = expectation.hung();
    if diagnostics.unresponsive.len() != hung {
        return Some(format!(
            "Expected {} unresponsive sessions, got {:?}",
            hung, diagnostics.unresponsive
        ));
    }
    if diagnostics.is_degraded() != (hung > 0) {
        return Some("Degraded flag does not match the injected faults".to_string());
    }

    None
}
