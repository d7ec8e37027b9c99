//! Tick driver - the world-simulation side of the trigger mailbox.
//!
//! ```text
//! loop:
//!   push_trigger(T) --> wait for TickReport(T) --> world tick (sleep dt) --> T + 1
//! ```

use ecloud_core::{EcloudError, OrchestratorHandle, TickId, TickReport};
use ecloud_env::EcloudContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Advances the orchestrator one tick at a time.
pub struct TickDriver<Ctx> {
    context: Arc<Ctx>,
    handle: OrchestratorHandle,
    reports: mpsc::UnboundedReceiver<TickReport>,

    /// World tick slept between rounds
    world_tick: Duration,

    /// Rounds after which the driver asks for a graceful finish
    budget: Option<u64>,

    first_tick: TickId,
}

impl<Ctx: EcloudContext> TickDriver<Ctx> {
    pub fn new(
        context: Arc<Ctx>,
        handle: OrchestratorHandle,
        reports: mpsc::UnboundedReceiver<TickReport>,
    ) -> Self {
        Self {
            context,
            handle,
            reports,
            world_tick: Duration::from_millis(50),
            budget: None,
            first_tick: 0,
        }
    }

    pub fn with_world_tick(mut self, world_tick: Duration) -> Self {
        self.world_tick = world_tick;
        self
    }

    /// Calls `finish()` after `ticks` completed rounds.
    pub fn with_budget(mut self, ticks: u64) -> Self {
        self.budget = Some(ticks);
        self
    }

    pub fn with_first_tick(mut self, tick_id: TickId) -> Self {
        self.first_tick = tick_id;
        self
    }

    /// Drives ticks until every vehicle is done, the budget is spent or
    /// the orchestrator stops. Returns the reports in tick order.
    pub async fn run(mut self) -> Result<Vec<TickReport>, EcloudError> {
        let mut collected: Vec<TickReport> = Vec::new();
        let mut next_tick = self.first_tick;

        loop {
            if let Some(budget) = self.budget {
                if collected.len() as u64 >= budget {
                    info!("Tick budget of {} spent, finishing", budget);
                    match self.handle.finish().await {
                        Ok(()) | Err(EcloudError::OrchestratorClosed) => break,
                        Err(e) => return Err(e),
                    }
                }
            }

            match self.handle.push_trigger(next_tick) {
                Ok(_) => {}
                Err(EcloudError::OrchestratorClosed) => break,
                Err(e) => return Err(e),
            }

            let Some(report) = self.reports.recv().await else {
                debug!("Report stream closed after {} ticks", collected.len());
                break;
            };

            self.context.sleep(self.world_tick).await;

            next_tick = report.tick_id + 1;
            let remaining = report.active_remaining;
            collected.push(report);

            if remaining == 0 {
                debug!("No active vehicles left after tick {}", next_tick - 1);
                break;
            }
        }

        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SimContext;
    use ecloud_core::{AgentUpdate, Command, Orchestrator, OrchestratorConfig, Payload};
    use ecloud_env::AgentIdentity;

    /// Answers every STEP immediately; finishes after `steps`.
    async fn echo_agent(handle: OrchestratorHandle, seed: u64, steps: u64) {
        let reg = handle.register(AgentIdentity::from_seed(seed)).await.unwrap();
        let mut stream = handle.subscribe(reg.assigned_index).await.unwrap();
        let mut answered = 0;
        while let Some(msg) = stream.recv().await {
            let update = match msg.command {
                Command::Step => {
                    answered += 1;
                    AgentUpdate::step(msg.tick_id, reg.assigned_index, Payload::empty(), answered >= steps)
                }
                Command::RequestDebug => AgentUpdate::debug(msg.tick_id, reg.assigned_index, Payload::empty()),
                Command::End => break,
            };
            handle.submit_update(update).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_driver_runs_until_all_done() {
        let (mut orchestrator, handle) = Orchestrator::new(OrchestratorConfig::new(2));
        let reports = orchestrator.tick_reports();
        let run = tokio::spawn(orchestrator.run());
        tokio::spawn(echo_agent(handle.clone(), 1, 3));
        tokio::spawn(echo_agent(handle.clone(), 2, 5));

        let context = SimContext::shared(9);
        let driver = TickDriver::new(Arc::clone(&context), handle, reports)
            .with_world_tick(Duration::from_millis(50));
        let reports = driver.run().await.unwrap();

        let ticks: Vec<TickId> = reports.iter().map(|r| r.tick_id).collect();
        assert_eq!(ticks, vec![0, 1, 2, 3, 4]);
        assert_eq!(reports[2].active_remaining, 1);
        assert_eq!(context.now(), Duration::from_millis(250));

        let diagnostics = run.await.unwrap();
        assert_eq!(diagnostics.ticks_completed, 5);
    }

    #[tokio::test]
    async fn test_driver_budget_finishes_run() {
        let (mut orchestrator, handle) = Orchestrator::new(OrchestratorConfig::new(1));
        let reports = orchestrator.tick_reports();
        let run = tokio::spawn(orchestrator.run());
        tokio::spawn(echo_agent(handle.clone(), 1, 1_000));

        let driver = TickDriver::new(SimContext::shared(9), handle, reports).with_budget(4);
        let reports = driver.run().await.unwrap();
        assert_eq!(reports.len(), 4);

        let diagnostics = run.await.unwrap();
        assert_eq!(diagnostics.ticks_completed, 4);
        assert_eq!(diagnostics.final_tick_id, 5);
        assert!(diagnostics.session(0).unwrap().answered_debug);
        assert_eq!(diagnostics.session(0).unwrap().done_reason, None);
    }
}
