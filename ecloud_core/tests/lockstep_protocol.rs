//! End-to-end protocol tests over the orchestrator handle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ecloud_core::{
    Ack, AgentProxy, AgentUpdate, Command, DoneReason, EcloudError, LocalTransport, Orchestrator,
    OrchestratorConfig, OrchestratorHandle, Payload, RunDiagnostics, StepComputation, StepError,
    StepInput, StepResult, TickId, TickMessage, TickReport,
};
use ecloud_env::{AgentIdentity, TokioContext};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;

/// Orchestrator plus manually driven agents.
struct Harness {
    handle: OrchestratorHandle,
    reports: mpsc::UnboundedReceiver<TickReport>,
    streams: Vec<mpsc::Receiver<TickMessage>>,
    run: JoinHandle<RunDiagnostics>,
}

impl Harness {
    async fn start(config: OrchestratorConfig) -> Self {
        let agents = config.expected_agents as u64;
        let (mut orchestrator, handle) = Orchestrator::new(config);
        let reports = orchestrator.tick_reports();
        let run = tokio::spawn(orchestrator.run());

        let mut streams = Vec::new();
        for seed in 0..agents {
            let reg = handle.register(AgentIdentity::from_seed(seed)).await.unwrap();
            streams.push(handle.subscribe(reg.assigned_index).await.unwrap());
        }

        Self {
            handle,
            reports,
            streams,
            run,
        }
    }

    async fn expect(&mut self, index: usize, tick: TickId, command: Command) {
        let msg = self.streams[index].recv().await.unwrap();
        assert_eq!((msg.tick_id, msg.command), (tick, command), "session {}", index);
    }

    async fn answer(&self, index: usize, tick: TickId, done: bool) -> Ack {
        self.handle
            .submit_update(AgentUpdate::step(tick, index, Payload::empty(), done))
            .await
            .unwrap()
    }

    /// Triggers `tick`, lets `agents` answer (those in `done` finish) and
    /// returns the report.
    async fn run_tick(&mut self, tick: TickId, agents: &[usize], done: &[usize]) -> TickReport {
        self.handle.push_trigger(tick).unwrap();
        for &index in agents {
            self.expect(index, tick, Command::Step).await;
        }
        for &index in agents {
            assert!(self.answer(index, tick, done.contains(&index)).await.accepted);
        }
        self.reports.recv().await.unwrap()
    }

    async fn answer_debug(&mut self, agents: &[usize], tick: TickId) {
        for &index in agents {
            self.expect(index, tick, Command::RequestDebug).await;
            let snapshot = Payload::encode(&serde_json::json!({ "session": index })).unwrap();
            let ack = self
                .handle
                .submit_update(AgentUpdate::debug(tick, index, snapshot))
                .await
                .unwrap();
            assert!(ack.accepted);
        }
    }
}

#[tokio::test]
async fn barrier_waits_for_every_active_agent() {
    let mut h = Harness::start(OrchestratorConfig::new(3)).await;

    h.handle.push_trigger(0).unwrap();
    for index in 0..3 {
        h.expect(index, 0, Command::Step).await;
    }

    assert!(h.answer(0, 0, false).await.accepted);
    assert!(h.answer(1, 0, false).await.accepted);
    assert!(matches!(h.reports.try_recv(), Err(TryRecvError::Empty)));

    assert!(h.answer(2, 0, false).await.accepted);
    let report = h.reports.recv().await.unwrap();
    assert_eq!(report.tick_id, 0);
    assert_eq!(report.replied, vec![0, 1, 2]);

    // Next trigger broadcasts tick 1 to everyone
    h.handle.push_trigger(1).unwrap();
    for index in 0..3 {
        h.expect(index, 1, Command::Step).await;
    }

    h.handle.abort().await.unwrap();
    let diagnostics = h.run.await.unwrap();
    assert_eq!(diagnostics.ticks_completed, 1);
    assert_eq!(diagnostics.final_tick_id, 2);
}

#[tokio::test]
async fn done_agent_is_excused_from_later_ticks() {
    let mut h = Harness::start(OrchestratorConfig::new(3)).await;

    for tick in 0..5 {
        h.run_tick(tick, &[0, 1, 2], &[]).await;
    }
    let report = h.run_tick(5, &[0, 1, 2], &[1]).await;
    assert_eq!(report.completed, vec![1]);
    assert_eq!(report.active_remaining, 2);

    let report = h.run_tick(6, &[0, 2], &[]).await;
    assert_eq!(report.tick_id, 6);
    assert_eq!(report.replied, vec![0, 2]);

    // The done agent saw no broadcast for tick 6
    assert!(matches!(h.streams[1].try_recv(), Err(TryRecvError::Empty)));

    h.handle.abort().await.unwrap();
    let diagnostics = h.run.await.unwrap();
    let session = diagnostics.session(1).unwrap();
    assert_eq!(session.done_reason, Some(DoneReason::Finished));
    assert_eq!(session.done_at_tick, Some(5));
    assert_eq!(session.last_acked_tick, Some(5));
}

#[tokio::test]
async fn all_done_ends_with_one_debug_and_one_end() {
    let mut h = Harness::start(OrchestratorConfig::new(3)).await;
    let mut seen: Vec<Vec<TickId>> = vec![Vec::new(); 3];

    let finish_at = [4, 10, 7];
    let mut active = vec![0, 1, 2];
    for tick in 0..=10 {
        let done: Vec<usize> = active.iter().copied().filter(|&i| finish_at[i] == tick).collect();
        let report = h.run_tick(tick, &active, &done).await;
        for &index in &active {
            seen[index].push(tick);
        }
        assert_eq!(report.completed, done);
        active.retain(|i| !done.contains(i));
    }
    assert!(active.is_empty());

    // Done sessions still answer the debug request
    h.answer_debug(&[0, 1, 2], 11).await;

    for (index, stream) in h.streams.iter_mut().enumerate() {
        let mut debug_requests = 0;
        let mut ends = 0;
        while let Some(msg) = stream.recv().await {
            seen[index].push(msg.tick_id);
            match msg.command {
                Command::RequestDebug => debug_requests += 1,
                Command::End => ends += 1,
                Command::Step => panic!("unexpected STEP after the run ended"),
            }
        }
        // The debug request was consumed by answer_debug
        assert_eq!(debug_requests, 0);
        assert_eq!(ends, 1);
    }

    // Strictly increasing tick ids per session
    for ticks in &seen {
        assert!(ticks.windows(2).all(|w| w[0] < w[1]), "{:?}", ticks);
    }

    let diagnostics = h.run.await.unwrap();
    assert_eq!(diagnostics.ticks_completed, 11);
    assert_eq!(diagnostics.final_tick_id, 12);
    assert!(diagnostics.missing_debug.is_empty());
    assert!(diagnostics.sessions.iter().all(|s| s.answered_debug));
    assert_eq!(diagnostics.session(2).unwrap().debug_snapshot.as_ref().unwrap()["session"], 2);
    assert!(!diagnostics.is_degraded());
}

#[tokio::test(start_paused = true)]
async fn silent_agent_is_excused_and_reported() {
    let config = OrchestratorConfig::new(3)
        .with_tick_timeout(Duration::from_millis(500))
        .with_debug_timeout(Duration::from_millis(200));
    let mut h = Harness::start(config).await;

    for tick in 0..7 {
        h.run_tick(tick, &[0, 1, 2], &[]).await;
    }

    // Agent 2 stops answering at tick 7
    h.handle.push_trigger(7).unwrap();
    for index in 0..3 {
        h.expect(index, 7, Command::Step).await;
    }
    h.answer(0, 7, false).await;
    h.answer(1, 7, false).await;

    let report = h.reports.recv().await.unwrap();
    assert_eq!(report.tick_id, 7);
    assert_eq!(report.excused, vec![2]);
    assert_eq!(report.active_remaining, 2);

    // A late answer is a protocol violation, not a count
    assert!(!h.answer(2, 7, false).await.accepted);

    let report = h.run_tick(8, &[0, 1], &[0, 1]).await;
    assert_eq!(report.active_remaining, 0);

    // The unresponsive agent is not asked for debug
    h.answer_debug(&[0, 1], 9).await;
    h.expect(2, 10, Command::End).await;

    let diagnostics = h.run.await.unwrap();
    assert_eq!(diagnostics.unresponsive, vec![2]);
    assert!(diagnostics.is_degraded());
    assert_eq!(diagnostics.session(2).unwrap().done_reason, Some(DoneReason::Unresponsive));
    assert_eq!(diagnostics.session(2).unwrap().done_at_tick, Some(7));
    assert_eq!(diagnostics.protocol.stale_updates, 1);
}

#[tokio::test]
async fn duplicate_and_stale_updates_are_dropped() {
    let mut h = Harness::start(OrchestratorConfig::new(2)).await;

    h.handle.push_trigger(0).unwrap();
    h.expect(0, 0, Command::Step).await;
    h.expect(1, 0, Command::Step).await;

    assert!(h.answer(0, 0, false).await.accepted);
    assert!(!h.answer(0, 0, false).await.accepted);
    // Future tick
    assert!(!h.answer(1, 3, false).await.accepted);
    assert!(matches!(h.reports.try_recv(), Err(TryRecvError::Empty)));

    assert!(h.answer(1, 0, false).await.accepted);
    let report = h.reports.recv().await.unwrap();
    assert_eq!(report.replied, vec![0, 1]);

    // Stale tick once the round moved on
    assert!(!h.answer(1, 0, false).await.accepted);

    h.handle.abort().await.unwrap();
    let diagnostics = h.run.await.unwrap();
    assert_eq!(diagnostics.protocol.duplicate_updates, 1);
    assert_eq!(diagnostics.protocol.stale_updates, 2);
}

#[tokio::test]
async fn second_trigger_before_take_is_rejected() {
    let h = Harness::start(OrchestratorConfig::new(1)).await;

    // The orchestrator task cannot run between these two calls
    h.handle.push_trigger(0).unwrap();
    let err = h.handle.push_trigger(1).unwrap_err();
    assert!(matches!(err, EcloudError::MailboxFull));

    h.handle.abort().await.unwrap();
    h.run.await.unwrap();
}

#[tokio::test]
async fn registration_errors_surface_to_callers() {
    let (orchestrator, handle) = Orchestrator::new(OrchestratorConfig::new(2));
    let run = tokio::spawn(orchestrator.run());

    let id = AgentIdentity::from_seed(42);
    handle.register(id).await.unwrap();
    let dup = handle.register(id).await.unwrap_err();
    assert!(matches!(dup, EcloudError::DuplicateRegistration(d) if d == id));

    handle.register(AgentIdentity::from_seed(43)).await.unwrap();
    let late = handle.register(AgentIdentity::from_seed(44)).await.unwrap_err();
    assert!(matches!(late, EcloudError::RegistryClosed(_)));

    handle.abort().await.unwrap();
    run.await.unwrap();

    let closed = handle.register(AgentIdentity::from_seed(45)).await.unwrap_err();
    assert!(matches!(closed, EcloudError::OrchestratorClosed));
}

#[tokio::test]
async fn abort_during_collection_ends_after_open_tick() {
    let mut h = Harness::start(OrchestratorConfig::new(2)).await;

    h.run_tick(0, &[0, 1], &[]).await;
    h.handle.push_trigger(1).unwrap();
    h.expect(0, 1, Command::Step).await;
    h.answer(0, 1, false).await;

    h.handle.abort().await.unwrap();
    h.expect(0, 2, Command::End).await;
    h.expect(1, 1, Command::Step).await;
    h.expect(1, 2, Command::End).await;

    let diagnostics = h.run.await.unwrap();
    assert!(diagnostics.aborted);
    assert!(diagnostics.is_degraded());
    assert_eq!(diagnostics.ticks_completed, 1);
}

/// Drives a fixed number of steps, echoing the waypoint it was given.
struct Convoy {
    steps: u32,
    seen: u32,
}

#[async_trait]
impl StepComputation for Convoy {
    async fn compute_step(&mut self, input: StepInput) -> Result<StepResult, StepError> {
        self.seen += 1;
        let value = input.instruction.unwrap_or_default();
        if self.seen >= self.steps {
            Ok(StepResult::terminal(value))
        } else {
            Ok(StepResult::running(value))
        }
    }

    fn diagnostics(&self) -> Payload {
        Payload::encode(&serde_json::json!({ "seen": self.seen })).unwrap_or_default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxies_run_full_protocol() {
    let (mut orchestrator, handle) = Orchestrator::new(OrchestratorConfig::new(4));
    let mut reports = orchestrator.tick_reports();
    let orchestrator = orchestrator.with_waypoints(|index: usize, tick: TickId| {
        Payload::encode(&(index, tick)).unwrap_or_default()
    });
    let run = tokio::spawn(orchestrator.run());

    let transport = Arc::new(LocalTransport::new(handle.clone()));
    let context = TokioContext::shared();
    let clients: Vec<_> = (0..4u32)
        .map(|i| {
            let proxy = AgentProxy::new(
                Arc::clone(&context),
                Arc::clone(&transport),
                Convoy { steps: 3 + i, seen: 0 },
                AgentIdentity::from_seed(100 + i as u64),
            );
            tokio::spawn(proxy.run())
        })
        .collect();

    let mut tick = 0;
    loop {
        handle.push_trigger(tick).unwrap();
        let report = reports.recv().await.unwrap();
        assert_eq!(report.tick_id, tick);
        if report.active_remaining == 0 {
            break;
        }
        tick += 1;
    }

    let mut steps = Vec::new();
    for client in clients {
        let outcome = client.await.unwrap().unwrap();
        assert!(outcome.finished);
        assert!(outcome.debug_answered);
        assert!(outcome.ended_cleanly);
        steps.push(outcome.steps_computed);
    }
    steps.sort_unstable();
    assert_eq!(steps, vec![3, 4, 5, 6]);

    let diagnostics = run.await.unwrap();
    assert_eq!(diagnostics.ticks_completed, 6);
    assert_eq!(diagnostics.count_done(DoneReason::Finished), 4);
    assert_eq!(diagnostics.client_step.samples, 3 + 4 + 5 + 6);
    assert!(!diagnostics.is_degraded());
}
