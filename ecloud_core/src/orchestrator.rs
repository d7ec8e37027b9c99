//! Lockstep orchestrator.
//!
//! A single task owns the session registry and the open barrier round and
//! reacts to three event sources:
//!
//! ```text
//!   requests (register / subscribe / update / finish / abort)
//!        |
//!        v
//!  +-------------+   trigger    +--------------+  barrier met   +------------------+
//!  | REGISTERING |--cohort----->| AWAITING     |--------------->| BROADCASTING     |
//!  +-------------+   complete   | TRIGGER      |<---------------| -> COLLECTING    |
//!                               +--------------+   tick += 1    +------------------+
//!                                      |                               |
//!                                      | finish                        | all DONE / finish / max_ticks
//!                                      v                               v
//!                               +------------------------------------------+
//!                               | TERMINATING: REQUEST_DEBUG, then END     |----> FINISHED
//!                               +------------------------------------------+
//! ```
//!
//! Per-update protocol violations are dropped, logged and counted; they
//! never stop the loop.

use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use ecloud_env::AgentIdentity;

use crate::barrier::TickBarrier;
use crate::collaborators::{DiagnosticsSink, TelemetrySink, WaypointSource};
use crate::config::OrchestratorConfig;
use crate::diagnostics::{LatencyStats, ProtocolCounters, RunDiagnostics, SessionReport, TickReport};
use crate::error::EcloudError;
use crate::mailbox::TriggerMailbox;
use crate::protocol::{
    Ack, AgentUpdate, ClientTimestamps, Command, Payload, Registration, SessionIndex, TickId,
    TickMessage, Trigger, UpdateKind,
};
use crate::registry::{DoneReason, SessionRegistry};

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorPhase {
    /// Waiting for the cohort to register
    Registering,
    /// Suspended on the trigger mailbox
    AwaitingTrigger,
    /// Sending the STEP broadcast for the current tick
    Broadcasting,
    /// Waiting for every ACTIVE session to answer
    Collecting,
    /// Collecting debug snapshots before END
    Terminating,
    /// END was broadcast
    Finished,
}

#[derive(Debug)]
enum Request {
    Register {
        identity: AgentIdentity,
        reply: oneshot::Sender<Result<Registration, EcloudError>>,
    },
    Subscribe {
        index: SessionIndex,
        reply: oneshot::Sender<Result<mpsc::Receiver<TickMessage>, EcloudError>>,
    },
    Update {
        update: AgentUpdate,
        reply: oneshot::Sender<Ack>,
    },
    Finish,
    Abort,
}

enum Event {
    Request(Request),
    Trigger(Trigger),
    Deadline,
    MailboxClosed,
    HandlesDropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    Dropped,
    Disconnected,
}

/// Per-round bookkeeping that ends up in the [`TickReport`].
#[derive(Debug, Default)]
struct RoundLog {
    completed: Vec<SessionIndex>,
    excused: Vec<SessionIndex>,
    timestamps: Vec<(SessionIndex, ClientTimestamps)>,
}

/// Drives the lockstep protocol for one run.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: SessionRegistry,
    phase: OrchestratorPhase,
    tick_id: TickId,
    barrier: Option<TickBarrier>,
    deadline: Option<Instant>,
    round_started: Option<Instant>,
    round: RoundLog,
    finish_requested: bool,

    requests: mpsc::Receiver<Request>,
    mailbox: Arc<TriggerMailbox>,

    /// Broadcast senders by session index
    streams: Vec<mpsc::Sender<TickMessage>>,
    /// Receivers not yet claimed by a subscriber
    unclaimed: Vec<Option<mpsc::Receiver<TickMessage>>>,

    waypoints: Box<dyn WaypointSource>,
    telemetry: Box<dyn TelemetrySink>,
    diagnostics_sink: Box<dyn DiagnosticsSink>,
    reports: Option<mpsc::UnboundedSender<TickReport>>,

    ticks_completed: u64,
    final_tick_id: TickId,
    aborted: bool,
    unresponsive: Vec<SessionIndex>,
    missing_debug: Vec<SessionIndex>,
    protocol: ProtocolCounters,
    client_step: LatencyStats,
    tick_wall: LatencyStats,
}

impl Orchestrator {
    /// Creates an orchestrator and the handle used to talk to it.
    pub fn new(config: OrchestratorConfig) -> (Self, OrchestratorHandle) {
        let (tx, rx) = mpsc::channel(config.request_capacity.max(1));
        let mailbox = TriggerMailbox::shared();

        let orchestrator = Self {
            registry: SessionRegistry::new(config.expected_agents),
            phase: OrchestratorPhase::Registering,
            tick_id: config.initial_tick_id,
            barrier: None,
            deadline: None,
            round_started: None,
            round: RoundLog::default(),
            finish_requested: false,
            requests: rx,
            mailbox: Arc::clone(&mailbox),
            streams: Vec::new(),
            unclaimed: Vec::new(),
            waypoints: Box::new(|_: SessionIndex, _: TickId| Payload::empty()),
            telemetry: Box::new(|_: &AgentUpdate| {}),
            diagnostics_sink: Box::new(|_: &RunDiagnostics| {}),
            reports: None,
            ticks_completed: 0,
            final_tick_id: config.initial_tick_id,
            aborted: false,
            unresponsive: Vec::new(),
            missing_debug: Vec::new(),
            protocol: ProtocolCounters::default(),
            client_step: LatencyStats::default(),
            tick_wall: LatencyStats::default(),
            config,
        };

        let handle = OrchestratorHandle {
            requests: tx,
            mailbox,
        };

        (orchestrator, handle)
    }

    pub fn with_waypoints(mut self, source: impl WaypointSource) -> Self {
        self.waypoints = Box::new(source);
        self
    }

    pub fn with_telemetry(mut self, sink: impl TelemetrySink) -> Self {
        self.telemetry = Box::new(sink);
        self
    }

    pub fn with_diagnostics(mut self, sink: impl DiagnosticsSink) -> Self {
        self.diagnostics_sink = Box::new(sink);
        self
    }

    /// Returns a stream of reports, one per completed STEP round.
    ///
    /// Only the most recent receiver gets reports. The stream ends when the
    /// run ends.
    pub fn tick_reports(&mut self) -> mpsc::UnboundedReceiver<TickReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.reports = Some(tx);
        rx
    }

    pub fn phase(&self) -> OrchestratorPhase {
        self.phase
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Runs the event loop until END has been broadcast.
    pub async fn run(mut self) -> RunDiagnostics {
        info!(
            "Orchestrator started: scenario={} agents={} tick_timeout={}ms",
            self.config.scenario.name, self.config.expected_agents, self.config.tick_timeout_ms
        );

        if self.registry.is_cohort_complete() {
            self.activate();
        }

        while self.phase != OrchestratorPhase::Finished {
            match self.next_event().await {
                Event::Request(request) => self.handle_request(request),
                Event::Trigger(trigger) => self.begin_tick(trigger),
                Event::Deadline => self.expire_round(),
                Event::MailboxClosed => {
                    info!("Trigger mailbox closed, finishing run");
                    self.begin_debug_round();
                }
                Event::HandlesDropped => {
                    warn!("All orchestrator handles dropped");
                    self.abort();
                }
            }
        }

        self.mailbox.close();
        let diagnostics = self.build_diagnostics();
        info!("Run finished: {}", diagnostics.summary());
        self.diagnostics_sink.on_finished(&diagnostics);
        diagnostics
    }

    async fn next_event(&mut self) -> Event {
        let mailbox = Arc::clone(&self.mailbox);
        let awaiting_trigger = self.phase == OrchestratorPhase::AwaitingTrigger;
        let deadline = self.deadline;

        tokio::select! {
            request = self.requests.recv() => match request {
                Some(request) => Event::Request(request),
                None => Event::HandlesDropped,
            },
            trigger = mailbox.take(), if awaiting_trigger => match trigger {
                Some(trigger) => Event::Trigger(trigger),
                None => Event::MailboxClosed,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Event::Deadline,
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Register { identity, reply } => {
                let result = self.register(identity);
                let _ = reply.send(result);
                if self.phase == OrchestratorPhase::Registering && self.registry.is_cohort_complete() {
                    self.activate();
                }
            }
            Request::Subscribe { index, reply } => {
                let _ = reply.send(self.subscribe(index));
            }
            Request::Update { update, reply } => {
                let ack = self.handle_update(update);
                let _ = reply.send(ack);
            }
            Request::Finish => self.request_finish(),
            Request::Abort => self.abort(),
        }
    }

    fn register(&mut self, identity: AgentIdentity) -> Result<Registration, EcloudError> {
        let index = self.registry.register(identity).map_err(|e| {
            warn!("Rejected registration: {}", e);
            e
        })?;

        let (tx, rx) = mpsc::channel(self.config.stream_capacity.max(1));
        self.streams.push(tx);
        self.unclaimed.push(Some(rx));

        info!(
            "Registered agent {} as session {} ({}/{})",
            identity,
            index,
            self.registry.len(),
            self.registry.expected()
        );

        Ok(Registration {
            assigned_index: index,
            initial_tick_id: self.config.initial_tick_id,
            scenario: self.config.scenario.clone(),
        })
    }

    fn subscribe(&mut self, index: SessionIndex) -> Result<mpsc::Receiver<TickMessage>, EcloudError> {
        let slot = self
            .unclaimed
            .get_mut(index)
            .ok_or_else(|| EcloudError::unknown_index(index))?;
        slot.take().ok_or(EcloudError::AlreadySubscribed(index))
    }

    fn activate(&mut self) {
        let promoted = self.registry.activate_all();
        self.phase = OrchestratorPhase::AwaitingTrigger;
        info!("Cohort complete: {} sessions active, first tick {}", promoted, self.tick_id);
    }

    fn begin_tick(&mut self, trigger: Trigger) {
        if trigger.tick_id_hint != self.tick_id {
            debug!("Trigger hint {} differs from tick {}", trigger.tick_id_hint, self.tick_id);
        }
        if self.finish_requested {
            self.begin_debug_round();
            return;
        }

        self.phase = OrchestratorPhase::Broadcasting;
        let participants = self.registry.active_indices();
        self.barrier = Some(TickBarrier::open(self.tick_id, Command::Step, participants.iter().copied()));
        self.round_started = Some(Instant::now());

        debug!("Tick {}: broadcasting STEP to {} sessions", self.tick_id, participants.len());

        for index in participants {
            let payload = self.waypoints.next_payload_for(index, self.tick_id);
            if self.deliver(index, TickMessage::step(self.tick_id, payload)) == Delivery::Disconnected {
                warn!("Session {} stream closed before tick {}", index, self.tick_id);
                self.mark_unresponsive(index);
            }
        }

        if self.barrier.as_ref().map_or(true, TickBarrier::is_satisfied) {
            self.complete_tick();
        } else {
            self.phase = OrchestratorPhase::Collecting;
            self.deadline = Some(Instant::now() + self.config.tick_timeout());
        }
    }

    fn deliver(&mut self, index: SessionIndex, message: TickMessage) -> Delivery {
        let Some(stream) = self.streams.get(index) else {
            return Delivery::Disconnected;
        };
        match stream.try_send(message) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(message)) => {
                self.protocol.dropped_broadcasts += 1;
                warn!(
                    "Session {} stream full, dropped {} for tick {}",
                    index, message.command, message.tick_id
                );
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Disconnected,
        }
    }

    fn handle_update(&mut self, update: AgentUpdate) -> Ack {
        let session = update.session_index;
        let reject = Ack {
            tick_id: update.tick_id,
            accepted: false,
        };

        if self.registry.get(session).is_none() {
            self.protocol.unknown_sessions += 1;
            warn!("Dropping update: {}", EcloudError::unknown_index(session));
            return reject;
        }

        let Some(barrier) = self.barrier.as_mut() else {
            self.protocol.stale_updates += 1;
            let err = EcloudError::StaleOrFutureTickUpdate {
                session,
                expected: None,
                got: update.tick_id,
            };
            warn!("Dropping update: {}", err);
            return reject;
        };

        let expected_kind = match barrier.command() {
            Command::RequestDebug => UpdateKind::Debug,
            _ => UpdateKind::Step,
        };
        if update.kind != expected_kind {
            self.protocol.stale_updates += 1;
            warn!(
                "Dropping {:?} update from session {} during {} round",
                update.kind,
                session,
                barrier.command()
            );
            return reject;
        }

        if let Err(err) = barrier.accept(session, update.tick_id) {
            match err {
                EcloudError::DuplicateUpdateForTick { .. } => self.protocol.duplicate_updates += 1,
                _ => self.protocol.stale_updates += 1,
            }
            warn!("Dropping update: {}", err);
            return reject;
        }

        let tick_id = update.tick_id;
        match update.kind {
            UpdateKind::Step => self.record_step(update),
            UpdateKind::Debug => {
                if let Some(entry) = self.registry.get_mut(session) {
                    entry.debug_payload = Some(update.payload);
                }
            }
        }

        if self.barrier.as_ref().map_or(false, TickBarrier::is_satisfied) {
            match self.phase {
                OrchestratorPhase::Terminating => self.close_debug_round(),
                _ => self.complete_tick(),
            }
        }

        Ack {
            tick_id,
            accepted: true,
        }
    }

    fn record_step(&mut self, update: AgentUpdate) {
        let session = update.session_index;
        self.registry.record_ack(session, update.tick_id);
        self.telemetry.on_update(&update);

        if let Some(millis) = update.timestamps.step_millis() {
            self.client_step.record(millis);
        }
        self.round.timestamps.push((session, update.timestamps));

        if update.done_flag {
            let reason = if update.local_failure {
                DoneReason::LocalFailure
            } else {
                DoneReason::Finished
            };
            if self.registry.mark_done(session, reason, update.tick_id) {
                info!("Session {} done at tick {} ({:?})", session, update.tick_id, reason);
                self.round.completed.push(session);
            }
        }
    }

    /// Excuses a session from the open round and every later one.
    fn mark_unresponsive(&mut self, index: SessionIndex) {
        if let Some(barrier) = self.barrier.as_mut() {
            barrier.excuse(index);
        }
        if self.registry.mark_done(index, DoneReason::Unresponsive, self.tick_id) {
            let err = EcloudError::AgentUnresponsive {
                session: index,
                tick_id: self.tick_id,
                timeout_ms: self.config.tick_timeout_ms,
            };
            warn!("Excusing session: {}", err);
            self.unresponsive.push(index);
            self.round.excused.push(index);
        }
    }

    fn expire_round(&mut self) {
        self.deadline = None;
        match self.phase {
            OrchestratorPhase::Collecting => {
                let missing = self
                    .barrier
                    .as_mut()
                    .map(TickBarrier::drain_pending)
                    .unwrap_or_default();
                for index in missing {
                    self.mark_unresponsive(index);
                }
                self.complete_tick();
            }
            OrchestratorPhase::Terminating => self.close_debug_round(),
            _ => {}
        }
    }

    fn complete_tick(&mut self) {
        let Some(barrier) = self.barrier.take() else {
            return;
        };
        self.deadline = None;

        let elapsed_ms = self
            .round_started
            .take()
            .map(|started| started.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        self.tick_wall.record(elapsed_ms);

        let round = std::mem::take(&mut self.round);
        let report = TickReport {
            tick_id: barrier.tick_id(),
            command: barrier.command(),
            replied: barrier.answered().iter().copied().collect(),
            completed: round.completed,
            excused: round.excused,
            active_remaining: self.registry.active_count(),
            elapsed_ms,
            timestamps: round.timestamps,
        };

        debug!(
            "Tick {} complete: {} replied, {} active remaining ({:.2}ms)",
            report.tick_id,
            report.replied.len(),
            report.active_remaining,
            elapsed_ms
        );
        if let Some(reports) = &self.reports {
            let _ = reports.send(report);
        }

        self.ticks_completed += 1;
        self.tick_id += 1;

        let budget_spent = self
            .config
            .max_ticks
            .map_or(false, |max| self.ticks_completed >= max);

        if self.registry.all_done() || self.finish_requested || budget_spent {
            self.begin_debug_round();
        } else {
            self.phase = OrchestratorPhase::AwaitingTrigger;
        }
    }

    fn request_finish(&mut self) {
        match self.phase {
            OrchestratorPhase::Registering | OrchestratorPhase::AwaitingTrigger => {
                info!("Finish requested at tick {}", self.tick_id);
                self.begin_debug_round();
            }
            OrchestratorPhase::Broadcasting | OrchestratorPhase::Collecting => {
                info!("Finish requested, stopping after tick {}", self.tick_id);
                self.finish_requested = true;
            }
            OrchestratorPhase::Terminating | OrchestratorPhase::Finished => {}
        }
    }

    /// Sends REQUEST_DEBUG to every session not excused as unresponsive.
    ///
    /// Excused sessions are presumed dead: they get no request, only END.
    fn begin_debug_round(&mut self) {
        self.phase = OrchestratorPhase::Terminating;
        self.finish_requested = false;
        self.registry.close();

        let participants: Vec<SessionIndex> = self
            .registry
            .sessions()
            .filter(|s| !s.is_unresponsive())
            .map(|s| s.index)
            .collect();

        info!(
            "Requesting debug snapshots from {} sessions at tick {}",
            participants.len(),
            self.tick_id
        );

        self.barrier = Some(TickBarrier::open(
            self.tick_id,
            Command::RequestDebug,
            participants.iter().copied(),
        ));

        for index in participants {
            if self.deliver(index, TickMessage::request_debug(self.tick_id)) == Delivery::Disconnected {
                if let Some(barrier) = self.barrier.as_mut() {
                    barrier.excuse(index);
                }
                self.missing_debug.push(index);
            }
        }

        if self.barrier.as_ref().map_or(true, TickBarrier::is_satisfied) {
            self.close_debug_round();
        } else {
            self.deadline = Some(Instant::now() + self.config.debug_timeout());
        }
    }

    fn close_debug_round(&mut self) {
        if let Some(mut barrier) = self.barrier.take() {
            let missing = barrier.drain_pending();
            if !missing.is_empty() {
                warn!("Sessions {:?} did not answer the debug request", missing);
            }
            self.missing_debug.extend(missing);
        }
        self.missing_debug.sort_unstable();
        self.missing_debug.dedup();

        self.tick_id += 1;
        self.broadcast_end(self.tick_id);
    }

    /// Broadcasts END right away, abandoning any open round.
    fn abort(&mut self) {
        if self.phase == OrchestratorPhase::Finished {
            return;
        }
        // The open round's tick was already broadcast
        let end_tick = if self.barrier.is_some() {
            self.tick_id + 1
        } else {
            self.tick_id
        };
        warn!("Aborting run in {:?} at tick {}", self.phase, self.tick_id);
        self.aborted = true;
        self.broadcast_end(end_tick);
    }

    fn broadcast_end(&mut self, tick_id: TickId) {
        for index in 0..self.streams.len() {
            self.deliver(index, TickMessage::end(tick_id));
        }
        self.streams.clear();
        self.registry.close();
        self.barrier = None;
        self.deadline = None;
        self.final_tick_id = tick_id;
        self.phase = OrchestratorPhase::Finished;
        info!("Broadcast END at tick {}", tick_id);
    }

    fn build_diagnostics(&self) -> RunDiagnostics {
        RunDiagnostics {
            scenario: self.config.scenario.name.clone(),
            ticks_completed: self.ticks_completed,
            final_tick_id: self.final_tick_id,
            aborted: self.aborted,
            sessions: self.registry.sessions().map(SessionReport::from_session).collect(),
            unresponsive: self.unresponsive.clone(),
            missing_debug: self.missing_debug.clone(),
            protocol: self.protocol.clone(),
            client_step: self.client_step.clone(),
            tick_wall: self.tick_wall.clone(),
        }
    }
}

/// Cloneable handle for talking to a running [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    requests: mpsc::Sender<Request>,
    mailbox: Arc<TriggerMailbox>,
}

impl OrchestratorHandle {
    async fn send(&self, request: Request) -> Result<(), EcloudError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| EcloudError::OrchestratorClosed)
    }

    /// Registers a client.
    ///
    /// # Errors
    /// * `DuplicateRegistration` / `RegistryClosed` - rejected by the registry
    /// * `OrchestratorClosed` - the loop has stopped
    pub async fn register(&self, identity: AgentIdentity) -> Result<Registration, EcloudError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Register { identity, reply }).await?;
        rx.await.map_err(|_| EcloudError::OrchestratorClosed)?
    }

    /// Claims the broadcast stream of a session. Broadcasts sent before
    /// the claim are buffered.
    pub async fn subscribe(&self, index: SessionIndex) -> Result<mpsc::Receiver<TickMessage>, EcloudError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Subscribe { index, reply }).await?;
        rx.await.map_err(|_| EcloudError::OrchestratorClosed)?
    }

    /// Submits an update. Protocol violations come back as a rejected [`Ack`].
    pub async fn submit_update(&self, update: AgentUpdate) -> Result<Ack, EcloudError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Update { update, reply }).await?;
        rx.await.map_err(|_| EcloudError::OrchestratorClosed)
    }

    /// Offers a trigger to the mailbox.
    pub fn push_trigger(&self, tick_id_hint: TickId) -> Result<Ack, EcloudError> {
        self.mailbox.offer(Trigger::new(tick_id_hint))?;
        Ok(Ack {
            tick_id: tick_id_hint,
            accepted: true,
        })
    }

    /// Finishes the run gracefully at the next barrier boundary.
    pub async fn finish(&self) -> Result<(), EcloudError> {
        self.send(Request::Finish).await
    }

    /// Broadcasts END immediately.
    pub async fn abort(&self) -> Result<(), EcloudError> {
        self.send(Request::Abort).await
    }

    pub fn mailbox(&self) -> Arc<TriggerMailbox> {
        Arc::clone(&self.mailbox)
    }

    /// True once the orchestrator loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn cohort(handle: &OrchestratorHandle, n: u64) -> Vec<mpsc::Receiver<TickMessage>> {
        let mut streams = Vec::new();
        for seed in 0..n {
            let reg = handle.register(AgentIdentity::from_seed(seed)).await.unwrap();
            streams.push(handle.subscribe(reg.assigned_index).await.unwrap());
        }
        streams
    }

    #[tokio::test]
    async fn test_registration_reply() {
        let config = OrchestratorConfig::new(2).with_initial_tick(3);
        let (orchestrator, handle) = Orchestrator::new(config);
        let task = tokio::spawn(orchestrator.run());

        let first = handle.register(AgentIdentity::from_seed(1)).await.unwrap();
        let second = handle.register(AgentIdentity::from_seed(2)).await.unwrap();
        assert_eq!(first.assigned_index, 0);
        assert_eq!(second.assigned_index, 1);
        assert_eq!(second.initial_tick_id, 3);
        assert_eq!(second.scenario.name, "ecloud-scenario");

        // Cohort is complete, the registry is closed
        let late = handle.register(AgentIdentity::from_seed(3)).await.unwrap_err();
        assert!(matches!(late, EcloudError::RegistryClosed(_)));

        handle.abort().await.unwrap();
        let diagnostics = task.await.unwrap();
        assert!(diagnostics.aborted);
        assert_eq!(diagnostics.final_tick_id, 3);
    }

    #[tokio::test]
    async fn test_subscribe_twice_fails() {
        let (orchestrator, handle) = Orchestrator::new(OrchestratorConfig::new(1));
        let task = tokio::spawn(orchestrator.run());

        let reg = handle.register(AgentIdentity::from_seed(7)).await.unwrap();
        let _stream = handle.subscribe(reg.assigned_index).await.unwrap();

        assert!(matches!(
            handle.subscribe(reg.assigned_index).await,
            Err(EcloudError::AlreadySubscribed(0))
        ));
        assert!(matches!(
            handle.subscribe(5).await,
            Err(EcloudError::UnknownSession(_))
        ));

        handle.abort().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_step_round_reports_and_advances() {
        let (mut orchestrator, handle) = Orchestrator::new(OrchestratorConfig::new(2));
        let mut reports = orchestrator.tick_reports();
        let orchestrator = orchestrator.with_waypoints(|index: SessionIndex, tick: TickId| {
            Payload::from_bytes(vec![index as u8, tick as u8])
        });
        let task = tokio::spawn(orchestrator.run());

        let mut streams = cohort(&handle, 2).await;
        handle.push_trigger(0).unwrap();

        for (index, stream) in streams.iter_mut().enumerate() {
            let msg = stream.recv().await.unwrap();
            assert_eq!(msg.command, Command::Step);
            assert_eq!(msg.payload.unwrap().as_bytes(), &[index as u8, 0]);

            let ack = handle
                .submit_update(AgentUpdate::step(0, index, Payload::empty(), false))
                .await
                .unwrap();
            assert!(ack.accepted);
        }

        let report = reports.recv().await.unwrap();
        assert_eq!(report.tick_id, 0);
        assert_eq!(report.replied, vec![0, 1]);
        assert_eq!(report.active_remaining, 2);

        handle.finish().await.unwrap();
        for (index, stream) in streams.iter_mut().enumerate() {
            let msg = stream.recv().await.unwrap();
            assert_eq!(msg, TickMessage::request_debug(1));
            handle
                .submit_update(AgentUpdate::debug(1, index, Payload::from_bytes(b"{}".to_vec())))
                .await
                .unwrap();
        }
        for stream in streams.iter_mut() {
            assert_eq!(stream.recv().await.unwrap(), TickMessage::end(2));
        }

        let diagnostics = task.await.unwrap();
        assert_eq!(diagnostics.ticks_completed, 1);
        assert!(diagnostics.missing_debug.is_empty());
        assert!(!diagnostics.is_degraded());
    }

    #[tokio::test]
    async fn test_update_outside_round_rejected() {
        let (orchestrator, handle) = Orchestrator::new(OrchestratorConfig::new(1));
        let task = tokio::spawn(orchestrator.run());
        let _streams = cohort(&handle, 1).await;

        let ack = handle
            .submit_update(AgentUpdate::step(0, 0, Payload::empty(), false))
            .await
            .unwrap();
        assert!(!ack.accepted);

        let unknown = handle
            .submit_update(AgentUpdate::step(0, 9, Payload::empty(), false))
            .await
            .unwrap();
        assert!(!unknown.accepted);

        handle.abort().await.unwrap();
        let diagnostics = task.await.unwrap();
        assert_eq!(diagnostics.protocol.stale_updates, 1);
        assert_eq!(diagnostics.protocol.unknown_sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_ticks_finishes_run() {
        let config = OrchestratorConfig::new(1)
            .with_max_ticks(2)
            .with_debug_timeout(Duration::from_millis(100));
        let (orchestrator, handle) = Orchestrator::new(config);
        let task = tokio::spawn(orchestrator.run());
        let mut streams = cohort(&handle, 1).await;

        for tick in 0..2 {
            handle.push_trigger(tick).unwrap();
            assert_eq!(streams[0].recv().await.unwrap().tick_id, tick);
            handle
                .submit_update(AgentUpdate::step(tick, 0, Payload::empty(), false))
                .await
                .unwrap();
        }

        // Debug request goes unanswered; the deadline closes the round
        assert_eq!(streams[0].recv().await.unwrap().command, Command::RequestDebug);
        assert_eq!(streams[0].recv().await.unwrap(), TickMessage::end(3));

        let diagnostics = task.await.unwrap();
        assert_eq!(diagnostics.ticks_completed, 2);
        assert_eq!(diagnostics.missing_debug, vec![0]);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_handles_abort_run() {
        let (orchestrator, handle) = Orchestrator::new(OrchestratorConfig::new(3));
        let task = tokio::spawn(orchestrator.run());
        drop(handle);

        let diagnostics = task.await.unwrap();
        assert!(diagnostics.aborted);
        assert!(diagnostics.sessions.is_empty());
    }
}
