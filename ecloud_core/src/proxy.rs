//! Client-side agent proxy.
//!
//! One proxy task per vehicle. It registers, subscribes to its broadcast
//! stream and answers every STEP and REQUEST_DEBUG until END arrives.

use std::sync::Arc;
use tracing::{debug, info, warn};

use ecloud_env::{AgentIdentity, EcloudContext, Timestamp};

use crate::collaborators::{StepComputation, StepInput};
use crate::error::EcloudError;
use crate::protocol::{AgentUpdate, ClientTimestamps, Command, SessionIndex, TickId, TickMessage};
use crate::transport::EcloudTransport;

/// What a proxy saw during its run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyOutcome {
    pub identity: AgentIdentity,
    pub session_index: SessionIndex,
    pub steps_computed: u64,

    /// Reported its terminal condition
    pub finished: bool,

    /// A step failed and a neutral result was sent instead
    pub local_failure: bool,

    pub debug_answered: bool,
    pub last_tick: Option<TickId>,

    /// Saw END (false when the stream closed without it)
    pub ended_cleanly: bool,
}

/// Vehicle client driving one [`StepComputation`].
pub struct AgentProxy<Ctx, T, S> {
    context: Arc<Ctx>,
    transport: Arc<T>,
    step: S,
    identity: AgentIdentity,
}

impl<Ctx, T, S> AgentProxy<Ctx, T, S>
where
    Ctx: EcloudContext,
    T: EcloudTransport,
    S: StepComputation,
{
    pub fn new(context: Arc<Ctx>, transport: Arc<T>, step: S, identity: AgentIdentity) -> Self {
        Self {
            context,
            transport,
            step,
            identity,
        }
    }

    pub fn identity(&self) -> AgentIdentity {
        self.identity
    }

    /// Runs the client loop until END.
    ///
    /// # Errors
    /// * registration errors from the orchestrator
    /// * `TickRegression` - a broadcast did not advance the tick id
    pub async fn run(mut self) -> Result<ProxyOutcome, EcloudError> {
        let registration = self.transport.register_agent(self.identity).await?;
        let index = registration.assigned_index;
        self.step.on_registered(&registration);

        let mut stream = self.transport.subscribe_ticks(index).await?;
        info!("Agent {} joined as session {}", self.identity, index);

        let mut outcome = ProxyOutcome {
            identity: self.identity,
            session_index: index,
            steps_computed: 0,
            finished: false,
            local_failure: false,
            debug_answered: false,
            last_tick: None,
            ended_cleanly: false,
        };

        while let Some(message) = stream.next().await {
            if let Some(last) = outcome.last_tick {
                if message.tick_id <= last {
                    warn!(
                        "Session {} saw tick {} after {}, stopping",
                        index, message.tick_id, last
                    );
                    return Err(EcloudError::TickRegression {
                        last,
                        got: message.tick_id,
                    });
                }
            }
            outcome.last_tick = Some(message.tick_id);

            match message.command {
                Command::Step => {
                    let update = self.compute(index, message, &mut outcome).await;
                    let ack = self.transport.submit_update(update).await?;
                    if !ack.accepted {
                        warn!("Session {} update for tick {} was rejected", index, ack.tick_id);
                    }
                }
                Command::RequestDebug => {
                    let update = AgentUpdate::debug(message.tick_id, index, self.step.diagnostics());
                    let ack = self.transport.submit_update(update).await?;
                    outcome.debug_answered = ack.accepted;
                }
                Command::End => {
                    debug!("Session {} received END at tick {}", index, message.tick_id);
                    outcome.ended_cleanly = true;
                    break;
                }
            }
        }

        Ok(outcome)
    }

    async fn compute(
        &mut self,
        index: SessionIndex,
        message: TickMessage,
        outcome: &mut ProxyOutcome,
    ) -> AgentUpdate {
        let tick_id = message.tick_id;
        let step_start = Timestamp::from_system_time(self.context.system_time());

        let result = self
            .step
            .compute_step(StepInput {
                tick_id,
                instruction: message.payload,
            })
            .await;

        let timestamps = ClientTimestamps {
            step_start: Some(step_start),
            step_end: Some(Timestamp::from_system_time(self.context.system_time())),
        };
        outcome.steps_computed += 1;

        match result {
            Ok(step) => {
                if step.is_terminal {
                    outcome.finished = true;
                }
                AgentUpdate::step(tick_id, index, step.value, step.is_terminal).with_timestamps(timestamps)
            }
            Err(err) => {
                warn!("Session {} step failed at tick {}: {}", index, tick_id, err);
                outcome.local_failure = true;
                AgentUpdate::step(tick_id, index, self.step.neutral_result(), true)
                    .with_local_failure()
                    .with_timestamps(timestamps)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{StepError, StepResult};
    use crate::config::OrchestratorConfig;
    use crate::orchestrator::Orchestrator;
    use crate::protocol::{Ack, Payload, Registration};
    use crate::transport::{LocalTransport, TickStream};
    use async_trait::async_trait;
    use ecloud_env::TokioContext;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Counts steps and finishes after a fixed number.
    struct Countdown {
        remaining: u32,
        fail: bool,
    }

    #[async_trait]
    impl StepComputation for Countdown {
        async fn compute_step(&mut self, _input: StepInput) -> Result<StepResult, StepError> {
            if self.fail {
                return Err(StepError::failed("sensor dropout"));
            }
            self.remaining = self.remaining.saturating_sub(1);
            let value = Payload::from_bytes(vec![self.remaining as u8]);
            if self.remaining == 0 {
                Ok(StepResult::terminal(value))
            } else {
                Ok(StepResult::running(value))
            }
        }

        fn diagnostics(&self) -> Payload {
            Payload::from_bytes(b"{\"remaining\":0}".to_vec())
        }
    }

    #[tokio::test]
    async fn test_proxy_runs_to_end() {
        let (mut orchestrator, handle) = Orchestrator::new(OrchestratorConfig::new(1));
        let mut reports = orchestrator.tick_reports();
        let task = tokio::spawn(orchestrator.run());
        let transport = Arc::new(LocalTransport::new(handle.clone()));

        let proxy = AgentProxy::new(
            TokioContext::shared(),
            transport,
            Countdown { remaining: 3, fail: false },
            AgentIdentity::from_seed(11),
        );
        let client = tokio::spawn(proxy.run());

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
        assert_eq!(tick, 2);

        let outcome = client.await.unwrap().unwrap();
        assert_eq!(outcome.steps_computed, 3);
        assert!(outcome.finished);
        assert!(outcome.debug_answered);
        assert!(outcome.ended_cleanly);

        let diagnostics = task.await.unwrap();
        assert_eq!(diagnostics.ticks_completed, 3);
        assert!(diagnostics.session(0).unwrap().answered_debug);
    }

    #[tokio::test]
    async fn test_failed_step_sends_neutral_result() {
        let (mut orchestrator, handle) = Orchestrator::new(OrchestratorConfig::new(1));
        let mut reports = orchestrator.tick_reports();
        let task = tokio::spawn(orchestrator.run());

        let proxy = AgentProxy::new(
            TokioContext::shared(),
            Arc::new(LocalTransport::new(handle.clone())),
            Countdown { remaining: 10, fail: true },
            AgentIdentity::from_seed(12),
        );
        let client = tokio::spawn(proxy.run());

        handle.push_trigger(0).unwrap();
        let report = reports.recv().await.unwrap();
        assert_eq!(report.completed, vec![0]);
        assert_eq!(report.active_remaining, 0);

        let outcome = client.await.unwrap().unwrap();
        assert!(outcome.local_failure);
        assert!(!outcome.finished);

        let diagnostics = task.await.unwrap();
        assert_eq!(
            diagnostics.session(0).unwrap().done_reason,
            Some(crate::registry::DoneReason::LocalFailure)
        );
    }

    /// Transport that replays a scripted broadcast sequence.
    struct Scripted {
        messages: Mutex<Option<Vec<TickMessage>>>,
    }

    #[async_trait]
    impl EcloudTransport for Scripted {
        async fn register_agent(&self, _identity: AgentIdentity) -> Result<Registration, EcloudError> {
            Ok(Registration {
                assigned_index: 0,
                initial_tick_id: 0,
                scenario: Default::default(),
            })
        }

        async fn submit_update(&self, update: AgentUpdate) -> Result<Ack, EcloudError> {
            Ok(Ack {
                tick_id: update.tick_id,
                accepted: true,
            })
        }

        async fn subscribe_ticks(&self, _index: SessionIndex) -> Result<TickStream, EcloudError> {
            let messages = self.messages.lock().unwrap().take().unwrap_or_default();
            let (tx, rx) = mpsc::channel(messages.len().max(1));
            for message in messages {
                tx.try_send(message).unwrap();
            }
            Ok(TickStream::new(rx))
        }

        async fn push_trigger(&self, tick_id_hint: TickId) -> Result<Ack, EcloudError> {
            Ok(Ack {
                tick_id: tick_id_hint,
                accepted: true,
            })
        }
    }

    #[tokio::test]
    async fn test_repeated_tick_is_fatal() {
        let transport = Arc::new(Scripted {
            messages: Mutex::new(Some(vec![
                TickMessage::step(4, Payload::empty()),
                TickMessage::step(4, Payload::empty()),
            ])),
        });

        let proxy = AgentProxy::new(
            TokioContext::shared(),
            transport,
            Countdown { remaining: 10, fail: false },
            AgentIdentity::from_seed(13),
        );

        let err = proxy.run().await.unwrap_err();
        assert!(matches!(err, EcloudError::TickRegression { last: 4, got: 4 }));
    }

    #[tokio::test]
    async fn test_closed_stream_without_end() {
        let transport = Arc::new(Scripted {
            messages: Mutex::new(Some(vec![TickMessage::step(0, Payload::empty())])),
        });

        let proxy = AgentProxy::new(
            TokioContext::shared(),
            transport,
            Countdown { remaining: 10, fail: false },
            AgentIdentity::from_seed(14),
        );

        let outcome = proxy.run().await.unwrap();
        assert_eq!(outcome.steps_computed, 1);
        assert_eq!(outcome.last_tick, Some(0));
        assert!(!outcome.ended_cleanly);
    }
}
