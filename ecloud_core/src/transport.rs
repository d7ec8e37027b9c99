//! Remote-call surface between vehicle clients and the orchestrator.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use ecloud_env::AgentIdentity;

use crate::error::EcloudError;
use crate::orchestrator::OrchestratorHandle;
use crate::protocol::{Ack, AgentUpdate, Registration, SessionIndex, TickId, TickMessage};

/// Abstraction for the client-facing orchestrator API.
///
/// # Implementations
///
/// - **In-process**: [`LocalTransport`] over the orchestrator's channels
/// - **Remote**: an RPC service forwarding to an [`OrchestratorHandle`]
///
/// # Call Flow
///
/// ```text
/// Client                     Transport                 Orchestrator
///   |-- register_agent ------->|-------------------------->|
///   |<-- Registration ---------|<--------------------------|
///   |-- subscribe_ticks ------>|-------------------------->|
///   |<======== TickStream (STEP / REQUEST_DEBUG / END) ====|
///   |-- submit_update -------->|-------------------------->|
///   |<-- Ack ------------------|<--------------------------|
/// ```
#[async_trait]
pub trait EcloudTransport: Send + Sync + 'static {
    /// Joins the run.
    async fn register_agent(&self, identity: AgentIdentity) -> Result<Registration, EcloudError>;

    /// Answers a broadcast.
    async fn submit_update(&self, update: AgentUpdate) -> Result<Ack, EcloudError>;

    /// Opens the broadcast stream of a registered session.
    async fn subscribe_ticks(&self, index: SessionIndex) -> Result<TickStream, EcloudError>;

    /// Asks the orchestrator to advance one tick.
    ///
    /// # Errors
    /// * `MailboxFull` - the previous trigger has not been consumed
    async fn push_trigger(&self, tick_id_hint: TickId) -> Result<Ack, EcloudError>;
}

/// Ordered stream of broadcasts for one session.
#[derive(Debug)]
pub struct TickStream {
    inner: mpsc::Receiver<TickMessage>,
}

impl TickStream {
    pub fn new(inner: mpsc::Receiver<TickMessage>) -> Self {
        Self { inner }
    }

    /// Waits for the next broadcast. `None` once the orchestrator is gone.
    pub async fn next(&mut self) -> Option<TickMessage> {
        self.inner.recv().await
    }
}

/// In-process transport with optional one-way latency on client calls.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    handle: OrchestratorHandle,
    latency: Duration,
}

impl LocalTransport {
    pub fn new(handle: OrchestratorHandle) -> Self {
        Self {
            handle,
            latency: Duration::ZERO,
        }
    }

    /// Delays every update by `latency` before it reaches the orchestrator.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn handle(&self) -> &OrchestratorHandle {
        &self.handle
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl EcloudTransport for LocalTransport {
    async fn register_agent(&self, identity: AgentIdentity) -> Result<Registration, EcloudError> {
        self.handle.register(identity).await
    }

    async fn submit_update(&self, update: AgentUpdate) -> Result<Ack, EcloudError> {
        self.delay().await;
        self.handle.submit_update(update).await
    }

    async fn subscribe_ticks(&self, index: SessionIndex) -> Result<TickStream, EcloudError> {
        self.handle.subscribe(index).await.map(TickStream::new)
    }

    async fn push_trigger(&self, tick_id_hint: TickId) -> Result<Ack, EcloudError> {
        self.handle.push_trigger(tick_id_hint)
    }
}
