//! Error taxonomy for the lockstep protocol.

use ecloud_env::{AgentIdentity, EnvError};
use thiserror::Error;

use crate::protocol::{SessionIndex, TickId};

/// Errors raised by the orchestrator, its registry, the trigger mailbox
/// and the agent proxy.
#[derive(Debug, Error)]
pub enum EcloudError {
    /// The identity already holds a session in this run
    #[error("Duplicate registration for agent {0}")]
    DuplicateRegistration(AgentIdentity),

    /// Registration attempted after the cohort closed
    #[error("Registry closed: {0}")]
    RegistryClosed(String),

    /// No session with this index or identity
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// The session's tick stream was already handed out
    #[error("Session {0} is already subscribed")]
    AlreadySubscribed(SessionIndex),

    /// Update does not belong to the open barrier round
    #[error("Update from session {session} for tick {got} does not match current tick {expected:?}")]
    StaleOrFutureTickUpdate {
        session: SessionIndex,
        expected: Option<TickId>,
        got: TickId,
    },

    /// Second update from the same session in one round
    #[error("Duplicate update from session {session} for tick {tick_id}")]
    DuplicateUpdateForTick { session: SessionIndex, tick_id: TickId },

    /// A trigger is already waiting to be consumed
    #[error("Trigger mailbox is full")]
    MailboxFull,

    /// Session missed the per-tick deadline and was excused
    #[error("Session {session} did not answer tick {tick_id} within {timeout_ms}ms")]
    AgentUnresponsive {
        session: SessionIndex,
        tick_id: TickId,
        timeout_ms: u64,
    },

    /// A client observed a tick id that is not newer than the last one
    #[error("Tick {got} observed after tick {last}")]
    TickRegression { last: TickId, got: TickId },

    /// The orchestrator loop has stopped
    #[error("Orchestrator is no longer running")]
    OrchestratorClosed,

    #[error("Environment error: {0}")]
    Env(#[from] EnvError),

    #[error("Payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EcloudError {
    /// Per-update violations that are dropped and logged, never fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EcloudError::StaleOrFutureTickUpdate { .. }
                | EcloudError::DuplicateUpdateForTick { .. }
                | EcloudError::UnknownSession(_)
                | EcloudError::AgentUnresponsive { .. }
        )
    }

    pub(crate) fn unknown_index(index: SessionIndex) -> Self {
        Self::UnknownSession(format!("index {}", index))
    }
}
