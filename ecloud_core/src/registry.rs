//! Client registry - one session per vehicle client.

use ecloud_env::AgentIdentity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::error::EcloudError;
use crate::protocol::{Payload, SessionIndex, TickId};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Joined, waiting for the rest of the cohort
    Registered,
    /// Participates in every barrier
    Active,
    /// Excused from barriers; still answers the final debug request
    Done,
}

/// Why a session left the barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DoneReason {
    /// The client reported its terminal condition
    Finished,
    /// The client's step failed and it sent a neutral result
    LocalFailure,
    /// The client missed a tick deadline and was forcibly excused
    Unresponsive,
}

/// Orchestrator-side record of one vehicle client.
#[derive(Debug, Clone)]
pub struct Session {
    /// Dense index, stable for the run
    pub index: SessionIndex,

    /// Self-generated identity of the client
    pub identity: AgentIdentity,

    pub state: SessionState,

    /// Highest tick whose step update was received
    pub last_acked_tick: Option<TickId>,

    pub done_reason: Option<DoneReason>,

    /// Tick at which the session left the barrier
    pub done_at_tick: Option<TickId>,

    /// Snapshot returned for REQUEST_DEBUG
    pub debug_payload: Option<Payload>,
}

impl Session {
    fn new(index: SessionIndex, identity: AgentIdentity) -> Self {
        Self {
            index,
            identity,
            state: SessionState::Registered,
            last_acked_tick: None,
            done_reason: None,
            done_at_tick: None,
            debug_payload: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn is_done(&self) -> bool {
        self.state == SessionState::Done
    }

    /// True if the session was excused for missing a deadline.
    pub fn is_unresponsive(&self) -> bool {
        self.done_reason == Some(DoneReason::Unresponsive)
    }
}

/// Session table owned by the orchestrator loop.
///
/// Indices are assigned densely in registration order. The table is
/// closed as soon as the cohort is activated; later registrations fail.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Vec<Session>,
    by_identity: HashMap<AgentIdentity, SessionIndex>,
    expected: usize,
    closed: bool,
}

impl SessionRegistry {
    /// Creates a registry for a cohort of `expected` clients.
    pub fn new(expected: usize) -> Self {
        Self {
            sessions: Vec::with_capacity(expected),
            by_identity: HashMap::with_capacity(expected),
            expected,
            closed: false,
        }
    }

    /// Registers a client and returns its index.
    ///
    /// # Errors
    /// * `DuplicateRegistration` - identity already holds a session
    /// * `RegistryClosed` - the run started or the cohort is full
    pub fn register(&mut self, identity: AgentIdentity) -> Result<SessionIndex, EcloudError> {
        if self.closed {
            return Err(EcloudError::RegistryClosed("run already started".to_string()));
        }
        if self.by_identity.contains_key(&identity) {
            return Err(EcloudError::DuplicateRegistration(identity));
        }
        if self.sessions.len() >= self.expected {
            return Err(EcloudError::RegistryClosed(format!(
                "cohort of {} already complete",
                self.expected
            )));
        }

        let index = self.sessions.len();
        self.sessions.push(Session::new(index, identity));
        self.by_identity.insert(identity, index);
        Ok(index)
    }

    /// True once `expected` clients have registered.
    pub fn is_cohort_complete(&self) -> bool {
        self.sessions.len() >= self.expected
    }

    /// Promotes every REGISTERED session to ACTIVE in one step and closes
    /// the registry. Returns the number of promoted sessions.
    pub fn activate_all(&mut self) -> usize {
        self.closed = true;
        let mut promoted = 0;
        for session in self.sessions.iter_mut() {
            if session.state == SessionState::Registered {
                session.state = SessionState::Active;
                promoted += 1;
            }
        }
        promoted
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, index: SessionIndex) -> Option<&Session> {
        self.sessions.get(index)
    }

    pub fn get_mut(&mut self, index: SessionIndex) -> Option<&mut Session> {
        self.sessions.get_mut(index)
    }

    pub fn index_of(&self, identity: &AgentIdentity) -> Option<SessionIndex> {
        self.by_identity.get(identity).copied()
    }

    /// All sessions in index order.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    /// Indices of ACTIVE sessions, ordered.
    pub fn active_indices(&self) -> BTreeSet<SessionIndex> {
        self.sessions
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.index)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_active()).count()
    }

    /// True when no session is REGISTERED or ACTIVE (vacuously true when empty).
    pub fn all_done(&self) -> bool {
        self.sessions.iter().all(Session::is_done)
    }

    /// Records a received step update.
    pub fn record_ack(&mut self, index: SessionIndex, tick_id: TickId) {
        if let Some(session) = self.sessions.get_mut(index) {
            session.last_acked_tick = Some(session.last_acked_tick.map_or(tick_id, |t| t.max(tick_id)));
        }
    }

    /// Moves a session to DONE. Returns false if it already was DONE.
    pub fn mark_done(&mut self, index: SessionIndex, reason: DoneReason, tick_id: TickId) -> bool {
        match self.sessions.get_mut(index) {
            Some(session) if !session.is_done() => {
                session.state = SessionState::Done;
                session.done_reason = Some(reason);
                session.done_at_tick = Some(tick_id);
                true
            }
            _ => false,
        }
    }
}
