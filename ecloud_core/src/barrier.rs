//! Per-tick barrier.
//!
//! A barrier round is opened for one tick id and one command with the set
//! of sessions expected to answer. Each session may answer exactly once;
//! the round is satisfied when nobody is pending (an empty participant set
//! is satisfied immediately).

use std::collections::BTreeSet;

use crate::error::EcloudError;
use crate::protocol::{Command, SessionIndex, TickId};

/// The orchestrator's notion of "now" for one round.
#[derive(Debug, Clone)]
pub struct TickBarrier {
    tick_id: TickId,
    command: Command,
    pending: BTreeSet<SessionIndex>,
    answered: BTreeSet<SessionIndex>,
}

impl TickBarrier {
    /// Opens a round for `tick_id` expecting one answer per participant.
    pub fn open(
        tick_id: TickId,
        command: Command,
        participants: impl IntoIterator<Item = SessionIndex>,
    ) -> Self {
        Self {
            tick_id,
            command,
            pending: participants.into_iter().collect(),
            answered: BTreeSet::new(),
        }
    }

    pub fn tick_id(&self) -> TickId {
        self.tick_id
    }

    pub fn command(&self) -> Command {
        self.command
    }

    /// Sessions that still owe an answer.
    pub fn pending(&self) -> &BTreeSet<SessionIndex> {
        &self.pending
    }

    /// Sessions whose answer was counted.
    pub fn answered(&self) -> &BTreeSet<SessionIndex> {
        &self.answered
    }

    pub fn is_pending(&self, session: SessionIndex) -> bool {
        self.pending.contains(&session)
    }

    pub fn is_satisfied(&self) -> bool {
        self.pending.is_empty()
    }

    /// Counts one answer.
    ///
    /// # Errors
    /// * `StaleOrFutureTickUpdate` - answer is for another tick
    /// * `DuplicateUpdateForTick` - session is not pending (already answered or excused)
    pub fn accept(&mut self, session: SessionIndex, tick_id: TickId) -> Result<(), EcloudError> {
        if tick_id != self.tick_id {
            return Err(EcloudError::StaleOrFutureTickUpdate {
                session,
                expected: Some(self.tick_id),
                got: tick_id,
            });
        }
        if !self.pending.remove(&session) {
            return Err(EcloudError::DuplicateUpdateForTick {
                session,
                tick_id,
            });
        }
        self.answered.insert(session);
        Ok(())
    }

    /// Removes a session without an answer. Returns true if it was pending.
    pub fn excuse(&mut self, session: SessionIndex) -> bool {
        self.pending.remove(&session)
    }

    /// Removes and returns every pending session (deadline expiry).
    pub fn drain_pending(&mut self) -> Vec<SessionIndex> {
        std::mem::take(&mut self.pending).into_iter().collect()
    }
}
