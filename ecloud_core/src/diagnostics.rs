//! Run diagnostics - per-tick reports and the final run summary.

use ecloud_env::AgentIdentity;
use serde::{Deserialize, Serialize};

use crate::protocol::{ClientTimestamps, Command, Payload, SessionIndex, TickId};
use crate::registry::{DoneReason, Session, SessionState};

/// Running min/mean/max over millisecond samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: u64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl LatencyStats {
    /// Adds one sample.
    pub fn record(&mut self, millis: f64) {
        if self.samples == 0 {
            self.min_ms = millis;
            self.max_ms = millis;
        } else {
            self.min_ms = self.min_ms.min(millis);
            self.max_ms = self.max_ms.max(millis);
        }
        self.samples += 1;
        // Incremental mean avoids keeping every sample
        self.mean_ms += (millis - self.mean_ms) / self.samples as f64;
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }
}

/// Counts of protocol violations that were dropped and logged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolCounters {
    /// Updates for a tick other than the open one
    pub stale_updates: u64,

    /// Second update from a session within one round
    pub duplicate_updates: u64,

    /// Updates naming a session that does not exist
    pub unknown_sessions: u64,

    /// Broadcasts that could not be delivered to a client stream
    pub dropped_broadcasts: u64,
}

impl ProtocolCounters {
    pub fn total(&self) -> u64 {
        self.stale_updates + self.duplicate_updates + self.unknown_sessions + self.dropped_broadcasts
    }
}

/// Published by the orchestrator each time a barrier round completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    pub tick_id: TickId,
    pub command: Command,

    /// Sessions whose update was counted this round
    pub replied: Vec<SessionIndex>,

    /// Sessions that reported their terminal condition this round
    pub completed: Vec<SessionIndex>,

    /// Sessions excused for missing the deadline this round
    pub excused: Vec<SessionIndex>,

    /// ACTIVE sessions left after this round
    pub active_remaining: usize,

    /// Wall time from broadcast to barrier completion
    pub elapsed_ms: f64,

    /// Client step timestamps, by session
    pub timestamps: Vec<(SessionIndex, ClientTimestamps)>,
}

/// Final per-session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub index: SessionIndex,
    pub identity: AgentIdentity,
    pub state: SessionState,
    pub done_reason: Option<DoneReason>,
    pub done_at_tick: Option<TickId>,
    pub last_acked_tick: Option<TickId>,
    pub answered_debug: bool,

    /// Debug snapshot decoded as JSON when possible
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_snapshot: Option<serde_json::Value>,

    #[serde(skip)]
    pub debug_payload: Option<Payload>,
}

impl SessionReport {
    pub(crate) fn from_session(session: &Session) -> Self {
        Self {
            index: session.index,
            identity: session.identity,
            state: session.state,
            done_reason: session.done_reason,
            done_at_tick: session.done_at_tick,
            last_acked_tick: session.last_acked_tick,
            answered_debug: session.debug_payload.is_some(),
            debug_snapshot: session.debug_payload.as_ref().and_then(Payload::to_json_value),
            debug_payload: session.debug_payload.clone(),
        }
    }
}

/// Everything known about a run once it has ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDiagnostics {
    pub scenario: String,

    /// Completed STEP rounds
    pub ticks_completed: u64,

    /// Tick id carried by the END broadcast
    pub final_tick_id: TickId,

    /// The run was cut short by an abort
    pub aborted: bool,

    pub sessions: Vec<SessionReport>,

    /// Sessions forcibly excused after missing a deadline
    pub unresponsive: Vec<SessionIndex>,

    /// Sessions that skipped the final debug request
    pub missing_debug: Vec<SessionIndex>,

    pub protocol: ProtocolCounters,

    /// Client-reported step durations
    pub client_step: LatencyStats,

    /// Broadcast-to-barrier wall time per round
    pub tick_wall: LatencyStats,
}

impl RunDiagnostics {
    /// True when data may be missing: an agent was excused or the run was aborted.
    pub fn is_degraded(&self) -> bool {
        self.aborted || !self.unresponsive.is_empty()
    }

    pub fn session(&self, index: SessionIndex) -> Option<&SessionReport> {
        self.sessions.get(index)
    }

    pub fn debug_payload(&self, index: SessionIndex) -> Option<&Payload> {
        self.session(index).and_then(|s| s.debug_payload.as_ref())
    }

    /// Number of sessions that ended with the given reason.
    pub fn count_done(&self, reason: DoneReason) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.done_reason == Some(reason))
            .count()
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{}: {} ticks, {} sessions ({} finished, {} failed, {} unresponsive), {} protocol violations",
            self.scenario,
            self.ticks_completed,
            self.sessions.len(),
            self.count_done(DoneReason::Finished),
            self.count_done(DoneReason::LocalFailure),
            self.unresponsive.len(),
            self.protocol.total(),
        );
        if !self.client_step.is_empty() {
            line.push_str(&format!(", client step {:.2}ms avg", self.client_step.mean_ms));
        }
        if self.is_degraded() {
            line.push_str(" [DEGRADED]");
        }
        line
    }
}
