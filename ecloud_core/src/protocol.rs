//! Wire messages exchanged between the orchestrator and vehicle clients.
//!
//! ```text
//! Trigger source        Orchestrator                     Vehicle client
//!      |                     |                                 |
//!      |-- Trigger(T) ------>|                                 |
//!      |                     |-- TickMessage(T, STEP, wp) ---->|
//!      |                     |                                 |-- compute_step()
//!      |                     |<-- AgentUpdate(T, idx, result) -|
//!      |<-- TickReport(T) ---|  (once every live agent answered)
//! ```

use ecloud_env::Timestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ScenarioInfo;

/// Identifier of one lockstep round.
pub type TickId = u64;

/// Dense index assigned to a session at registration.
pub type SessionIndex = usize;

/// Command carried by every broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Compute one simulation step with the attached instruction.
    Step,
    /// Answer with a diagnostic snapshot instead of a step.
    RequestDebug,
    /// The run is over; stop listening.
    End,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Step => "STEP",
            Command::RequestDebug => "REQUEST_DEBUG",
            Command::End => "END",
        };
        f.write_str(name)
    }
}

/// Opaque payload bytes.
///
/// The core never looks inside; collaborators on either end agree on the
/// encoding. `encode`/`decode` cover the common JSON case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    /// An empty payload.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Wraps raw bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Serializes a value as JSON.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(value).map(Self)
    }

    /// Deserializes a JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    /// Returns the payload as a JSON value, if it is JSON.
    pub fn to_json_value(&self) -> Option<serde_json::Value> {
        if self.0.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.0).ok()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One broadcast as seen by a single vehicle client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickMessage {
    pub tick_id: TickId,
    pub command: Command,
    /// Per-agent instruction (STEP only).
    pub payload: Option<Payload>,
}

impl TickMessage {
    pub fn step(tick_id: TickId, payload: Payload) -> Self {
        Self {
            tick_id,
            command: Command::Step,
            payload: Some(payload),
        }
    }

    pub fn request_debug(tick_id: TickId) -> Self {
        Self {
            tick_id,
            command: Command::RequestDebug,
            payload: None,
        }
    }

    pub fn end(tick_id: TickId) -> Self {
        Self {
            tick_id,
            command: Command::End,
            payload: None,
        }
    }
}

/// Whether an update answers a STEP or a REQUEST_DEBUG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateKind {
    Step,
    Debug,
}

/// Client-side wall-clock times for one answered tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTimestamps {
    pub step_start: Option<Timestamp>,
    pub step_end: Option<Timestamp>,
}

impl ClientTimestamps {
    /// Step duration in milliseconds, when both ends were recorded.
    pub fn step_millis(&self) -> Option<f64> {
        match (self.step_start, self.step_end) {
            (Some(start), Some(end)) => Some(end.millis_since(&start)),
            _ => None,
        }
    }
}

/// A vehicle client's answer to one broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentUpdate {
    pub tick_id: TickId,
    pub session_index: SessionIndex,
    pub kind: UpdateKind,
    pub payload: Payload,
    /// The client reached its terminal condition with this update.
    pub done_flag: bool,
    /// The client substituted a neutral result after a local failure.
    pub local_failure: bool,
    pub timestamps: ClientTimestamps,
}

impl AgentUpdate {
    /// Builds a step update.
    pub fn step(tick_id: TickId, session_index: SessionIndex, payload: Payload, done_flag: bool) -> Self {
        Self {
            tick_id,
            session_index,
            kind: UpdateKind::Step,
            payload,
            done_flag,
            local_failure: false,
            timestamps: ClientTimestamps::default(),
        }
    }

    /// Builds a debug answer.
    pub fn debug(tick_id: TickId, session_index: SessionIndex, payload: Payload) -> Self {
        Self {
            tick_id,
            session_index,
            kind: UpdateKind::Debug,
            payload,
            done_flag: false,
            local_failure: false,
            timestamps: ClientTimestamps::default(),
        }
    }

    /// Marks the update as a substituted result after a failed step.
    pub fn with_local_failure(mut self) -> Self {
        self.local_failure = true;
        self.done_flag = true;
        self
    }

    pub fn with_timestamps(mut self, timestamps: ClientTimestamps) -> Self {
        self.timestamps = timestamps;
        self
    }
}

/// Reply to a successful registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub assigned_index: SessionIndex,
    pub initial_tick_id: TickId,
    pub scenario: ScenarioInfo,
}

/// External "advance" signal offered to the trigger mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Tick the trigger source believes comes next. Advisory only.
    pub tick_id_hint: TickId,
}

impl Trigger {
    pub fn new(tick_id_hint: TickId) -> Self {
        Self { tick_id_hint }
    }
}

/// Acknowledgement of an update or trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub tick_id: TickId,
    /// False when the orchestrator dropped the message as a protocol violation.
    pub accepted: bool,
}
