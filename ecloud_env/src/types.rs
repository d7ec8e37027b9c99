//! Common types for the eCloud environment abstraction.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Self-generated identity of a vehicle client.
///
/// Uses UUID v4 for global uniqueness without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentIdentity(pub Uuid);

impl AgentIdentity {
    /// Creates a new random identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an identity from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a deterministic identity from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for AgentIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 8 chars are enough to tell clients apart in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Wall-clock instant carried on the wire.
///
/// Seconds + nanos since the UNIX epoch, the same split the vehicle
/// clients report their step start/end times in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: u64,
    pub nanos: u32,
}

impl Timestamp {
    /// Converts a `SystemTime`. Times before the epoch clamp to zero.
    pub fn from_system_time(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            seconds: since_epoch.as_secs(),
            nanos: since_epoch.subsec_nanos(),
        }
    }

    /// Returns the offset from the UNIX epoch.
    pub fn as_duration(&self) -> Duration {
        Duration::new(self.seconds, self.nanos)
    }

    /// Milliseconds elapsed since `earlier` (0 if `earlier` is later).
    pub fn millis_since(&self, earlier: &Timestamp) -> f64 {
        self.as_duration()
            .saturating_sub(earlier.as_duration())
            .as_secs_f64()
            * 1000.0
    }
}
