//! eCloud Core - Lockstep Tick Synchronization for Distributed Vehicle Simulation
//!
//! Keeps a cohort of independently running vehicle clients in lockstep with
//! one central world simulation:
//! 1. **Registration**: clients join with a self-generated identity and get a dense index
//! 2. **Barrier**: every tick is broadcast once; the world advances only after every live client answered
//! 3. **Shutdown**: finished clients drop out of barriers and answer one final debug request
//!
//! ```text
//!   TickDriver --push_trigger--> [TriggerMailbox] --> Orchestrator --STEP--> AgentProxy x N
//!        ^                                             |      ^                    |
//!        +---------------- TickReport ----------------+      +---- AgentUpdate ---+
//! ```

pub mod barrier;
pub mod collaborators;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod mailbox;
pub mod orchestrator;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod transport;

// Re-export key types for convenience
pub use barrier::TickBarrier;
pub use collaborators::{
    DiagnosticsSink, StepComputation, StepError, StepInput, StepResult, TelemetrySink, WaypointSource,
};
pub use config::{OrchestratorConfig, ScenarioInfo};
pub use diagnostics::{LatencyStats, ProtocolCounters, RunDiagnostics, SessionReport, TickReport};
pub use error::EcloudError;
pub use mailbox::TriggerMailbox;
pub use orchestrator::{Orchestrator, OrchestratorHandle, OrchestratorPhase};
pub use protocol::{
    Ack, AgentUpdate, ClientTimestamps, Command, Payload, Registration, SessionIndex, TickId,
    TickMessage, Trigger, UpdateKind,
};
pub use proxy::{AgentProxy, ProxyOutcome};
pub use registry::{DoneReason, Session, SessionRegistry, SessionState};
pub use transport::{EcloudTransport, LocalTransport, TickStream};
