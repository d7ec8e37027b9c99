//! eCloud Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction that lets the eCloud
//! orchestrator and its vehicle clients run against either **Production**
//! (tokio, wall clock) or **Simulation** (virtual clock, seeded entropy).
//!
//! # Core Concept
//!
//! Vehicle clients never read the clock or the OS entropy pool directly:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Tasks (`spawn()`)
//! - Randomness (`derive_seed()`)
//!
//! all go through an [`EcloudContext`]. In simulation every run is then
//! reproducible from its 64-bit seed.
//!
//! # Example
//!
//! ```ignore
//! use ecloud_env::{EcloudContext, Timestamp};
//!
//! async fn timed_step<Ctx: EcloudContext>(ctx: &Ctx) -> (Timestamp, Timestamp) {
//!     let start = Timestamp::from_system_time(ctx.system_time());
//!     ctx.sleep(Duration::from_millis(5)).await;
//!     (start, Timestamp::from_system_time(ctx.system_time()))
//! }
//! ```

mod context;
mod types;
mod error;
mod tokio_impl;

pub use context::EcloudContext;
pub use types::{AgentIdentity, Timestamp};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
