//! Core environment context trait for eCloud participants.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for environment interaction.
///
/// This trait abstracts the "real world" so that vehicle clients can run
/// in both production (tokio) and deterministic simulation.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, thread RNG
/// - **Simulation**: `SimContext` (in `ecloud_sim`) - virtual clock, `ChaCha8Rng(seed)`
#[async_trait]
pub trait EcloudContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used for update timestamps.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Derives a seed for a sub-component (one vehicle, one planner, ...).
    ///
    /// Simulation combines the master seed with `seed_extension` so the
    /// result is unique per extension but reproducible across runs.
    fn derive_seed(&self, seed_extension: u64) -> u64;

    /// Returns the context's master seed (0 in production).
    fn seed(&self) -> u64;
}
