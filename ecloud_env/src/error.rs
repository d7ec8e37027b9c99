//! Error types for the eCloud environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),
}
