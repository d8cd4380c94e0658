//! Error types for the resync orchestrator

/// Resync errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResyncError {
    /// Subscriber with the same name already registered
    #[error("resync subscriber {0} is already registered")]
    DuplicateRegistration(String),

    /// Orchestrator was closed
    #[error("resync orchestrator is closed")]
    Closed,

    /// Configuration could not be loaded
    #[error("configuration error: {0}")]
    Config(String),
}

impl ResyncError {
    /// Check if the error indicates the orchestrator can no longer be used
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}
