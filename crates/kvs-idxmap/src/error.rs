//! Error types for the name-to-index registry

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdxMapError {
    /// Subscriber already watches this registry
    #[error("subscriber {subscriber} already watches registry {registry}")]
    DuplicateSubscriber {
        /// Registry title
        registry: String,
        /// Subscriber name
        subscriber: String,
    },
}
