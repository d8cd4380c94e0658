//! Error types for dependency ordering

/// Dependency cycle found while ordering keys with cycle handling disabled
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("dependency cycle among keys: {}", .keys.join(", "))]
pub struct DependencyCycle {
    /// Keys left unordered when the cycle was found, sorted
    pub keys: Vec<String>,
}
