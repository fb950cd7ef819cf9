//! Error types for the graph boundary.

use thiserror::Error;

/// Errors raised while inspecting a model graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A tensor name was referenced but never declared.
    #[error("tensor not found: {0}")]
    MissingTensor(String),

    /// A node attribute was requested but not present.
    #[error("missing attribute: {0}")]
    MissingAttribute(String),

    /// An attribute existed but had a different type than requested.
    #[error("attribute type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Structural invariant violation (dangling references, bad ids).
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
}

/// Specialized Result type for graph operations.
pub type Result<T> = std::result::Result<T, GraphError>;
