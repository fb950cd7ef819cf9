//! Error types for the execution-provider core.
//!
//! The taxonomy mirrors how failures propagate: validation and build
//! failures are fatal for the affected subgraph, cache I/O degrades to a
//! rebuild, binding and device failures are fatal for the affected call
//! only. Internal helpers return [`Result`]; the per-call entry points on
//! the provider are the only surface that hands failures to the caller.

use tephra_accel::AccelError;
use tephra_graph::GraphError;
use thiserror::Error;

/// Errors surfaced by the execution-provider core.
#[derive(Debug, Error)]
pub enum EpError {
    /// Malformed configuration: bad option values, missing explicit
    /// profiles for a dynamic input, inconsistent shape maps.
    #[error("validation error: {0}")]
    Validation(String),

    /// The accelerator rejected the network, or serialization/refit
    /// failed. Fatal for the affected subgraph.
    #[error("build error: {0}")]
    Build(String),

    /// Cache file I/O failed in a way that cannot degrade to a rebuild
    /// (for example a decryption hook refused the payload).
    #[error("engine cache error: {0}")]
    CacheIo(String),

    /// A tensor could not be bound: unsupported type, missing caller
    /// tensor, or the accelerator refused the address.
    #[error("binding error: {0}")]
    Binding(String),

    /// Enqueue or stream failure. Fatal for the affected call.
    #[error("device error: {0}")]
    Device(String),
}

/// Specialized Result type for provider operations.
pub type Result<T> = std::result::Result<T, EpError>;

impl From<GraphError> for EpError {
    fn from(err: GraphError) -> Self {
        EpError::Validation(err.to_string())
    }
}

impl From<AccelError> for EpError {
    fn from(err: AccelError) -> Self {
        match err {
            AccelError::BuildError(_)
            | AccelError::DeserializeError(_)
            | AccelError::RefitRequired(_)
            | AccelError::RefitError(_) => EpError::Build(err.to_string()),
            AccelError::UnknownTensor(_)
            | AccelError::ShapeOutOfRange { .. }
            | AccelError::InvalidPointer(_)
            | AccelError::MissingBinding(_) => EpError::Binding(err.to_string()),
            AccelError::StreamError(_) | AccelError::ExecutionError(_) => {
                EpError::Device(err.to_string())
            }
        }
    }
}
