//! Error types for the accelerator boundary.

use thiserror::Error;

/// Errors surfaced by an accelerator backend.
#[derive(Debug, Error)]
pub enum AccelError {
    /// The backend rejected the network at build time.
    #[error("engine build failed: {0}")]
    BuildError(String),

    /// An engine blob could not be deserialized or is incompatible with
    /// the target device.
    #[error("engine deserialization failed: {0}")]
    DeserializeError(String),

    /// A tensor name is unknown to the engine or context.
    #[error("unknown engine tensor: {0}")]
    UnknownTensor(String),

    /// An input shape fell outside every optimization profile.
    #[error("shape {dims:?} for tensor '{name}' is outside all optimization profiles")]
    ShapeOutOfRange { name: String, dims: Vec<i64> },

    /// A device pointer did not refer to a live allocation.
    #[error("invalid device pointer: {0}")]
    InvalidPointer(u64),

    /// A required tensor address was never bound before enqueue.
    #[error("missing binding for engine tensor: {0}")]
    MissingBinding(String),

    /// A stream operation was illegal in the current stream state.
    #[error("stream error: {0}")]
    StreamError(String),

    /// Enqueue or device-side execution failed.
    #[error("execution failed: {0}")]
    ExecutionError(String),

    /// A weight-stripped engine was used without a successful refit.
    #[error("engine requires refit before use: {0}")]
    RefitRequired(String),

    /// Refitting a weight-stripped engine failed.
    #[error("refit failed: {0}")]
    RefitError(String),
}

/// Specialized Result type for accelerator operations.
pub type Result<T> = std::result::Result<T, AccelError>;
