//! Backend traits: the seam between the provider core and an accelerator.
//!
//! A [`Backend`] turns a [`NetworkDefinition`] into an opaque serialized
//! engine and deserializes engine blobs back into executable form. An
//! [`Engine`] is an immutable compiled program; an [`ExecutionContext`] is
//! the mutable per-run state (shapes, bindings, scratch memory) derived
//! from one. Contexts are not thread-safe; callers serialize access.

use crate::device::{DeviceAllocator, DevicePtr, DeviceStream};
use crate::error::Result;
use crate::network::{NetworkDefinition, Weights};
use crate::profile::OptimizationProfile;
use crate::types::{Capabilities, IoTensorDesc, PrecisionFlags};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Weights keyed by the tensor name they materialize, for refitting
/// weight-stripped engines.
pub type WeightMap = BTreeMap<String, Weights>;

/// Build-time configuration for an engine.
#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    /// Reduced-precision flags.
    pub precision: PrecisionFlags,

    /// Optimization profiles the engine must cover. Required when the
    /// network has any dynamic input.
    pub profiles: Vec<OptimizationProfile>,

    /// Build in hardware-compatibility mode so the engine loads on newer
    /// devices of the same family.
    pub hardware_compatible: bool,

    /// Omit weights from the serialized engine; the engine must be
    /// refitted before first use.
    pub strip_weights: bool,

    /// Upper bound on builder scratch memory, in bytes. Zero means the
    /// backend default.
    pub workspace_limit: u64,

    /// Emit verbose build diagnostics.
    pub detailed_build_log: bool,
}

/// How an execution context obtains its device scratch memory.
pub enum ContextMemory {
    /// The context allocates and owns its scratch memory.
    Internal,

    /// The caller supplies scratch memory (shared across contexts that
    /// never run concurrently). The block must be at least
    /// [`Engine::device_memory_size`] bytes.
    UserManaged(DevicePtr),
}

/// An accelerator capable of building and running engines.
pub trait Backend: Send + Sync {
    /// Backend name, for diagnostics.
    fn name(&self) -> &str;

    /// What the target device supports.
    fn capabilities(&self) -> &Capabilities;

    /// The device heap this backend allocates from.
    fn allocator(&self) -> DeviceAllocator;

    /// Create a new execution stream.
    fn create_stream(&self) -> DeviceStream;

    /// Compile a network into a serialized engine blob.
    fn build_engine(&self, network: &NetworkDefinition, config: &BuildConfig) -> Result<Vec<u8>>;

    /// Deserialize an engine blob built by this backend (or a
    /// hardware-compatible one).
    fn deserialize_engine(&self, blob: &[u8]) -> Result<Box<dyn Engine>>;
}

/// A compiled, immutable engine.
pub trait Engine: Send + Sync {
    /// Serialize the engine back to a blob.
    fn serialize(&self) -> Result<Vec<u8>>;

    /// Descriptors for every engine I/O tensor.
    fn io_tensors(&self) -> Vec<IoTensorDesc>;

    /// The optimization profiles the engine was built with.
    fn profiles(&self) -> &[OptimizationProfile];

    /// The precision flags the engine was built with.
    fn precision(&self) -> PrecisionFlags;

    /// True for a weight-stripped engine that has not been refitted yet.
    fn needs_refit(&self) -> bool;

    /// Supply weights to a weight-stripped engine. Every stripped weight
    /// must be present in `weights`.
    fn refit_weights(&self, weights: &WeightMap) -> Result<()>;

    /// Scratch memory one execution context needs, in bytes.
    fn device_memory_size(&self) -> u64;

    /// Create an execution context over this engine.
    fn create_context(&self, memory: ContextMemory) -> Result<Box<dyn ExecutionContext>>;
}

/// Per-run mutable state over an engine.
pub trait ExecutionContext: Send {
    /// Set the concrete dims of a dynamic input. Validated against the
    /// engine's profiles.
    fn set_input_shape(&mut self, name: &str, dims: &[i64]) -> Result<()>;

    /// Set the concrete values of a shape-tensor input. Validated against
    /// the engine's profiles.
    fn set_shape_values(&mut self, name: &str, values: &[i64]) -> Result<()>;

    /// Bind a device address to an engine I/O tensor.
    fn set_tensor_address(&mut self, name: &str, ptr: DevicePtr) -> Result<()>;

    /// Resolved dims of a tensor under the shapes set so far. Dimensions
    /// that are still unknown before execution (data-dependent outputs)
    /// come back as `-1`.
    fn tensor_shape(&self, name: &str) -> Result<Vec<i64>>;

    /// Install an allocator for an output whose shape is data-dependent;
    /// the engine calls it during execution once the extent is known.
    fn set_output_allocator(
        &mut self,
        name: &str,
        allocator: Arc<dyn OutputAllocator>,
    ) -> Result<()>;

    /// Point the context at caller-managed scratch memory.
    fn set_device_memory(&mut self, ptr: DevicePtr) -> Result<()>;

    /// Launch the program on the stream with the bindings set so far.
    fn enqueue(&mut self, stream: &mut DeviceStream) -> Result<()>;
}

/// Receives device memory requests for data-dependent-shape outputs.
///
/// Called from inside [`ExecutionContext::enqueue`]; implementations must
/// be internally synchronized.
pub trait OutputAllocator: Send + Sync {
    /// Return a device address with room for `len` bytes. Implementations
    /// may return a previously returned address if it is already large
    /// enough.
    fn reallocate(&self, name: &str, len: usize) -> Result<DevicePtr>;

    /// Report the final dims of the output once execution determines them.
    fn notify_shape(&self, name: &str, dims: &[i64]);
}
