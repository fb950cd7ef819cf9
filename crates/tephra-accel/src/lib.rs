//! Accelerator SDK boundary for the tephra execution provider.
//!
//! This crate defines the seam between the execution-provider core and a
//! native accelerator: a data-model for compiled networks
//! ([`NetworkDefinition`]), optimization profiles over dynamic shape ranges
//! ([`OptimizationProfile`]), traits for engines, execution contexts and
//! device streams, and an opaque device memory model with RAII buffer
//! ownership.
//!
//! # Architecture
//!
//! The provider core never touches a raw accelerator handle; every native
//! resource crosses this boundary as an owning type:
//! 1. **Build** — a [`NetworkDefinition`] plus [`BuildConfig`] goes in, an
//!    opaque serialized engine blob comes out.
//! 2. **Load** — the blob deserializes into an [`Engine`], which creates
//!    [`ExecutionContext`]s.
//! 3. **Run** — per call, tensor addresses are bound on the context and the
//!    program is enqueued on a [`DeviceStream`].
//!
//! Version-dependent behavior (which element types and features the
//! accelerator supports natively) is exposed through a [`Capabilities`]
//! table queried at initialization, not through conditional compilation.
//!
//! The [`sim`] module provides a deterministic in-process backend that
//! implements the whole boundary; the integration suites run against it.

mod backend;
mod device;
mod error;
mod network;
mod profile;
pub mod sim;
mod types;

pub use backend::{
    Backend, BuildConfig, ContextMemory, Engine, ExecutionContext, OutputAllocator, WeightMap,
};
pub use device::{CapturedGraph, DeviceAllocator, DeviceBuffer, DevicePtr, DeviceStream};
pub use error::{AccelError, Result};
pub use network::{
    ActivationKind, ElementWiseOp, Layer, LayerKind, NetworkDefinition, NetworkTensor, ReduceOp,
    Weights,
};
pub use profile::{OptimizationProfile, ShapeTriple};
pub use types::{Capabilities, ElementType, IoTensorDesc, PrecisionFlags, TensorIoMode};
