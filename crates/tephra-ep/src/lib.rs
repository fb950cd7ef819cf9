//! Execution-provider core.
//!
//! Orchestrates compiled accelerator engines for subgraphs of a model:
//! dynamic-shape profile resolution, persistent engine caching, graph
//! lowering and engine builds, per-call tensor binding (including shape
//! tensors, empty tensors, type adaptation, and data-dependent output
//! shapes), and stream execution with optional command-graph capture.
//!
//! The [`ExecutionProvider`] is the entry point: register subgraphs with
//! [`ExecutionProvider::compile_subgraph`] (or load a prebuilt engine
//! with [`ExecutionProvider::compile_from_context_model`]), then issue
//! calls through [`ExecutionProvider::run`] with a per-call
//! [`KernelContext`]. Calls are thread-safe; each subgraph serializes
//! its own critical section.

mod binder;
mod cache;
mod calibration;
mod compile;
mod context;
mod context_model;
mod dds;
mod error;
mod options;
mod provider;
mod runner;
mod shape_profile;

pub use binder::BindingSession;
pub use cache::{CryptoHooks, EngineCacheManager};
pub use calibration::load_calibration_table;
pub use compile::{CompiledArtifact, PartitionCompiler};
pub use context::{CallTensor, KernelContext};
pub use context_model::{
    read_context_model, write_context_model, ContextEngine, ContextModel,
};
pub use dds::DdsOutputAllocator;
pub use error::{EpError, Result};
pub use options::{ProviderOptions, ShapeMap};
pub use provider::{ExecutionProvider, SubgraphState};
pub use runner::{shape_fingerprint, ContextRunner, RunState};
pub use shape_profile::{ProfileInput, ShapeRangeTable, UNRESOLVED};
