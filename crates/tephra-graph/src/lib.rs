//! Read-only model graph boundary consumed by the tephra execution provider.
//!
//! This crate defines the structured, immutable view of a model graph that
//! the execution provider compiles from: nodes, tensor metadata, attributes,
//! and subgraph views carved out by the partitioner. It deliberately knows
//! nothing about the wire format the graph was loaded from; whatever parses
//! the model hands the provider one of these.

mod error;
mod graph;
mod view;

pub use error::{GraphError, Result};
pub use graph::{
    AttributeValue, DataType, Dimension, Graph, GraphMetadata, Node, NodeId, TensorId, TensorInfo,
    TensorKind, TensorShape,
};
pub use view::SubgraphView;
