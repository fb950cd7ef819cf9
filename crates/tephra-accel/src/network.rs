//! Network definition: the accelerator's native program representation.
//!
//! The partition compiler lowers a model subgraph into a
//! [`NetworkDefinition`]: a flat list of layers over named tensors, plus
//! weights and optional per-tensor int8 dynamic ranges. Backends consume a
//! definition together with a [`crate::BuildConfig`] and produce an opaque
//! serialized engine.

use crate::types::ElementType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A tensor declared at the network boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkTensor {
    /// Tensor name (engine-internal names equal graph tensor names).
    pub name: String,

    /// Element type.
    pub dtype: ElementType,

    /// Declared dims; `-1` marks a dynamic dimension.
    pub dims: Vec<i64>,

    /// True if the tensor's values feed shape computation.
    pub is_shape_tensor: bool,
}

/// Elementwise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementWiseOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Reduction operations. Reductions run over the last axis, dropping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
}

/// Activation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationKind {
    Relu,
    Sigmoid,
    Tanh,
}

/// The kind of computation a layer performs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    /// Binary elementwise op over two inputs of equal shape.
    ElementWise(ElementWiseOp),

    /// Reduction over the last axis.
    Reduce(ReduceOp),

    /// Unary activation.
    Activation(ActivationKind),

    /// 2-D matrix multiply.
    MatMul,

    /// Reshape; the target shape comes from a shape-tensor input.
    Shuffle,

    /// Elementwise type conversion to the given type.
    Cast(ElementType),

    /// Materialize a constant from the network's weight table.
    Constant,

    /// Emit the input's shape as a 1-D i64 tensor.
    Shape,

    /// Emit indices of non-zero elements; output shape is data-dependent.
    NonZero,

    /// Pass-through.
    Identity,
}

/// One layer of the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    /// Layer name (from the source node, for diagnostics).
    pub name: String,

    /// What the layer computes.
    pub kind: LayerKind,

    /// Input tensor names.
    pub inputs: Vec<String>,

    /// Output tensor names.
    pub outputs: Vec<String>,

    /// Compute-precision override. `None` lets the builder choose under the
    /// configured precision flags; `Some` pins the layer (used to keep
    /// overflow-prone layer pairs in full precision under fp16/int8).
    pub precision: Option<ElementType>,

    /// Output-type override, paired with `precision` when pinning.
    pub output_type: Option<ElementType>,
}

impl Layer {
    /// Create a layer with no precision overrides.
    pub fn new(
        name: impl Into<String>,
        kind: LayerKind,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            inputs,
            outputs,
            precision: None,
            output_type: None,
        }
    }

    /// Pin the layer to compute and emit the given type regardless of the
    /// build's precision flags.
    pub fn pin_precision(&mut self, dtype: ElementType) {
        self.precision = Some(dtype);
        self.output_type = Some(dtype);
    }
}

/// Weight data attached to a network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Weights {
    pub dtype: ElementType,
    pub dims: Vec<i64>,
    pub data: Vec<u8>,
}

/// A complete network ready to hand to a backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkDefinition {
    /// Network name (the fused-node name of the source subgraph).
    pub name: String,

    /// Boundary input tensors, in fused-node input order.
    pub inputs: Vec<NetworkTensor>,

    /// Boundary output tensors, in fused-node output order.
    pub outputs: Vec<NetworkTensor>,

    /// Layers in execution order.
    pub layers: Vec<Layer>,

    /// Weight table keyed by the tensor name the weight materializes.
    pub weights: BTreeMap<String, Weights>,

    /// Per-tensor int8 dynamic ranges (symmetric; value is the absolute
    /// maximum). Empty when calibration was not provided.
    pub dynamic_ranges: BTreeMap<String, f32>,
}

impl NetworkDefinition {
    /// Create an empty network with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Input tensor descriptor by name.
    pub fn input(&self, name: &str) -> Option<&NetworkTensor> {
        self.inputs.iter().find(|t| t.name == name)
    }

    /// Names of inputs with at least one dynamic dimension, or which are
    /// shape tensors (whose value ranges must be profiled).
    pub fn dynamic_input_names(&self) -> Vec<&str> {
        self.inputs
            .iter()
            .filter(|t| t.is_shape_tensor || t.dims.contains(&-1))
            .map(|t| t.name.as_str())
            .collect()
    }
}
