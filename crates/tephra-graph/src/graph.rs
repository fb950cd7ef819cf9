//! Structured graph representation.
//!
//! Defines the stable, wire-format-independent model of a computation graph:
//! nodes with string-keyed attributes, tensors with element types and
//! (possibly dynamic) shapes, and name-based indexing. The execution
//! provider treats everything here as read-only for the duration of
//! compilation.

use crate::{GraphError, Result};
use std::collections::HashMap;

/// Unique identifier for a node in the graph.
pub type NodeId = usize;

/// Unique identifier for a tensor in the graph.
pub type TensorId = usize;

/// A full model graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// All nodes (operations) in topological declaration order.
    pub nodes: Vec<Node>,

    /// Tensor name -> id index.
    pub tensors: HashMap<String, TensorId>,

    /// Tensor metadata, indexed by [`TensorId`].
    pub tensor_info: Vec<TensorInfo>,

    /// Names of graph input tensors.
    pub inputs: Vec<String>,

    /// Names of graph output tensors.
    pub outputs: Vec<String>,

    /// Graph metadata.
    pub metadata: GraphMetadata,
}

/// Metadata about the graph.
#[derive(Debug, Clone, Default)]
pub struct GraphMetadata {
    /// Graph name.
    pub name: String,

    /// Path of the model file this graph was loaded from, if any.
    ///
    /// Used by the weight-stripped engine refit path to locate weights.
    pub model_path: Option<String>,

    /// Producer name.
    pub producer_name: String,

    /// Model version.
    pub model_version: i64,
}

impl Graph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get tensor ID by name.
    pub fn tensor_id(&self, name: &str) -> Result<TensorId> {
        self.tensors
            .get(name)
            .copied()
            .ok_or_else(|| GraphError::MissingTensor(name.to_string()))
    }

    /// Get tensor info by ID.
    pub fn tensor(&self, id: TensorId) -> Result<&TensorInfo> {
        self.tensor_info
            .get(id)
            .ok_or_else(|| GraphError::InvalidGraph(format!("invalid tensor id: {id}")))
    }

    /// Get tensor info by name.
    pub fn tensor_by_name(&self, name: &str) -> Result<&TensorInfo> {
        let id = self.tensor_id(name)?;
        self.tensor(id)
    }

    /// Add a tensor to the graph, returning its id.
    pub fn add_tensor(&mut self, info: TensorInfo) -> TensorId {
        let id = self.tensor_info.len();
        let name = info.name.clone();
        self.tensor_info.push(info);
        self.tensors.insert(name, id);
        id
    }

    /// Add a node to the graph, returning its id.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(node);
        id
    }

    /// Validate graph structure: every referenced tensor must exist.
    pub fn validate(&self) -> Result<()> {
        for input in &self.inputs {
            self.tensor_id(input)?;
        }
        for output in &self.outputs {
            self.tensor_id(output)?;
        }
        for node in &self.nodes {
            // Empty names mark absent optional inputs/outputs.
            for input in node.inputs.iter().filter(|n| !n.is_empty()) {
                self.tensor_id(input)?;
            }
            for output in node.outputs.iter().filter(|n| !n.is_empty()) {
                self.tensor_id(output)?;
            }
        }
        Ok(())
    }
}

/// A node (operation) in the graph.
#[derive(Debug, Clone)]
pub struct Node {
    /// Node name (may be empty).
    pub name: String,

    /// Operation type (e.g. "MatMul", "Add", "Relu").
    pub op_type: String,

    /// Input tensor names, in operator order.
    pub inputs: Vec<String>,

    /// Output tensor names, in operator order.
    pub outputs: Vec<String>,

    /// Node attributes.
    pub attributes: HashMap<String, AttributeValue>,

    /// Operator domain (for custom operators).
    pub domain: String,
}

impl Node {
    /// Create a new node with the given operation type.
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            op_type: op_type.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: HashMap::new(),
            domain: String::new(),
        }
    }

    /// Get a typed attribute value.
    pub fn attr<T>(&self, name: &str) -> Result<T>
    where
        T: TryFrom<AttributeValue>,
        T::Error: std::fmt::Display,
    {
        let value = self
            .attributes
            .get(name)
            .ok_or_else(|| GraphError::MissingAttribute(name.to_string()))?;

        T::try_from(value.clone()).map_err(|e| GraphError::TypeMismatch {
            expected: std::any::type_name::<T>().to_string(),
            actual: format!("{e}"),
        })
    }

    /// Check whether an attribute exists.
    pub fn has_attr(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }
}

/// Attribute value types.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    Float(f32),
    Int(i64),
    String(String),
    Bytes(Vec<u8>),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Strings(Vec<String>),
}

impl TryFrom<AttributeValue> for f32 {
    type Error = String;

    fn try_from(value: AttributeValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AttributeValue::Float(v) => Ok(v),
            _ => Err("not a float".to_string()),
        }
    }
}

impl TryFrom<AttributeValue> for i64 {
    type Error = String;

    fn try_from(value: AttributeValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AttributeValue::Int(v) => Ok(v),
            _ => Err("not an int".to_string()),
        }
    }
}

impl TryFrom<AttributeValue> for String {
    type Error = String;

    fn try_from(value: AttributeValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AttributeValue::String(v) => Ok(v),
            _ => Err("not a string".to_string()),
        }
    }
}

impl TryFrom<AttributeValue> for Vec<i64> {
    type Error = String;

    fn try_from(value: AttributeValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AttributeValue::Ints(v) => Ok(v),
            _ => Err("not an int array".to_string()),
        }
    }
}

impl TryFrom<AttributeValue> for Vec<u8> {
    type Error = String;

    fn try_from(value: AttributeValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AttributeValue::Bytes(v) => Ok(v),
            _ => Err("not a byte blob".to_string()),
        }
    }
}

/// Information about a tensor.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    /// Tensor name.
    pub name: String,

    /// Element type.
    pub dtype: DataType,

    /// Tensor shape.
    pub shape: TensorShape,

    /// Tensor kind (input, output, weight, intermediate).
    pub kind: TensorKind,

    /// Initializer bytes, for weights.
    pub initializer: Option<Vec<u8>>,
}

/// Element types a graph tensor may declare.
///
/// This is the caller-facing type set; the accelerator backend may support
/// a narrower set, in which case the tensor binder adapts (see the
/// capability table in `tephra-accel`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
    F64,
    I8,
    U8,
    I32,
    I64,
    Bool,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F16 => 2,
            DataType::F64 | DataType::I64 => 8,
            DataType::I8 | DataType::U8 | DataType::Bool => 1,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DataType::F32 => "f32",
            DataType::F16 => "f16",
            DataType::F64 => "f64",
            DataType::I8 => "i8",
            DataType::U8 => "u8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::Bool => "bool",
        };
        f.write_str(s)
    }
}

/// Tensor shape representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorShape {
    /// All dimensions known.
    Static(Vec<usize>),

    /// At least one symbolic dimension.
    Dynamic(Vec<Dimension>),

    /// Shape not declared at all.
    Unknown,
}

impl TensorShape {
    /// Check whether the shape is fully static.
    pub fn is_static(&self) -> bool {
        matches!(self, TensorShape::Static(_))
    }

    /// Get static dimensions if available.
    pub fn as_static(&self) -> Option<&[usize]> {
        match self {
            TensorShape::Static(dims) => Some(dims),
            _ => None,
        }
    }

    /// Number of dimensions, if the rank is known.
    pub fn ndim(&self) -> Option<usize> {
        match self {
            TensorShape::Static(dims) => Some(dims.len()),
            TensorShape::Dynamic(dims) => Some(dims.len()),
            TensorShape::Unknown => None,
        }
    }

    /// Dimensions as signed sizes with `-1` marking dynamic dimensions.
    ///
    /// This is the convention the accelerator boundary speaks.
    pub fn dims_i64(&self) -> Option<Vec<i64>> {
        match self {
            TensorShape::Static(dims) => Some(dims.iter().map(|&d| d as i64).collect()),
            TensorShape::Dynamic(dims) => Some(
                dims.iter()
                    .map(|d| match d {
                        Dimension::Static(v) => *v as i64,
                        Dimension::Named(_) => -1,
                    })
                    .collect(),
            ),
            TensorShape::Unknown => None,
        }
    }

    /// True if any dimension is symbolic.
    pub fn has_dynamic_dim(&self) -> bool {
        matches!(self, TensorShape::Dynamic(dims)
            if dims.iter().any(|d| matches!(d, Dimension::Named(_))))
    }
}

/// A single dimension in a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Known size.
    Static(usize),

    /// Named symbolic dimension (e.g. "batch"); size resolved at call time.
    Named(String),
}

/// Kind of tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    /// Graph input (provided by the caller).
    Input,

    /// Graph output (returned to the caller).
    Output,

    /// Static weight with initializer data.
    Weight,

    /// Intermediate value produced and consumed inside the graph.
    Intermediate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_indexing() {
        let mut graph = Graph::new();
        let id = graph.add_tensor(TensorInfo {
            name: "input".to_string(),
            dtype: DataType::F32,
            shape: TensorShape::Static(vec![1, 3, 224, 224]),
            kind: TensorKind::Input,
            initializer: None,
        });
        assert_eq!(id, 0);
        assert_eq!(graph.tensor_id("input").unwrap(), 0);
        assert!(graph.tensor_id("missing").is_err());
    }

    #[test]
    fn node_attributes() {
        let mut node = Node::new("Reshape");
        node.attributes
            .insert("allowzero".to_string(), AttributeValue::Int(1));
        let v: i64 = node.attr("allowzero").unwrap();
        assert_eq!(v, 1);
        assert!(node.attr::<Vec<i64>>("allowzero").is_err());
    }

    #[test]
    fn dynamic_dims_use_negative_sentinel() {
        let shape = TensorShape::Dynamic(vec![
            Dimension::Named("batch".to_string()),
            Dimension::Static(3),
            Dimension::Static(224),
            Dimension::Static(224),
        ]);
        assert!(shape.has_dynamic_dim());
        assert_eq!(shape.dims_i64().unwrap(), vec![-1, 3, 224, 224]);
    }

    #[test]
    fn validate_rejects_dangling_reference() {
        let mut graph = Graph::new();
        let mut node = Node::new("Relu");
        node.inputs = vec!["ghost".to_string()];
        node.outputs = vec![];
        graph.add_node(node);
        assert!(graph.validate().is_err());
    }
}
