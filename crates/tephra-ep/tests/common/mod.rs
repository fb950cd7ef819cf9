//! Common test utilities for provider integration tests.
//!
//! Graph builders for the small subgraphs the suites exercise, plus
//! helpers for staging host data into a kernel context and reading
//! results back.

use std::collections::HashMap;
use std::sync::Arc;
use tephra_accel::sim::SimBackend;
use tephra_accel::Backend;
use tephra_ep::{ExecutionProvider, KernelContext, ProviderOptions};
use tephra_graph::{
    DataType, Dimension, Graph, Node, SubgraphView, TensorInfo, TensorKind, TensorShape,
};

/// Parse an option list and build a provider over the given backend.
pub fn provider(backend: &Arc<SimBackend>, pairs: &[(&str, &str)]) -> ExecutionProvider {
    let backend: Arc<dyn Backend> = backend.clone();
    ExecutionProvider::new(backend, options(pairs)).expect("provider construction")
}

/// Parse an option list.
pub fn options(pairs: &[(&str, &str)]) -> ProviderOptions {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ProviderOptions::from_map(&map).expect("option parsing")
}

/// A kernel context over the backend's device heap.
pub fn kernel(backend: &SimBackend) -> KernelContext {
    KernelContext::new(backend.allocator())
}

/// `Relu(x)` with a dynamic batch dimension: x:[batch,2] -> y:[batch,2].
pub fn dynamic_relu_graph() -> SubgraphView {
    let mut graph = Graph::new();
    let shape = TensorShape::Dynamic(vec![
        Dimension::Named("batch".to_string()),
        Dimension::Static(2),
    ]);
    for (name, kind) in [("x", TensorKind::Input), ("y", TensorKind::Output)] {
        graph.add_tensor(TensorInfo {
            name: name.to_string(),
            dtype: DataType::F32,
            shape: shape.clone(),
            kind,
            initializer: None,
        });
    }
    let mut node = Node::new("Relu");
    node.name = "relu_0".to_string();
    node.inputs = vec!["x".to_string()];
    node.outputs = vec!["y".to_string()];
    graph.add_node(node);
    graph.inputs = vec!["x".to_string()];
    graph.outputs = vec!["y".to_string()];
    SubgraphView::whole_graph(graph, "relu_sub")
}

/// `Add(a, b)` with two dynamic inputs: a:[n], b:[n] -> c:[n].
pub fn dynamic_add_graph() -> SubgraphView {
    let mut graph = Graph::new();
    let shape = TensorShape::Dynamic(vec![Dimension::Named("n".to_string())]);
    for (name, kind) in [
        ("a", TensorKind::Input),
        ("b", TensorKind::Input),
        ("c", TensorKind::Output),
    ] {
        graph.add_tensor(TensorInfo {
            name: name.to_string(),
            dtype: DataType::F32,
            shape: shape.clone(),
            kind,
            initializer: None,
        });
    }
    let mut node = Node::new("Add");
    node.name = "add_0".to_string();
    node.inputs = vec!["a".to_string(), "b".to_string()];
    node.outputs = vec!["c".to_string()];
    graph.add_node(node);
    graph.inputs = vec!["a".to_string(), "b".to_string()];
    graph.outputs = vec!["c".to_string()];
    SubgraphView::whole_graph(graph, "add_sub")
}

/// Static `MatMul(x, w)` with a weight initializer:
/// x:[2,3] @ w:[3,4] -> y:[2,4].
pub fn matmul_graph() -> SubgraphView {
    let mut graph = Graph::new();
    graph.add_tensor(TensorInfo {
        name: "x".to_string(),
        dtype: DataType::F32,
        shape: TensorShape::Static(vec![2, 3]),
        kind: TensorKind::Input,
        initializer: None,
    });
    let w: Vec<f32> = vec![
        1.0, 0.0, 0.0, 1.0, //
        0.0, 1.0, 0.0, 1.0, //
        0.0, 0.0, 1.0, 1.0,
    ];
    graph.add_tensor(TensorInfo {
        name: "w".to_string(),
        dtype: DataType::F32,
        shape: TensorShape::Static(vec![3, 4]),
        kind: TensorKind::Weight,
        initializer: Some(f32_bytes(&w)),
    });
    graph.add_tensor(TensorInfo {
        name: "y".to_string(),
        dtype: DataType::F32,
        shape: TensorShape::Static(vec![2, 4]),
        kind: TensorKind::Output,
        initializer: None,
    });
    let mut node = Node::new("MatMul");
    node.name = "matmul_0".to_string();
    node.inputs = vec!["x".to_string(), "w".to_string()];
    node.outputs = vec!["y".to_string()];
    graph.add_node(node);
    graph.inputs = vec!["x".to_string()];
    graph.outputs = vec!["y".to_string()];
    SubgraphView::whole_graph(graph, "matmul_sub")
}

/// `NonZero(x)` with a data-dependent output: x:[4] -> idx:[1,n].
pub fn nonzero_graph() -> SubgraphView {
    let mut graph = Graph::new();
    graph.add_tensor(TensorInfo {
        name: "x".to_string(),
        dtype: DataType::F32,
        shape: TensorShape::Static(vec![4]),
        kind: TensorKind::Input,
        initializer: None,
    });
    graph.add_tensor(TensorInfo {
        name: "idx".to_string(),
        dtype: DataType::I64,
        shape: TensorShape::Dynamic(vec![
            Dimension::Static(1),
            Dimension::Named("n".to_string()),
        ]),
        kind: TensorKind::Output,
        initializer: None,
    });
    let mut node = Node::new("NonZero");
    node.name = "nonzero_0".to_string();
    node.inputs = vec!["x".to_string()];
    node.outputs = vec!["idx".to_string()];
    graph.add_node(node);
    graph.inputs = vec!["x".to_string()];
    graph.outputs = vec!["idx".to_string()];
    SubgraphView::whole_graph(graph, "nonzero_sub")
}

/// `Reshape(data, target)` where `target` is a shape-tensor input:
/// data:[2,3], target:[2] -> out:[a,b].
pub fn reshape_graph() -> SubgraphView {
    let mut graph = Graph::new();
    graph.add_tensor(TensorInfo {
        name: "data".to_string(),
        dtype: DataType::F32,
        shape: TensorShape::Static(vec![2, 3]),
        kind: TensorKind::Input,
        initializer: None,
    });
    graph.add_tensor(TensorInfo {
        name: "target".to_string(),
        dtype: DataType::I64,
        shape: TensorShape::Static(vec![2]),
        kind: TensorKind::Input,
        initializer: None,
    });
    graph.add_tensor(TensorInfo {
        name: "out".to_string(),
        dtype: DataType::F32,
        shape: TensorShape::Dynamic(vec![
            Dimension::Named("a".to_string()),
            Dimension::Named("b".to_string()),
        ]),
        kind: TensorKind::Output,
        initializer: None,
    });
    let mut node = Node::new("Reshape");
    node.name = "reshape_0".to_string();
    node.inputs = vec!["data".to_string(), "target".to_string()];
    node.outputs = vec!["out".to_string()];
    graph.add_node(node);
    graph.inputs = vec!["data".to_string(), "target".to_string()];
    graph.outputs = vec!["out".to_string()];
    SubgraphView::whole_graph(graph, "reshape_sub")
}

/// Static `Identity(x)` over i64 data: x:[2] -> y:[2]. Exercises the
/// binder's cast adaptation on capability-limited devices.
pub fn identity_i64_graph() -> SubgraphView {
    let mut graph = Graph::new();
    for (name, kind) in [("x", TensorKind::Input), ("y", TensorKind::Output)] {
        graph.add_tensor(TensorInfo {
            name: name.to_string(),
            dtype: DataType::I64,
            shape: TensorShape::Static(vec![2]),
            kind,
            initializer: None,
        });
    }
    let mut node = Node::new("Identity");
    node.name = "identity_0".to_string();
    node.inputs = vec!["x".to_string()];
    node.outputs = vec!["y".to_string()];
    graph.add_node(node);
    graph.inputs = vec!["x".to_string()];
    graph.outputs = vec!["y".to_string()];
    SubgraphView::whole_graph(graph, "identity_sub")
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn i64_bytes(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn as_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn as_i64s(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}
