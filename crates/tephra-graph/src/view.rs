//! Subgraph views.
//!
//! A [`SubgraphView`] is the unit of work handed to one execution-provider
//! instance: an ordered subset of a graph's nodes, a fused-node name that
//! identifies the subgraph for caching, and the declared input/output names
//! of the fused node. The view is read-only; compilation never mutates the
//! underlying graph.

use crate::{Graph, GraphError, Node, Result, TensorInfo};
use std::collections::HashMap;

/// A read-only view over a connected subset of graph nodes assigned to one
/// execution provider.
#[derive(Debug, Clone)]
pub struct SubgraphView {
    graph: Graph,
    name: String,
    node_ids: Vec<usize>,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl SubgraphView {
    /// Build a view over `node_ids` of `graph`.
    ///
    /// `name` is the fused-node identity used for engine cache keys.
    /// `inputs`/`outputs` are the fused node's declared boundary tensors, in
    /// the order the caller will present them at inference time.
    pub fn new(
        graph: Graph,
        name: impl Into<String>,
        node_ids: Vec<usize>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Result<Self> {
        for &id in &node_ids {
            if id >= graph.nodes.len() {
                return Err(GraphError::InvalidGraph(format!(
                    "subgraph references node id {id} outside the graph"
                )));
            }
        }
        for name in inputs.iter().chain(outputs.iter()) {
            graph.tensor_id(name)?;
        }
        Ok(Self {
            graph,
            name: name.into(),
            node_ids,
            inputs,
            outputs,
        })
    }

    /// Convenience constructor: view over the whole graph, using the graph's
    /// declared inputs/outputs.
    pub fn whole_graph(graph: Graph, name: impl Into<String>) -> Self {
        let node_ids = (0..graph.nodes.len()).collect();
        let inputs = graph.inputs.clone();
        let outputs = graph.outputs.clone();
        Self {
            graph,
            name: name.into(),
            node_ids,
            inputs,
            outputs,
        }
    }

    /// Fused-node name identifying this subgraph.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying graph.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Nodes of the subgraph, in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.node_ids.iter().map(|&id| &self.graph.nodes[id])
    }

    /// Number of nodes in the subgraph.
    pub fn node_count(&self) -> usize {
        self.node_ids.len()
    }

    /// Declared input tensor names of the fused node.
    pub fn input_names(&self) -> &[String] {
        &self.inputs
    }

    /// Declared output tensor names of the fused node.
    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }

    /// Tensor metadata by name.
    pub fn tensor(&self, name: &str) -> Result<&TensorInfo> {
        self.graph.tensor_by_name(name)
    }

    /// Input name -> position map for the fused node.
    pub fn input_index_map(&self) -> HashMap<String, usize> {
        self.inputs
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect()
    }

    /// Output name -> position map for the fused node.
    pub fn output_index_map(&self) -> HashMap<String, usize> {
        self.outputs
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect()
    }
}
