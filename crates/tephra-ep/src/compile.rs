//! Graph partition compiler.
//!
//! Lowers one [`SubgraphView`] into the accelerator's network
//! representation and drives the engine build: operator lowering in
//! dependency order, precision policy against the device capability
//! table, numerical-stability overrides, and profile attachment. The
//! result bundles the serialized engine with the metadata later stages
//! need (output element types, fused-node I/O index maps).

use crate::error::{EpError, Result};
use crate::options::ProviderOptions;
use crate::shape_profile::{ProfileInput, ShapeRangeTable};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{BTreeMap, HashMap, HashSet};
use tephra_accel::{
    ActivationKind, Backend, BuildConfig, Capabilities, ElementType, ElementWiseOp, Layer,
    LayerKind, NetworkDefinition, NetworkTensor, PrecisionFlags, ReduceOp, Weights,
};
use tephra_graph::{DataType, Node, SubgraphView, TensorKind};
use tracing::{debug, warn};

/// Everything a successful build emits.
pub struct CompiledArtifact {
    /// Serialized engine blob.
    pub engine_bytes: Vec<u8>,

    /// Precision the engine was actually built with, after capability
    /// downgrades.
    pub precision: PrecisionFlags,

    /// Declared element type of each fused-node output.
    pub output_types: HashMap<String, DataType>,

    /// Fused-node input name -> position.
    pub input_indices: HashMap<String, usize>,

    /// Fused-node output name -> position.
    pub output_indices: HashMap<String, usize>,
}

/// Compiles subgraphs into engines for one backend.
pub struct PartitionCompiler<'a> {
    backend: &'a dyn Backend,
    options: &'a ProviderOptions,
    calibration: Option<&'a BTreeMap<String, f32>>,
}

impl<'a> PartitionCompiler<'a> {
    pub fn new(
        backend: &'a dyn Backend,
        options: &'a ProviderOptions,
        calibration: Option<&'a BTreeMap<String, f32>>,
    ) -> Self {
        Self {
            backend,
            options,
            calibration,
        }
    }

    /// Requested precision, downgraded to what the device does fast.
    pub fn effective_precision(&self) -> PrecisionFlags {
        let caps = self.backend.capabilities();
        let mut precision = PrecisionFlags {
            fp16: self.options.fp16_enable,
            int8: self.options.int8_enable,
        };
        if precision.fp16 && !caps.fast_fp16 {
            warn!("device lacks fast fp16; building in fp32");
            precision.fp16 = false;
        }
        if precision.int8 && !caps.fast_int8 {
            warn!("device lacks fast int8; building without int8");
            precision.int8 = false;
        }
        precision
    }

    /// Compile one subgraph into an engine.
    ///
    /// The shape range table must be fully resolved (or empty, for a
    /// static subgraph); implicit-shape subgraphs reach this point only
    /// after first-call resolution.
    pub fn compile(&self, view: &SubgraphView, table: &ShapeRangeTable) -> Result<CompiledArtifact> {
        let precision = self.effective_precision();
        let network = self.lower(view, precision)?;

        if precision.int8 && network.dynamic_ranges.is_empty() {
            warn!(
                subgraph = view.name(),
                "int8 requested without calibration table or dynamic ranges; \
                 the engine will be uncalibrated"
            );
        }

        let profiles = if table.is_empty() {
            Vec::new()
        } else {
            table.to_profiles(&profile_inputs(view)?)?
        };
        let config = BuildConfig {
            precision,
            profiles,
            hardware_compatible: self.options.engine_hw_compatible,
            strip_weights: self.options.weight_stripped_engine_enable,
            workspace_limit: self.options.max_workspace_size,
            detailed_build_log: self.options.detailed_build_log,
        };
        let engine_bytes = self
            .backend
            .build_engine(&network, &config)
            .map_err(|e| EpError::Build(format!("subgraph '{}': {e}", view.name())))?;
        debug!(
            subgraph = view.name(),
            bytes = engine_bytes.len(),
            "engine built"
        );

        let mut output_types = HashMap::new();
        for name in view.output_names() {
            output_types.insert(name.clone(), view.tensor(name)?.dtype);
        }
        Ok(CompiledArtifact {
            engine_bytes,
            precision,
            output_types,
            input_indices: view.input_index_map(),
            output_indices: view.output_index_map(),
        })
    }

    /// Lower the subgraph to a network definition.
    fn lower(&self, view: &SubgraphView, precision: PrecisionFlags) -> Result<NetworkDefinition> {
        let caps = self.backend.capabilities();
        let shape_operands = shape_operand_names(view);
        let mut network = NetworkDefinition::new(view.name());

        for name in view.input_names() {
            network
                .inputs
                .push(self.boundary_tensor(view, name, &shape_operands, caps)?);
        }
        for name in view.output_names() {
            network
                .outputs
                .push(self.boundary_tensor(view, name, &shape_operands, caps)?);
        }

        for node in ordered_nodes(view)? {
            let layer = self.lower_node(view, node, caps)?;
            network.layers.push(layer);
            for input in node.inputs.iter().filter(|n| !n.is_empty()) {
                let info = view.tensor(input)?;
                if info.kind == TensorKind::Weight && !network.weights.contains_key(input) {
                    let data = info.initializer.clone().ok_or_else(|| {
                        EpError::Validation(format!("weight '{input}' has no initializer"))
                    })?;
                    let dims = info.shape.dims_i64().ok_or_else(|| {
                        EpError::Validation(format!("weight '{input}' has no declared shape"))
                    })?;
                    network.weights.insert(
                        input.clone(),
                        Weights {
                            dtype: element_type(info.dtype),
                            dims,
                            data,
                        },
                    );
                }
            }
        }

        if (precision.fp16 || precision.int8) && self.options.layer_norm_fp32_fallback {
            pin_norm_patterns(&mut network);
        }

        if let Some(ranges) = self.calibration {
            network.dynamic_ranges = ranges.clone();
        }
        Ok(network)
    }

    fn boundary_tensor(
        &self,
        view: &SubgraphView,
        name: &str,
        shape_operands: &HashSet<String>,
        caps: &Capabilities,
    ) -> Result<NetworkTensor> {
        let info = view.tensor(name)?;
        let dims = info.shape.dims_i64().ok_or_else(|| {
            EpError::Validation(format!("tensor '{name}' has no declared shape"))
        })?;
        Ok(NetworkTensor {
            name: name.to_string(),
            dtype: device_element_type(info.dtype, caps),
            dims,
            is_shape_tensor: shape_operands.contains(name),
        })
    }

    fn lower_node(&self, view: &SubgraphView, node: &Node, caps: &Capabilities) -> Result<Layer> {
        let kind = match node.op_type.as_str() {
            "Add" => LayerKind::ElementWise(ElementWiseOp::Add),
            "Sub" => LayerKind::ElementWise(ElementWiseOp::Sub),
            "Mul" => LayerKind::ElementWise(ElementWiseOp::Mul),
            "Div" => LayerKind::ElementWise(ElementWiseOp::Div),
            "Pow" => LayerKind::ElementWise(ElementWiseOp::Pow),
            "ReduceSum" => LayerKind::Reduce(ReduceOp::Sum),
            "ReduceMean" => LayerKind::Reduce(ReduceOp::Mean),
            "ReduceMax" => LayerKind::Reduce(ReduceOp::Max),
            "Relu" => LayerKind::Activation(ActivationKind::Relu),
            "Sigmoid" => LayerKind::Activation(ActivationKind::Sigmoid),
            "Tanh" => LayerKind::Activation(ActivationKind::Tanh),
            "MatMul" => LayerKind::MatMul,
            "Reshape" => LayerKind::Shuffle,
            "Cast" => {
                let output = node.outputs.first().ok_or_else(|| {
                    EpError::Validation(format!("Cast node '{}' has no output", node.name))
                })?;
                LayerKind::Cast(device_element_type(view.tensor(output)?.dtype, caps))
            }
            "Shape" => LayerKind::Shape,
            "NonZero" => LayerKind::NonZero,
            "Identity" => LayerKind::Identity,
            other => {
                return Err(EpError::Build(format!(
                    "operator '{other}' (node '{}') is not supported",
                    node.name
                )))
            }
        };
        let name = if node.name.is_empty() {
            format!("{}_{}", node.op_type.to_lowercase(), node.outputs.join("_"))
        } else {
            node.name.clone()
        };
        Ok(Layer::new(
            name,
            kind,
            node.inputs.iter().filter(|n| !n.is_empty()).cloned().collect(),
            node.outputs.clone(),
        ))
    }
}

/// The dynamic inputs the shape-profile resolver must cover.
pub(crate) fn profile_inputs(view: &SubgraphView) -> Result<Vec<ProfileInput>> {
    let shape_operands = shape_operand_names(view);
    let mut inputs = Vec::new();
    for name in view.input_names() {
        let info = view.tensor(name)?;
        let dims = info.shape.dims_i64().ok_or_else(|| {
            EpError::Validation(format!("input '{name}' has no declared shape"))
        })?;
        inputs.push(ProfileInput {
            name: name.clone(),
            dims,
            is_shape_tensor: shape_operands.contains(name),
        });
    }
    Ok(inputs)
}

/// Tensors whose values feed shape computation: anything wired into a
/// shape operand position of a consuming node.
fn shape_operand_names(view: &SubgraphView) -> HashSet<String> {
    let mut names = HashSet::new();
    for node in view.nodes() {
        // Reshape's second operand is the target shape.
        if node.op_type == "Reshape" {
            if let Some(shape_input) = node.inputs.get(1) {
                names.insert(shape_input.clone());
            }
        }
    }
    names
}

/// Subgraph nodes in dependency order.
fn ordered_nodes(view: &SubgraphView) -> Result<Vec<&Node>> {
    let nodes: Vec<&Node> = view.nodes().collect();
    let mut graph = DiGraph::<usize, ()>::new();
    let indices: Vec<_> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();

    let mut producers: HashMap<&str, usize> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        for output in &node.outputs {
            producers.insert(output.as_str(), i);
        }
    }
    for (i, node) in nodes.iter().enumerate() {
        for input in node.inputs.iter().filter(|n| !n.is_empty()) {
            if let Some(&p) = producers.get(input.as_str()) {
                if p != i {
                    graph.add_edge(indices[p], indices[i], ());
                }
            }
        }
    }

    let order = toposort(&graph, None).map_err(|_| {
        EpError::Build(format!("subgraph '{}' contains a cycle", view.name()))
    })?;
    Ok(order.into_iter().map(|ix| nodes[graph[ix]]).collect())
}

/// Pin overflow-prone power-then-reduce pairs (the layer-normalization
/// variance pattern) to full precision.
fn pin_norm_patterns(network: &mut NetworkDefinition) {
    let mut pinned: Vec<usize> = Vec::new();
    for (i, layer) in network.layers.iter().enumerate() {
        if layer.kind != LayerKind::ElementWise(ElementWiseOp::Pow) {
            continue;
        }
        let Some(pow_out) = layer.outputs.first() else {
            continue;
        };
        for (j, consumer) in network.layers.iter().enumerate().skip(i + 1) {
            let is_reduce = matches!(consumer.kind, LayerKind::Reduce(_));
            if is_reduce && consumer.inputs.iter().any(|input| input == pow_out) {
                pinned.push(i);
                pinned.push(j);
            }
        }
    }
    for i in pinned {
        let layer = &mut network.layers[i];
        debug!(layer = %layer.name, "pinning normalization pattern to fp32");
        layer.pin_precision(ElementType::F32);
    }
}

/// 1:1 mapping from the graph element type to the accelerator's.
pub(crate) fn element_type(dtype: DataType) -> ElementType {
    match dtype {
        DataType::F32 => ElementType::F32,
        DataType::F16 => ElementType::F16,
        DataType::F64 => ElementType::F64,
        DataType::I8 => ElementType::I8,
        DataType::U8 => ElementType::U8,
        DataType::I32 => ElementType::I32,
        DataType::I64 => ElementType::I64,
        DataType::Bool => ElementType::Bool,
    }
}

/// Inverse mapping, for recovering declared types from engine I/O
/// descriptors on the precompiled-engine path.
pub(crate) fn data_type(dtype: ElementType) -> DataType {
    match dtype {
        ElementType::F32 => DataType::F32,
        ElementType::F16 => DataType::F16,
        ElementType::F64 => DataType::F64,
        ElementType::I8 => DataType::I8,
        ElementType::U8 => DataType::U8,
        ElementType::I32 => DataType::I32,
        ElementType::I64 => DataType::I64,
        ElementType::Bool => DataType::Bool,
    }
}

/// The element type the device actually carries for a declared graph
/// type, narrowing 64-bit types the device lacks. The tensor binder
/// inserts the matching casts at the call boundary.
pub(crate) fn device_element_type(dtype: DataType, caps: &Capabilities) -> ElementType {
    match dtype {
        DataType::I64 if !caps.native_int64 => {
            debug!("narrowing i64 tensor to i32 for this device");
            ElementType::I32
        }
        DataType::F64 if !caps.native_double => {
            debug!("narrowing f64 tensor to f32 for this device");
            ElementType::F32
        }
        other => element_type(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use tephra_accel::sim::SimBackend;
    use tephra_graph::{Graph, TensorInfo, TensorShape};

    fn graph_with_pow_reduce() -> SubgraphView {
        let mut graph = Graph::new();
        for (name, kind) in [
            ("x", TensorKind::Input),
            ("sq", TensorKind::Intermediate),
            ("var", TensorKind::Output),
            ("two", TensorKind::Weight),
        ] {
            graph.add_tensor(TensorInfo {
                name: name.to_string(),
                dtype: DataType::F32,
                shape: TensorShape::Static(vec![4, 8]),
                kind,
                initializer: (kind == TensorKind::Weight)
                    .then(|| 2.0f32.to_le_bytes().repeat(32)),
            });
        }
        let mut pow = Node::new("Pow");
        pow.name = "pow_0".to_string();
        pow.inputs = vec!["x".to_string(), "two".to_string()];
        pow.outputs = vec!["sq".to_string()];
        let mut reduce = Node::new("ReduceMean");
        reduce.name = "reduce_0".to_string();
        reduce.inputs = vec!["sq".to_string()];
        reduce.outputs = vec!["var".to_string()];
        graph.add_node(pow);
        graph.add_node(reduce);
        graph.inputs = vec!["x".to_string()];
        graph.outputs = vec!["var".to_string()];
        SubgraphView::whole_graph(graph, "norm_sub")
    }

    fn options(pairs: &[(&str, &str)]) -> ProviderOptions {
        let map: StdHashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProviderOptions::from_map(&map).unwrap()
    }

    #[test]
    fn pow_reduce_pattern_is_pinned_under_fp16() {
        let backend = SimBackend::new();
        let opts = options(&[("fp16_enable", "1"), ("layer_norm_fp32_fallback", "1")]);
        let compiler = PartitionCompiler::new(&backend, &opts, None);
        let network = compiler
            .lower(&graph_with_pow_reduce(), compiler.effective_precision())
            .unwrap();
        assert_eq!(network.layers[0].precision, Some(ElementType::F32));
        assert_eq!(network.layers[1].precision, Some(ElementType::F32));
    }

    #[test]
    fn pattern_not_pinned_in_fp32_builds() {
        let backend = SimBackend::new();
        let opts = options(&[("layer_norm_fp32_fallback", "1")]);
        let compiler = PartitionCompiler::new(&backend, &opts, None);
        let network = compiler
            .lower(&graph_with_pow_reduce(), compiler.effective_precision())
            .unwrap();
        assert_eq!(network.layers[0].precision, None);
    }

    #[test]
    fn precision_downgrades_without_fast_support() {
        let backend = SimBackend::with_capabilities(Capabilities {
            fast_fp16: false,
            fast_int8: false,
            native_int64: true,
            native_double: true,
            hardware_compat: false,
            compute_capability: "75".to_string(),
        });
        let opts = options(&[("fp16_enable", "1"), ("int8_enable", "1")]);
        let compiler = PartitionCompiler::new(&backend, &opts, None);
        let precision = compiler.effective_precision();
        assert!(!precision.fp16);
        assert!(!precision.int8);
    }

    #[test]
    fn static_subgraph_compiles_without_profiles() {
        let backend = SimBackend::new();
        let opts = options(&[]);
        let compiler = PartitionCompiler::new(&backend, &opts, None);
        let artifact = compiler
            .compile(&graph_with_pow_reduce(), &ShapeRangeTable::default())
            .unwrap();
        assert!(!artifact.engine_bytes.is_empty());
        assert_eq!(artifact.output_types["var"], DataType::F32);
        assert_eq!(artifact.input_indices["x"], 0);
    }

    #[test]
    fn unsupported_operator_is_a_build_error() {
        let mut graph = Graph::new();
        graph.add_tensor(TensorInfo {
            name: "x".to_string(),
            dtype: DataType::F32,
            shape: TensorShape::Static(vec![2]),
            kind: TensorKind::Input,
            initializer: None,
        });
        graph.add_tensor(TensorInfo {
            name: "y".to_string(),
            dtype: DataType::F32,
            shape: TensorShape::Static(vec![2]),
            kind: TensorKind::Output,
            initializer: None,
        });
        let mut node = Node::new("Erf");
        node.inputs = vec!["x".to_string()];
        node.outputs = vec!["y".to_string()];
        graph.add_node(node);
        graph.inputs = vec!["x".to_string()];
        graph.outputs = vec!["y".to_string()];
        let view = SubgraphView::whole_graph(graph, "erf_sub");

        let backend = SimBackend::new();
        let opts = options(&[]);
        let compiler = PartitionCompiler::new(&backend, &opts, None);
        let err = compiler.compile(&view, &ShapeRangeTable::default());
        assert!(matches!(err, Err(EpError::Build(_))));
    }
}
