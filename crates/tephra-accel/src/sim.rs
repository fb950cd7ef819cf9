//! In-process reference backend.
//!
//! `SimBackend` compiles a [`NetworkDefinition`] into a self-describing
//! JSON engine blob and interprets the layer list at enqueue time, reading
//! and writing tensors through the shared [`DeviceAllocator`]. It honors
//! the full backend contract: optimization-profile validation, shape
//! tensors, data-dependent output allocation, weight-stripped engines with
//! refit, and deferred execution under stream capture. Integration tests
//! for the provider core run against it.

use crate::backend::{
    Backend, BuildConfig, ContextMemory, Engine, ExecutionContext, OutputAllocator, WeightMap,
};
use crate::device::{DeviceAllocator, DeviceBuffer, DevicePtr, DeviceStream};
use crate::error::{AccelError, Result};
use crate::network::{ActivationKind, ElementWiseOp, LayerKind, NetworkDefinition, ReduceOp};
use crate::profile::OptimizationProfile;
use crate::types::{Capabilities, ElementType, IoTensorDesc, PrecisionFlags, TensorIoMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const ENGINE_MAGIC: &str = "tephra-sim-engine-v1";

/// Serialized engine layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EngineBlob {
    magic: String,
    compute_capability: String,
    hardware_compatible: bool,
    precision: PrecisionFlags,
    profiles: Vec<OptimizationProfile>,
    network: NetworkDefinition,
    stripped: bool,
}

/// Deterministic in-process backend.
pub struct SimBackend {
    caps: Capabilities,
    alloc: DeviceAllocator,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    /// A backend with every capability enabled, on compute capability 86.
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities {
            fast_fp16: true,
            fast_int8: true,
            native_int64: true,
            native_double: true,
            hardware_compat: true,
            compute_capability: "86".to_string(),
        })
    }

    /// A backend with an explicit capability set, for exercising the
    /// provider's capability-gated paths.
    pub fn with_capabilities(caps: Capabilities) -> Self {
        Self {
            caps,
            alloc: DeviceAllocator::new(),
        }
    }
}

impl Backend for SimBackend {
    fn name(&self) -> &str {
        "sim"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn allocator(&self) -> DeviceAllocator {
        self.alloc.clone()
    }

    fn create_stream(&self) -> DeviceStream {
        DeviceStream::new(self.alloc.clone())
    }

    fn build_engine(&self, network: &NetworkDefinition, config: &BuildConfig) -> Result<Vec<u8>> {
        let dynamic = network.dynamic_input_names();
        if !dynamic.is_empty() && config.profiles.is_empty() {
            return Err(AccelError::BuildError(format!(
                "network '{}' has dynamic inputs {:?} but no optimization profile",
                network.name, dynamic
            )));
        }
        for profile in &config.profiles {
            for name in &dynamic {
                let input = network.input(name).ok_or_else(|| {
                    AccelError::BuildError(format!("unknown dynamic input '{name}'"))
                })?;
                let covered = if input.is_shape_tensor {
                    profile.shape_values.contains_key(*name)
                } else {
                    profile.dims.contains_key(*name)
                };
                if !covered {
                    return Err(AccelError::BuildError(format!(
                        "profile does not cover dynamic input '{name}'"
                    )));
                }
            }
        }

        let mut network = network.clone();
        if config.strip_weights {
            for weights in network.weights.values_mut() {
                weights.data.clear();
            }
        }
        let blob = EngineBlob {
            magic: ENGINE_MAGIC.to_string(),
            compute_capability: self.caps.compute_capability.clone(),
            hardware_compatible: config.hardware_compatible,
            precision: config.precision,
            profiles: config.profiles.clone(),
            network,
            stripped: config.strip_weights,
        };
        debug!(
            network = %blob.network.name,
            layers = blob.network.layers.len(),
            profiles = blob.profiles.len(),
            "building engine"
        );
        serde_json::to_vec(&blob).map_err(|e| AccelError::BuildError(e.to_string()))
    }

    fn deserialize_engine(&self, bytes: &[u8]) -> Result<Box<dyn Engine>> {
        let blob: EngineBlob = serde_json::from_slice(bytes)
            .map_err(|e| AccelError::DeserializeError(e.to_string()))?;
        if blob.magic != ENGINE_MAGIC {
            return Err(AccelError::DeserializeError(
                "unrecognized engine format".to_string(),
            ));
        }
        let device_cc: u32 = self.caps.compute_capability.parse().unwrap_or(0);
        let engine_cc: u32 = blob.compute_capability.parse().unwrap_or(0);
        let compatible = if blob.hardware_compatible {
            device_cc >= engine_cc
        } else {
            device_cc == engine_cc
        };
        if !compatible {
            return Err(AccelError::DeserializeError(format!(
                "engine built for compute capability {} cannot run on {}",
                blob.compute_capability, self.caps.compute_capability
            )));
        }
        Ok(Box::new(SimEngine {
            state: Arc::new(EngineState {
                blob,
                refit: Mutex::new(None),
            }),
            alloc: self.alloc.clone(),
        }))
    }
}

struct EngineState {
    blob: EngineBlob,
    refit: Mutex<Option<WeightMap>>,
}

struct SimEngine {
    state: Arc<EngineState>,
    alloc: DeviceAllocator,
}

impl Engine for SimEngine {
    fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.state.blob).map_err(|e| AccelError::BuildError(e.to_string()))
    }

    fn io_tensors(&self) -> Vec<IoTensorDesc> {
        let net = &self.state.blob.network;
        net.inputs
            .iter()
            .map(|t| (t, TensorIoMode::Input))
            .chain(net.outputs.iter().map(|t| (t, TensorIoMode::Output)))
            .map(|(t, mode)| IoTensorDesc {
                name: t.name.clone(),
                mode,
                dtype: t.dtype,
                dims: t.dims.clone(),
                is_shape_tensor: t.is_shape_tensor,
            })
            .collect()
    }

    fn profiles(&self) -> &[OptimizationProfile] {
        &self.state.blob.profiles
    }

    fn precision(&self) -> PrecisionFlags {
        self.state.blob.precision
    }

    fn needs_refit(&self) -> bool {
        self.state.blob.stripped && self.state.refit.lock().is_none()
    }

    fn refit_weights(&self, weights: &WeightMap) -> Result<()> {
        if !self.state.blob.stripped {
            return Ok(());
        }
        for (name, stripped) in &self.state.blob.network.weights {
            let supplied = weights.get(name).ok_or_else(|| {
                AccelError::RefitError(format!("missing weight '{name}'"))
            })?;
            if supplied.dtype != stripped.dtype || supplied.dims != stripped.dims {
                return Err(AccelError::RefitError(format!(
                    "weight '{name}' does not match the engine's declaration"
                )));
            }
        }
        *self.state.refit.lock() = Some(weights.clone());
        Ok(())
    }

    fn device_memory_size(&self) -> u64 {
        (self.state.blob.network.layers.len() as u64 + 1) * 256
    }

    fn create_context(&self, memory: ContextMemory) -> Result<Box<dyn ExecutionContext>> {
        let scratch = match memory {
            ContextMemory::Internal => {
                Some(self.alloc.alloc(self.device_memory_size() as usize))
            }
            ContextMemory::UserManaged(_) => None,
        };
        Ok(Box::new(SimContext {
            state: self.state.clone(),
            alloc: self.alloc.clone(),
            _scratch: scratch,
            input_shapes: HashMap::new(),
            shape_values: HashMap::new(),
            addresses: HashMap::new(),
            output_allocators: HashMap::new(),
        }))
    }
}

struct SimContext {
    state: Arc<EngineState>,
    alloc: DeviceAllocator,
    _scratch: Option<DeviceBuffer>,
    input_shapes: HashMap<String, Vec<i64>>,
    shape_values: HashMap<String, Vec<i64>>,
    addresses: HashMap<String, DevicePtr>,
    output_allocators: HashMap<String, Arc<dyn OutputAllocator>>,
}

impl SimContext {
    fn network(&self) -> &NetworkDefinition {
        &self.state.blob.network
    }

    fn is_io_tensor(&self, name: &str) -> bool {
        let net = self.network();
        net.inputs.iter().any(|t| t.name == name) || net.outputs.iter().any(|t| t.name == name)
    }

    /// Concrete dims for an input under the shapes set so far.
    fn resolved_input_dims(&self, name: &str) -> Result<Vec<i64>> {
        let input = self
            .network()
            .input(name)
            .ok_or_else(|| AccelError::UnknownTensor(name.to_string()))?;
        if let Some(dims) = self.input_shapes.get(name) {
            return Ok(dims.clone());
        }
        if input.dims.contains(&-1) {
            return Err(AccelError::MissingBinding(format!(
                "no shape set for dynamic input '{name}'"
            )));
        }
        Ok(input.dims.clone())
    }

    /// Infer the dims of every tensor without running the program. Shape
    /// tensors feeding Shuffle are taken from the values set on the
    /// context; data-dependent extents come back as `-1`.
    fn infer_shapes(&self) -> Result<HashMap<String, Vec<i64>>> {
        let net = self.network();
        let mut shapes: HashMap<String, Vec<i64>> = HashMap::new();
        for input in &net.inputs {
            shapes.insert(input.name.clone(), self.resolved_input_dims(&input.name)?);
        }
        for (name, weights) in &net.weights {
            shapes.insert(name.clone(), weights.dims.clone());
        }
        for layer in &net.layers {
            let in_dims = |i: usize| -> Result<Vec<i64>> {
                let name = layer.inputs.get(i).ok_or_else(|| {
                    AccelError::ExecutionError(format!("layer '{}' missing input {i}", layer.name))
                })?;
                shapes
                    .get(name)
                    .cloned()
                    .ok_or_else(|| AccelError::UnknownTensor(name.clone()))
            };
            let out_dims = match &layer.kind {
                LayerKind::ElementWise(_) | LayerKind::Activation(_) | LayerKind::Identity => {
                    in_dims(0)?
                }
                LayerKind::Cast(_) => in_dims(0)?,
                LayerKind::Reduce(_) => {
                    let mut dims = in_dims(0)?;
                    dims.pop();
                    dims
                }
                LayerKind::MatMul => {
                    let a = in_dims(0)?;
                    let b = in_dims(1)?;
                    if a.len() != 2 || b.len() != 2 {
                        return Err(AccelError::ExecutionError(format!(
                            "layer '{}': matmul requires 2-D operands",
                            layer.name
                        )));
                    }
                    vec![a[0], b[1]]
                }
                LayerKind::Shuffle => {
                    let data_dims = in_dims(0)?;
                    let shape_input = layer.inputs.get(1).ok_or_else(|| {
                        AccelError::ExecutionError(format!(
                            "layer '{}' has no shape input",
                            layer.name
                        ))
                    })?;
                    match self.shape_values.get(shape_input) {
                        Some(target) => resolve_reshape(&data_dims, target)?,
                        // Values unknown until execution.
                        None => {
                            let rank = shapes
                                .get(shape_input)
                                .map(|d| element_count(d).unwrap_or(0))
                                .unwrap_or(0);
                            vec![-1; rank as usize]
                        }
                    }
                }
                LayerKind::Constant => {
                    let name = layer.outputs.first().ok_or_else(|| {
                        AccelError::ExecutionError(format!(
                            "layer '{}' has no output",
                            layer.name
                        ))
                    })?;
                    net.weights
                        .get(name)
                        .map(|w| w.dims.clone())
                        .ok_or_else(|| AccelError::UnknownTensor(name.clone()))?
                }
                LayerKind::Shape => vec![in_dims(0)?.len() as i64],
                LayerKind::NonZero => vec![in_dims(0)?.len() as i64, -1],
            };
            for output in &layer.outputs {
                shapes.insert(output.clone(), out_dims.clone());
            }
        }
        Ok(shapes)
    }
}

impl ExecutionContext for SimContext {
    fn set_input_shape(&mut self, name: &str, dims: &[i64]) -> Result<()> {
        let input = self
            .network()
            .input(name)
            .ok_or_else(|| AccelError::UnknownTensor(name.to_string()))?;
        if dims.len() != input.dims.len() {
            return Err(AccelError::ShapeOutOfRange {
                name: name.to_string(),
                dims: dims.to_vec(),
            });
        }
        let profiles = &self.state.blob.profiles;
        if !profiles.is_empty() && !profiles.iter().any(|p| p.accepts_dims(name, dims)) {
            return Err(AccelError::ShapeOutOfRange {
                name: name.to_string(),
                dims: dims.to_vec(),
            });
        }
        self.input_shapes.insert(name.to_string(), dims.to_vec());
        Ok(())
    }

    fn set_shape_values(&mut self, name: &str, values: &[i64]) -> Result<()> {
        if self.network().input(name).is_none() {
            return Err(AccelError::UnknownTensor(name.to_string()));
        }
        let profiles = &self.state.blob.profiles;
        if !profiles.is_empty()
            && !profiles.iter().any(|p| p.accepts_shape_values(name, values))
        {
            return Err(AccelError::ShapeOutOfRange {
                name: name.to_string(),
                dims: values.to_vec(),
            });
        }
        self.shape_values.insert(name.to_string(), values.to_vec());
        Ok(())
    }

    fn set_tensor_address(&mut self, name: &str, ptr: DevicePtr) -> Result<()> {
        if !self.is_io_tensor(name) {
            return Err(AccelError::UnknownTensor(name.to_string()));
        }
        self.addresses.insert(name.to_string(), ptr);
        Ok(())
    }

    fn tensor_shape(&self, name: &str) -> Result<Vec<i64>> {
        let shapes = self.infer_shapes()?;
        shapes
            .get(name)
            .cloned()
            .ok_or_else(|| AccelError::UnknownTensor(name.to_string()))
    }

    fn set_output_allocator(
        &mut self,
        name: &str,
        allocator: Arc<dyn OutputAllocator>,
    ) -> Result<()> {
        if !self.network().outputs.iter().any(|t| t.name == name) {
            return Err(AccelError::UnknownTensor(name.to_string()));
        }
        self.output_allocators.insert(name.to_string(), allocator);
        Ok(())
    }

    fn set_device_memory(&mut self, _ptr: DevicePtr) -> Result<()> {
        // Scratch placement does not affect interpretation.
        Ok(())
    }

    fn enqueue(&mut self, stream: &mut DeviceStream) -> Result<()> {
        let blob = &self.state.blob;
        let weights = if blob.stripped {
            self.state.refit.lock().clone().ok_or_else(|| {
                AccelError::RefitRequired(blob.network.name.clone())
            })?
        } else {
            blob.network.weights.clone()
        };
        for input in &blob.network.inputs {
            if !self.addresses.contains_key(&input.name) {
                return Err(AccelError::MissingBinding(input.name.clone()));
            }
        }
        for output in &blob.network.outputs {
            if !self.addresses.contains_key(&output.name)
                && !self.output_allocators.contains_key(&output.name)
            {
                return Err(AccelError::MissingBinding(output.name.clone()));
            }
        }

        let mut input_shapes = HashMap::new();
        for input in &blob.network.inputs {
            input_shapes.insert(input.name.clone(), self.resolved_input_dims(&input.name)?);
        }

        let run = ExecState {
            network: blob.network.clone(),
            weights,
            input_shapes,
            addresses: self.addresses.clone(),
            output_allocators: self.output_allocators.clone(),
            alloc: self.alloc.clone(),
        };
        stream.issue(Box::new(move || run.execute()))
    }
}

/// Snapshot of everything one launch needs; safe to record for replay.
struct ExecState {
    network: NetworkDefinition,
    weights: WeightMap,
    input_shapes: HashMap<String, Vec<i64>>,
    addresses: HashMap<String, DevicePtr>,
    output_allocators: HashMap<String, Arc<dyn OutputAllocator>>,
    alloc: DeviceAllocator,
}

/// A materialized tensor during interpretation.
#[derive(Clone)]
struct Tensor {
    dtype: ElementType,
    dims: Vec<i64>,
    bytes: Vec<u8>,
}

impl ExecState {
    fn execute(&self) -> Result<()> {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();

        for input in &self.network.inputs {
            let dims = self
                .input_shapes
                .get(&input.name)
                .cloned()
                .ok_or_else(|| AccelError::MissingBinding(input.name.clone()))?;
            let count = element_count(&dims)?;
            let ptr = self.addresses[&input.name];
            let bytes = self.alloc.read(ptr, count as usize * input.dtype.size())?;
            tensors.insert(
                input.name.clone(),
                Tensor {
                    dtype: input.dtype,
                    dims,
                    bytes,
                },
            );
        }
        for (name, weights) in &self.weights {
            tensors.insert(
                name.clone(),
                Tensor {
                    dtype: weights.dtype,
                    dims: weights.dims.clone(),
                    bytes: weights.data.clone(),
                },
            );
        }

        for layer in &self.network.layers {
            let out = self.run_layer(layer, &tensors)?;
            let output = layer.outputs.first().ok_or_else(|| {
                AccelError::ExecutionError(format!("layer '{}' has no output", layer.name))
            })?;
            tensors.insert(output.clone(), out);
        }

        for output in &self.network.outputs {
            let tensor = tensors
                .get(&output.name)
                .ok_or_else(|| AccelError::UnknownTensor(output.name.clone()))?;
            if let Some(allocator) = self.output_allocators.get(&output.name) {
                let ptr = allocator.reallocate(&output.name, tensor.bytes.len())?;
                self.alloc.write(ptr, &tensor.bytes)?;
                allocator.notify_shape(&output.name, &tensor.dims);
            } else {
                self.alloc.write(self.addresses[&output.name], &tensor.bytes)?;
            }
        }
        Ok(())
    }

    fn run_layer(
        &self,
        layer: &crate::network::Layer,
        tensors: &HashMap<String, Tensor>,
    ) -> Result<Tensor> {
        let get = |i: usize| -> Result<&Tensor> {
            let name = layer.inputs.get(i).ok_or_else(|| {
                AccelError::ExecutionError(format!("layer '{}' missing input {i}", layer.name))
            })?;
            tensors
                .get(name)
                .ok_or_else(|| AccelError::UnknownTensor(name.clone()))
        };
        match &layer.kind {
            LayerKind::Identity => Ok(get(0)?.clone()),
            LayerKind::ElementWise(op) => {
                let a = get(0)?;
                let b = get(1)?;
                let xs = to_f64s(a)?;
                let ys = to_f64s(b)?;
                if xs.len() != ys.len() {
                    return Err(AccelError::ExecutionError(format!(
                        "layer '{}': operand element counts differ",
                        layer.name
                    )));
                }
                let vals: Vec<f64> = xs
                    .iter()
                    .zip(&ys)
                    .map(|(&x, &y)| match op {
                        ElementWiseOp::Add => x + y,
                        ElementWiseOp::Sub => x - y,
                        ElementWiseOp::Mul => x * y,
                        ElementWiseOp::Div => x / y,
                        ElementWiseOp::Pow => x.powf(y),
                    })
                    .collect();
                Ok(Tensor {
                    dtype: a.dtype,
                    dims: a.dims.clone(),
                    bytes: from_f64s(a.dtype, &vals),
                })
            }
            LayerKind::Reduce(op) => {
                let a = get(0)?;
                let xs = to_f64s(a)?;
                let last = *a.dims.last().ok_or_else(|| {
                    AccelError::ExecutionError(format!(
                        "layer '{}': cannot reduce a scalar",
                        layer.name
                    ))
                })? as usize;
                if last == 0 {
                    return Err(AccelError::ExecutionError(format!(
                        "layer '{}': reduction over empty axis",
                        layer.name
                    )));
                }
                let vals: Vec<f64> = xs
                    .chunks(last)
                    .map(|group| match op {
                        ReduceOp::Sum => group.iter().sum(),
                        ReduceOp::Mean => group.iter().sum::<f64>() / group.len() as f64,
                        ReduceOp::Max => group.iter().copied().fold(f64::MIN, f64::max),
                    })
                    .collect();
                let mut dims = a.dims.clone();
                dims.pop();
                Ok(Tensor {
                    dtype: a.dtype,
                    dims,
                    bytes: from_f64s(a.dtype, &vals),
                })
            }
            LayerKind::Activation(kind) => {
                let a = get(0)?;
                let vals: Vec<f64> = to_f64s(a)?
                    .iter()
                    .map(|&x| match kind {
                        ActivationKind::Relu => x.max(0.0),
                        ActivationKind::Sigmoid => 1.0 / (1.0 + (-x).exp()),
                        ActivationKind::Tanh => x.tanh(),
                    })
                    .collect();
                Ok(Tensor {
                    dtype: a.dtype,
                    dims: a.dims.clone(),
                    bytes: from_f64s(a.dtype, &vals),
                })
            }
            LayerKind::MatMul => {
                let a = get(0)?;
                let b = get(1)?;
                if a.dims.len() != 2 || b.dims.len() != 2 || a.dims[1] != b.dims[0] {
                    return Err(AccelError::ExecutionError(format!(
                        "layer '{}': incompatible matmul dims {:?} x {:?}",
                        layer.name, a.dims, b.dims
                    )));
                }
                let (m, k, n) = (a.dims[0] as usize, a.dims[1] as usize, b.dims[1] as usize);
                let xs = to_f64s(a)?;
                let ys = to_f64s(b)?;
                let mut vals = vec![0.0f64; m * n];
                for i in 0..m {
                    for j in 0..n {
                        let mut acc = 0.0;
                        for p in 0..k {
                            acc += xs[i * k + p] * ys[p * n + j];
                        }
                        vals[i * n + j] = acc;
                    }
                }
                Ok(Tensor {
                    dtype: a.dtype,
                    dims: vec![m as i64, n as i64],
                    bytes: from_f64s(a.dtype, &vals),
                })
            }
            LayerKind::Shuffle => {
                let a = get(0)?;
                let shape = get(1)?;
                let target = to_i64s(shape)?;
                let dims = resolve_reshape(&a.dims, &target)?;
                Ok(Tensor {
                    dtype: a.dtype,
                    dims,
                    bytes: a.bytes.clone(),
                })
            }
            LayerKind::Cast(to) => {
                let a = get(0)?;
                let vals = to_f64s(a)?;
                Ok(Tensor {
                    dtype: *to,
                    dims: a.dims.clone(),
                    bytes: from_f64s(*to, &vals),
                })
            }
            LayerKind::Constant => {
                let name = layer.outputs.first().ok_or_else(|| {
                    AccelError::ExecutionError(format!("layer '{}' has no output", layer.name))
                })?;
                let weights = self.weights.get(name).ok_or_else(|| {
                    AccelError::ExecutionError(format!(
                        "layer '{}': no weights for '{name}'",
                        layer.name
                    ))
                })?;
                Ok(Tensor {
                    dtype: weights.dtype,
                    dims: weights.dims.clone(),
                    bytes: weights.data.clone(),
                })
            }
            LayerKind::Shape => {
                let a = get(0)?;
                let mut bytes = Vec::with_capacity(a.dims.len() * 8);
                for &d in &a.dims {
                    bytes.extend_from_slice(&d.to_le_bytes());
                }
                Ok(Tensor {
                    dtype: ElementType::I64,
                    dims: vec![a.dims.len() as i64],
                    bytes,
                })
            }
            LayerKind::NonZero => {
                let a = get(0)?;
                let vals = to_f64s(a)?;
                let rank = a.dims.len().max(1);
                let hits: Vec<usize> = vals
                    .iter()
                    .enumerate()
                    .filter(|(_, &v)| v != 0.0)
                    .map(|(i, _)| i)
                    .collect();
                // Row-major index decomposition, one row per dimension.
                let mut bytes = Vec::with_capacity(rank * hits.len() * 8);
                for d in 0..rank {
                    let stride: usize = a.dims[d + 1..]
                        .iter()
                        .map(|&x| x.max(1) as usize)
                        .product();
                    let extent = a.dims.get(d).copied().unwrap_or(1).max(1) as usize;
                    for &flat in &hits {
                        let idx = (flat / stride) % extent;
                        bytes.extend_from_slice(&(idx as i64).to_le_bytes());
                    }
                }
                Ok(Tensor {
                    dtype: ElementType::I64,
                    dims: vec![rank as i64, hits.len() as i64],
                    bytes,
                })
            }
        }
    }
}

fn element_count(dims: &[i64]) -> Result<i64> {
    let mut count: i64 = 1;
    for &d in dims {
        if d < 0 {
            return Err(AccelError::ExecutionError(format!(
                "unresolved dimension in {dims:?}"
            )));
        }
        count *= d;
    }
    Ok(count)
}

/// Resolve a reshape target, inferring a single `-1` from the source
/// element count.
fn resolve_reshape(src: &[i64], target: &[i64]) -> Result<Vec<i64>> {
    let total = element_count(src)?;
    let known: i64 = target.iter().filter(|&&d| d != -1).product();
    let inferred: Vec<i64> = target
        .iter()
        .map(|&d| {
            if d == -1 {
                if known == 0 { 0 } else { total / known }
            } else {
                d
            }
        })
        .collect();
    if element_count(&inferred)? != total {
        return Err(AccelError::ExecutionError(format!(
            "cannot reshape {src:?} into {target:?}"
        )));
    }
    Ok(inferred)
}

fn to_f64s(tensor: &Tensor) -> Result<Vec<f64>> {
    let size = tensor.dtype.size();
    let vals = tensor
        .bytes
        .chunks_exact(size)
        .map(|c| match tensor.dtype {
            ElementType::F32 => f32::from_le_bytes(c.try_into().unwrap_or_default()) as f64,
            ElementType::F64 => f64::from_le_bytes(c.try_into().unwrap_or_default()),
            ElementType::I32 => i32::from_le_bytes(c.try_into().unwrap_or_default()) as f64,
            ElementType::I64 => i64::from_le_bytes(c.try_into().unwrap_or_default()) as f64,
            ElementType::I8 => c[0] as i8 as f64,
            ElementType::U8 | ElementType::Bool => c[0] as f64,
            // Stored widened; one f32 per two bytes is not meaningful, so
            // f16 payloads are kept as f32 in this backend.
            ElementType::F16 => {
                f32::from_le_bytes([c[0], c[1], 0, 0]) as f64
            }
        })
        .collect();
    Ok(vals)
}

fn from_f64s(dtype: ElementType, vals: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vals.len() * dtype.size());
    for &v in vals {
        match dtype {
            ElementType::F32 => bytes.extend_from_slice(&(v as f32).to_le_bytes()),
            ElementType::F64 => bytes.extend_from_slice(&v.to_le_bytes()),
            ElementType::I32 => bytes.extend_from_slice(&(v as i32).to_le_bytes()),
            ElementType::I64 => bytes.extend_from_slice(&(v as i64).to_le_bytes()),
            ElementType::I8 => bytes.push(v as i8 as u8),
            ElementType::U8 | ElementType::Bool => bytes.push(v as u8),
            ElementType::F16 => {
                let half = (v as f32).to_le_bytes();
                bytes.extend_from_slice(&half[..2]);
            }
        }
    }
    bytes
}

fn to_i64s(tensor: &Tensor) -> Result<Vec<i64>> {
    Ok(to_f64s(tensor)?.iter().map(|&v| v as i64).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Layer, NetworkTensor, Weights};

    fn relu_network() -> NetworkDefinition {
        let mut net = NetworkDefinition::new("relu_net");
        net.inputs.push(NetworkTensor {
            name: "x".to_string(),
            dtype: ElementType::F32,
            dims: vec![-1, 2],
            is_shape_tensor: false,
        });
        net.outputs.push(NetworkTensor {
            name: "y".to_string(),
            dtype: ElementType::F32,
            dims: vec![-1, 2],
            is_shape_tensor: false,
        });
        net.layers.push(Layer::new(
            "relu_0",
            LayerKind::Activation(ActivationKind::Relu),
            vec!["x".to_string()],
            vec!["y".to_string()],
        ));
        net
    }

    fn batch_profile(max_batch: i64) -> OptimizationProfile {
        let mut profile = OptimizationProfile::new();
        profile.set_dimensions(
            "x",
            crate::profile::ShapeTriple {
                min: vec![1, 2],
                opt: vec![1, 2],
                max: vec![max_batch, 2],
            },
        );
        profile
    }

    fn f32_bytes(vals: &[f32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn build_requires_profile_for_dynamic_input() {
        let backend = SimBackend::new();
        let err = backend.build_engine(&relu_network(), &BuildConfig::default());
        assert!(matches!(err, Err(AccelError::BuildError(_))));
    }

    #[test]
    fn relu_executes_end_to_end() {
        let backend = SimBackend::new();
        let config = BuildConfig {
            profiles: vec![batch_profile(8)],
            ..Default::default()
        };
        let blob = backend.build_engine(&relu_network(), &config).unwrap();
        let engine = backend.deserialize_engine(&blob).unwrap();
        let mut ctx = engine.create_context(ContextMemory::Internal).unwrap();

        let alloc = backend.allocator();
        let input = alloc.alloc(16);
        let output = alloc.alloc(16);
        alloc
            .write(input.ptr(), &f32_bytes(&[-1.0, 2.0, -3.0, 4.0]))
            .unwrap();

        ctx.set_input_shape("x", &[2, 2]).unwrap();
        ctx.set_tensor_address("x", input.ptr()).unwrap();
        ctx.set_tensor_address("y", output.ptr()).unwrap();

        let mut stream = backend.create_stream();
        ctx.enqueue(&mut stream).unwrap();
        stream.synchronize().unwrap();

        let out = alloc.read(output.ptr(), 16).unwrap();
        let vals: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(vals, vec![0.0, 2.0, 0.0, 4.0]);
    }

    #[test]
    fn shape_outside_profile_is_rejected() {
        let backend = SimBackend::new();
        let config = BuildConfig {
            profiles: vec![batch_profile(4)],
            ..Default::default()
        };
        let blob = backend.build_engine(&relu_network(), &config).unwrap();
        let engine = backend.deserialize_engine(&blob).unwrap();
        let mut ctx = engine.create_context(ContextMemory::Internal).unwrap();
        assert!(matches!(
            ctx.set_input_shape("x", &[16, 2]),
            Err(AccelError::ShapeOutOfRange { .. })
        ));
    }

    #[test]
    fn stripped_engine_refuses_enqueue_until_refit() {
        let backend = SimBackend::new();
        let mut net = relu_network();
        net.weights.insert(
            "w".to_string(),
            Weights {
                dtype: ElementType::F32,
                dims: vec![2],
                data: f32_bytes(&[1.0, 2.0]),
            },
        );
        let config = BuildConfig {
            profiles: vec![batch_profile(8)],
            strip_weights: true,
            ..Default::default()
        };
        let blob = backend.build_engine(&net, &config).unwrap();
        let engine = backend.deserialize_engine(&blob).unwrap();
        assert!(engine.needs_refit());

        let alloc = backend.allocator();
        let input = alloc.alloc(8);
        let output = alloc.alloc(8);
        let mut ctx = engine.create_context(ContextMemory::Internal).unwrap();
        ctx.set_input_shape("x", &[1, 2]).unwrap();
        ctx.set_tensor_address("x", input.ptr()).unwrap();
        ctx.set_tensor_address("y", output.ptr()).unwrap();

        let mut stream = backend.create_stream();
        assert!(matches!(
            ctx.enqueue(&mut stream),
            Err(AccelError::RefitRequired(_))
        ));

        let mut refit = WeightMap::new();
        refit.insert(
            "w".to_string(),
            Weights {
                dtype: ElementType::F32,
                dims: vec![2],
                data: f32_bytes(&[1.0, 2.0]),
            },
        );
        engine.refit_weights(&refit).unwrap();
        assert!(!engine.needs_refit());
        ctx.enqueue(&mut stream).unwrap();
    }

    #[test]
    fn hardware_compatible_engine_loads_on_newer_device() {
        let old = SimBackend::with_capabilities(Capabilities {
            fast_fp16: true,
            fast_int8: true,
            native_int64: true,
            native_double: true,
            hardware_compat: true,
            compute_capability: "80".to_string(),
        });
        let config = BuildConfig {
            profiles: vec![batch_profile(8)],
            hardware_compatible: true,
            ..Default::default()
        };
        let blob = old.build_engine(&relu_network(), &config).unwrap();

        let newer = SimBackend::new();
        assert!(newer.deserialize_engine(&blob).is_ok());

        let strict = old
            .build_engine(
                &relu_network(),
                &BuildConfig {
                    profiles: vec![batch_profile(8)],
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(matches!(
            newer.deserialize_engine(&strict),
            Err(AccelError::DeserializeError(_))
        ));
    }
}
