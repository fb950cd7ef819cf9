//! The execution provider: per-subgraph registry and call orchestration.
//!
//! An [`ExecutionProvider`] owns every engine, execution context, and
//! cache table for the lifetime of the loaded model. Each compiled
//! subgraph lives in its own [`SubgraphState`] behind its own mutex, so
//! concurrent calls into one subgraph serialize around the full critical
//! section (shape resolution, possible rebuild, binding, enqueue,
//! synchronization) while calls into different subgraphs overlap freely.

use crate::binder::BindingSession;
use crate::cache::{CryptoHooks, EngineCacheManager};
use crate::calibration::load_calibration_table;
use crate::compile::{data_type, profile_inputs, CompiledArtifact, PartitionCompiler};
use crate::context::KernelContext;
use crate::context_model::{self, ContextEngine, ContextModel};
use crate::dds::DdsOutputAllocator;
use crate::error::{EpError, Result};
use crate::options::ProviderOptions;
use crate::runner::{shape_fingerprint, ContextRunner};
use crate::shape_profile::{ProfileInput, ShapeRangeTable};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tephra_accel::{
    Backend, ContextMemory, DeviceBuffer, DevicePtr, DeviceStream, Engine, ExecutionContext,
    IoTensorDesc, TensorIoMode, WeightMap,
};
use tephra_graph::{DataType, SubgraphView, TensorKind};
use tracing::{debug, info, warn};

/// Where a subgraph's engine comes from.
enum EngineSource {
    /// Compiled (and recompiled on demand) from a graph view.
    Graph(SubgraphView),

    /// Loaded from a context model; cannot be rebuilt.
    Precompiled,
}

/// Everything one subgraph owns, mutated only under its lock.
pub struct SubgraphState {
    name: String,
    inner: Mutex<StateInner>,
}

struct StateInner {
    source: EngineSource,
    table: ShapeRangeTable,
    profile_inputs: Vec<ProfileInput>,
    engine: Option<Box<dyn Engine>>,
    exec: Option<Box<dyn ExecutionContext>>,
    ios: Vec<IoTensorDesc>,
    output_types: HashMap<String, DataType>,
    dds: HashMap<String, Arc<DdsOutputAllocator>>,
    runner: ContextRunner,
    build_count: u64,
    refit_pending: bool,
    cache_key: Option<String>,
}

#[derive(Default)]
struct SharedArena {
    buffer: Option<DeviceBuffer>,
    capacity: u64,
}

/// The provider instance owning all subgraph state.
pub struct ExecutionProvider {
    backend: Arc<dyn Backend>,
    options: ProviderOptions,
    cache: Option<EngineCacheManager>,
    calibration: Option<BTreeMap<String, f32>>,
    subgraphs: Mutex<HashMap<String, Arc<SubgraphState>>>,
    shared_arena: Mutex<SharedArena>,
}

impl ExecutionProvider {
    /// Create a provider over a backend with validated options.
    pub fn new(backend: Arc<dyn Backend>, options: ProviderOptions) -> Result<Self> {
        let calibration = match (&options.int8_calibration_table_name, options.int8_enable) {
            (Some(name), true) => {
                let path = options.engine_cache_path.join(name);
                if path.exists() {
                    Some(load_calibration_table(
                        &path,
                        options.int8_use_native_calibration_table,
                    )?)
                } else {
                    warn!(path = %path.display(), "calibration table not found");
                    None
                }
            }
            _ => None,
        };
        let cache = options.engine_cache_enable.then(|| {
            EngineCacheManager::new(
                options.engine_cache_path.clone(),
                options.engine_cache_prefix.clone(),
            )
        });
        Ok(Self {
            backend,
            options,
            cache,
            calibration,
            subgraphs: Mutex::new(HashMap::new()),
            shared_arena: Mutex::new(SharedArena::default()),
        })
    }

    /// Install engine encryption hooks. Requires the engine cache and
    /// `engine_decryption_enable`.
    pub fn set_crypto_hooks(&mut self, hooks: CryptoHooks) -> Result<()> {
        if !self.options.engine_decryption_enable {
            return Err(EpError::Validation(
                "encryption hooks require engine_decryption_enable".to_string(),
            ));
        }
        match &mut self.cache {
            Some(cache) => {
                cache.set_crypto_hooks(hooks);
                Ok(())
            }
            None => Err(EpError::Validation(
                "encryption hooks require engine_cache_enable".to_string(),
            )),
        }
    }

    fn compiler(&self) -> PartitionCompiler<'_> {
        PartitionCompiler::new(
            self.backend.as_ref(),
            &self.options,
            self.calibration.as_ref(),
        )
    }

    /// Compile a subgraph (or adopt its cached engine) and register it.
    ///
    /// A subgraph with implicit dynamic shapes and no usable cache entry
    /// defers the actual engine build to its first call.
    pub fn compile_subgraph(&self, view: SubgraphView) -> Result<()> {
        let name = view.name().to_string();
        if self.subgraphs.lock().contains_key(&name) {
            return Err(EpError::Validation(format!(
                "subgraph '{name}' is already registered"
            )));
        }

        let inputs = profile_inputs(&view)?;
        let mut table = if inputs.iter().any(|i| i.is_dynamic()) {
            if self.options.has_explicit_profiles() {
                ShapeRangeTable::from_explicit(
                    &inputs,
                    &self.options.profile_min_shapes,
                    &self.options.profile_max_shapes,
                    &self.options.profile_opt_shapes,
                )?
            } else {
                ShapeRangeTable::implicit(&inputs)
            }
        } else {
            ShapeRangeTable::default()
        };

        let compiler = self.compiler();
        let precision = compiler.effective_precision();
        let caps = self.backend.capabilities();
        let cache_key = self.cache.as_ref().map(|cache| {
            cache.cache_key(
                &name,
                precision,
                self.options.engine_hw_compatible,
                &caps.compute_capability,
            )
        });

        let mut engine: Option<Box<dyn Engine>> = None;
        let mut refit_pending = false;
        let mut build_count = 0;
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(cached_table) = cache.reconcile_profiles(key, &table) {
                let bytes = match cache.load_engine(key)? {
                    Some(bytes) => Some(bytes),
                    None if self.options.weight_stripped_engine_enable => {
                        let stripped = cache.load_stripped_engine(key);
                        refit_pending = stripped.is_some();
                        stripped
                    }
                    None => None,
                };
                if let Some(bytes) = bytes {
                    match self.backend.deserialize_engine(&bytes) {
                        Ok(e) => {
                            info!(subgraph = %name, key = %key, "loaded cached engine");
                            table = cached_table;
                            engine = Some(e);
                        }
                        Err(e) => {
                            warn!(subgraph = %name, error = %e, "cached engine unusable; rebuilding");
                            refit_pending = false;
                        }
                    }
                }
            }
        }

        if engine.is_none() && !table.needs_resolution() {
            let artifact = compiler.compile(&view, &table)?;
            self.persist_artifact(&name, cache_key.as_deref(), &artifact, &table)?;
            engine = Some(
                self.backend
                    .deserialize_engine(&artifact.engine_bytes)
                    .map_err(|e| EpError::Build(format!("subgraph '{name}': {e}")))?,
            );
            refit_pending = self.options.weight_stripped_engine_enable;
            build_count = 1;
        }

        if refit_pending {
            if let Some(engine) = engine.as_deref() {
                refit_from_view(engine, &view)?;
                refit_pending = false;
            }
        }

        let mut output_types = HashMap::new();
        for output in view.output_names() {
            output_types.insert(output.clone(), view.tensor(output)?.dtype);
        }
        let (exec, ios) = match engine.as_deref() {
            Some(engine) => (
                Some(self.create_exec_context(engine)?),
                engine.io_tensors(),
            ),
            None => {
                debug!(subgraph = %name, "deferring engine build to first call");
                (None, Vec::new())
            }
        };

        let state = Arc::new(SubgraphState {
            name: name.clone(),
            inner: Mutex::new(StateInner {
                source: EngineSource::Graph(view),
                table,
                profile_inputs: inputs,
                engine,
                exec,
                ios,
                output_types,
                dds: HashMap::new(),
                runner: ContextRunner::new(self.options.graph_capture_enable),
                build_count,
                refit_pending,
                cache_key,
            }),
        });
        self.subgraphs.lock().insert(name, state);
        Ok(())
    }

    /// Register a subgraph from a persisted context model.
    pub fn compile_from_context_model(&self, path: &std::path::Path) -> Result<()> {
        let model = context_model::read_context_model(path)?;
        let caps = self.backend.capabilities();
        if !model.hardware_compatible && model.compute_capability != caps.compute_capability {
            return Err(EpError::Validation(format!(
                "context model '{}' targets compute capability {}, device is {}",
                model.fused_name, model.compute_capability, caps.compute_capability
            )));
        }
        if self.subgraphs.lock().contains_key(&model.fused_name) {
            return Err(EpError::Validation(format!(
                "subgraph '{}' is already registered",
                model.fused_name
            )));
        }

        let bytes = model.engine_bytes(&self.options.engine_cache_path)?;
        let engine = self
            .backend
            .deserialize_engine(&bytes)
            .map_err(|e| EpError::Build(format!("context model '{}': {e}", model.fused_name)))?;
        if engine.needs_refit() {
            return Err(EpError::Build(format!(
                "context model '{}' holds a weight-stripped engine; compile from the graph \
                 to supply refit weights",
                model.fused_name
            )));
        }

        let ios = engine.io_tensors();
        let profile_inputs = ios
            .iter()
            .filter(|d| d.mode == TensorIoMode::Input)
            .map(|d| ProfileInput {
                name: d.name.clone(),
                dims: d.dims.clone(),
                is_shape_tensor: d.is_shape_tensor,
            })
            .collect();
        let output_types = ios
            .iter()
            .filter(|d| d.mode == TensorIoMode::Output)
            .map(|d| (d.name.clone(), data_type(d.dtype)))
            .collect();
        let exec = Some(self.create_exec_context(engine.as_ref())?);

        let state = Arc::new(SubgraphState {
            name: model.fused_name.clone(),
            inner: Mutex::new(StateInner {
                source: EngineSource::Precompiled,
                table: ShapeRangeTable::default(),
                profile_inputs,
                engine: Some(engine),
                exec,
                ios,
                output_types,
                dds: HashMap::new(),
                runner: ContextRunner::new(self.options.graph_capture_enable),
                build_count: 0,
                refit_pending: false,
                cache_key: None,
            }),
        });
        self.subgraphs.lock().insert(model.fused_name, state);
        Ok(())
    }

    /// Run one inference call against a registered subgraph.
    pub fn run(&self, name: &str, kernel: &mut KernelContext) -> Result<()> {
        let state = self
            .subgraphs
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| EpError::Validation(format!("unknown subgraph '{name}'")))?;
        let mut inner = state.inner.lock();
        let inner = &mut *inner;
        let mut stream = self.backend.create_stream();

        // Shape observation: widen the range table from this call's
        // shapes and shape-tensor values before deciding on a rebuild.
        let mut shape_values: HashMap<String, Vec<i64>> = HashMap::new();
        let mut widened = false;
        for input in inner.profile_inputs.iter().filter(|i| i.is_dynamic()) {
            let tensor = kernel.input(&input.name).ok_or_else(|| {
                EpError::Binding(format!("no caller tensor for input '{}'", input.name))
            })?;
            let observed = if input.is_shape_tensor {
                let values = read_shape_values(&mut stream, tensor)?;
                shape_values.insert(input.name.clone(), values.clone());
                values
            } else {
                tensor.dims.clone()
            };
            widened |= inner.table.update_from_call(&input.name, &observed);
        }

        if inner.engine.is_none() || widened {
            let EngineSource::Graph(_) = inner.source else {
                return Err(EpError::Build(format!(
                    "subgraph '{}': shapes outside the precompiled engine's profiles \
                     cannot trigger a rebuild",
                    state.name
                )));
            };
            self.rebuild(&state.name, inner)?;
        }

        if inner.refit_pending {
            let engine = inner.engine.as_deref().ok_or_else(|| {
                EpError::Build(format!("subgraph '{}' has no engine", state.name))
            })?;
            let EngineSource::Graph(view) = &inner.source else {
                return Err(EpError::Build(format!(
                    "subgraph '{}' requires refit but has no source graph",
                    state.name
                )));
            };
            refit_from_view(engine, view)?;
            inner.refit_pending = false;
        }

        let engine = inner.engine.as_deref().ok_or_else(|| {
            EpError::Build(format!("subgraph '{}' has no engine", state.name))
        })?;
        let exec = inner.exec.as_deref_mut().ok_or_else(|| {
            EpError::Build(format!("subgraph '{}' has no execution context", state.name))
        })?;
        if self.options.context_memory_sharing_enable {
            let arena = self.ensure_arena(engine.device_memory_size())?;
            exec.set_device_memory(arena).map_err(EpError::from)?;
        }

        let mut session = BindingSession::with_shape_values(shape_values);
        session.bind_inputs(
            exec,
            &inner.ios,
            kernel,
            self.backend.capabilities(),
            &mut stream,
        )?;
        session.bind_outputs(
            exec,
            &inner.ios,
            kernel,
            &inner.output_types,
            &mut inner.dds,
            &self.backend.allocator(),
        )?;
        let fingerprint = call_fingerprint(
            &inner.ios,
            kernel,
            session.shape_values(),
            session.bound_addresses(),
        );
        inner.runner.shapes_bound();
        inner.runner.run(exec, &mut stream, fingerprint)?;
        session.finish(kernel, &mut stream)?;
        inner.runner.finish();
        Ok(())
    }

    /// Number of engine builds performed for a subgraph (0 for unknown
    /// names). Stable across calls that reuse the engine.
    pub fn build_count(&self, name: &str) -> u64 {
        self.subgraphs
            .lock()
            .get(name)
            .map(|state| state.inner.lock().build_count)
            .unwrap_or(0)
    }

    /// Whether the last call on a subgraph replayed a captured graph.
    pub fn replayed_capture(&self, name: &str) -> bool {
        self.subgraphs
            .lock()
            .get(name)
            .map(|state| state.inner.lock().runner.replayed_capture())
            .unwrap_or(false)
    }

    fn rebuild(&self, name: &str, inner: &mut StateInner) -> Result<()> {
        let artifact = {
            let EngineSource::Graph(view) = &inner.source else {
                return Err(EpError::Build(format!(
                    "subgraph '{name}' cannot be rebuilt"
                )));
            };
            self.compiler().compile(view, &inner.table)?
        };
        self.persist_artifact(name, inner.cache_key.as_deref(), &artifact, &inner.table)?;

        let engine = self
            .backend
            .deserialize_engine(&artifact.engine_bytes)
            .map_err(|e| EpError::Build(format!("subgraph '{name}': {e}")))?;
        inner.exec = Some(self.create_exec_context(engine.as_ref())?);
        inner.ios = engine.io_tensors();
        inner.engine = Some(engine);
        inner.build_count += 1;
        inner.refit_pending = self.options.weight_stripped_engine_enable;
        inner.runner.invalidate_capture();
        info!(subgraph = name, builds = inner.build_count, "engine (re)built");
        Ok(())
    }

    fn persist_artifact(
        &self,
        name: &str,
        cache_key: Option<&str>,
        artifact: &CompiledArtifact,
        table: &ShapeRangeTable,
    ) -> Result<()> {
        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            if self.options.weight_stripped_engine_enable {
                cache.store_stripped_engine(key, &artifact.engine_bytes)?;
            } else {
                cache.store_engine(key, &artifact.engine_bytes)?;
            }
            cache.store_profile(key, table)?;
        }
        if self.options.ep_context_enable {
            self.write_context_model(name, cache_key, &artifact.engine_bytes)?;
        }
        Ok(())
    }

    fn write_context_model(
        &self,
        name: &str,
        cache_key: Option<&str>,
        engine_bytes: &[u8],
    ) -> Result<()> {
        let engine = if self.options.ep_context_embed_mode == 1 {
            ContextEngine::Embedded(engine_bytes.to_vec())
        } else {
            let key = cache_key.ok_or_else(|| {
                EpError::Validation(
                    "ep_context_embed_mode 0 requires the engine cache".to_string(),
                )
            })?;
            ContextEngine::Referenced(format!("{key}.engine"))
        };
        let model = ContextModel {
            fused_name: name.to_string(),
            compute_capability: self.backend.capabilities().compute_capability.clone(),
            hardware_compatible: self.options.engine_hw_compatible,
            engine,
        };
        let path = match &self.options.ep_context_file_path {
            Some(path) => path.clone(),
            None => self
                .options
                .engine_cache_path
                .join(format!("{name}_ctx.json")),
        };
        context_model::write_context_model(&path, &model)
    }

    fn create_exec_context(&self, engine: &dyn Engine) -> Result<Box<dyn ExecutionContext>> {
        if self.options.context_memory_sharing_enable {
            let arena = self.ensure_arena(engine.device_memory_size())?;
            let mut exec = engine
                .create_context(ContextMemory::UserManaged(arena))
                .map_err(EpError::from)?;
            exec.set_device_memory(arena).map_err(EpError::from)?;
            Ok(exec)
        } else {
            engine
                .create_context(ContextMemory::Internal)
                .map_err(EpError::from)
        }
    }

    /// Grow the shared scratch arena to at least `size` bytes and return
    /// its address.
    fn ensure_arena(&self, size: u64) -> Result<DevicePtr> {
        let mut arena = self.shared_arena.lock();
        if arena.buffer.is_none() || arena.capacity < size {
            arena.buffer = Some(self.backend.allocator().alloc(size as usize));
            arena.capacity = size;
        }
        arena
            .buffer
            .as_ref()
            .map(|b| b.ptr())
            .ok_or_else(|| EpError::Device("shared arena allocation failed".to_string()))
    }
}

fn call_fingerprint(
    ios: &[IoTensorDesc],
    kernel: &KernelContext,
    shape_values: &HashMap<String, Vec<i64>>,
    bindings: &[(String, DevicePtr)],
) -> u64 {
    let mut entries: Vec<(String, Vec<i64>)> = Vec::new();
    for desc in ios.iter().filter(|d| d.mode == TensorIoMode::Input) {
        // Shape-tensor values change execution even when dims do not.
        if let Some(values) = shape_values.get(&desc.name) {
            entries.push((desc.name.clone(), values.clone()));
        } else if let Some(tensor) = kernel.input(&desc.name) {
            entries.push((desc.name.clone(), tensor.dims.clone()));
        }
    }
    let shapes = shape_fingerprint(
        entries
            .iter()
            .map(|(name, dims)| (name.as_str(), dims.as_slice())),
    );
    // A captured graph replays against the addresses recorded at capture
    // time, so a call bound to different device buffers is a different
    // call even when its shapes match.
    let mut hasher = DefaultHasher::new();
    shapes.hash(&mut hasher);
    for (name, ptr) in bindings {
        name.hash(&mut hasher);
        ptr.raw().hash(&mut hasher);
    }
    hasher.finish()
}

fn read_shape_values(
    stream: &mut DeviceStream,
    tensor: &crate::context::CallTensor,
) -> Result<Vec<i64>> {
    let bytes = stream
        .read_to_host(tensor.ptr, tensor.byte_len())
        .map_err(|e| EpError::Binding(format!("reading shape tensor values: {e}")))?;
    match tensor.dtype {
        DataType::I64 => Ok(bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap_or_default()))
            .collect()),
        DataType::I32 => Ok(bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap_or_default()) as i64)
            .collect()),
        other => Err(EpError::Binding(format!(
            "shape tensor has element type {other}; expected i32 or i64"
        ))),
    }
}

fn refit_from_view(engine: &dyn Engine, view: &SubgraphView) -> Result<()> {
    let mut weights = WeightMap::new();
    for info in &view.graph().tensor_info {
        if info.kind != TensorKind::Weight {
            continue;
        }
        let Some(data) = info.initializer.clone() else {
            continue;
        };
        let Some(dims) = info.shape.dims_i64() else {
            continue;
        };
        weights.insert(
            info.name.clone(),
            tephra_accel::Weights {
                dtype: crate::compile::element_type(info.dtype),
                dims,
                data,
            },
        );
    }
    engine
        .refit_weights(&weights)
        .map_err(|e| EpError::Build(format!("refit failed: {e}")))?;
    debug!(subgraph = view.name(), "weight-stripped engine refitted");
    Ok(())
}
