//! Tensor binding.
//!
//! A [`BindingSession`] lives for exactly one inference call. It walks
//! the engine's I/O tensors, gives each one a device-visible address,
//! and records the work that has to happen after execution: widening
//! casts back into caller tensors and data-dependent-output copy-back.
//! Scratch allocations are owned by the session and released when it
//! drops.

use crate::compile::element_type;
use crate::context::KernelContext;
use crate::dds::DdsOutputAllocator;
use crate::error::{EpError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tephra_accel::{
    Capabilities, DeviceAllocator, DeviceBuffer, DevicePtr, DeviceStream, ElementType,
    ExecutionContext, IoTensorDesc, OutputAllocator, TensorIoMode,
};
use tephra_graph::DataType;

enum CopyBack {
    /// Widen an engine-typed scratch buffer into the caller's output.
    Cast {
        src: DevicePtr,
        src_ty: ElementType,
        dst: DevicePtr,
        dst_ty: ElementType,
        count: usize,
    },
    /// Materialize a data-dependent output from its capturing allocator.
    Dds {
        name: String,
        allocator: Arc<DdsOutputAllocator>,
        dtype: DataType,
        engine_ty: ElementType,
    },
}

/// Per-call binding state.
pub struct BindingSession {
    scratch: Vec<DeviceBuffer>,
    shape_values: HashMap<String, Vec<i64>>,
    copy_backs: Vec<CopyBack>,
    bound: Vec<(String, DevicePtr)>,
}

impl BindingSession {
    pub fn new() -> Self {
        Self {
            scratch: Vec::new(),
            shape_values: HashMap::new(),
            copy_backs: Vec::new(),
            bound: Vec::new(),
        }
    }

    /// Seed the per-call shape-value cache with values already read
    /// during profile resolution, avoiding a second device-to-host copy.
    pub fn with_shape_values(shape_values: HashMap<String, Vec<i64>>) -> Self {
        Self {
            shape_values,
            ..Self::new()
        }
    }

    /// Bind every engine input: shapes first, then addresses.
    pub fn bind_inputs(
        &mut self,
        exec: &mut dyn ExecutionContext,
        ios: &[IoTensorDesc],
        kernel: &KernelContext,
        caps: &Capabilities,
        stream: &mut DeviceStream,
    ) -> Result<()> {
        for desc in ios.iter().filter(|d| d.mode == TensorIoMode::Input) {
            let tensor = kernel.input(&desc.name).ok_or_else(|| {
                EpError::Binding(format!("no caller tensor for engine input '{}'", desc.name))
            })?;

            if desc.is_shape_tensor {
                let values =
                    self.shape_tensor_values(&desc.name, tensor.ptr, tensor.dtype, tensor.dims.clone(), stream)?;
                exec.set_shape_values(&desc.name, &values)
                    .map_err(EpError::from)?;
            } else {
                exec.set_input_shape(&desc.name, &tensor.dims)
                    .map_err(EpError::from)?;
            }

            let address = self.input_address(&desc.name, desc.dtype, tensor, caps, stream)?;
            exec.set_tensor_address(&desc.name, address).map_err(|e| {
                EpError::Binding(format!("binding input '{}': {e}", desc.name))
            })?;
            self.bound.push((desc.name.clone(), address));
        }
        Ok(())
    }

    /// Bind every engine output.
    ///
    /// Outputs with a resolved shape get a caller-owned buffer (through
    /// a cast scratch when the engine carries a narrowed type); outputs
    /// whose shape is still unknown get their persistent capturing
    /// allocator.
    pub fn bind_outputs(
        &mut self,
        exec: &mut dyn ExecutionContext,
        ios: &[IoTensorDesc],
        kernel: &mut KernelContext,
        output_types: &HashMap<String, DataType>,
        dds: &mut HashMap<String, Arc<DdsOutputAllocator>>,
        alloc: &DeviceAllocator,
    ) -> Result<()> {
        for desc in ios.iter().filter(|d| d.mode == TensorIoMode::Output) {
            let dtype = output_types
                .get(&desc.name)
                .copied()
                .ok_or_else(|| {
                    EpError::Binding(format!("no declared type for output '{}'", desc.name))
                })?;
            let shape = exec.tensor_shape(&desc.name).map_err(EpError::from)?;

            if shape.contains(&-1) {
                let allocator = dds
                    .entry(desc.name.clone())
                    .or_insert_with(|| DdsOutputAllocator::new(alloc.clone()))
                    .clone();
                allocator.reset_shape();
                exec.set_output_allocator(&desc.name, allocator.clone() as Arc<dyn OutputAllocator>)
                    .map_err(|e| {
                        EpError::Binding(format!("binding DDS output '{}': {e}", desc.name))
                    })?;
                self.copy_backs.push(CopyBack::Dds {
                    name: desc.name.clone(),
                    allocator,
                    dtype,
                    engine_ty: desc.dtype,
                });
                continue;
            }

            let count: usize = shape.iter().map(|&d| d.max(0) as usize).product();
            let declared_ty = element_type(dtype);
            if count == 0 {
                // The caller still sees an empty tensor of the right
                // shape; the engine still needs a unique non-null
                // address.
                kernel.allocate_output(&desc.name, dtype, shape)?;
                let address = self.unique_scratch(alloc);
                exec.set_tensor_address(&desc.name, address).map_err(|e| {
                    EpError::Binding(format!("binding empty output '{}': {e}", desc.name))
                })?;
                self.bound.push((desc.name.clone(), address));
            } else if declared_ty != desc.dtype {
                check_cast_pair(&desc.name, declared_ty, desc.dtype)?;
                let narrow = alloc.alloc(count * desc.dtype.size());
                let narrow_ptr = narrow.ptr();
                self.scratch.push(narrow);
                exec.set_tensor_address(&desc.name, narrow_ptr).map_err(|e| {
                    EpError::Binding(format!("binding output '{}': {e}", desc.name))
                })?;
                self.bound.push((desc.name.clone(), narrow_ptr));
                let dst = kernel.allocate_output(&desc.name, dtype, shape)?;
                self.copy_backs.push(CopyBack::Cast {
                    src: narrow_ptr,
                    src_ty: desc.dtype,
                    dst,
                    dst_ty: declared_ty,
                    count,
                });
            } else {
                let ptr = kernel.allocate_output(&desc.name, dtype, shape)?;
                exec.set_tensor_address(&desc.name, ptr).map_err(|e| {
                    EpError::Binding(format!("binding output '{}': {e}", desc.name))
                })?;
                self.bound.push((desc.name.clone(), ptr));
            }
        }
        Ok(())
    }

    /// Run the recorded post-execution work: widening casts and
    /// data-dependent copy-back. Call after stream synchronization.
    pub fn finish(
        &mut self,
        kernel: &mut KernelContext,
        stream: &mut DeviceStream,
    ) -> Result<()> {
        for copy_back in self.copy_backs.drain(..) {
            match copy_back {
                CopyBack::Cast {
                    src,
                    src_ty,
                    dst,
                    dst_ty,
                    count,
                } => {
                    stream
                        .cast(src, src_ty, dst, dst_ty, count)
                        .map_err(EpError::from)?;
                }
                CopyBack::Dds {
                    name,
                    allocator,
                    dtype,
                    engine_ty,
                } => {
                    let dims = allocator.captured_dims().ok_or_else(|| {
                        EpError::Device(format!(
                            "execution reported no shape for data-dependent output '{name}'"
                        ))
                    })?;
                    let count: usize = dims.iter().map(|&d| d.max(0) as usize).product();
                    let dst = kernel.allocate_output(&name, dtype, dims)?;
                    if count == 0 {
                        continue;
                    }
                    let src = allocator.captured_ptr().ok_or_else(|| {
                        EpError::Device(format!(
                            "no captured buffer for data-dependent output '{name}'"
                        ))
                    })?;
                    let declared_ty = element_type(dtype);
                    if declared_ty != engine_ty {
                        check_cast_pair(&name, declared_ty, engine_ty)?;
                        stream
                            .cast(src, engine_ty, dst, declared_ty, count)
                            .map_err(EpError::from)?;
                    } else {
                        stream
                            .copy_device_to_device(src, dst, count * engine_ty.size())
                            .map_err(EpError::from)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Shape-tensor values read so far this call.
    pub fn shape_values(&self) -> &HashMap<String, Vec<i64>> {
        &self.shape_values
    }

    /// Every `(tensor, address)` pair bound on the execution context
    /// this call, in binding order. A captured command graph replays
    /// against the addresses it recorded, so these are part of a call's
    /// identity.
    pub fn bound_addresses(&self) -> &[(String, DevicePtr)] {
        &self.bound
    }

    /// Shape-tensor values, copied device-to-host at most once per
    /// distinct name per call.
    fn shape_tensor_values(
        &mut self,
        name: &str,
        ptr: DevicePtr,
        dtype: DataType,
        dims: Vec<i64>,
        stream: &mut DeviceStream,
    ) -> Result<Vec<i64>> {
        if let Some(values) = self.shape_values.get(name) {
            return Ok(values.clone());
        }
        let count: usize = dims.iter().map(|&d| d.max(0) as usize).product();
        let bytes = stream
            .read_to_host(ptr, count * dtype.size())
            .map_err(|e| EpError::Binding(format!("reading shape tensor '{name}': {e}")))?;
        let values = match dtype {
            DataType::I64 => bytes
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes(c.try_into().unwrap_or_default()))
                .collect(),
            DataType::I32 => bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes(c.try_into().unwrap_or_default()) as i64)
                .collect(),
            other => {
                return Err(EpError::Binding(format!(
                    "shape tensor '{name}' has element type {other}; expected i32 or i64"
                )))
            }
        };
        self.shape_values.insert(name.to_string(), values);
        Ok(self.shape_values[name].clone())
    }

    /// Device address for an engine input, inserting a narrowing cast
    /// when the device does not carry the declared type.
    fn input_address(
        &mut self,
        name: &str,
        engine_ty: ElementType,
        tensor: &crate::context::CallTensor,
        caps: &Capabilities,
        stream: &mut DeviceStream,
    ) -> Result<DevicePtr> {
        let declared_ty = element_type(tensor.dtype);
        if tensor.is_empty() {
            return Ok(self.unique_scratch(stream.allocator()));
        }
        if declared_ty == engine_ty {
            if !caps.supports_native(declared_ty) {
                return Err(EpError::Binding(format!(
                    "tensor '{name}': element type {declared_ty} is not supported by the device"
                )));
            }
            return Ok(tensor.ptr);
        }
        check_cast_pair(name, declared_ty, engine_ty)?;
        let count = tensor.element_count();
        let narrow = stream.allocator().alloc(count * engine_ty.size());
        let narrow_ptr = narrow.ptr();
        self.scratch.push(narrow);
        stream
            .cast(tensor.ptr, declared_ty, narrow_ptr, engine_ty, count)
            .map_err(|e| EpError::Binding(format!("narrowing input '{name}': {e}")))?;
        Ok(narrow_ptr)
    }

    /// A fresh 1-byte allocation; every empty tensor in a call gets its
    /// own non-null address.
    fn unique_scratch(&mut self, alloc: &DeviceAllocator) -> DevicePtr {
        let buffer = alloc.alloc(1);
        let ptr = buffer.ptr();
        self.scratch.push(buffer);
        ptr
    }
}

impl Default for BindingSession {
    fn default() -> Self {
        Self::new()
    }
}

fn check_cast_pair(name: &str, declared: ElementType, engine: ElementType) -> Result<()> {
    let ok = matches!(
        (declared, engine),
        (ElementType::I64, ElementType::I32)
            | (ElementType::I32, ElementType::I64)
            | (ElementType::F64, ElementType::F32)
            | (ElementType::F32, ElementType::F64)
    );
    if ok {
        Ok(())
    } else {
        Err(EpError::Binding(format!(
            "tensor '{name}': cannot adapt element type {declared} to device type {engine}"
        )))
    }
}
