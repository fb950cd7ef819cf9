//! Per-call kernel context.
//!
//! A [`KernelContext`] carries the caller's device-resident input tensors
//! into one inference call and receives the outputs. Output buffers are
//! allocated by the provider once shapes are known (or, for data-dependent
//! outputs, after execution); all buffers owned by the context are
//! released when it drops.

use crate::error::{EpError, Result};
use std::collections::HashMap;
use tephra_accel::{DeviceAllocator, DeviceBuffer, DevicePtr};
use tephra_graph::DataType;

/// A device tensor crossing the call boundary.
#[derive(Debug, Clone)]
pub struct CallTensor {
    /// Element type.
    pub dtype: DataType,

    /// Concrete dims.
    pub dims: Vec<i64>,

    /// Device address of the data.
    pub ptr: DevicePtr,
}

impl CallTensor {
    /// Number of elements, or zero for an empty tensor.
    pub fn element_count(&self) -> usize {
        self.dims.iter().map(|&d| d.max(0) as usize).product()
    }

    /// Payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size()
    }

    /// True if any extent is zero.
    pub fn is_empty(&self) -> bool {
        self.dims.iter().any(|&d| d == 0)
    }
}

/// Caller-facing tensor set for one inference call.
pub struct KernelContext {
    alloc: DeviceAllocator,
    inputs: HashMap<String, CallTensor>,
    outputs: HashMap<String, CallTensor>,
    owned: Vec<DeviceBuffer>,
}

impl KernelContext {
    /// Create an empty context over the backend's device heap.
    pub fn new(alloc: DeviceAllocator) -> Self {
        Self {
            alloc,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            owned: Vec::new(),
        }
    }

    /// Stage an input: allocates device memory, uploads `bytes`, and
    /// records the tensor under `name`.
    pub fn set_input(
        &mut self,
        name: impl Into<String>,
        dtype: DataType,
        dims: Vec<i64>,
        bytes: &[u8],
    ) -> Result<()> {
        let name = name.into();
        let expected: usize = dims.iter().map(|&d| d.max(0) as usize).product::<usize>()
            * dtype.size();
        if bytes.len() != expected {
            return Err(EpError::Validation(format!(
                "input '{name}': {} bytes supplied for shape {dims:?} of {dtype} \
                 ({expected} expected)",
                bytes.len()
            )));
        }
        let buffer = self.alloc.alloc(bytes.len());
        self.alloc
            .write(buffer.ptr(), bytes)
            .map_err(|e| EpError::Binding(format!("uploading input '{name}': {e}")))?;
        self.inputs.insert(
            name,
            CallTensor {
                dtype,
                dims,
                ptr: buffer.ptr(),
            },
        );
        self.owned.push(buffer);
        Ok(())
    }

    /// Register an input that already lives in device memory.
    pub fn set_input_device(&mut self, name: impl Into<String>, tensor: CallTensor) {
        self.inputs.insert(name.into(), tensor);
    }

    /// Caller input by name.
    pub fn input(&self, name: &str) -> Option<&CallTensor> {
        self.inputs.get(name)
    }

    /// Allocate an output tensor once its shape is known.
    ///
    /// Repeated calls with the same name and byte size reuse the
    /// existing buffer, keeping output addresses stable across runs of
    /// one context (required for command-graph replay).
    pub(crate) fn allocate_output(
        &mut self,
        name: &str,
        dtype: DataType,
        dims: Vec<i64>,
    ) -> Result<DevicePtr> {
        let len: usize =
            dims.iter().map(|&d| d.max(0) as usize).product::<usize>() * dtype.size();
        if let Some(existing) = self.outputs.get_mut(name) {
            if existing.dtype == dtype && existing.byte_len() == len {
                existing.dims = dims;
                return Ok(existing.ptr);
            }
        }
        let buffer = self.alloc.alloc(len);
        let ptr = buffer.ptr();
        self.outputs.insert(
            name.to_string(),
            CallTensor { dtype, dims, ptr },
        );
        self.owned.push(buffer);
        Ok(ptr)
    }

    /// Output tensor by name, present after a successful run.
    pub fn output(&self, name: &str) -> Option<&CallTensor> {
        self.outputs.get(name)
    }

    /// Read an output's bytes back to the host.
    pub fn read_output(&self, name: &str) -> Result<Vec<u8>> {
        let tensor = self
            .outputs
            .get(name)
            .ok_or_else(|| EpError::Binding(format!("no output named '{name}'")))?;
        self.alloc
            .read(tensor.ptr, tensor.byte_len())
            .map_err(|e| EpError::Binding(format!("reading output '{name}': {e}")))
    }

    /// The device heap this context allocates from.
    pub fn allocator(&self) -> &DeviceAllocator {
        &self.alloc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_upload_roundtrip() {
        let alloc = DeviceAllocator::new();
        let mut ctx = KernelContext::new(alloc.clone());
        ctx.set_input("x", DataType::F32, vec![2], &1.0f32.to_le_bytes().repeat(2))
            .unwrap();
        let tensor = ctx.input("x").unwrap();
        assert_eq!(tensor.byte_len(), 8);
        assert_eq!(alloc.read(tensor.ptr, 8).unwrap().len(), 8);
    }

    #[test]
    fn rejects_size_mismatch() {
        let mut ctx = KernelContext::new(DeviceAllocator::new());
        let err = ctx.set_input("x", DataType::F32, vec![3], &[0u8; 4]);
        assert!(matches!(err, Err(EpError::Validation(_))));
    }

    #[test]
    fn empty_tensor_has_zero_bytes() {
        let tensor = CallTensor {
            dtype: DataType::F32,
            dims: vec![4, 0, 8],
            ptr: DeviceAllocator::new().alloc(0).ptr(),
        };
        assert!(tensor.is_empty());
        assert_eq!(tensor.byte_len(), 0);
    }
}
