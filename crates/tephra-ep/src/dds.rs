//! Data-dependent-shape output allocators.
//!
//! When an output's extent is only known during execution, the engine is
//! handed a [`DdsOutputAllocator`] instead of a fixed buffer. One
//! allocator exists per (subgraph, output name) and survives across
//! calls; its buffer only ever grows, so repeated calls with shrinking
//! outputs reuse the high-water allocation.

use parking_lot::Mutex;
use std::sync::Arc;
use tephra_accel::{
    AccelError, DeviceAllocator, DeviceBuffer, DevicePtr, OutputAllocator,
};

#[derive(Default)]
struct Inner {
    buffer: Option<DeviceBuffer>,
    capacity: usize,
    dims: Option<Vec<i64>>,
}

/// Persistent capturing allocator for one data-dependent output.
pub struct DdsOutputAllocator {
    alloc: DeviceAllocator,
    inner: Mutex<Inner>,
}

impl DdsOutputAllocator {
    /// Create an allocator over the backend's device heap.
    pub fn new(alloc: DeviceAllocator) -> Arc<Self> {
        Arc::new(Self {
            alloc,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Dims reported by the most recent execution, if any.
    pub fn captured_dims(&self) -> Option<Vec<i64>> {
        self.inner.lock().dims.clone()
    }

    /// Device address of the captured data, if any.
    pub fn captured_ptr(&self) -> Option<DevicePtr> {
        self.inner.lock().buffer.as_ref().map(|b| b.ptr())
    }

    /// Forget the shape from the previous call; the buffer is kept.
    pub fn reset_shape(&self) {
        self.inner.lock().dims = None;
    }
}

impl OutputAllocator for DdsOutputAllocator {
    fn reallocate(&self, _name: &str, len: usize) -> tephra_accel::Result<DevicePtr> {
        let mut inner = self.inner.lock();
        if inner.capacity < len || inner.buffer.is_none() {
            let buffer = self.alloc.alloc(len.max(1));
            inner.capacity = len;
            inner.buffer = Some(buffer);
        }
        inner
            .buffer
            .as_ref()
            .map(|b| b.ptr())
            .ok_or_else(|| AccelError::ExecutionError("allocator has no buffer".to_string()))
    }

    fn notify_shape(&self, _name: &str, dims: &[i64]) {
        self.inner.lock().dims = Some(dims.to_vec());
    }
}
