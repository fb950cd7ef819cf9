//! Device memory model and execution stream.
//!
//! Device memory is addressed through opaque [`DevicePtr`] handles minted by
//! a [`DeviceAllocator`]; ownership lives in RAII [`DeviceBuffer`]s that
//! release their allocation on drop, so no bare pointer ever outlives its
//! backing storage across a component boundary.
//!
//! A [`DeviceStream`] orders device operations: within one stream, work
//! executes in issue order; nothing is ordered across streams except through
//! explicit synchronization. Streams also implement command-graph capture:
//! while capturing, issued work is recorded instead of executed, and the
//! resulting [`CapturedGraph`] replays the recorded work against the same
//! device addresses.

use crate::error::{AccelError, Result};
use crate::types::ElementType;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Opaque, non-null device address.
///
/// Two live pointers are equal only if they refer to the same allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(u64);

impl DevicePtr {
    /// Raw handle value, for diagnostics.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

#[derive(Default)]
struct AllocatorInner {
    next_id: u64,
    blocks: HashMap<u64, Vec<u8>>,
}

/// Allocates device memory blocks and services reads/writes against them.
///
/// Cloning is cheap; clones share the same device heap.
#[derive(Clone, Default)]
pub struct DeviceAllocator {
    inner: Arc<Mutex<AllocatorInner>>,
}

impl DeviceAllocator {
    /// Create a fresh device heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate `len` bytes (zero-length requests still receive a unique,
    /// non-null address backed by one byte).
    pub fn alloc(&self, len: usize) -> DeviceBuffer {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.blocks.insert(id, vec![0u8; len.max(1)]);
        DeviceBuffer {
            ptr: DevicePtr(id),
            len,
            alloc: self.clone(),
        }
    }

    fn free(&self, ptr: DevicePtr) {
        self.inner.lock().blocks.remove(&ptr.0);
    }

    /// Write `data` to the start of the block at `ptr`.
    pub fn write(&self, ptr: DevicePtr, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let block = inner
            .blocks
            .get_mut(&ptr.0)
            .ok_or(AccelError::InvalidPointer(ptr.0))?;
        if data.len() > block.len() {
            return Err(AccelError::ExecutionError(format!(
                "device write of {} bytes overflows {}-byte allocation",
                data.len(),
                block.len()
            )));
        }
        block[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Read `len` bytes from the start of the block at `ptr`.
    pub fn read(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let block = inner
            .blocks
            .get(&ptr.0)
            .ok_or(AccelError::InvalidPointer(ptr.0))?;
        if len > block.len() {
            return Err(AccelError::ExecutionError(format!(
                "device read of {len} bytes overruns {}-byte allocation",
                block.len()
            )));
        }
        Ok(block[..len].to_vec())
    }

    /// Copy `len` bytes between device blocks.
    pub fn copy(&self, src: DevicePtr, dst: DevicePtr, len: usize) -> Result<()> {
        let data = self.read(src, len)?;
        self.write(dst, &data)
    }

    /// Number of live allocations (used by tests to verify scratch release).
    pub fn live_allocations(&self) -> usize {
        self.inner.lock().blocks.len()
    }
}

/// Owning handle to one device allocation; frees on drop.
pub struct DeviceBuffer {
    ptr: DevicePtr,
    len: usize,
    alloc: DeviceAllocator,
}

impl DeviceBuffer {
    /// The device address of this allocation.
    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Requested length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the logical length is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.alloc.free(self.ptr);
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

type StreamOp = Box<dyn Fn() -> Result<()> + Send>;

/// A recorded sequence of device operations, replayable against the
/// addresses that were bound at capture time.
pub struct CapturedGraph {
    ops: Vec<StreamOp>,
}

impl CapturedGraph {
    /// Number of recorded operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// An in-order device execution stream.
pub struct DeviceStream {
    alloc: DeviceAllocator,
    capture: Option<Vec<StreamOp>>,
}

impl DeviceStream {
    /// Create a stream over the given device heap.
    pub fn new(alloc: DeviceAllocator) -> Self {
        Self {
            alloc,
            capture: None,
        }
    }

    /// The device heap this stream operates on.
    pub fn allocator(&self) -> &DeviceAllocator {
        &self.alloc
    }

    /// Whether command-graph capture is active.
    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Issue an operation: run it now, or record it while capturing.
    /// Work issued to a capturing stream does not execute.
    pub(crate) fn issue(&mut self, op: StreamOp) -> Result<()> {
        match &mut self.capture {
            Some(recording) => {
                recording.push(op);
                Ok(())
            }
            None => op(),
        }
    }

    /// Asynchronous host-to-device copy.
    pub fn write_device(&mut self, dst: DevicePtr, data: Vec<u8>) -> Result<()> {
        let alloc = self.alloc.clone();
        self.issue(Box::new(move || alloc.write(dst, &data)))
    }

    /// Asynchronous device-to-device copy.
    pub fn copy_device_to_device(
        &mut self,
        src: DevicePtr,
        dst: DevicePtr,
        len: usize,
    ) -> Result<()> {
        let alloc = self.alloc.clone();
        self.issue(Box::new(move || alloc.copy(src, dst, len)))
    }

    /// Synchronous device-to-host read. Illegal while capturing, like any
    /// other blocking operation.
    pub fn read_to_host(&mut self, src: DevicePtr, len: usize) -> Result<Vec<u8>> {
        if self.is_capturing() {
            return Err(AccelError::StreamError(
                "device-to-host read requires synchronization, which is forbidden during capture"
                    .to_string(),
            ));
        }
        self.alloc.read(src, len)
    }

    /// Asynchronous elementwise cast between device blocks.
    pub fn cast(
        &mut self,
        src: DevicePtr,
        src_ty: ElementType,
        dst: DevicePtr,
        dst_ty: ElementType,
        count: usize,
    ) -> Result<()> {
        let alloc = self.alloc.clone();
        self.issue(Box::new(move || {
            let bytes = alloc.read(src, count * src_ty.size())?;
            let out = cast_bytes(&bytes, src_ty, dst_ty, count)?;
            alloc.write(dst, &out)
        }))
    }

    /// Block until all issued work completes. Forbidden during capture.
    pub fn synchronize(&mut self) -> Result<()> {
        if self.is_capturing() {
            return Err(AccelError::StreamError(
                "stream synchronization is forbidden during capture".to_string(),
            ));
        }
        // Issued work runs eagerly outside capture, so there is nothing
        // left to wait for here.
        Ok(())
    }

    /// Begin recording issued work instead of executing it.
    pub fn begin_capture(&mut self) -> Result<()> {
        if self.is_capturing() {
            return Err(AccelError::StreamError("capture already active".to_string()));
        }
        self.capture = Some(Vec::new());
        Ok(())
    }

    /// Stop recording and return the captured graph.
    pub fn end_capture(&mut self) -> Result<CapturedGraph> {
        match self.capture.take() {
            Some(ops) => Ok(CapturedGraph { ops }),
            None => Err(AccelError::StreamError("no capture active".to_string())),
        }
    }

    /// Execute a previously captured graph.
    pub fn replay(&mut self, graph: &CapturedGraph) -> Result<()> {
        if self.is_capturing() {
            return Err(AccelError::StreamError(
                "cannot replay while capturing".to_string(),
            ));
        }
        for op in &graph.ops {
            op()?;
        }
        Ok(())
    }
}

fn cast_bytes(
    bytes: &[u8],
    src_ty: ElementType,
    dst_ty: ElementType,
    count: usize,
) -> Result<Vec<u8>> {
    use ElementType::*;
    let mut out = Vec::with_capacity(count * dst_ty.size());
    match (src_ty, dst_ty) {
        (I64, I32) => {
            for chunk in bytes.chunks_exact(8).take(count) {
                let v = i64::from_le_bytes(chunk.try_into().unwrap_or([0; 8]));
                out.extend_from_slice(&(v as i32).to_le_bytes());
            }
        }
        (I32, I64) => {
            for chunk in bytes.chunks_exact(4).take(count) {
                let v = i32::from_le_bytes(chunk.try_into().unwrap_or([0; 4]));
                out.extend_from_slice(&(v as i64).to_le_bytes());
            }
        }
        (F64, F32) => {
            for chunk in bytes.chunks_exact(8).take(count) {
                let v = f64::from_le_bytes(chunk.try_into().unwrap_or([0; 8]));
                out.extend_from_slice(&(v as f32).to_le_bytes());
            }
        }
        (F32, F64) => {
            for chunk in bytes.chunks_exact(4).take(count) {
                let v = f32::from_le_bytes(chunk.try_into().unwrap_or([0; 4]));
                out.extend_from_slice(&(v as f64).to_le_bytes());
            }
        }
        (a, b) if a == b => out.extend_from_slice(&bytes[..count * a.size()]),
        (a, b) => {
            return Err(AccelError::StreamError(format!(
                "unsupported device cast {a} -> {b}"
            )))
        }
    }
    Ok(out)
}
