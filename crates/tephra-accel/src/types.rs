//! Core accelerator types: element types, I/O descriptors, capabilities.

use serde::{Deserialize, Serialize};

/// Element types an accelerator tensor may carry.
///
/// 64-bit integer and double-precision support are capability-gated (see
/// [`Capabilities`]); the tensor binder in the provider core adapts caller
/// tensors of unsupported types through explicit casts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    F32,
    F16,
    F64,
    I8,
    U8,
    I32,
    I64,
    Bool,
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::F16 => 2,
            ElementType::F64 | ElementType::I64 => 8,
            ElementType::I8 | ElementType::U8 | ElementType::Bool => 1,
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ElementType::F32 => "f32",
            ElementType::F16 => "f16",
            ElementType::F64 => "f64",
            ElementType::I8 => "i8",
            ElementType::U8 => "u8",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::Bool => "bool",
        };
        f.write_str(s)
    }
}

/// Whether an engine tensor is read or written by the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorIoMode {
    Input,
    Output,
}

/// Descriptor of one engine I/O tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoTensorDesc {
    /// Engine-internal tensor name.
    pub name: String,

    /// Input or output.
    pub mode: TensorIoMode,

    /// Element type.
    pub dtype: ElementType,

    /// Declared dims; `-1` marks a dynamic dimension.
    pub dims: Vec<i64>,

    /// True if the tensor's *values* (not just its extent) feed shape
    /// computation inside the engine.
    pub is_shape_tensor: bool,
}

/// Precision flags requested for an engine build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PrecisionFlags {
    pub fp16: bool,
    pub int8: bool,
}

impl PrecisionFlags {
    /// Suffix tag used in engine cache keys, e.g. `_fp16_int8`.
    pub fn cache_tag(&self) -> &'static str {
        match (self.fp16, self.int8) {
            (true, true) => "_fp16_int8",
            (true, false) => "_fp16",
            (false, true) => "_int8",
            (false, false) => "",
        }
    }
}

/// What the target accelerator supports natively.
///
/// Queried once at provider initialization and consulted by the partition
/// compiler (precision policy) and the tensor binder (type adaptation)
/// instead of scattering version checks through the code.
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Fast native fp16 math.
    pub fast_fp16: bool,

    /// Fast native int8 math.
    pub fast_int8: bool,

    /// 64-bit integer tensors are supported without casting.
    pub native_int64: bool,

    /// Double-precision tensors are supported without casting.
    pub native_double: bool,

    /// Engines may be built in a hardware-compatibility mode that loads on
    /// newer devices of the same family.
    pub hardware_compat: bool,

    /// Compute capability string of the target device, e.g. `"86"`.
    pub compute_capability: String,
}

impl Capabilities {
    /// Whether an element type can be bound directly, without the binder
    /// inserting a cast.
    pub fn supports_native(&self, dtype: ElementType) -> bool {
        match dtype {
            ElementType::I64 => self.native_int64,
            ElementType::F64 => self.native_double,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precision_cache_tags() {
        assert_eq!(PrecisionFlags::default().cache_tag(), "");
        let both = PrecisionFlags { fp16: true, int8: true };
        assert_eq!(both.cache_tag(), "_fp16_int8");
    }

    #[test]
    fn capability_gating() {
        let caps = Capabilities {
            fast_fp16: true,
            fast_int8: true,
            native_int64: false,
            native_double: false,
            hardware_compat: true,
            compute_capability: "86".to_string(),
        };
        assert!(caps.supports_native(ElementType::F32));
        assert!(!caps.supports_native(ElementType::I64));
        assert!(!caps.supports_native(ElementType::F64));
    }
}
