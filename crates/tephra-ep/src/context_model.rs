//! Context models: persisted wrappers around a prebuilt engine.
//!
//! A context model records enough to run a compiled subgraph without
//! recompiling from the graph: the fused-node name, the compute
//! capability the engine targets, and the engine itself, either embedded
//! in the file (embed mode 1) or referenced by the name of its engine
//! cache file (embed mode 0).

use crate::error::{EpError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Where the engine bytes live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContextEngine {
    /// Engine bytes stored inline.
    Embedded(Vec<u8>),

    /// File name of the engine in the cache directory.
    Referenced(String),
}

/// A persisted context model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextModel {
    /// Fused-node name of the subgraph the engine implements.
    pub fused_name: String,

    /// Compute capability the engine was built for.
    pub compute_capability: String,

    /// Engine loads on newer devices of the same family.
    pub hardware_compatible: bool,

    /// The engine, inline or by reference.
    pub engine: ContextEngine,
}

impl ContextModel {
    /// Resolve the engine bytes, reading the referenced cache file
    /// relative to `cache_dir` when not embedded.
    pub fn engine_bytes(&self, cache_dir: &Path) -> Result<Vec<u8>> {
        match &self.engine {
            ContextEngine::Embedded(bytes) => Ok(bytes.clone()),
            ContextEngine::Referenced(file_name) => {
                let path = cache_dir.join(file_name);
                fs::read(&path).map_err(|e| {
                    EpError::CacheIo(format!(
                        "context model references missing engine {}: {e}",
                        path.display()
                    ))
                })
            }
        }
    }
}

/// Write a context model file.
pub fn write_context_model(path: &Path, model: &ContextModel) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(model)
        .map_err(|e| EpError::CacheIo(format!("serializing context model: {e}")))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| EpError::CacheIo(format!("creating {}: {e}", parent.display())))?;
    }
    fs::write(path, bytes)
        .map_err(|e| EpError::CacheIo(format!("writing {}: {e}", path.display())))
}

/// Read a context model file.
pub fn read_context_model(path: &Path) -> Result<ContextModel> {
    let bytes = fs::read(path)
        .map_err(|e| EpError::CacheIo(format!("reading {}: {e}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| EpError::Validation(format!("context model {}: {e}", path.display())))
}
