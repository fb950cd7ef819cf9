//! Engine cache persistence.
//!
//! One engine blob per cache key, plus a companion `.profile` file
//! recording the exact [`ShapeRangeTable`] the engine was built with.
//! Keys embed the precision tag and the device compute capability, so an
//! engine built for one device or precision mode never loads for another.
//! All writes go through a temp-file-then-rename step.
//!
//! A missing or unreadable cache file degrades to a rebuild. A failing
//! decryption hook does not: the payload exists but cannot be trusted, so
//! it surfaces as a hard error.

use crate::error::{EpError, Result};
use crate::shape_profile::ShapeRangeTable;
use std::fs;
use std::path::{Path, PathBuf};
use tephra_accel::PrecisionFlags;
use tracing::{debug, warn};

/// Pluggable engine encryption/decryption functions, set programmatically
/// on the provider.
pub struct CryptoHooks {
    /// Applied to engine bytes before they reach disk.
    pub encrypt: Box<dyn Fn(&[u8]) -> std::io::Result<Vec<u8>> + Send + Sync>,

    /// Applied to engine bytes read from disk.
    pub decrypt: Box<dyn Fn(&[u8]) -> std::io::Result<Vec<u8>> + Send + Sync>,
}

/// Persists and loads engines and their profile descriptions.
pub struct EngineCacheManager {
    dir: PathBuf,
    prefix: Option<String>,
    crypto: Option<CryptoHooks>,
}

impl EngineCacheManager {
    /// Cache under `dir`, keys optionally prefixed.
    pub fn new(dir: impl Into<PathBuf>, prefix: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix,
            crypto: None,
        }
    }

    /// Install encryption hooks; engine files gain the `.encrypted`
    /// suffix.
    pub fn set_crypto_hooks(&mut self, hooks: CryptoHooks) {
        self.crypto = Some(hooks);
    }

    /// Compute the cache key for a subgraph.
    ///
    /// `{prefix}{fused_name}{precision_tag}_sm{cc}`, with the compute
    /// capability replaced by `80+` for hardware-compatible engines.
    pub fn cache_key(
        &self,
        fused_name: &str,
        precision: PrecisionFlags,
        hardware_compatible: bool,
        compute_capability: &str,
    ) -> String {
        let sm = if hardware_compatible {
            "80+"
        } else {
            compute_capability
        };
        match &self.prefix {
            Some(prefix) => format!("{prefix}{fused_name}{}_sm{sm}", precision.cache_tag()),
            None => format!("{fused_name}{}_sm{sm}", precision.cache_tag()),
        }
    }

    fn engine_path(&self, key: &str) -> PathBuf {
        if self.crypto.is_some() {
            self.dir.join(format!("{key}.engine.encrypted"))
        } else {
            self.dir.join(format!("{key}.engine"))
        }
    }

    fn stripped_engine_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.stripped.engine"))
    }

    fn profile_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.profile"))
    }

    /// Load cached engine bytes. `Ok(None)` is a cache miss; a failing
    /// decryption hook is a hard error.
    pub fn load_engine(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.engine_path(key);
        let Some(bytes) = read_optional(&path) else {
            return Ok(None);
        };
        match &self.crypto {
            Some(hooks) => {
                let plain = (hooks.decrypt)(&bytes).map_err(|e| {
                    EpError::CacheIo(format!("decrypting {}: {e}", path.display()))
                })?;
                Ok(Some(plain))
            }
            None => Ok(Some(bytes)),
        }
    }

    /// Load a cached weight-stripped engine, if present.
    pub fn load_stripped_engine(&self, key: &str) -> Option<Vec<u8>> {
        read_optional(&self.stripped_engine_path(key))
    }

    /// Persist engine bytes atomically, encrypting when hooks are set.
    pub fn store_engine(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let payload = match &self.crypto {
            Some(hooks) => (hooks.encrypt)(bytes)
                .map_err(|e| EpError::CacheIo(format!("encrypting engine '{key}': {e}")))?,
            None => bytes.to_vec(),
        };
        write_atomic(&self.engine_path(key), &payload)
    }

    /// Persist a weight-stripped engine atomically.
    pub fn store_stripped_engine(&self, key: &str, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.stripped_engine_path(key), bytes)
    }

    /// Load the companion profile description. Corrupt files degrade to a
    /// cache miss with a warning.
    pub fn load_profile(&self, key: &str) -> Option<ShapeRangeTable> {
        let path = self.profile_path(key);
        let bytes = read_optional(&path)?;
        match serde_json::from_slice(&bytes) {
            Ok(table) => Some(table),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable profile file");
                None
            }
        }
    }

    /// Persist the profile description atomically.
    pub fn store_profile(&self, key: &str, table: &ShapeRangeTable) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(table)
            .map_err(|e| EpError::CacheIo(format!("serializing profile '{key}': {e}")))?;
        write_atomic(&self.profile_path(key), &bytes)
    }

    /// Decide whether a cached table is usable for the configured one.
    ///
    /// Explicit profiles must match the cached ones exactly; a mismatch
    /// invalidates the cache. An implicit configuration adopts whatever
    /// ranges the cache recorded (resolved by earlier runs).
    pub fn reconcile_profiles(
        &self,
        key: &str,
        configured: &ShapeRangeTable,
    ) -> Option<ShapeRangeTable> {
        let cached = self.load_profile(key)?;
        if configured.is_explicit() {
            if &cached == configured {
                Some(cached)
            } else {
                debug!(key, "explicit profiles changed; invalidating cached engine");
                None
            }
        } else {
            Some(cached)
        }
    }
}

fn read_optional(path: &Path) -> Option<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cache read failed; treating as miss");
            None
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| EpError::CacheIo(format!("creating {}: {e}", parent.display())))?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| EpError::CacheIo(format!("bad cache path {}", path.display())))?;
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp, bytes)
        .map_err(|e| EpError::CacheIo(format!("writing {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| EpError::CacheIo(format!("renaming into {}: {e}", path.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_embeds_precision_and_compute_capability() {
        let cache = EngineCacheManager::new("/tmp/never-used", None);
        let fp16 = PrecisionFlags {
            fp16: true,
            int8: false,
        };
        assert_eq!(cache.cache_key("sub_0", fp16, false, "86"), "sub_0_fp16_sm86");
        assert_eq!(cache.cache_key("sub_0", fp16, true, "86"), "sub_0_fp16_sm80+");

        let prefixed = EngineCacheManager::new("/tmp/never-used", Some("model_".to_string()));
        assert_eq!(
            prefixed.cache_key("sub_0", PrecisionFlags::default(), false, "80"),
            "model_sub_0_sm80"
        );
    }

    #[test]
    fn missing_engine_is_a_miss_not_an_error() {
        let cache = EngineCacheManager::new("/tmp/tephra-cache-test-missing", None);
        assert!(cache.load_engine("nope").unwrap().is_none());
        assert!(cache.load_profile("nope").is_none());
    }
}
