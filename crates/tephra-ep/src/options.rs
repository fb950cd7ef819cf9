//! Provider configuration surface.
//!
//! Options arrive as a flat string-keyed map. Unrecognized keys are
//! rejected rather than ignored, so typos fail loudly at session
//! construction instead of silently running with defaults.
//!
//! Explicit profile shapes use the grammar
//! `input1:1x3x224x224,input2:5`, with multiple profiles separated by
//! `+`: `x:1x3x224x224+x:8x3x224x224`. For a shape-tensor input the
//! `x`-separated numbers are element *values*, not dimension sizes. The
//! three shape maps (`profile_min_shapes`, `profile_max_shapes`,
//! `profile_opt_shapes`) must be given together and agree on profile
//! count and tensor names.

use crate::error::{EpError, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// One profile's explicit shapes: tensor name -> dims (or values, for a
/// shape tensor).
pub type ShapeMap = BTreeMap<String, Vec<i64>>;

/// Parsed provider options.
#[derive(Debug, Clone, Default)]
pub struct ProviderOptions {
    /// Allow fp16 kernels when the device has fast fp16.
    pub fp16_enable: bool,

    /// Allow int8 kernels when the device has fast int8.
    pub int8_enable: bool,

    /// Calibration table file for int8 builds.
    pub int8_calibration_table_name: Option<String>,

    /// Calibration table is in the JSON format rather than text.
    pub int8_use_native_calibration_table: bool,

    /// Explicit per-input minimum shapes, one entry per profile.
    pub profile_min_shapes: Vec<ShapeMap>,

    /// Explicit per-input maximum shapes, one entry per profile.
    pub profile_max_shapes: Vec<ShapeMap>,

    /// Explicit per-input optimal shapes, one entry per profile.
    pub profile_opt_shapes: Vec<ShapeMap>,

    /// Persist engines and profile descriptions to disk.
    pub engine_cache_enable: bool,

    /// Cache directory.
    pub engine_cache_path: PathBuf,

    /// Optional prefix prepended to every cache key.
    pub engine_cache_prefix: Option<String>,

    /// Build hardware-compatible engines loadable on newer devices.
    pub engine_hw_compatible: bool,

    /// Run cached engine bytes through the decryption hook on load (and
    /// the encryption hook on store).
    pub engine_decryption_enable: bool,

    /// Cache weight-stripped engines and refit before first use.
    pub weight_stripped_engine_enable: bool,

    /// Directory holding the original model, for locating refit weights.
    pub onnx_model_folder_path: Option<PathBuf>,

    /// Share one scratch arena across execution contexts instead of
    /// giving each context its own device memory.
    pub context_memory_sharing_enable: bool,

    /// Capture the device command graph after warm-up and replay it for
    /// repeated identical invocations.
    pub graph_capture_enable: bool,

    /// Pin layer-normalization patterns to fp32 under reduced precision.
    pub layer_norm_fp32_fallback: bool,

    /// Builder scratch memory limit in bytes (0 = backend default).
    pub max_workspace_size: u64,

    /// Write a context model file after compiling each subgraph.
    pub ep_context_enable: bool,

    /// Path of the context model file.
    pub ep_context_file_path: Option<PathBuf>,

    /// 1 embeds engine bytes in the context model, 0 references the
    /// engine cache file by name.
    pub ep_context_embed_mode: u8,

    /// Emit verbose engine build diagnostics.
    pub detailed_build_log: bool,
}

impl ProviderOptions {
    /// Parse and validate a flat option map.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self> {
        let mut opts = ProviderOptions {
            engine_cache_path: PathBuf::from("."),
            ..Default::default()
        };

        for (key, value) in map {
            match key.as_str() {
                "fp16_enable" => opts.fp16_enable = parse_bool(key, value)?,
                "int8_enable" => opts.int8_enable = parse_bool(key, value)?,
                "int8_calibration_table_name" => {
                    opts.int8_calibration_table_name = Some(value.clone())
                }
                "int8_use_native_calibration_table" => {
                    opts.int8_use_native_calibration_table = parse_bool(key, value)?
                }
                "profile_min_shapes" => opts.profile_min_shapes = parse_shape_maps(key, value)?,
                "profile_max_shapes" => opts.profile_max_shapes = parse_shape_maps(key, value)?,
                "profile_opt_shapes" => opts.profile_opt_shapes = parse_shape_maps(key, value)?,
                "engine_cache_enable" => opts.engine_cache_enable = parse_bool(key, value)?,
                "engine_cache_path" => opts.engine_cache_path = PathBuf::from(value),
                "engine_cache_prefix" => opts.engine_cache_prefix = Some(value.clone()),
                "engine_hw_compatible" => opts.engine_hw_compatible = parse_bool(key, value)?,
                "engine_decryption_enable" => {
                    opts.engine_decryption_enable = parse_bool(key, value)?
                }
                "weight_stripped_engine_enable" => {
                    opts.weight_stripped_engine_enable = parse_bool(key, value)?
                }
                "onnx_model_folder_path" => {
                    opts.onnx_model_folder_path = Some(PathBuf::from(value))
                }
                "context_memory_sharing_enable" => {
                    opts.context_memory_sharing_enable = parse_bool(key, value)?
                }
                "graph_capture_enable" => opts.graph_capture_enable = parse_bool(key, value)?,
                "layer_norm_fp32_fallback" => {
                    opts.layer_norm_fp32_fallback = parse_bool(key, value)?
                }
                "max_workspace_size" => {
                    opts.max_workspace_size = value.parse().map_err(|_| {
                        EpError::Validation(format!("max_workspace_size: '{value}' is not a size"))
                    })?
                }
                "ep_context_enable" => opts.ep_context_enable = parse_bool(key, value)?,
                "ep_context_file_path" => {
                    opts.ep_context_file_path = Some(PathBuf::from(value))
                }
                "ep_context_embed_mode" => {
                    opts.ep_context_embed_mode = match value.as_str() {
                        "0" => 0,
                        "1" => 1,
                        other => {
                            return Err(EpError::Validation(format!(
                                "ep_context_embed_mode must be 0 or 1, got '{other}'"
                            )))
                        }
                    }
                }
                "detailed_build_log" => opts.detailed_build_log = parse_bool(key, value)?,
                other => {
                    return Err(EpError::Validation(format!(
                        "unrecognized provider option '{other}'"
                    )))
                }
            }
        }

        opts.validate()?;
        Ok(opts)
    }

    /// True when explicit profile shapes were supplied.
    pub fn has_explicit_profiles(&self) -> bool {
        !self.profile_min_shapes.is_empty()
    }

    fn validate(&self) -> Result<()> {
        let given = [
            !self.profile_min_shapes.is_empty(),
            !self.profile_max_shapes.is_empty(),
            !self.profile_opt_shapes.is_empty(),
        ];
        if given.iter().any(|&g| g) && !given.iter().all(|&g| g) {
            return Err(EpError::Validation(
                "profile_min_shapes, profile_max_shapes and profile_opt_shapes must be \
                 supplied together"
                    .to_string(),
            ));
        }
        if self.profile_min_shapes.len() != self.profile_max_shapes.len()
            || self.profile_min_shapes.len() != self.profile_opt_shapes.len()
        {
            return Err(EpError::Validation(format!(
                "explicit profile counts disagree: {} min, {} max, {} opt",
                self.profile_min_shapes.len(),
                self.profile_max_shapes.len(),
                self.profile_opt_shapes.len()
            )));
        }
        for (i, min) in self.profile_min_shapes.iter().enumerate() {
            let max = &self.profile_max_shapes[i];
            let opt = &self.profile_opt_shapes[i];
            let names: Vec<&String> = min.keys().collect();
            if max.keys().collect::<Vec<_>>() != names || opt.keys().collect::<Vec<_>>() != names {
                return Err(EpError::Validation(format!(
                    "profile {i}: min/max/opt cover different tensors"
                )));
            }
            for (name, min_dims) in min {
                if max[name].len() != min_dims.len() || opt[name].len() != min_dims.len() {
                    return Err(EpError::Validation(format!(
                        "profile {i}: ranks for '{name}' disagree across min/max/opt"
                    )));
                }
            }
        }
        if self.ep_context_enable && self.ep_context_embed_mode == 0 && !self.engine_cache_enable {
            return Err(EpError::Validation(
                "ep_context_embed_mode 0 references the engine cache; enable engine_cache_enable"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "True" => Ok(true),
        "0" | "false" | "False" => Ok(false),
        other => Err(EpError::Validation(format!(
            "{key}: expected a boolean, got '{other}'"
        ))),
    }
}

fn parse_shape_maps(key: &str, value: &str) -> Result<Vec<ShapeMap>> {
    let mut profiles = Vec::new();
    for profile_str in value.split('+') {
        let mut map = ShapeMap::new();
        for entry in profile_str.split(',').filter(|e| !e.is_empty()) {
            let (name, dims_str) = entry.split_once(':').ok_or_else(|| {
                EpError::Validation(format!("{key}: entry '{entry}' is missing ':'"))
            })?;
            let dims = dims_str
                .split('x')
                .map(|d| {
                    d.parse::<i64>().map_err(|_| {
                        EpError::Validation(format!("{key}: '{d}' is not a dimension"))
                    })
                })
                .collect::<Result<Vec<i64>>>()?;
            if map.insert(name.to_string(), dims).is_some() {
                return Err(EpError::Validation(format!(
                    "{key}: tensor '{name}' appears twice in one profile"
                )));
            }
        }
        if map.is_empty() {
            return Err(EpError::Validation(format!("{key}: empty profile entry")));
        }
        profiles.push(map);
    }
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_profile_grammar() {
        let opts = ProviderOptions::from_map(&map(&[
            ("profile_min_shapes", "x:1x3x224x224,shape:2"),
            ("profile_max_shapes", "x:8x3x224x224,shape:2"),
            ("profile_opt_shapes", "x:1x3x224x224,shape:2"),
        ]))
        .unwrap();
        assert_eq!(opts.profile_min_shapes.len(), 1);
        assert_eq!(opts.profile_min_shapes[0]["x"], vec![1, 3, 224, 224]);
        assert_eq!(opts.profile_min_shapes[0]["shape"], vec![2]);
    }

    #[test]
    fn multiple_profiles_split_on_plus() {
        let opts = ProviderOptions::from_map(&map(&[
            ("profile_min_shapes", "x:1x3+x:16x3"),
            ("profile_max_shapes", "x:8x3+x:32x3"),
            ("profile_opt_shapes", "x:4x3+x:16x3"),
        ]))
        .unwrap();
        assert_eq!(opts.profile_min_shapes.len(), 2);
        assert_eq!(opts.profile_max_shapes[1]["x"], vec![32, 3]);
    }

    #[test]
    fn rejects_unknown_key() {
        let err = ProviderOptions::from_map(&map(&[("trt_fp16_enable", "1")]));
        assert!(matches!(err, Err(EpError::Validation(_))));
    }

    #[test]
    fn rejects_partial_profile_trio() {
        let err = ProviderOptions::from_map(&map(&[("profile_min_shapes", "x:1x3")]));
        assert!(matches!(err, Err(EpError::Validation(_))));
    }

    #[test]
    fn rejects_rank_mismatch() {
        let err = ProviderOptions::from_map(&map(&[
            ("profile_min_shapes", "x:1x3"),
            ("profile_max_shapes", "x:8x3x3"),
            ("profile_opt_shapes", "x:4x3"),
        ]));
        assert!(matches!(err, Err(EpError::Validation(_))));
    }
}
