//! Optimization profiles over dynamic shape ranges.
//!
//! A profile gives the accelerator a (min, opt, max) bound per dynamic
//! dimension of each execution-tensor input, and (min, opt, max) *value*
//! bounds for each shape-tensor input. An engine is valid for exactly the
//! profile set it was built with.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-tensor (min, opt, max) bound vectors.
///
/// For an execution tensor the vectors are per-dimension sizes; for a shape
/// tensor they are element values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShapeTriple {
    pub min: Vec<i64>,
    pub opt: Vec<i64>,
    pub max: Vec<i64>,
}

impl ShapeTriple {
    /// A triple with min == opt == max.
    pub fn fixed(dims: Vec<i64>) -> Self {
        Self {
            min: dims.clone(),
            opt: dims.clone(),
            max: dims,
        }
    }

    /// Whether `dims` lies within `[min, max]` elementwise.
    pub fn contains(&self, dims: &[i64]) -> bool {
        if dims.len() != self.min.len() {
            return false;
        }
        dims.iter()
            .zip(self.min.iter().zip(self.max.iter()))
            .all(|(&d, (&lo, &hi))| d >= lo && d <= hi)
    }
}

/// One optimization profile covering a shape range per input.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OptimizationProfile {
    /// Execution-tensor dimension bounds, keyed by input name.
    pub dims: BTreeMap<String, ShapeTriple>,

    /// Shape-tensor value bounds, keyed by input name.
    pub shape_values: BTreeMap<String, ShapeTriple>,
}

impl OptimizationProfile {
    /// Create an empty profile.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dimension bounds for an execution-tensor input.
    pub fn set_dimensions(&mut self, name: impl Into<String>, triple: ShapeTriple) {
        self.dims.insert(name.into(), triple);
    }

    /// Set the value bounds for a shape-tensor input.
    pub fn set_shape_values(&mut self, name: impl Into<String>, triple: ShapeTriple) {
        self.shape_values.insert(name.into(), triple);
    }

    /// Whether concrete dims for `name` fall inside this profile.
    ///
    /// An input with no entry has no dynamic dimensions covered by this
    /// profile and accepts any shape (the engine's static declaration is
    /// authoritative for it).
    pub fn accepts_dims(&self, name: &str, dims: &[i64]) -> bool {
        match self.dims.get(name) {
            Some(triple) => triple.contains(dims),
            None => true,
        }
    }

    /// Whether concrete shape-tensor values for `name` fall inside this
    /// profile.
    pub fn accepts_shape_values(&self, name: &str, values: &[i64]) -> bool {
        match self.shape_values.get(name) {
            Some(triple) => triple.contains(values),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triple_containment() {
        let triple = ShapeTriple {
            min: vec![1, 3, 224, 224],
            opt: vec![1, 3, 224, 224],
            max: vec![8, 3, 224, 224],
        };
        assert!(triple.contains(&[4, 3, 224, 224]));
        assert!(!triple.contains(&[16, 3, 224, 224]));
        assert!(!triple.contains(&[4, 3, 224]));
    }

    #[test]
    fn profile_accepts_uncovered_input() {
        let mut profile = OptimizationProfile::new();
        profile.set_dimensions("x", ShapeTriple::fixed(vec![2, 2]));
        assert!(profile.accepts_dims("y", &[100]));
        assert!(profile.accepts_dims("x", &[2, 2]));
        assert!(!profile.accepts_dims("x", &[3, 2]));
    }
}
