//! Shape-profile resolution.
//!
//! Turns user-declared or runtime-observed dynamic shape ranges into the
//! optimization profiles an engine build needs. The central structure is
//! the [`ShapeRangeTable`]: per tensor, per dimension index, one
//! `[min, max, opt]` triple per profile. For a shape tensor the table
//! stores element *values* keyed by element index instead of dimension
//! sizes.
//!
//! Two lifecycles exist. An explicit table is built once from provider
//! options, covers every dynamic input or fails fast, and never changes.
//! An implicit table starts with unresolved sentinel triples and is
//! widened from observed shapes at call time; widening invalidates the
//! current engine.

use crate::error::{EpError, Result};
use crate::options::ShapeMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tephra_accel::{OptimizationProfile, ShapeTriple};

/// Sentinel triple marking a range that no call has resolved yet.
pub const UNRESOLVED: [i64; 3] = [i64::MAX, i64::MIN, i64::MIN];

/// A dynamic input the resolver must cover.
#[derive(Debug, Clone)]
pub struct ProfileInput {
    /// Tensor name.
    pub name: String,

    /// Declared dims, `-1` marking dynamic dimensions.
    pub dims: Vec<i64>,

    /// True if profile entries are element values rather than dimension
    /// sizes.
    pub is_shape_tensor: bool,
}

impl ProfileInput {
    /// Whether this input needs profile coverage at all.
    pub fn is_dynamic(&self) -> bool {
        self.is_shape_tensor || self.dims.contains(&-1)
    }
}

/// Per-tensor, per-dimension shape ranges, one `[min, max, opt]` triple
/// per profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeRangeTable {
    ranges: BTreeMap<String, BTreeMap<usize, Vec<[i64; 3]>>>,
    explicit: bool,
}

impl ShapeRangeTable {
    /// Build a table from explicit per-profile shape maps.
    ///
    /// Every dynamic input must be covered by every profile; the error
    /// lists every uncovered input by name.
    pub fn from_explicit(
        inputs: &[ProfileInput],
        min: &[ShapeMap],
        max: &[ShapeMap],
        opt: &[ShapeMap],
    ) -> Result<Self> {
        let missing: Vec<&str> = inputs
            .iter()
            .filter(|input| input.is_dynamic())
            .filter(|input| min.iter().any(|profile| !profile.contains_key(&input.name)))
            .map(|input| input.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(EpError::Validation(format!(
                "explicit profiles do not cover dynamic inputs: {}",
                missing.join(", ")
            )));
        }

        let mut table = ShapeRangeTable {
            explicit: true,
            ..Default::default()
        };
        for (p, min_map) in min.iter().enumerate() {
            for (name, min_dims) in min_map {
                let max_dims = &max[p][name];
                let opt_dims = &opt[p][name];
                let entry = table.ranges.entry(name.clone()).or_default();
                for (d, &lo) in min_dims.iter().enumerate() {
                    let (hi, best) = (max_dims[d], opt_dims[d]);
                    if lo > hi || best < lo || best > hi {
                        return Err(EpError::Validation(format!(
                            "profile {p}, tensor '{name}', dim {d}: \
                             min {lo} / max {hi} / opt {best} is not ordered"
                        )));
                    }
                    let triples = entry.entry(d).or_default();
                    while triples.len() < p {
                        triples.push(UNRESOLVED);
                    }
                    triples.push([lo, hi, best]);
                }
            }
        }
        Ok(table)
    }

    /// Build an implicit table: one placeholder profile with unresolved
    /// sentinels for every dynamic dimension (or shape-tensor element).
    pub fn implicit(inputs: &[ProfileInput]) -> Self {
        let mut table = ShapeRangeTable::default();
        for input in inputs.iter().filter(|i| i.is_dynamic()) {
            let entry = table.ranges.entry(input.name.clone()).or_default();
            if input.is_shape_tensor {
                let elements = input.dims.iter().product::<i64>().max(0) as usize;
                for d in 0..elements {
                    entry.insert(d, vec![UNRESOLVED]);
                }
            } else {
                for (d, &dim) in input.dims.iter().enumerate() {
                    if dim == -1 {
                        entry.insert(d, vec![UNRESOLVED]);
                    }
                }
            }
        }
        table
    }

    /// True when the table was built from explicit provider options.
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    /// True when no tensor has a profiled range (fully static subgraph).
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// True while any range still carries the unresolved sentinel.
    pub fn needs_resolution(&self) -> bool {
        self.ranges
            .values()
            .flat_map(|dims| dims.values())
            .flatten()
            .any(|triple| *triple == UNRESOLVED)
    }

    /// Number of profiles the table describes.
    pub fn profile_count(&self) -> usize {
        self.ranges
            .values()
            .flat_map(|dims| dims.values())
            .map(|triples| triples.len())
            .max()
            .unwrap_or(0)
    }

    /// Widen profile 0 from an observed shape (or observed shape-tensor
    /// values). Returns true if any range changed, which invalidates the
    /// current engine.
    ///
    /// A shape already inside one of the recorded profiles leaves the
    /// table untouched. Otherwise observed values below profile 0's
    /// minimum lower it; values above its maximum raise both the maximum
    /// and the optimum, tracking the largest shape seen.
    pub fn update_from_call(&mut self, name: &str, observed: &[i64]) -> bool {
        if self.accepts(name, observed) {
            return false;
        }
        let Some(dims) = self.ranges.get_mut(name) else {
            return false;
        };
        let mut widened = false;
        for (&d, triples) in dims.iter_mut() {
            let Some(&value) = observed.get(d) else {
                continue;
            };
            let Some(triple) = triples.first_mut() else {
                continue;
            };
            if value < triple[0] {
                triple[0] = value;
                widened = true;
            }
            if value > triple[1] {
                triple[1] = value;
                triple[2] = value;
                widened = true;
            }
        }
        widened
    }

    /// Whether some single recorded profile covers every ranged
    /// dimension (or element) of an observed shape. Unprofiled tensors
    /// accept anything.
    pub fn accepts(&self, name: &str, observed: &[i64]) -> bool {
        let Some(dims) = self.ranges.get(name) else {
            return true;
        };
        let count = dims.values().map(|triples| triples.len()).max().unwrap_or(0);
        (0..count).any(|p| {
            dims.iter().all(|(&d, triples)| {
                let Some(&value) = observed.get(d) else {
                    return false;
                };
                triples
                    .get(p)
                    .map_or(false, |triple| value >= triple[0] && value <= triple[1])
            })
        })
    }

    /// Materialize accelerator optimization profiles.
    ///
    /// `inputs` supplies the static dims for dimensions the table does
    /// not range over, and distinguishes shape tensors from execution
    /// tensors. Returns a validation error while sentinels remain.
    pub fn to_profiles(&self, inputs: &[ProfileInput]) -> Result<Vec<OptimizationProfile>> {
        if self.needs_resolution() {
            return Err(EpError::Validation(
                "shape ranges are not fully resolved".to_string(),
            ));
        }
        let count = self.profile_count();
        let mut profiles = vec![OptimizationProfile::new(); count];
        for input in inputs {
            let Some(dims) = self.ranges.get(&input.name) else {
                continue;
            };
            let rank = if input.is_shape_tensor {
                input.dims.iter().product::<i64>().max(0) as usize
            } else {
                input.dims.len()
            };
            for (p, profile) in profiles.iter_mut().enumerate() {
                let mut triple = ShapeTriple {
                    min: vec![0; rank],
                    opt: vec![0; rank],
                    max: vec![0; rank],
                };
                for d in 0..rank {
                    let bounds = match dims.get(&d).and_then(|t| t.get(p)) {
                        Some(b) => *b,
                        // Static dimension: fixed at its declared size.
                        None => {
                            let fixed = if input.is_shape_tensor {
                                0
                            } else {
                                input.dims[d]
                            };
                            [fixed, fixed, fixed]
                        }
                    };
                    triple.min[d] = bounds[0];
                    triple.max[d] = bounds[1];
                    triple.opt[d] = bounds[2];
                }
                if input.is_shape_tensor {
                    profile.set_shape_values(input.name.clone(), triple);
                } else {
                    profile.set_dimensions(input.name.clone(), triple);
                }
            }
        }
        Ok(profiles)
    }
}
