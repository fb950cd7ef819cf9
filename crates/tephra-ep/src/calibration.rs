//! Int8 calibration table reader.
//!
//! Two on-disk formats are recognized. The flat text format holds one
//! `tensor_name: range` pair per line; the JSON format is a single
//! object mapping tensor names to ranges. Ranges are symmetric absolute
//! maxima applied as per-tensor dynamic ranges on the lowered network.

use crate::error::{EpError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Load a calibration table.
///
/// `json` selects the JSON format; otherwise the flat text format is
/// parsed. Lines that are empty or start with `#` are skipped.
pub fn load_calibration_table(path: &Path, json: bool) -> Result<BTreeMap<String, f32>> {
    let text = fs::read_to_string(path)
        .map_err(|e| EpError::CacheIo(format!("reading {}: {e}", path.display())))?;
    if json {
        serde_json::from_str(&text)
            .map_err(|e| EpError::Validation(format!("calibration table {}: {e}", path.display())))
    } else {
        parse_text_table(&text)
            .map_err(|e| EpError::Validation(format!("calibration table {}: {e}", path.display())))
    }
}

fn parse_text_table(text: &str) -> std::result::Result<BTreeMap<String, f32>, String> {
    let mut ranges = BTreeMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, value) = line
            .rsplit_once(':')
            .ok_or_else(|| format!("line {}: missing ':'", lineno + 1))?;
        let range: f32 = value
            .trim()
            .parse()
            .map_err(|_| format!("line {}: '{}' is not a range", lineno + 1, value.trim()))?;
        ranges.insert(name.trim().to_string(), range);
    }
    Ok(ranges)
}
