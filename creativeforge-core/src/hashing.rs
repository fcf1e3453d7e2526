//! Hashing - SHA-256 audit digests
//!
//! Reports and artifacts carry digests so a verdict can be reproduced from
//! the stored inputs.

use serde::Serialize;
use serde_json::{to_string, Value};
use sha2::{Digest, Sha256};

use crate::layout::LayoutSpec;
use crate::model::{AnalysisResult, ContentSpec};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    to_string(&sort_value(&v))
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), sort_value(v))).collect())
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

#[derive(Serialize)]
struct ValidationInputs<'a> {
    layout: &'a LayoutSpec,
    content: &'a ContentSpec,
    analysis: &'a AnalysisResult,
    catalog_version: &'a str,
}

/// Digest of everything a compliance verdict depends on.
pub fn compute_input_digest(
    layout: &LayoutSpec,
    content: &ContentSpec,
    analysis: &AnalysisResult,
    catalog_version: &str,
) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(&ValidationInputs { layout, content, analysis, catalog_version })?;
    Ok(sha256_hex(canonical.as_bytes()))
}
