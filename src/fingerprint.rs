//! Request fingerprinting.
//!
//! A fingerprint is `base64(sha256(key ‖ canonical_headers ‖ canonical_body))`.
//! Both canonical forms are JSON with sorted object keys, so logically equal
//! requests hash equally regardless of how the client ordered its fields.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use axum::http::HeaderMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::models::BodyArgument;

/// Headers that take part in fingerprinting unless configured otherwise.
pub const DEFAULT_INCLUDE_HEADERS: &[&str] = &["host", "authorization", "cookie", "content-type"];

/// Hash identifying one logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds fingerprints from a fixed header allow-list. Pure and `Sync`.
#[derive(Debug, Clone)]
pub struct FingerprintBuilder {
    include_headers: BTreeSet<String>,
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_INCLUDE_HEADERS)
    }
}

impl FingerprintBuilder {
    pub fn new<I, S>(include_headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            include_headers: include_headers
                .into_iter()
                .map(|h| h.as_ref().trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    pub fn build(&self, key: &str, headers: &HeaderMap, arguments: &[BodyArgument]) -> Fingerprint {
        let headers = self.canonical_headers(headers);
        let body = canonical_body(arguments);

        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update(headers.as_bytes());
        hasher.update(body.as_bytes());
        Fingerprint(STANDARD.encode(hasher.finalize()))
    }

    /// Allow-listed, non-empty headers as a sorted JSON object.
    /// Repeated headers are joined with `,` in arrival order.
    pub fn canonical_headers(&self, headers: &HeaderMap) -> String {
        let mut selected: BTreeMap<&str, String> = BTreeMap::new();
        for name in &self.include_headers {
            let values: Vec<String> = headers
                .get_all(name.as_str())
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            if !values.is_empty() {
                selected.insert(name.as_str(), values.join(","));
            }
        }
        serde_json::to_string(&selected).unwrap_or_default()
    }
}

/// Non-ignored arguments as a sorted JSON object of `name -> value`, with
/// each argument's excluded fields removed.
pub fn canonical_body(arguments: &[BodyArgument]) -> String {
    let mut canonical = Map::new();
    for argument in arguments.iter().filter(|a| !a.ignore) {
        canonical.insert(
            argument.name.clone(),
            strip_excluded(&argument.value, &argument.excludes),
        );
    }
    serde_json::to_string(&sorted(&Value::Object(canonical))).unwrap_or_default()
}

/// Remove excluded top-level fields, matching both the declared name and its
/// lower-camel variant (`Timestamp` also drops `timestamp`).
fn strip_excluded(value: &Value, excludes: &[String]) -> Value {
    match value {
        Value::Object(fields) if !excludes.is_empty() => {
            let mut fields = fields.clone();
            for name in excludes {
                fields.remove(name);
                fields.remove(&first_char_lower(name));
            }
            Value::Object(fields)
        }
        other => other.clone(),
    }
}

fn first_char_lower(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Rebuild objects with keys in sorted order at every depth.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(fields) => {
            let ordered: BTreeMap<&String, Value> = fields.iter().map(|(k, v)| (k, sorted(v))).collect();
            let mut out = Map::new();
            for (k, v) in ordered {
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
