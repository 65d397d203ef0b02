//! OpenAPI operation enumeration and spec hashing
//!
//! The core only needs the operation list: method, path template, and the
//! optional operationId. Full schema resolution stays with the spec's
//! producer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::scenario::HttpMethod;

/// One operation enumerated from the spec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub method: HttpMethod,
    /// Path template as written in the spec, e.g. `/users/{id}`
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Operation {
    /// Stable key for coverage maps: `"GET /users/{id}"`.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Content hash of the normalized (parsed and re-serialized) spec document.
pub fn spec_hash(document: &Value) -> String {
    let normalized = serde_json::to_vec(document).unwrap_or_default();
    hex::encode(Sha256::digest(&normalized))
}

/// Walk `paths` and enumerate every operation. Anything that is not a
/// recognized HTTP method key is ignored.
pub fn enumerate_operations(document: &Value) -> Vec<Operation> {
    let mut operations = Vec::new();
    let Some(paths) = document.get("paths").and_then(Value::as_object) else {
        return operations;
    };

    for (path, item) in paths {
        let Some(item) = item.as_object() else {
            continue;
        };
        for (method_key, op) in item {
            let Some(method) = HttpMethod::parse(method_key) else {
                continue;
            };
            let operation_id = op
                .get("operationId")
                .and_then(Value::as_str)
                .map(String::from);
            let summary = op.get("summary").and_then(Value::as_str).map(String::from);
            operations.push(Operation {
                method,
                path: path.clone(),
                operation_id,
                summary,
            });
        }
    }

    operations
}

/// Compare two path templates modulo path parameters. A segment matches when
/// the texts are equal or either side is a parameter (`{id}`) or carries a
/// `${...}` placeholder.
pub fn path_templates_match(left: &str, right: &str) -> bool {
    let left_segments: Vec<&str> = left.split('/').filter(|s| !s.is_empty()).collect();
    let right_segments: Vec<&str> = right.split('/').filter(|s| !s.is_empty()).collect();
    if left_segments.len() != right_segments.len() {
        return false;
    }
    left_segments
        .iter()
        .zip(&right_segments)
        .all(|(l, r)| l == r || is_param_segment(l) || is_param_segment(r))
}

fn is_param_segment(segment: &str) -> bool {
    (segment.starts_with('{') && segment.ends_with('}')) || segment.contains("${")
}

/// Find the operation a step endpoint exercises, if any. The endpoint may
/// be absolute; only its path part participates in matching.
pub fn match_operation<'a>(
    operations: &'a [Operation],
    method: HttpMethod,
    endpoint: &str,
) -> Option<&'a Operation> {
    let path = strip_to_path(endpoint);
    operations
        .iter()
        .find(|op| op.method == method && path_templates_match(&op.path, path))
}

fn strip_to_path(endpoint: &str) -> &str {
    let without_scheme = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"));
    let after_host = match without_scheme {
        Some(rest) => rest.find('/').map(|i| &rest[i..]).unwrap_or("/"),
        None => endpoint,
    };
    after_host.split(['?', '#']).next().unwrap_or(after_host)
}
