//! Per-scenario execution context and placeholder resolution
//!
//! Resolution is a single left-to-right pass over the template text: a
//! resolved value is never re-scanned, and substitution happens before any
//! JSON parsing. Two namespaces exist: extracted variables (the default)
//! and the frozen environment reached through `${env.KEY}`.

use std::collections::BTreeMap;

use qw_domain::contract::{PLACEHOLDER_RE, SYNTHETIC_PLACEHOLDERS};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Outcome of resolving one template string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub text: String,
    /// Placeholder names that had no value, in order of appearance
    pub unresolved: Vec<String>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Mutable per-scenario state: extracted variables plus the frozen
/// environment. Owned by exactly one scenario worker, never shared.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    extracted: BTreeMap<String, String>,
    environment: BTreeMap<String, String>,
    synthetics: BTreeMap<String, String>,
}

impl ExecutionContext {
    /// Fresh context seeded with the run environment. Synthetic
    /// placeholders are materialized once so repeated references within the
    /// scenario agree.
    pub fn new(environment: BTreeMap<String, String>) -> Self {
        let mut synthetics = BTreeMap::new();
        for name in SYNTHETIC_PLACEHOLDERS {
            synthetics.insert((*name).to_string(), synthesize(name));
        }
        Self {
            extracted: BTreeMap::new(),
            environment,
            synthetics,
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.extracted.insert(name.into(), value.into());
    }

    pub fn merge(&mut self, values: &BTreeMap<String, String>) {
        for (name, value) in values {
            self.extracted.insert(name.clone(), value.clone());
        }
    }

    /// Look up a placeholder by name. Extracted variables win; `env.KEY`
    /// falls back to the frozen environment.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        if let Some(value) = self.extracted.get(name) {
            return Some(value);
        }
        if let Some(key) = name.strip_prefix("env.") {
            return self.environment.get(key).map(String::as_str);
        }
        self.synthetics.get(name).map(String::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Substitute every `${name}` in a single pass. Unresolved placeholders
    /// are left in place and reported.
    pub fn resolve(&self, template: &str) -> Resolution {
        let mut text = String::with_capacity(template.len());
        let mut unresolved = Vec::new();
        let mut last_index = 0;

        for capture in PLACEHOLDER_RE.captures_iter(template) {
            let matched = capture.get(0).expect("capture group 0 always present");
            let name = &capture[1];
            text.push_str(&template[last_index..matched.start()]);
            match self.lookup(name) {
                Some(value) => text.push_str(value),
                None => {
                    text.push_str(matched.as_str());
                    unresolved.push(name.to_string());
                }
            }
            last_index = matched.end();
        }
        text.push_str(&template[last_index..]);

        Resolution { text, unresolved }
    }
}

fn synthesize(name: &str) -> String {
    let mut rng = rand::thread_rng();
    match name {
        "random.email" => {
            let local: String = (&mut rng)
                .sample_iter(Alphanumeric)
                .take(12)
                .map(char::from)
                .collect();
            format!("qa-{}@example.test", local.to_lowercase())
        }
        "random.uuid" => {
            let bytes: [u8; 16] = rng.gen();
            format!(
                "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]
            )
        }
        _ => (&mut rng)
            .sample_iter(Alphanumeric)
            .take(16)
            .map(char::from)
            .collect(),
    }
}
