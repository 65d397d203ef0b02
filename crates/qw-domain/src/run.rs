//! Run entities: one execution of the pipeline from spec + requirement
//! to summary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ulid::Ulid;
use url::Url;

use crate::errors::DomainError;
use crate::openapi::Operation;
use crate::scenario::Scenario;
use crate::state_machine::RunStatus;

/// Run identifier: `run_<ULID>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    pub fn new() -> Self {
        Self(format!("run_{}", Ulid::new()))
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Execution mode of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunMode {
    Standard,
    Security,
    Performance,
}

impl Default for RunMode {
    fn default() -> Self {
        RunMode::Standard
    }
}

/// Where the OpenAPI spec comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind", content = "value")]
pub enum SpecSource {
    Url(String),
    Inline(String),
}

/// Recognized run options. Every field has a safe default, so a config can
/// arrive as a sparse JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunConfig {
    /// Upper bound on scenarios generated per run
    pub max_scenarios: u32,
    /// Upper bound on steps per scenario
    pub max_steps_per_scenario: u32,
    /// When false, scenarios execute serially
    pub parallel_execution: bool,
    /// When true, a failed step halts its scenario
    pub stop_on_first_failure: bool,
    /// Concurrent AI generations
    pub ai_concurrency: u32,
    /// Concurrent scenario executions
    pub exec_concurrency: u32,
    /// Per-step HTTP timeout
    pub step_timeout_ms: u64,
    /// Corrective regeneration attempts
    pub ai_verify_retries: u32,
    /// Transport-level retry attempts per step
    pub step_max_retries: u32,
    /// Coverage fraction required for a PASS verdict
    pub coverage_threshold: f64,
    /// Permit requests to loopback / private ranges
    pub allow_internal: bool,
    /// Frozen `${env.KEY}` namespace
    pub environment: BTreeMap<String, String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_scenarios: 10,
            max_steps_per_scenario: 10,
            parallel_execution: true,
            stop_on_first_failure: true,
            ai_concurrency: 5,
            exec_concurrency: 10,
            step_timeout_ms: 30_000,
            ai_verify_retries: 2,
            step_max_retries: 2,
            coverage_threshold: 0.80,
            allow_internal: false,
            environment: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    /// Effective scenario-execution worker count: serial mode pins it to 1.
    pub fn effective_exec_concurrency(&self) -> u32 {
        if self.parallel_execution {
            self.exec_concurrency.max(1)
        } else {
            1
        }
    }
}

/// One execution of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirement_text: Option<String>,
    pub spec_source: SpecSource,
    /// Hex SHA-256 over the normalized spec document; set no later than the
    /// transition out of REQUESTED
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_hash: Option<String>,
    pub base_url: String,
    pub mode: RunMode,
    pub config: RunConfig,
    pub status: RunStatus,
    pub triggered_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Run {
    /// Create a new run in REQUESTED state. The base URL must be a
    /// syntactically valid `http(s)://` URL.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        spec_source: SpecSource,
        base_url: impl Into<String>,
        mode: RunMode,
        config: RunConfig,
        triggered_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let base_url = base_url.into();
        validate_base_url(&base_url)?;
        Ok(Self {
            id: RunId::new(),
            name: name.into(),
            description: None,
            requirement_text: None,
            spec_source,
            spec_hash: None,
            base_url,
            mode,
            config,
            status: RunStatus::Requested,
            triggered_by: triggered_by.into(),
            created_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_message: None,
        })
    }
}

/// Reject anything that is not an absolute `http(s)` URL with a host.
pub fn validate_base_url(base_url: &str) -> Result<(), DomainError> {
    let parsed = Url::parse(base_url).map_err(|e| DomainError::InvalidBaseUrl {
        url: base_url.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(DomainError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    if parsed.host_str().is_none() {
        return Err(DomainError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(())
}

/// The canonical payload persisted on first entry to AI_SUCCESS and used
/// for deterministic replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPayload {
    pub run_id: RunId,
    pub spec_hash: String,
    pub base_url: String,
    pub env: BTreeMap<String, String>,
    pub config: RunConfig,
    /// Enumerated spec operations, kept so replays rebuild coverage without
    /// re-fetching the spec
    pub operations: Vec<Operation>,
    pub scenarios: Vec<Scenario>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_documented_values() {
        let config = RunConfig::default();
        assert_eq!(config.max_scenarios, 10);
        assert_eq!(config.max_steps_per_scenario, 10);
        assert!(config.parallel_execution);
        assert!(config.stop_on_first_failure);
        assert_eq!(config.ai_concurrency, 5);
        assert_eq!(config.exec_concurrency, 10);
        assert_eq!(config.step_timeout_ms, 30_000);
        assert_eq!(config.ai_verify_retries, 2);
    }

    #[test]
    fn sparse_config_json_fills_defaults() {
        let config: RunConfig = serde_json::from_str(r#"{"maxScenarios": 3}"#).unwrap();
        assert_eq!(config.max_scenarios, 3);
        assert_eq!(config.exec_concurrency, 10);
    }

    #[test]
    fn serial_mode_pins_exec_concurrency() {
        let config = RunConfig {
            parallel_execution: false,
            exec_concurrency: 8,
            ..RunConfig::default()
        };
        assert_eq!(config.effective_exec_concurrency(), 1);
    }

    #[test]
    fn base_url_must_be_http_with_host() {
        assert!(validate_base_url("http://api.example.com").is_ok());
        assert!(validate_base_url("https://api.example.com:8443/v1").is_ok());
        assert!(validate_base_url("ftp://api.example.com").is_err());
        assert!(validate_base_url("not a url").is_err());
        assert!(validate_base_url("http://").is_err());
    }

    #[test]
    fn new_run_starts_requested() {
        let run = Run::new(
            "smoke",
            SpecSource::Inline("{}".to_string()),
            "http://api.example.com",
            RunMode::Standard,
            RunConfig::default(),
            "tester",
            Utc::now(),
        )
        .unwrap();
        assert_eq!(run.status, RunStatus::Requested);
        assert!(run.spec_hash.is_none());
    }
}
