//! Step results: the observed outcome of executing one step

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ulid::Ulid;

use crate::errors::ErrorKind;
use crate::run::RunId;
use crate::scenario::ScenarioId;

/// Step result identifier: `res_<ULID>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepResultId(String);

impl StepResultId {
    pub fn new() -> Self {
        Self(format!("res_{}", Ulid::new()))
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for StepResultId {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a single step; exactly one of these holds per result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

/// Result of one declared assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionCheck {
    /// `status`, a header name, or a body locator
    pub locator: String,
    pub expected: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AssertionCheck {
    pub fn passed(locator: impl Into<String>, expected: impl Into<String>, actual: Option<String>) -> Self {
        Self {
            locator: locator.into(),
            expected: expected.into(),
            actual,
            passed: true,
            reason: None,
        }
    }

    pub fn failed(
        locator: impl Into<String>,
        expected: impl Into<String>,
        actual: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            locator: locator.into(),
            expected: expected.into(),
            actual,
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Outcome of executing one step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub id: StepResultId,
    pub run_id: RunId,
    pub scenario_id: ScenarioId,
    pub step_index: u32,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_status_code: Option<u16>,
    #[serde(default)]
    pub actual_headers: Vec<(String, String)>,
    /// Hex SHA-256 over the full response body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_digest: Option<String>,
    /// Response body truncated to the retention cap
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_excerpt: Option<String>,
    #[serde(default)]
    pub assertions: Vec<AssertionCheck>,
    /// Variables this step contributed to the scenario context
    #[serde(default)]
    pub extracted: BTreeMap<String, String>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl StepResult {
    pub fn is_passed(&self) -> bool {
        self.status == StepStatus::Passed
    }
}

/// Aggregate outcome of one scenario's execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioVerdict {
    /// Every step passed
    Passed,
    /// At least one step failed an expectation
    Failed,
    /// At least one step ended in a transport or internal error
    Errored,
}

impl ScenarioVerdict {
    /// Combine step statuses: error dominates failure dominates pass.
    pub fn from_steps<'a>(statuses: impl IntoIterator<Item = &'a StepStatus>) -> Self {
        let mut verdict = ScenarioVerdict::Passed;
        for status in statuses {
            match status {
                StepStatus::Error => return ScenarioVerdict::Errored,
                StepStatus::Failed | StepStatus::Skipped => verdict = ScenarioVerdict::Failed,
                StepStatus::Passed => {}
            }
        }
        verdict
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, ScenarioVerdict::Passed)
    }
}
