//! Scenarios and steps: the ordered test cases a run executes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ulid::Ulid;

use crate::assertion::{AssertionToken, StatusExpectation};
use crate::locator::Locator;
use crate::run::RunId;

/// Scenario identifier: `scn_<ULID>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScenarioId(String);

impl ScenarioId {
    pub fn new() -> Self {
        Self(format!("scn_{}", Ulid::new()))
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ScenarioId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// HTTP methods a step may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            "DELETE" => Some(HttpMethod::Delete),
            "HEAD" => Some(HttpMethod::Head),
            "OPTIONS" => Some(HttpMethod::Options),
            _ => None,
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a scenario came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioSource {
    AiGenerated,
    Manual,
    Imported,
    Replayed,
    /// Synthetic scenario produced by the resilience fallback
    Fallback,
}

/// Scenario lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioStatus {
    Pending,
    Ready,
    Invalid,
    Disabled,
}

/// One declared body-field check, kept in declaration order
#[derive(Debug, Clone, PartialEq)]
pub struct BodyFieldCheck {
    pub locator: Locator,
    pub token: AssertionToken,
}

/// One declared header check (name compared case-insensitively)
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderCheck {
    pub name: String,
    pub token: AssertionToken,
}

/// What a step must observe
#[derive(Debug, Clone, PartialEq)]
pub struct Expectation {
    pub status: StatusExpectation,
    pub body_fields: Vec<BodyFieldCheck>,
    pub headers: Vec<HeaderCheck>,
}

/// One HTTP action inside a scenario
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub index: u32,
    pub name: String,
    pub method: HttpMethod,
    /// Path or absolute URL; may contain `${...}` placeholders
    pub endpoint: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub expected: Expectation,
    pub extractions: Vec<(String, Locator)>,
}

/// An ordered test case belonging to a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub id: ScenarioId,
    pub run_id: RunId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source: ScenarioSource,
    /// OpenAPI operation this scenario exercises (label only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub steps: Vec<Step>,
    pub status: ScenarioStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: u8,
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

impl Scenario {
    /// Content hash over the canonical step list, used to compare
    /// scenarios structurally across runs.
    pub fn steps_hash(&self) -> String {
        let canonical = serde_json::to_vec(&self.steps).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        hex::encode(digest)
    }

    /// Variables guaranteed present before `step_index` runs: everything an
    /// earlier step extracts.
    pub fn variables_before(&self, step_index: u32) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.index < step_index)
            .flat_map(|s| s.extractions.iter().map(|(name, _)| name.as_str()))
            .collect()
    }
}
