//! Coverage snapshots and the final run summary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::scenario::HttpMethod;

/// Test status of one spec operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Covered,
    Failed,
    Untested,
}

/// Method + path reference to a spec operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRef {
    pub method: HttpMethod,
    pub path: String,
}

/// Aggregate coverage attached to a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageSnapshot {
    pub ops_total: u32,
    pub ops_covered: u32,
    pub ops_failed: u32,
    pub uncovered_ops: Vec<OperationRef>,
    /// Keyed by `"METHOD path"`
    pub per_op_status: BTreeMap<String, OperationStatus>,
    pub scenarios_passed: u32,
    pub scenarios_failed: u32,
    pub computed_at: DateTime<Utc>,
}

impl CoverageSnapshot {
    /// Empty snapshot for a run that enumerated no operations.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            ops_total: 0,
            ops_covered: 0,
            ops_failed: 0,
            uncovered_ops: Vec::new(),
            per_op_status: BTreeMap::new(),
            scenarios_passed: 0,
            scenarios_failed: 0,
            computed_at: now,
        }
    }

    /// Covered fraction in `[0, 1]`; zero operations count as zero coverage.
    pub fn coverage_fraction(&self) -> f64 {
        if self.ops_total == 0 {
            0.0
        } else {
            self.ops_covered as f64 / self.ops_total as f64
        }
    }
}

/// Top-level outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
    Inconclusive,
}

/// Final verdict artifact for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QaSummary {
    pub overall_verdict: Verdict,
    pub passed_scenarios: u32,
    pub failed_scenarios: u32,
    pub errored_scenarios: u32,
    /// LLM-written narrative, or the deterministic template fallback
    pub narrative_summary: String,
    pub recommendations: Vec<String>,
    /// 0..=100
    pub quality_score: u8,
}
