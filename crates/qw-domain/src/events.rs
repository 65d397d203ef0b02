//! The append-only run event journal records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::outcome::StepResultId;
use crate::run::RunId;
use crate::scenario::ScenarioId;

/// Event identifier: `evt_<ULID>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    pub fn new() -> Self {
        Self(format!("evt_{}", Ulid::new()))
    }

    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Event types emitted over a run's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEventType {
    Requested,
    SpecFetched,
    SpecFetchFailed,
    ScenarioCreated,
    ScenarioGenerationFailed,
    ExecutionStarted,
    ExecutionSuccess,
    ExecutionFailed,
    AiSuccess,
    AiFailed,
    QaEvalStarted,
    QaEvalDone,
    QaEvalFailed,
    Complete,
    Failed,
    Cancelled,
}

/// Upper bound on a journal record's structured payload. Larger payloads
/// are truncated to a reference before the append.
pub const MAX_EVENT_PAYLOAD_BYTES: usize = 16 * 1024;

/// An event proposed for the journal; `seq` and `id` are assigned at append.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRunEvent {
    pub event_type: RunEventType,
    #[serde(default)]
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<ScenarioId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_result_id: Option<StepResultId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl NewRunEvent {
    pub fn new(event_type: RunEventType) -> Self {
        Self {
            event_type,
            payload: Value::Null,
            scenario_id: None,
            step_result_id: None,
            error_message: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_scenario(mut self, scenario_id: ScenarioId) -> Self {
        self.scenario_id = Some(scenario_id);
        self
    }

    pub fn with_step_result(mut self, step_result_id: StepResultId) -> Self {
        self.step_result_id = Some(step_result_id);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// A persisted journal record. Events for a run are totally ordered by
/// `seq`, which is strictly increasing and allocated at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub id: EventId,
    pub run_id: RunId,
    pub seq: u64,
    pub event_type: RunEventType,
    #[serde(default)]
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<ScenarioId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_result_id: Option<StepResultId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}
