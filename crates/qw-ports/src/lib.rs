//! QAWave Port Traits
//!
//! This crate defines the interfaces (traits) the execution engine consumes
//! and adapters implement:
//! - Persistence stores for runs, scenarios, step results, events,
//!   payloads, and reports
//! - `AiProvider` for the language model
//! - `HttpGateway` for outbound calls to the system under test
//! - `MessageBus` for the best-effort journal feed
//! - `Clock` for deterministic time handling

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use qw_domain::{
    CoverageSnapshot, GenerationAttempt, HttpMethod, NewRunEvent, QaSummary, Run, RunEvent, RunId,
    RunStatus, Scenario, ScenarioId, ScenarioStatus, StepResult,
};

// ============================================================================
// Persistence
// ============================================================================

/// Persistence errors shared by all stores
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Concurrency conflict: expected status {expected}, found {actual}")]
    Conflict { expected: String, actual: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

/// Field changes applied together with a status transition
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub spec_hash: Option<String>,
}

/// Run records and their transactional status updates
pub trait RunStore: Send + Sync {
    fn insert_run(&self, run: Run) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn load_run(&self, run_id: &RunId) -> impl Future<Output = Result<Run, StoreError>> + Send;

    /// Atomically: compare the stored status against `expected`, apply the
    /// new status and patch, and append the event (when given) with the next
    /// journal seq. A status mismatch leaves everything untouched and
    /// returns `Conflict`.
    fn transition_run(
        &self,
        run_id: &RunId,
        expected: RunStatus,
        next: RunStatus,
        patch: RunPatch,
        event: Option<NewRunEvent>,
    ) -> impl Future<Output = Result<(Run, Option<RunEvent>), StoreError>> + Send;

    /// Status and latest journal seq, read in one snapshot.
    fn status_snapshot(
        &self,
        run_id: &RunId,
    ) -> impl Future<Output = Result<(RunStatus, u64), StoreError>> + Send;
}

/// Append-only journal access outside of status transitions
pub trait EventStore: Send + Sync {
    /// Append an event, allocating the next seq for the run.
    fn append_event(
        &self,
        run_id: &RunId,
        event: NewRunEvent,
    ) -> impl Future<Output = Result<RunEvent, StoreError>> + Send;

    /// All events for a run, ordered by seq.
    fn events_for_run(
        &self,
        run_id: &RunId,
    ) -> impl Future<Output = Result<Vec<RunEvent>, StoreError>> + Send;
}

/// Scenario records and generation attempts
pub trait ScenarioStore: Send + Sync {
    fn insert_scenario(
        &self,
        scenario: Scenario,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn update_scenario_status(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
        status: ScenarioStatus,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn scenarios_for_run(
        &self,
        run_id: &RunId,
    ) -> impl Future<Output = Result<Vec<Scenario>, StoreError>> + Send;

    fn record_attempt(
        &self,
        attempt: GenerationAttempt,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn attempts_for_run(
        &self,
        run_id: &RunId,
    ) -> impl Future<Output = Result<Vec<GenerationAttempt>, StoreError>> + Send;
}

/// Step results, persisted as they are produced
pub trait StepResultStore: Send + Sync {
    fn insert_step_result(
        &self,
        result: StepResult,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn results_for_scenario(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
    ) -> impl Future<Output = Result<Vec<StepResult>, StoreError>> + Send;

    fn results_for_run(
        &self,
        run_id: &RunId,
    ) -> impl Future<Output = Result<Vec<StepResult>, StoreError>> + Send;
}

/// Canonical payload blobs keyed by run id
pub trait PayloadStore: Send + Sync {
    fn save_payload(
        &self,
        run_id: &RunId,
        blob: Vec<u8>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn load_payload(
        &self,
        run_id: &RunId,
    ) -> impl Future<Output = Result<Vec<u8>, StoreError>> + Send;
}

/// Coverage snapshots and summaries
pub trait ReportStore: Send + Sync {
    fn save_coverage(
        &self,
        run_id: &RunId,
        coverage: CoverageSnapshot,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn load_coverage(
        &self,
        run_id: &RunId,
    ) -> impl Future<Output = Result<CoverageSnapshot, StoreError>> + Send;

    fn save_summary(
        &self,
        run_id: &RunId,
        summary: QaSummary,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn load_summary(
        &self,
        run_id: &RunId,
    ) -> impl Future<Output = Result<QaSummary, StoreError>> + Send;
}

/// Everything the pipeline needs from persistence, in one bound
pub trait Persistence:
    RunStore + EventStore + ScenarioStore + StepResultStore + PayloadStore + ReportStore + 'static
{
}

impl<T> Persistence for T where
    T: RunStore + EventStore + ScenarioStore + StepResultStore + PayloadStore + ReportStore + 'static
{
}

// ============================================================================
// AI provider
// ============================================================================

/// One completion request to the language model
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Why the model stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Other(String),
}

/// A completed model response
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub finish_reason: FinishReason,
}

/// AI provider errors
#[derive(Debug, thiserror::Error)]
pub enum AiProviderError {
    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Provider call timed out")]
    Timeout,

    #[error("Invalid provider response: {message}")]
    InvalidResponse { message: String },
}

impl AiProviderError {
    /// Transient classes worth another attempt: rate limits, 5xx, timeouts,
    /// and transport drops.
    pub fn is_retryable(&self) -> bool {
        match self {
            AiProviderError::RateLimited { .. }
            | AiProviderError::Network { .. }
            | AiProviderError::Timeout => true,
            AiProviderError::Upstream { status, .. } => *status >= 500,
            AiProviderError::InvalidResponse { .. } => false,
        }
    }
}

/// The language model behind scenario generation and summaries
pub trait AiProvider: Send + Sync {
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl Future<Output = Result<Completion, AiProviderError>> + Send;
}

// ============================================================================
// HTTP gateway
// ============================================================================

/// One outbound request to the system under test
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub timeout: Duration,
}

/// The observed response
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Gateway errors, classed so the step executor can decide what retries
#[derive(Debug, thiserror::Error)]
pub enum HttpGatewayError {
    #[error("Connection failed: {message}")]
    Connect { message: String },

    #[error("DNS resolution failed: {message}")]
    Dns { message: String },

    #[error("TLS failure: {message}")]
    Tls { message: String },

    #[error("Connection reset: {message}")]
    Reset { message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },
}

impl HttpGatewayError {
    /// Transport-level failures are retryable; an invalid request is not.
    pub fn is_transport(&self) -> bool {
        !matches!(self, HttpGatewayError::InvalidRequest { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpGatewayError::Timeout)
    }
}

/// Outbound HTTP to the system under test
pub trait HttpGateway: Send + Sync {
    fn send(
        &self,
        request: GatewayRequest,
    ) -> impl Future<Output = Result<GatewayResponse, HttpGatewayError>> + Send;
}

// ============================================================================
// Message bus
// ============================================================================

/// Message bus errors
#[derive(Debug, thiserror::Error)]
pub enum MessageBusError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Publish error: {message}")]
    Publish { message: String },
}

/// Best-effort publication of journal records. Loss of delivery never
/// affects run correctness; the journal is the source of truth.
pub trait MessageBus: Send + Sync {
    fn publish(
        &self,
        subject: &str,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), MessageBusError>> + Send;
}

// ============================================================================
// Clock
// ============================================================================

/// Clock port for deterministic time handling
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// System clock implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
