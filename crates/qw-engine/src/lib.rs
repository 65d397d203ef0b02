//! QAWave Execution Core
//!
//! The streaming pipeline that turns a requirement, an OpenAPI spec, and a
//! base URL into an executed, evaluated, and summarized QA run:
//! - Placeholder resolution and per-scenario execution context
//! - Assertion evaluation against observed responses
//! - Step and scenario execution with retries and SSRF guarding
//! - AI scenario generation with synchronous verification
//! - The validated run journal and its event feed
//! - The orchestrator composing the concurrent stages
//! - Coverage, summary, payload persistence, and deterministic replay
//! - The resilience envelope around both volatile dependencies

pub mod context;
pub mod coverage;
pub mod evaluator;
pub mod generator;
pub mod journal;
pub mod orchestrator;
pub mod payload;
pub mod resilience;
pub mod scenario_executor;
pub mod step_executor;

pub use context::{ExecutionContext, Resolution};
pub use coverage::{build_coverage, build_recommendations, build_summary, decide_verdict};
pub use evaluator::{evaluate, ObservedResponse};
pub use generator::{AiGenerator, GenerationOutcome, GeneratorSettings};
pub use journal::{JournalError, RunJournal};
pub use orchestrator::{Orchestrator, OrchestratorError, ResilienceSettings, RuntimeContext};
pub use payload::{decode_payload, encode_payload, PayloadError};
pub use resilience::{
    Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, EnvelopeConfig, RateLimiter,
    RateLimiterConfig, ResilienceEnvelope, ResilienceError, RetryConfig,
};
pub use scenario_executor::{ScenarioExecutor, ScenarioRun};
pub use step_executor::{ExecutionPolicy, StepExecutor};
