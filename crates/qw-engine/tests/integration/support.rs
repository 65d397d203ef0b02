//! Shared fixtures for the integration suite: a scripted system under
//! test, a scripted AI provider, and pipeline wiring over the in-memory
//! adapters.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qw_adapters::{MemoryStore, NoopBus};
use qw_domain::{
    Run, RunConfig, RunEvent, RunEventType, RunId, RunMode, SpecSource,
};
use qw_engine::{Orchestrator, ResilienceSettings, RuntimeContext};
use qw_engine::resilience::RateLimiterConfig;
use qw_ports::{
    AiProvider, AiProviderError, Completion, CompletionRequest, EventStore, FinishReason,
    GatewayRequest, GatewayResponse, HttpGateway, HttpGatewayError, SystemClock,
};
use serde_json::{json, Value};

// ============================================================================
// Scripted system under test
// ============================================================================

type GatewayScript =
    Box<dyn Fn(u32, &GatewayRequest) -> (Duration, Result<GatewayResponse, HttpGatewayError>) + Send + Sync>;

/// Gateway whose behavior is a function of (call number, request). A
/// scripted delay longer than the request timeout yields a Timeout error,
/// the way a real gateway would.
pub struct ScriptedGateway {
    script: GatewayScript,
    calls: AtomicU32,
}

impl ScriptedGateway {
    pub fn new(
        script: impl Fn(u32, &GatewayRequest) -> (Duration, Result<GatewayResponse, HttpGatewayError>)
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            calls: AtomicU32::new(0),
        }
    }

    /// Every call answers instantly with the same response.
    pub fn constant(status: u16, body: Value) -> Self {
        Self::new(move |_, _| (Duration::ZERO, Ok(json_response(status, body.clone()))))
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HttpGateway for ScriptedGateway {
    async fn send(&self, request: GatewayRequest) -> Result<GatewayResponse, HttpGatewayError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let (delay, result) = (self.script)(call, &request);
        if delay >= request.timeout {
            tokio::time::sleep(request.timeout).await;
            return Err(HttpGatewayError::Timeout);
        }
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

pub fn json_response(status: u16, body: Value) -> GatewayResponse {
    GatewayResponse {
        status,
        headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        body: serde_json::to_vec(&body).expect("serializable body"),
    }
}

// ============================================================================
// Scripted AI provider
// ============================================================================

pub enum AiReply {
    Text(String),
    RateLimited,
    Upstream(u16),
}

type AiHandler = Box<dyn Fn(u32, &CompletionRequest) -> String + Send + Sync>;

/// Provider that first drains a reply queue, then falls back to a handler
/// (when present) or an upstream error.
pub struct ScriptedAi {
    queue: Mutex<VecDeque<AiReply>>,
    handler: Option<AiHandler>,
    calls: AtomicU32,
}

impl ScriptedAi {
    pub fn from_replies(replies: Vec<AiReply>) -> Self {
        Self {
            queue: Mutex::new(replies.into()),
            handler: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_handler(handler: impl Fn(u32, &CompletionRequest) -> String + Send + Sync + 'static) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            handler: Some(Box::new(handler)),
            calls: AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AiProvider for ScriptedAi {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, AiProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let reply = self.queue.lock().expect("queue lock").pop_front();
        let text = match reply {
            Some(AiReply::Text(text)) => text,
            Some(AiReply::RateLimited) => {
                return Err(AiProviderError::RateLimited { retry_after: None })
            }
            Some(AiReply::Upstream(status)) => {
                return Err(AiProviderError::Upstream {
                    status,
                    message: "scripted upstream failure".to_string(),
                })
            }
            None => match &self.handler {
                Some(handler) => handler(call, &request),
                None => {
                    return Err(AiProviderError::Upstream {
                        status: 500,
                        message: "script exhausted".to_string(),
                    })
                }
            },
        };
        Ok(Completion {
            text,
            prompt_tokens: 100,
            completion_tokens: 200,
            finish_reason: FinishReason::Stop,
        })
    }
}

// ============================================================================
// Specs, runs, and pipeline wiring
// ============================================================================

/// Spec with POST /api/users and GET /api/users/{id}.
pub fn user_spec() -> Value {
    json!({
        "openapi": "3.0.0",
        "paths": {
            "/api/users": {
                "post": {"operationId": "createUser", "summary": "Create a user"}
            },
            "/api/users/{id}": {
                "get": {"operationId": "getUser", "summary": "Fetch a user"}
            }
        }
    })
}

/// Spec with `count` POST operations `/api/r0` .. `/api/r{count-1}`.
pub fn wide_spec(count: usize) -> Value {
    let mut paths = serde_json::Map::new();
    for i in 0..count {
        paths.insert(
            format!("/api/r{i}"),
            json!({"post": {"operationId": format!("op{i}")}}),
        );
    }
    json!({"openapi": "3.0.0", "paths": paths})
}

/// A scenario document exercising one POST endpoint, expecting 201 and an id.
pub fn simple_scenario_json(endpoint: &str) -> String {
    json!({
        "name": format!("exercise {endpoint}"),
        "steps": [{
            "index": 0,
            "name": "call",
            "method": "POST",
            "endpoint": endpoint,
            "expected": {"status": 201, "bodyFields": {"$.id": "<any>"}}
        }]
    })
    .to_string()
}

/// The two-step create-then-fetch scenario from the seed suite.
pub fn create_then_fetch_json() -> String {
    json!({
        "name": "create then fetch",
        "operationId": "createUser",
        "steps": [
            {
                "index": 0,
                "name": "create user",
                "method": "POST",
                "endpoint": "/api/users",
                "expected": {"status": 201, "bodyFields": {"$.id": "<any>"}},
                "extractions": {"userId": "$.id"}
            },
            {
                "index": 1,
                "name": "fetch user",
                "method": "GET",
                "endpoint": "/api/users/${userId}",
                "expected": {"status": 200, "bodyFields": {"$.id": "${userId}"}}
            }
        ]
    })
    .to_string()
}

/// Test config: internal hosts allowed (the SUT is an in-process script),
/// everything else at defaults.
pub fn test_config() -> RunConfig {
    RunConfig {
        allow_internal: true,
        step_timeout_ms: 2_000,
        ..RunConfig::default()
    }
}

pub fn test_run(spec: Value, config: RunConfig) -> Run {
    Run::new(
        "integration run",
        SpecSource::Inline(spec.to_string()),
        "http://sut.example.test",
        RunMode::Standard,
        config,
        "integration-suite",
        chrono::Utc::now(),
    )
    .expect("valid run")
}

/// Resilience tuned so tests never wait on rate limiters.
pub fn fast_resilience() -> ResilienceSettings {
    ResilienceSettings {
        ai_rate_limiter: RateLimiterConfig {
            period: Duration::from_micros(10),
            burst: 1000,
        },
        sut_rate_limiter: RateLimiterConfig {
            period: Duration::from_micros(10),
            burst: 1000,
        },
        ..ResilienceSettings::default()
    }
}

pub type TestOrchestrator = Orchestrator<MemoryStore, ScriptedAi, ScriptedGateway, NoopBus>;

pub fn orchestrator(
    store: Arc<MemoryStore>,
    ai: Arc<ScriptedAi>,
    gateway: Arc<ScriptedGateway>,
) -> TestOrchestrator {
    Orchestrator::new(RuntimeContext {
        store,
        ai,
        gateway,
        bus: Some(Arc::new(NoopBus)),
        clock: Arc::new(SystemClock),
        resilience: fast_resilience(),
    })
}

// ============================================================================
// Journal helpers
// ============================================================================

pub async fn events(store: &MemoryStore, run_id: &RunId) -> Vec<RunEvent> {
    store.events_for_run(run_id).await.expect("events readable")
}

pub fn seqs_of(events: &[RunEvent], event_type: RunEventType) -> Vec<u64> {
    events
        .iter()
        .filter(|e| e.event_type == event_type)
        .map(|e| e.seq)
        .collect()
}

pub fn first_seq(events: &[RunEvent], event_type: RunEventType) -> Option<u64> {
    seqs_of(events, event_type).into_iter().next()
}
