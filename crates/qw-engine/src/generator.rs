//! Scenario generation: drive the language model and verify its output
//!
//! The verifier runs synchronously on every response, in order: schema,
//! spec alignment, placeholder safety, and shape. On failure it classifies
//! the violations, builds a corrective hint, and regenerates up to the
//! configured retry budget. Output that survives becomes READY scenarios;
//! an exhausted budget leaves INVALID scenarios that never execute.

use std::sync::Arc;

use qw_domain::{
    contract::{parse_scenario_document, ShapeLimits, Violation},
    match_operation, AttemptStatus, ErrorKind, GenerationAttempt, Operation, Run, Scenario,
    ScenarioDraft, ScenarioSource, ScenarioStatus, Step, VerifyFailureKind,
};
use qw_ports::{AiProvider, AiProviderError, Clock, CompletionRequest, ScenarioStore, StoreError};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::resilience::{ResilienceEnvelope, ResilienceError};

/// Generator tuning derived from the run config
#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub verify_retries: u32,
    pub limits: ShapeLimits,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GeneratorSettings {
    pub fn from_config(config: &qw_domain::RunConfig) -> Self {
        Self {
            verify_retries: config.ai_verify_retries,
            limits: ShapeLimits {
                max_scenarios: config.max_scenarios,
                max_steps_per_scenario: config.max_steps_per_scenario,
            },
            temperature: 0.2,
            max_tokens: 4096,
        }
    }
}

/// What one operation's generation produced
#[derive(Debug)]
pub enum GenerationOutcome {
    /// Verified scenarios, status READY
    Verified(Vec<Scenario>),
    /// Verification exhausted its retries; drafts (if any) are INVALID
    Invalid {
        scenarios: Vec<Scenario>,
        violations: Vec<Violation>,
    },
    /// The provider failed after retries, or the bulkhead rejected the call
    ProviderFailed { kind: ErrorKind, message: String },
    /// Circuit open: a synthetic probe keeps the run going at reduced quality
    Fallback(Scenario),
}

/// Drives the AI provider through the resilience envelope and verifies
/// every response against the scenario contract
pub struct AiGenerator<A, S> {
    provider: Arc<A>,
    scenarios: Arc<S>,
    envelope: Arc<ResilienceEnvelope>,
    clock: Arc<dyn Clock>,
    settings: GeneratorSettings,
}

impl<A: AiProvider, S: ScenarioStore> AiGenerator<A, S> {
    pub fn new(
        provider: Arc<A>,
        scenarios: Arc<S>,
        envelope: Arc<ResilienceEnvelope>,
        clock: Arc<dyn Clock>,
        settings: GeneratorSettings,
    ) -> Self {
        Self {
            provider,
            scenarios,
            envelope,
            clock,
            settings,
        }
    }

    /// Generate and verify scenarios for one operation. Store errors are the
    /// only propagated failures; everything else becomes an outcome.
    #[instrument(skip_all, fields(run_id = %run.id, operation = %operation.key()))]
    pub async fn generate_for_operation(
        &self,
        run: &Run,
        operations: &[Operation],
        operation: &Operation,
    ) -> Result<GenerationOutcome, StoreError> {
        let mut hint: Option<String> = None;
        let mut last_violations: Vec<Violation> = Vec::new();
        let mut last_drafts: Vec<ScenarioDraft> = Vec::new();

        let attempts = 1 + self.settings.verify_retries;
        for attempt_number in 1..=attempts {
            let mut attempt = GenerationAttempt::new(
                run.id.clone(),
                operation.operation_id.clone(),
                attempt_number,
                self.clock.now(),
            );
            if attempt_number > 1 {
                attempt.status = AttemptStatus::Retrying;
                attempt.hint = hint.clone();
            }
            self.scenarios.record_attempt(attempt.clone()).await?;

            let request = CompletionRequest {
                system_prompt: system_prompt(),
                prompt: generation_prompt(run, operations, operation, hint.as_deref(), &self.settings.limits),
                temperature: self.settings.temperature,
                max_tokens: self.settings.max_tokens,
            };

            let response = self
                .envelope
                .call(AiProviderError::is_retryable, || {
                    let provider = Arc::clone(&self.provider);
                    let request = request.clone();
                    async move { provider.complete(request).await }
                })
                .await;

            let text = match response {
                Ok(completion) => completion.text,
                Err(ResilienceError::CircuitOpen) => {
                    warn!("AI circuit open; emitting synthetic fallback scenario");
                    attempt.status = AttemptStatus::Failed;
                    self.scenarios.record_attempt(attempt).await?;
                    return Ok(GenerationOutcome::Fallback(fallback_scenario(
                        run, operation, self.clock.now(),
                    )));
                }
                Err(ResilienceError::Overloaded) => {
                    attempt.status = AttemptStatus::Failed;
                    self.scenarios.record_attempt(attempt).await?;
                    return Ok(GenerationOutcome::ProviderFailed {
                        kind: ErrorKind::Overloaded,
                        message: "AI bulkhead rejected the call".to_string(),
                    });
                }
                Err(ResilienceError::Inner(err)) => {
                    attempt.status = AttemptStatus::Failed;
                    self.scenarios.record_attempt(attempt).await?;
                    return Ok(GenerationOutcome::ProviderFailed {
                        kind: ErrorKind::AiProvider,
                        message: err.to_string(),
                    });
                }
            };

            match verify(&text, operations, &self.settings.limits) {
                Ok(drafts) => {
                    attempt.status = AttemptStatus::Passed;
                    self.scenarios.record_attempt(attempt).await?;
                    let scenarios = drafts
                        .into_iter()
                        .map(|draft| self.ready_scenario(run, operation, draft))
                        .collect::<Vec<_>>();
                    info!(count = scenarios.len(), attempt = attempt_number, "generation verified");
                    return Ok(GenerationOutcome::Verified(scenarios));
                }
                Err(Rejection { violations, drafts }) => {
                    debug!(
                        attempt = attempt_number,
                        violations = violations.len(),
                        "generation rejected by verifier"
                    );
                    attempt.status = AttemptStatus::Failed;
                    attempt.failure_kinds = classify(&violations);
                    hint = Some(corrective_hint(&violations));
                    attempt.hint = hint.clone();
                    self.scenarios.record_attempt(attempt).await?;
                    last_violations = violations;
                    last_drafts = drafts;
                }
            }
        }

        // Retries exhausted: persist whatever drafts survived parsing as
        // INVALID so the failure is inspectable.
        let scenarios = last_drafts
            .into_iter()
            .map(|draft| {
                let mut scenario =
                    draft.into_scenario(run.id.clone(), ScenarioSource::AiGenerated, self.clock.now());
                scenario.status = ScenarioStatus::Invalid;
                scenario.operation_id = scenario
                    .operation_id
                    .or_else(|| operation.operation_id.clone());
                scenario
            })
            .collect();
        Ok(GenerationOutcome::Invalid {
            scenarios,
            violations: last_violations,
        })
    }

    fn ready_scenario(&self, run: &Run, operation: &Operation, draft: ScenarioDraft) -> Scenario {
        let mut scenario =
            draft.into_scenario(run.id.clone(), ScenarioSource::AiGenerated, self.clock.now());
        scenario.status = ScenarioStatus::Ready;
        scenario.operation_id = scenario
            .operation_id
            .or_else(|| operation.operation_id.clone())
            .or_else(|| Some(operation.key()));
        scenario
    }
}

/// A rejected generation: the violations plus any drafts that survived
/// parsing (kept so exhausted retries can persist them INVALID)
#[derive(Debug)]
struct Rejection {
    violations: Vec<Violation>,
    drafts: Vec<ScenarioDraft>,
}

/// Run the verifier checks in order: schema, alignment, placeholders, shape
/// (shape is folded into the contract parse).
fn verify(
    text: &str,
    operations: &[Operation],
    limits: &ShapeLimits,
) -> Result<Vec<ScenarioDraft>, Rejection> {
    let stripped = strip_code_fences(text);
    let document: Value = match serde_json::from_str(stripped) {
        Ok(value) => value,
        Err(e) => {
            return Err(Rejection {
                violations: vec![Violation::schema(format!("response is not valid JSON: {e}"))],
                drafts: Vec::new(),
            })
        }
    };

    let drafts = match parse_scenario_document(&document, limits) {
        Ok(drafts) => drafts,
        Err(violations) => {
            return Err(Rejection {
                violations,
                drafts: Vec::new(),
            })
        }
    };

    let mut violations = Vec::new();
    for draft in &drafts {
        for step in &draft.steps {
            if match_operation(operations, step.method, &step.endpoint).is_none() {
                violations.push(Violation {
                    kind: VerifyFailureKind::Alignment,
                    message: format!(
                        "scenario '{}' step {}: {} {} does not match any spec operation",
                        draft.name, step.index, step.method, step.endpoint
                    ),
                });
            }
        }
        violations.extend(draft.placeholder_violations());
    }

    if violations.is_empty() {
        Ok(drafts)
    } else {
        Err(Rejection { violations, drafts })
    }
}

fn classify(violations: &[Violation]) -> Vec<VerifyFailureKind> {
    let mut kinds: Vec<VerifyFailureKind> = Vec::new();
    for violation in violations {
        if !kinds.contains(&violation.kind) {
            kinds.push(violation.kind);
        }
    }
    kinds
}

/// Enumerate the specific violations so the next attempt can fix them.
fn corrective_hint(violations: &[Violation]) -> String {
    let mut hint = String::from(
        "The previous response was rejected. Fix every issue below and return only the corrected JSON:\n",
    );
    for violation in violations {
        hint.push_str("- ");
        hint.push_str(&violation.message);
        hint.push('\n');
    }
    hint
}

/// Models wrap JSON in markdown fences often enough to handle it here.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

fn system_prompt() -> String {
    "You design multi-step HTTP API test scenarios. Respond with a single JSON document: \
     either one scenario object or an array of scenario objects, no prose, no markdown. \
     Each scenario has: name, optional description, optional operationId, and steps. \
     Each step has: index (0-based, contiguous), name, method, endpoint, optional headers, \
     optional body, expected {status, optional bodyFields, optional headers}, and optional \
     extractions mapping variable names to JSONPath-style locators. Reference earlier \
     extractions with ${var}; environment values with ${env.KEY}."
        .to_string()
}

fn generation_prompt(
    run: &Run,
    operations: &[Operation],
    operation: &Operation,
    hint: Option<&str>,
    limits: &ShapeLimits,
) -> String {
    let mut prompt = String::new();
    if let Some(requirement) = &run.requirement_text {
        prompt.push_str("Requirement under test:\n");
        prompt.push_str(requirement);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Available operations:\n");
    for op in operations {
        prompt.push_str("- ");
        prompt.push_str(&op.key());
        if let Some(id) = &op.operation_id {
            prompt.push_str(&format!(" (operationId: {id})"));
        }
        if let Some(summary) = &op.summary {
            prompt.push_str(&format!(": {summary}"));
        }
        prompt.push('\n');
    }
    prompt.push_str(&format!(
        "\nDesign a test scenario exercising {} with realistic data. \
         Use at most {} steps. Only call operations from the list above.\n",
        operation.key(),
        limits.max_steps_per_scenario
    ));
    if let Some(hint) = hint {
        prompt.push('\n');
        prompt.push_str(hint);
    }
    prompt
}

/// Deterministic probe emitted when the AI circuit is open. It is shaped to
/// the contract, flagged as synthetic, and accepts any response so the run
/// completes with reduced quality instead of stalling.
pub fn fallback_scenario(
    run: &Run,
    operation: &Operation,
    now: chrono::DateTime<chrono::Utc>,
) -> Scenario {
    let draft = ScenarioDraft {
        name: format!("fallback probe {}", operation.key()),
        description: Some("Synthetic scenario generated while the AI provider was unavailable".to_string()),
        operation_id: operation.operation_id.clone().or_else(|| Some(operation.key())),
        steps: vec![Step {
            index: 0,
            name: "probe".to_string(),
            method: operation.method,
            endpoint: operation.path.clone(),
            headers: Vec::new(),
            body: None,
            expected: qw_domain::Expectation {
                status: qw_domain::StatusExpectation::Cmp(qw_domain::CmpOp::Ge, 100),
                body_fields: Vec::new(),
                headers: Vec::new(),
            },
            extractions: Vec::new(),
        }],
    };
    let mut scenario = draft.into_scenario(run.id.clone(), ScenarioSource::Fallback, now);
    scenario.status = ScenarioStatus::Ready;
    scenario.tags = vec!["synthetic".to_string()];
    scenario
}

#[cfg(test)]
mod tests {
    use super::*;
    use qw_domain::HttpMethod;
    use serde_json::json;

    fn ops() -> Vec<Operation> {
        vec![
            Operation {
                method: HttpMethod::Post,
                path: "/api/users".to_string(),
                operation_id: Some("createUser".to_string()),
                summary: None,
            },
            Operation {
                method: HttpMethod::Get,
                path: "/api/users/{id}".to_string(),
                operation_id: Some("getUser".to_string()),
                summary: None,
            },
        ]
    }

    fn valid_response() -> String {
        json!({
            "name": "create and fetch",
            "steps": [
                {
                    "index": 0,
                    "name": "create",
                    "method": "POST",
                    "endpoint": "/api/users",
                    "expected": {"status": 201},
                    "extractions": {"userId": "$.id"}
                },
                {
                    "index": 1,
                    "name": "fetch",
                    "method": "GET",
                    "endpoint": "/api/users/${userId}",
                    "expected": {"status": 200}
                }
            ]
        })
        .to_string()
    }

    #[test]
    fn accepts_a_valid_response() {
        let drafts = verify(&valid_response(), &ops(), &ShapeLimits::default()).unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].steps.len(), 2);
    }

    #[test]
    fn accepts_fenced_json() {
        let fenced = format!("```json\n{}\n```", valid_response());
        assert!(verify(&fenced, &ops(), &ShapeLimits::default()).is_ok());
    }

    #[test]
    fn classifies_schema_failures() {
        let Err(Rejection { violations, .. }) =
            verify("{\"name\": \"missing steps\"}", &ops(), &ShapeLimits::default())
        else {
            panic!("expected violations");
        };
        assert_eq!(classify(&violations), vec![VerifyFailureKind::Schema]);
        let hint = corrective_hint(&violations);
        assert!(hint.contains("steps"));
    }

    #[test]
    fn classifies_alignment_failures() {
        let response = json!({
            "name": "wrong op",
            "steps": [{
                "index": 0,
                "method": "DELETE",
                "endpoint": "/api/unknown",
                "expected": {"status": 204}
            }]
        })
        .to_string();
        let Err(Rejection { violations, drafts }) =
            verify(&response, &ops(), &ShapeLimits::default())
        else {
            panic!("expected violations");
        };
        assert_eq!(classify(&violations), vec![VerifyFailureKind::Alignment]);
        // Drafts survive parsing, so exhausted retries can persist them INVALID
        assert_eq!(drafts.len(), 1);
    }

    #[test]
    fn classifies_placeholder_failures() {
        let response = json!({
            "name": "undefined var",
            "steps": [{
                "index": 0,
                "method": "GET",
                "endpoint": "/api/users/${ghost}",
                "expected": {"status": 200}
            }]
        })
        .to_string();
        let Err(Rejection { violations, .. }) =
            verify(&response, &ops(), &ShapeLimits::default())
        else {
            panic!("expected violations");
        };
        assert!(classify(&violations).contains(&VerifyFailureKind::Placeholder));
    }

    #[test]
    fn invalid_json_is_a_schema_failure() {
        let Err(Rejection { violations, .. }) =
            verify("not json at all", &ops(), &ShapeLimits::default())
        else {
            panic!("expected violations");
        };
        assert_eq!(violations[0].kind, VerifyFailureKind::Schema);
    }
}
