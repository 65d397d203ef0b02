//! Coverage aggregation and the final summary
//!
//! An operation is COVERED when at least one passed step exercises it,
//! FAILED when scenarios map to it but no step passed, and UNTESTED when
//! nothing maps to it at all.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use qw_domain::{
    path_templates_match, CoverageSnapshot, Operation, OperationRef, OperationStatus, QaSummary,
    Run, ScenarioSource, StepStatus, Verdict,
};
use qw_ports::{AiProvider, AiProviderError, CompletionRequest};
use tracing::{debug, warn};

use crate::resilience::{ResilienceEnvelope, ResilienceError};
use crate::scenario_executor::ScenarioRun;

/// Build the coverage snapshot from enumerated operations and completed
/// scenario runs.
pub fn build_coverage(
    operations: &[Operation],
    runs: &[ScenarioRun],
    now: DateTime<Utc>,
) -> CoverageSnapshot {
    let mut per_op_status = BTreeMap::new();
    let mut uncovered = Vec::new();
    let mut covered = 0u32;
    let mut failed = 0u32;

    for operation in operations {
        let mut mapped = false;
        let mut passed_step = false;

        for run in runs {
            if run.scenario.operation_id.as_deref() == operation.operation_id.as_deref()
                && operation.operation_id.is_some()
            {
                mapped = true;
            }
            for result in &run.results {
                let Some(step) = run.scenario.steps.iter().find(|s| s.index == result.step_index)
                else {
                    continue;
                };
                if step.method == operation.method
                    && path_templates_match(&operation.path, endpoint_path(&step.endpoint))
                {
                    mapped = true;
                    if result.status == StepStatus::Passed {
                        passed_step = true;
                    }
                }
            }
        }

        let status = if passed_step {
            covered += 1;
            OperationStatus::Covered
        } else if mapped {
            failed += 1;
            OperationStatus::Failed
        } else {
            uncovered.push(OperationRef {
                method: operation.method,
                path: operation.path.clone(),
            });
            OperationStatus::Untested
        };
        per_op_status.insert(operation.key(), status);
    }

    let scenarios_passed = runs.iter().filter(|r| r.verdict.is_passed()).count() as u32;
    let scenarios_failed = runs.len() as u32 - scenarios_passed;

    CoverageSnapshot {
        ops_total: operations.len() as u32,
        ops_covered: covered,
        ops_failed: failed,
        uncovered_ops: uncovered,
        per_op_status,
        scenarios_passed,
        scenarios_failed,
        computed_at: now,
    }
}

fn endpoint_path(endpoint: &str) -> &str {
    let without_scheme = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"));
    let path = match without_scheme {
        Some(rest) => rest.find('/').map(|i| &rest[i..]).unwrap_or("/"),
        None => endpoint,
    };
    path.split(['?', '#']).next().unwrap_or(path)
}

/// Quality signals surfaced as recommendations.
pub fn build_recommendations(runs: &[ScenarioRun], coverage: &CoverageSnapshot) -> Vec<String> {
    let mut recommendations = Vec::new();

    let weak: Vec<&str> = runs
        .iter()
        .filter(|r| r.scenario.steps.iter().all(|s| s.expected.body_fields.is_empty()))
        .map(|r| r.scenario.name.as_str())
        .collect();
    if !weak.is_empty() {
        recommendations.push(format!(
            "Weak assertions: {} declare(s) no body-field expectations; add value checks",
            weak.join(", ")
        ));
    }

    let gaps: Vec<&str> = runs
        .iter()
        .filter(|r| {
            r.results.iter().any(|result| {
                result.error_kind == Some(qw_domain::ErrorKind::PlaceholderUnresolved)
            })
        })
        .map(|r| r.scenario.name.as_str())
        .collect();
    if !gaps.is_empty() {
        recommendations.push(format!(
            "Placeholder gaps: {} ran with unresolved placeholders; check extraction locators",
            gaps.join(", ")
        ));
    }

    if runs.iter().any(|r| r.scenario.source == ScenarioSource::Fallback) {
        recommendations.push(
            "Synthetic fallback scenarios ran while the AI provider was unavailable; \
             re-run for full-quality generation"
                .to_string(),
        );
    }

    if !coverage.uncovered_ops.is_empty() {
        recommendations.push(format!(
            "{} operation(s) remain untested",
            coverage.uncovered_ops.len()
        ));
    }

    recommendations
}

/// PASS needs zero failures and coverage at or above the threshold; any
/// failure is FAIL; clean-but-shallow runs are INCONCLUSIVE.
pub fn decide_verdict(coverage: &CoverageSnapshot, threshold: f64) -> Verdict {
    if coverage.scenarios_failed > 0 {
        Verdict::Fail
    } else if coverage.coverage_fraction() >= threshold && coverage.ops_total > 0 {
        Verdict::Pass
    } else {
        Verdict::Inconclusive
    }
}

pub fn quality_score(coverage: &CoverageSnapshot) -> u8 {
    let total = (coverage.scenarios_passed + coverage.scenarios_failed).max(1) as f64;
    let pass_rate = coverage.scenarios_passed as f64 / total;
    let op_rate = coverage.ops_covered as f64 / coverage.ops_total.max(1) as f64;
    (100.0 * pass_rate * op_rate).round() as u8
}

/// How long the narrative LLM call may take before the template fallback.
const NARRATIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the final summary. The narrative comes from the model when it
/// answers in time; otherwise from a deterministic template.
pub async fn build_summary<A: AiProvider>(
    run: &Run,
    coverage: &CoverageSnapshot,
    runs: &[ScenarioRun],
    ai: Option<(&Arc<A>, &Arc<ResilienceEnvelope>)>,
) -> QaSummary {
    let errored = runs
        .iter()
        .filter(|r| matches!(r.verdict, qw_domain::ScenarioVerdict::Errored))
        .count() as u32;
    let failed = coverage.scenarios_failed - errored.min(coverage.scenarios_failed);
    let verdict = decide_verdict(coverage, run.config.coverage_threshold);
    let recommendations = build_recommendations(runs, coverage);
    let score = quality_score(coverage);

    let narrative = match ai {
        Some((provider, envelope)) => {
            match narrative_from_model(run, coverage, verdict, provider, envelope).await {
                Some(text) => text,
                None => template_narrative(run, coverage, verdict),
            }
        }
        None => template_narrative(run, coverage, verdict),
    };

    QaSummary {
        overall_verdict: verdict,
        passed_scenarios: coverage.scenarios_passed,
        failed_scenarios: failed,
        errored_scenarios: errored,
        narrative_summary: narrative,
        recommendations,
        quality_score: score,
    }
}

async fn narrative_from_model<A: AiProvider>(
    run: &Run,
    coverage: &CoverageSnapshot,
    verdict: Verdict,
    provider: &Arc<A>,
    envelope: &Arc<ResilienceEnvelope>,
) -> Option<String> {
    let prompt = format!(
        "Write a 2-3 sentence QA summary for run '{}': verdict {:?}, \
         {} of {} scenarios passed, {} of {} operations covered. Plain prose, no lists.",
        run.name,
        verdict,
        coverage.scenarios_passed,
        coverage.scenarios_passed + coverage.scenarios_failed,
        coverage.ops_covered,
        coverage.ops_total
    );
    let request = CompletionRequest {
        system_prompt: "You summarize API test runs for engineers. Be factual and brief.".to_string(),
        prompt,
        temperature: 0.3,
        max_tokens: 256,
    };

    let call = envelope.call(AiProviderError::is_retryable, || {
        let provider = Arc::clone(provider);
        let request = request.clone();
        async move { provider.complete(request).await }
    });

    match tokio::time::timeout(NARRATIVE_TIMEOUT, call).await {
        Ok(Ok(completion)) => Some(completion.text.trim().to_string()),
        Ok(Err(ResilienceError::Inner(e))) => {
            warn!(error = %e, "narrative generation failed; using template");
            None
        }
        Ok(Err(e)) => {
            warn!(error = %e, "narrative generation rejected; using template");
            None
        }
        Err(_) => {
            debug!("narrative generation timed out; using template");
            None
        }
    }
}

fn template_narrative(run: &Run, coverage: &CoverageSnapshot, verdict: Verdict) -> String {
    format!(
        "Run '{}' finished with verdict {:?}: {}/{} scenarios passed and {}/{} operations covered ({}%).",
        run.name,
        verdict,
        coverage.scenarios_passed,
        coverage.scenarios_passed + coverage.scenarios_failed,
        coverage.ops_covered,
        coverage.ops_total,
        (coverage.coverage_fraction() * 100.0).round() as u32
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use qw_domain::contract::{parse_scenario_document, ShapeLimits};
    use qw_domain::{
        HttpMethod, RunId, ScenarioSource, ScenarioVerdict, StepResult, StepResultId,
    };
    use serde_json::json;
    use std::collections::BTreeMap;

    fn operation(method: HttpMethod, path: &str, id: &str) -> Operation {
        Operation {
            method,
            path: path.to_string(),
            operation_id: Some(id.to_string()),
            summary: None,
        }
    }

    fn scenario_run(endpoint: &str, method: &str, status: StepStatus) -> ScenarioRun {
        let doc = json!({
            "name": format!("{method} {endpoint}"),
            "steps": [{
                "index": 0,
                "method": method,
                "endpoint": endpoint,
                "expected": {"status": 200, "bodyFields": {"$.id": "<any>"}}
            }]
        });
        let scenario = parse_scenario_document(&doc, &ShapeLimits::default())
            .unwrap()
            .remove(0)
            .into_scenario(RunId::new(), ScenarioSource::AiGenerated, Utc::now());
        let result = StepResult {
            id: StepResultId::new(),
            run_id: scenario.run_id.clone(),
            scenario_id: scenario.id.clone(),
            step_index: 0,
            status,
            actual_status_code: Some(200),
            actual_headers: Vec::new(),
            body_digest: None,
            body_excerpt: None,
            assertions: Vec::new(),
            extracted: BTreeMap::new(),
            duration_ms: 5,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            failure_reason: None,
            error_kind: None,
        };
        let verdict = ScenarioVerdict::from_steps([&result.status]);
        ScenarioRun {
            scenario,
            results: vec![result],
            verdict,
        }
    }

    #[test]
    fn classifies_covered_failed_and_untested() {
        let ops = vec![
            operation(HttpMethod::Post, "/api/users", "createUser"),
            operation(HttpMethod::Get, "/api/users/{id}", "getUser"),
            operation(HttpMethod::Delete, "/api/users/{id}", "deleteUser"),
        ];
        let runs = vec![
            scenario_run("/api/users", "POST", StepStatus::Passed),
            scenario_run("/api/users/${id}", "GET", StepStatus::Failed),
        ];
        let coverage = build_coverage(&ops, &runs, Utc::now());
        assert_eq!(coverage.ops_total, 3);
        assert_eq!(coverage.ops_covered, 1);
        assert_eq!(coverage.ops_failed, 1);
        assert_eq!(coverage.uncovered_ops.len(), 1);
        assert_eq!(
            coverage.per_op_status["POST /api/users"],
            OperationStatus::Covered
        );
        assert_eq!(
            coverage.per_op_status["GET /api/users/{id}"],
            OperationStatus::Failed
        );
        assert_eq!(
            coverage.per_op_status["DELETE /api/users/{id}"],
            OperationStatus::Untested
        );
    }

    #[test]
    fn verdict_thresholds() {
        let ops = vec![operation(HttpMethod::Post, "/api/users", "createUser")];
        let runs = vec![scenario_run("/api/users", "POST", StepStatus::Passed)];
        let coverage = build_coverage(&ops, &runs, Utc::now());
        assert_eq!(decide_verdict(&coverage, 0.8), Verdict::Pass);
        assert_eq!(quality_score(&coverage), 100);

        let failed_runs = vec![scenario_run("/api/users", "POST", StepStatus::Failed)];
        let coverage = build_coverage(&ops, &failed_runs, Utc::now());
        assert_eq!(decide_verdict(&coverage, 0.8), Verdict::Fail);

        let empty = CoverageSnapshot::empty(Utc::now());
        assert_eq!(decide_verdict(&empty, 0.8), Verdict::Inconclusive);
    }

    #[test]
    fn weak_assertion_and_untested_recommendations() {
        let ops = vec![
            operation(HttpMethod::Post, "/api/users", "createUser"),
            operation(HttpMethod::Get, "/api/users/{id}", "getUser"),
        ];
        let doc = json!({
            "name": "no assertions",
            "steps": [{
                "index": 0,
                "method": "POST",
                "endpoint": "/api/users",
                "expected": {"status": 201}
            }]
        });
        let scenario = parse_scenario_document(&doc, &ShapeLimits::default())
            .unwrap()
            .remove(0)
            .into_scenario(RunId::new(), ScenarioSource::AiGenerated, Utc::now());
        let mut run = scenario_run("/api/users", "POST", StepStatus::Passed);
        run.scenario = scenario;
        let coverage = build_coverage(&ops, &[run.clone()], Utc::now());
        let recs = build_recommendations(&[run], &coverage);
        assert!(recs.iter().any(|r| r.contains("Weak assertions")));
        assert!(recs.iter().any(|r| r.contains("untested")));
    }
}
