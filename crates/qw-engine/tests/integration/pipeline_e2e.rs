//! End-to-end pipeline tests against the in-memory adapters and a
//! scripted system under test.

mod support;

use std::sync::Arc;
use std::time::Duration;

use qw_domain::{
    AttemptStatus, ErrorKind, RunConfig, RunEventType, RunStatus, ScenarioStatus, StepStatus,
    Verdict, VerifyFailureKind,
};
use qw_ports::{ReportStore, RunStore, ScenarioStore, StepResultStore};
use serde_json::json;
use support::*;

#[tokio::test]
async fn happy_path_reaches_complete_with_full_coverage() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    let spec = json!({
        "openapi": "3.0.0",
        "paths": {"/api/users": {"post": {"operationId": "createUser"}}}
    });
    let ai = Arc::new(ScriptedAi::from_replies(vec![AiReply::Text(
        simple_scenario_json("/api/users"),
    )]));
    let gateway = Arc::new(ScriptedGateway::constant(201, json!({"id": "u-1"})));
    let orchestrator = orchestrator(Arc::clone(&store), ai, Arc::clone(&gateway));

    let run = test_run(spec, test_config());
    let run_id = orchestrator.submit(run).await.unwrap();
    let status = orchestrator.run(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::Complete);

    let run = store.load_run(&run_id).await.unwrap();
    assert!(run.spec_hash.is_some());
    assert!(run.started_at.is_some());
    assert!(run.completed_at.is_some());

    let coverage = store.load_coverage(&run_id).await.unwrap();
    assert_eq!(coverage.ops_total, 1);
    assert_eq!(coverage.ops_covered, 1);
    assert!(coverage.uncovered_ops.is_empty());

    let summary = store.load_summary(&run_id).await.unwrap();
    assert_eq!(summary.overall_verdict, Verdict::Pass);
    assert_eq!(summary.quality_score, 100);
    assert_eq!(summary.passed_scenarios, 1);
    assert!(!summary.narrative_summary.is_empty());

    let events = events(&store, &run_id).await;
    let ai_success = first_seq(&events, RunEventType::AiSuccess).unwrap();
    let exec_success = first_seq(&events, RunEventType::ExecutionSuccess).unwrap();
    assert!(ai_success < exec_success);
    assert_eq!(events.last().unwrap().event_type, RunEventType::Complete);
}

#[tokio::test]
async fn extraction_feeds_later_steps_across_one_context() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    let ai = Arc::new(ScriptedAi::from_replies(vec![AiReply::Text(
        create_then_fetch_json(),
    )]));
    let gateway = Arc::new(ScriptedGateway::new(|_, request| {
        if request.url.ends_with("/api/users") {
            (Duration::ZERO, Ok(json_response(201, json!({"id": "u-42"}))))
        } else {
            assert!(
                request.url.ends_with("/api/users/u-42"),
                "placeholder should resolve in {}",
                request.url
            );
            (Duration::ZERO, Ok(json_response(200, json!({"id": "u-42"}))))
        }
    }));
    let orchestrator = orchestrator(Arc::clone(&store), ai, gateway);

    let config = RunConfig {
        max_scenarios: 1,
        ..test_config()
    };
    let run_id = orchestrator.submit(test_run(user_spec(), config)).await.unwrap();
    assert_eq!(orchestrator.run(&run_id).await.unwrap(), RunStatus::Complete);

    let results = store.results_for_run(&run_id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.status == StepStatus::Passed));
    assert_eq!(results[0].extracted.get("userId").map(String::as_str), Some("u-42"));

    // Both operations were exercised by the one scenario
    let coverage = store.load_coverage(&run_id).await.unwrap();
    assert_eq!(coverage.ops_covered, 2);

    let summary = store.load_summary(&run_id).await.unwrap();
    assert_eq!(summary.overall_verdict, Verdict::Pass);
}

#[tokio::test]
async fn stop_on_first_failure_skips_the_rest_of_the_scenario() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    let ai = Arc::new(ScriptedAi::from_replies(vec![AiReply::Text(
        create_then_fetch_json(),
    )]));
    // Step 0 gets a 500; the expectation (201) fails, so step 1 must skip.
    let gateway = Arc::new(ScriptedGateway::constant(500, json!({"error": "boom"})));
    let orchestrator = orchestrator(Arc::clone(&store), ai, Arc::clone(&gateway));

    let config = RunConfig {
        max_scenarios: 1,
        ..test_config()
    };
    let run_id = orchestrator.submit(test_run(user_spec(), config)).await.unwrap();
    assert_eq!(orchestrator.run(&run_id).await.unwrap(), RunStatus::Complete);

    let results = store.results_for_run(&run_id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, StepStatus::Failed);
    assert_eq!(results[0].error_kind, Some(ErrorKind::Assertion));
    assert_eq!(results[1].status, StepStatus::Skipped);
    assert_eq!(results[1].failure_reason.as_deref(), Some("previous step failed"));
    // Only the first step performed an HTTP call
    assert_eq!(gateway.call_count(), 1);

    let events = events(&store, &run_id).await;
    assert_eq!(seqs_of(&events, RunEventType::ExecutionFailed).len(), 1);

    let summary = store.load_summary(&run_id).await.unwrap();
    assert_eq!(summary.overall_verdict, Verdict::Fail);
    assert_eq!(summary.failed_scenarios, 1);
}

#[tokio::test]
async fn verification_failure_retries_with_hint_and_records_attempts() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    // First response violates the schema (no steps); second is valid.
    let ai = Arc::new(ScriptedAi::from_replies(vec![
        AiReply::Text(json!({"name": "incomplete"}).to_string()),
        AiReply::Text(simple_scenario_json("/api/users")),
    ]));
    let spec = json!({
        "openapi": "3.0.0",
        "paths": {"/api/users": {"post": {"operationId": "createUser"}}}
    });
    let gateway = Arc::new(ScriptedGateway::constant(201, json!({"id": "u-1"})));
    let orchestrator = orchestrator(Arc::clone(&store), Arc::clone(&ai), gateway);

    let run_id = orchestrator.submit(test_run(spec, test_config())).await.unwrap();
    assert_eq!(orchestrator.run(&run_id).await.unwrap(), RunStatus::Complete);

    let attempts = store.attempts_for_run(&run_id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].status, AttemptStatus::Failed);
    assert_eq!(attempts[0].failure_kinds, vec![VerifyFailureKind::Schema]);
    assert!(attempts[0].hint.as_deref().unwrap().contains("steps"));
    assert_eq!(attempts[1].status, AttemptStatus::Passed);
    assert!(attempts[1].hint.is_some(), "retry carries the corrective hint");

    let scenarios = store.scenarios_for_run(&run_id).await.unwrap();
    assert_eq!(scenarios.len(), 1);
    assert_eq!(scenarios[0].status, ScenarioStatus::Ready);

    let events = events(&store, &run_id).await;
    assert_eq!(seqs_of(&events, RunEventType::ScenarioCreated).len(), 1);
}

#[tokio::test]
async fn exhausted_verification_leaves_invalid_scenarios_unexecuted() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    // Every attempt misaligns with the spec; retries cannot fix it.
    let misaligned = json!({
        "name": "wrong endpoint",
        "steps": [{
            "index": 0,
            "method": "POST",
            "endpoint": "/api/unknown",
            "expected": {"status": 200}
        }]
    })
    .to_string();
    let ai = Arc::new(ScriptedAi::from_replies(vec![
        AiReply::Text(misaligned.clone()),
        AiReply::Text(misaligned.clone()),
        AiReply::Text(misaligned),
    ]));
    let spec = json!({
        "openapi": "3.0.0",
        "paths": {"/api/users": {"post": {"operationId": "createUser"}}}
    });
    let gateway = Arc::new(ScriptedGateway::constant(200, json!({})));
    let orchestrator = orchestrator(Arc::clone(&store), ai, Arc::clone(&gateway));

    let run_id = orchestrator.submit(test_run(spec, test_config())).await.unwrap();
    let status = orchestrator.run(&run_id).await.unwrap();
    assert_eq!(status, RunStatus::FailedGeneration);

    let scenarios = store.scenarios_for_run(&run_id).await.unwrap();
    assert!(!scenarios.is_empty());
    assert!(scenarios.iter().all(|s| s.status == ScenarioStatus::Invalid));
    // Invalid scenarios never execute
    assert_eq!(gateway.call_count(), 0);

    let events = events(&store, &run_id).await;
    assert!(!seqs_of(&events, RunEventType::ScenarioGenerationFailed).is_empty());
    assert!(seqs_of(&events, RunEventType::AiSuccess).is_empty());
}

#[tokio::test]
async fn cancellation_stops_new_work_and_journals_cancelled_last() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    // One scenario per operation, derived from the prompt's focus line.
    let ai = Arc::new(ScriptedAi::with_handler(|_, request| {
        let endpoint = request
            .prompt
            .lines()
            .find_map(|line| line.split("exercising POST ").nth(1))
            .map(|rest| rest.split_whitespace().next().unwrap_or("/api/r0"))
            .unwrap_or("/api/r0")
            .to_string();
        json!({
            "name": format!("probe {endpoint}"),
            "steps": [{
                "index": 0,
                "method": "POST",
                "endpoint": endpoint,
                "expected": {"status": 201, "bodyFields": {"$.id": "<any>"}}
            }]
        })
        .to_string()
    }));
    // Two quick responses, then slow ones: the cancel lands while the slow
    // calls are in flight.
    let gateway = Arc::new(ScriptedGateway::new(|call, _| {
        let delay = if call <= 2 {
            Duration::ZERO
        } else {
            Duration::from_millis(300)
        };
        (delay, Ok(json_response(201, json!({"id": format!("u-{call}")}))))
    }));

    let config = RunConfig {
        max_scenarios: 8,
        exec_concurrency: 4,
        ..test_config()
    };
    let orchestrator = Arc::new(orchestrator(Arc::clone(&store), ai, gateway));
    let run_id = orchestrator.submit(test_run(wide_spec(8), config)).await.unwrap();

    let runner = {
        let orchestrator = Arc::clone(&orchestrator);
        let run_id = run_id.clone();
        tokio::spawn(async move { orchestrator.run(&run_id).await })
    };

    // Wait for two scenarios to finish, then cancel.
    loop {
        let events = events(&store, &run_id).await;
        if seqs_of(&events, RunEventType::ExecutionSuccess).len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    orchestrator.cancel(&run_id).await.unwrap();

    let status = runner.await.unwrap().unwrap();
    assert_eq!(status, RunStatus::Cancelled);

    let events = events(&store, &run_id).await;
    let cancelled_seq = first_seq(&events, RunEventType::Cancelled).unwrap();
    // Nothing is journaled after CANCELLED
    assert_eq!(events.last().unwrap().seq, cancelled_seq);
    // Scenarios not yet started when the signal tripped never start
    let started = seqs_of(&events, RunEventType::ExecutionStarted);
    assert!(started.len() < 8, "remaining scenarios must not start");
    assert!(started.iter().all(|seq| *seq < cancelled_seq));

    // Cancelling a terminal run is a no-op that reports the terminal state
    assert_eq!(
        orchestrator.cancel(&run_id).await.unwrap(),
        RunStatus::Cancelled
    );
}

#[tokio::test]
async fn unresolved_placeholder_fails_without_touching_the_network() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    // The scenario passes verification (userId is extracted by step 0),
    // but the SUT's create response carries no id, so step 1 references a
    // variable the extraction never supplied.
    let ai = Arc::new(ScriptedAi::from_replies(vec![AiReply::Text(
        create_then_fetch_json(),
    )]));
    let gateway = Arc::new(ScriptedGateway::new(|_, request| {
        assert!(
            request.url.ends_with("/api/users"),
            "step 1 must not reach the network, got {}",
            request.url
        );
        (Duration::ZERO, Ok(json_response(201, json!({"name": "no id"}))))
    }));
    let orchestrator = orchestrator(Arc::clone(&store), ai, Arc::clone(&gateway));

    let config = RunConfig {
        max_scenarios: 1,
        stop_on_first_failure: false,
        ..test_config()
    };
    let run_id = orchestrator.submit(test_run(user_spec(), config)).await.unwrap();
    assert_eq!(orchestrator.run(&run_id).await.unwrap(), RunStatus::Complete);

    let results = store.results_for_run(&run_id).await.unwrap();
    // Step 0 fails its own assertion ($.id missing); step 1 fails on the
    // missing extraction before any HTTP call.
    assert_eq!(results[1].status, StepStatus::Failed);
    assert_eq!(results[1].error_kind, Some(ErrorKind::ExtractionMissing));
    assert_eq!(gateway.call_count(), 1);
}

#[tokio::test]
async fn loopback_targets_are_blocked_by_the_ssrf_guard() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    let spec = json!({
        "openapi": "3.0.0",
        "paths": {"/api/ping": {"post": {"operationId": "ping"}}}
    });
    let ai = Arc::new(ScriptedAi::from_replies(vec![AiReply::Text(
        json!({
            "name": "ping",
            "steps": [{
                "index": 0,
                "method": "POST",
                "endpoint": "/api/ping",
                "expected": {"status": 200}
            }]
        })
        .to_string(),
    )]));
    let gateway = Arc::new(ScriptedGateway::constant(200, json!({})));
    let orchestrator = orchestrator(Arc::clone(&store), ai, Arc::clone(&gateway));

    let mut run = test_run(spec, RunConfig::default());
    run.base_url = "http://127.0.0.1:8080".to_string();
    let run_id = orchestrator.submit(run).await.unwrap();
    assert_eq!(orchestrator.run(&run_id).await.unwrap(), RunStatus::Complete);

    let results = store.results_for_run(&run_id).await.unwrap();
    assert_eq!(results[0].status, StepStatus::Failed);
    assert_eq!(results[0].error_kind, Some(ErrorKind::SsrfBlocked));
    assert_eq!(gateway.call_count(), 0);

    let summary = store.load_summary(&run_id).await.unwrap();
    assert_eq!(summary.overall_verdict, Verdict::Fail);
}

#[tokio::test]
async fn provider_failure_without_output_fails_generation() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    let spec = json!({
        "openapi": "3.0.0",
        "paths": {"/api/users": {"post": {"operationId": "createUser"}}}
    });
    // Non-retryable upstream failure on every attempt
    let ai = Arc::new(ScriptedAi::from_replies(vec![AiReply::Upstream(400)]));
    let gateway = Arc::new(ScriptedGateway::constant(200, json!({})));
    let orchestrator = orchestrator(Arc::clone(&store), ai, gateway);

    let run_id = orchestrator.submit(test_run(spec, test_config())).await.unwrap();
    assert_eq!(
        orchestrator.run(&run_id).await.unwrap(),
        RunStatus::FailedGeneration
    );

    let run = store.load_run(&run_id).await.unwrap();
    assert!(run.error_message.is_some());
}
