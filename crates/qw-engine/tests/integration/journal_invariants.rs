//! Journal ordering and terminal-state properties over full pipeline runs.

mod support;

use std::collections::HashSet;
use std::sync::Arc;

use qw_domain::{NewRunEvent, RunConfig, RunEventType, RunStatus, Verdict};
use qw_ports::{ReportStore, RunPatch, RunStore, ScenarioStore};
use serde_json::json;
use support::*;

#[tokio::test]
async fn journal_is_totally_ordered_and_causally_consistent() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
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
    let gateway = Arc::new(ScriptedGateway::constant(201, json!({"id": "u-1"})));
    let orchestrator = orchestrator(Arc::clone(&store), ai, gateway);

    let config = RunConfig {
        max_scenarios: 4,
        ..test_config()
    };
    let run_id = orchestrator.submit(test_run(wide_spec(4), config)).await.unwrap();
    assert_eq!(orchestrator.run(&run_id).await.unwrap(), RunStatus::Complete);

    let events = events(&store, &run_id).await;

    // Total order: seqs strictly increasing, no duplicates
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    let unique: HashSet<u64> = seqs.iter().copied().collect();
    assert_eq!(unique.len(), seqs.len());
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    // Causality: every scenario's EXECUTION_STARTED precedes its outcome
    for event in &events {
        if event.event_type == RunEventType::ExecutionSuccess {
            let scenario_id = event.scenario_id.as_ref().unwrap();
            let started = events
                .iter()
                .find(|e| {
                    e.event_type == RunEventType::ExecutionStarted
                        && e.scenario_id.as_ref() == Some(scenario_id)
                })
                .expect("every executed scenario has a started event");
            assert!(started.seq < event.seq);
        }
    }

    // AI_SUCCESS is emitted exactly once and precedes every outcome event
    let ai_success = seqs_of(&events, RunEventType::AiSuccess);
    assert_eq!(ai_success.len(), 1);
    for outcome in seqs_of(&events, RunEventType::ExecutionSuccess) {
        assert!(ai_success[0] < outcome);
    }

    // COMPLETE is last
    assert_eq!(events.last().unwrap().event_type, RunEventType::Complete);
}

#[tokio::test]
async fn terminal_states_reject_transitions_and_cancel_is_idempotent() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    let spec = json!({
        "openapi": "3.0.0",
        "paths": {"/api/users": {"post": {"operationId": "createUser"}}}
    });
    let ai = Arc::new(ScriptedAi::from_replies(vec![AiReply::Text(
        simple_scenario_json("/api/users"),
    )]));
    let gateway = Arc::new(ScriptedGateway::constant(201, json!({"id": "u-1"})));
    let orchestrator = orchestrator(Arc::clone(&store), ai, gateway);

    let run_id = orchestrator.submit(test_run(spec, test_config())).await.unwrap();
    assert_eq!(orchestrator.run(&run_id).await.unwrap(), RunStatus::Complete);
    let sealed = events(&store, &run_id).await.len();

    // A direct transition attempt on a terminal run fails and appends nothing
    let refused = orchestrator
        .journal()
        .transition(
            &run_id,
            RunStatus::ExecutionInProgress,
            RunPatch::default(),
            Some(NewRunEvent::new(RunEventType::ExecutionStarted)),
        )
        .await;
    assert!(refused.is_err());

    // Cancel on a terminal run is a no-op reporting the terminal state
    assert_eq!(orchestrator.cancel(&run_id).await.unwrap(), RunStatus::Complete);
    assert_eq!(orchestrator.cancel(&run_id).await.unwrap(), RunStatus::Complete);

    let events = events(&store, &run_id).await;
    assert_eq!(events.len(), sealed, "terminal runs accept no further events");
    let run = store.load_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Complete);
}

#[tokio::test]
async fn zero_scenario_budget_completes_inconclusive_with_empty_coverage() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    let ai = Arc::new(ScriptedAi::from_replies(Vec::new()));
    let gateway = Arc::new(ScriptedGateway::constant(200, json!({})));
    let orchestrator = orchestrator(Arc::clone(&store), Arc::clone(&ai), Arc::clone(&gateway));

    let config = RunConfig {
        max_scenarios: 0,
        ..test_config()
    };
    let run_id = orchestrator.submit(test_run(user_spec(), config)).await.unwrap();
    assert_eq!(orchestrator.run(&run_id).await.unwrap(), RunStatus::Complete);

    // No generation attempts, no execution (the summary narrative may
    // still consult the provider and fall back to the template)
    assert!(store.attempts_for_run(&run_id).await.unwrap().is_empty());
    assert_eq!(gateway.call_count(), 0);

    let coverage = store.load_coverage(&run_id).await.unwrap();
    assert_eq!(coverage.ops_covered, 0);
    assert_eq!(coverage.scenarios_passed + coverage.scenarios_failed, 0);

    let summary = store.load_summary(&run_id).await.unwrap();
    assert_eq!(summary.overall_verdict, Verdict::Inconclusive);
}

#[tokio::test]
async fn spec_without_operations_fails_the_run_as_invalid() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    let ai = Arc::new(ScriptedAi::from_replies(Vec::new()));
    let gateway = Arc::new(ScriptedGateway::constant(200, json!({})));
    let orchestrator = orchestrator(Arc::clone(&store), ai, gateway);

    let spec = json!({"openapi": "3.0.0", "paths": {}});
    let run_id = orchestrator.submit(test_run(spec, test_config())).await.unwrap();
    assert_eq!(
        orchestrator.run(&run_id).await.unwrap(),
        RunStatus::FailedSpecFetch
    );

    let events = events(&store, &run_id).await;
    let failure = events
        .iter()
        .find(|e| e.event_type == RunEventType::SpecFetchFailed)
        .unwrap();
    assert_eq!(failure.payload["errorKind"], json!("SPEC_INVALID"));
}

#[tokio::test]
async fn runs_are_only_startable_from_requested() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    let spec = json!({
        "openapi": "3.0.0",
        "paths": {"/api/users": {"post": {"operationId": "createUser"}}}
    });
    let ai = Arc::new(ScriptedAi::from_replies(vec![AiReply::Text(
        simple_scenario_json("/api/users"),
    )]));
    let gateway = Arc::new(ScriptedGateway::constant(201, json!({"id": "u-1"})));
    let orchestrator = orchestrator(Arc::clone(&store), ai, gateway);

    let run_id = orchestrator.submit(test_run(spec, test_config())).await.unwrap();
    orchestrator.run(&run_id).await.unwrap();

    let again = orchestrator.run(&run_id).await;
    assert!(matches!(
        again,
        Err(qw_engine::OrchestratorError::NotRunnable { .. })
    ));
}
