//! Deterministic replay: a stored payload re-executes the same scenarios
//! against a new base URL without any AI involvement.

mod support;

use std::sync::Arc;

use qw_domain::{RunConfig, RunEventType, RunStatus, ScenarioSource, Verdict};
use qw_engine::{decode_payload, encode_payload};
use qw_ports::{PayloadStore, ReportStore, ScenarioStore};
use serde_json::json;
use support::*;

fn per_operation_ai() -> ScriptedAi {
    ScriptedAi::with_handler(|_, request| {
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
    })
}

#[tokio::test]
async fn replay_reuses_scenarios_and_skips_the_ai_stage() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    let ai = Arc::new(per_operation_ai());
    let gateway = Arc::new(ScriptedGateway::constant(201, json!({"id": "u-1"})));
    let orchestrator = orchestrator(Arc::clone(&store), Arc::clone(&ai), gateway);

    let config = RunConfig {
        max_scenarios: 3,
        ..test_config()
    };
    let source_id = orchestrator.submit(test_run(wide_spec(3), config)).await.unwrap();
    assert_eq!(orchestrator.run(&source_id).await.unwrap(), RunStatus::Complete);
    let generation_calls = ai.call_count();

    let (replay_id, status) = orchestrator
        .replay(&source_id, Some("http://sut-b.example.test".to_string()), "replayer")
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Complete);

    // Scenarios are structurally identical: same ids, same step order
    let source_scenarios = store.scenarios_for_run(&source_id).await.unwrap();
    let replayed = store.scenarios_for_run(&replay_id).await.unwrap();
    assert_eq!(source_scenarios.len(), replayed.len());
    for (original, replay) in source_scenarios.iter().zip(&replayed) {
        assert_eq!(original.id, replay.id);
        assert_eq!(original.steps_hash(), replay.steps_hash());
        assert_eq!(replay.source, ScenarioSource::Replayed);
        assert_eq!(replay.run_id, replay_id);
    }

    // The AI stage never runs during a replay: no AI_SUCCESS event, no
    // generation calls beyond the original run's (the summary narrative
    // accounts for at most one extra provider call).
    let replay_events = events(&store, &replay_id).await;
    assert!(seqs_of(&replay_events, RunEventType::AiSuccess).is_empty());
    assert!(ai.call_count() <= generation_calls + 1);

    // Execution still journals normally and the run completes
    assert_eq!(
        seqs_of(&replay_events, RunEventType::ExecutionSuccess).len(),
        replayed.len()
    );
    assert_eq!(replay_events.last().unwrap().event_type, RunEventType::Complete);

    let summary = store.load_summary(&replay_id).await.unwrap();
    assert_eq!(summary.overall_verdict, Verdict::Pass);
}

#[tokio::test]
async fn payload_round_trips_byte_equivalently() {
    let store = Arc::new(qw_adapters::MemoryStore::default());
    let ai = Arc::new(per_operation_ai());
    let gateway = Arc::new(ScriptedGateway::constant(201, json!({"id": "u-1"})));
    let orchestrator = orchestrator(Arc::clone(&store), ai, gateway);

    let config = RunConfig {
        max_scenarios: 2,
        ..test_config()
    };
    let run_id = orchestrator.submit(test_run(wide_spec(2), config)).await.unwrap();
    assert_eq!(orchestrator.run(&run_id).await.unwrap(), RunStatus::Complete);

    let blob = store.load_payload(&run_id).await.unwrap();
    let payload = decode_payload(&blob).unwrap();
    assert_eq!(payload.run_id, run_id);
    assert_eq!(payload.scenarios.len(), 2);
    assert_eq!(payload.operations.len(), 2);

    // Decode → encode reproduces the stored blob exactly
    assert_eq!(encode_payload(&payload).unwrap(), blob);
}

#[tokio::test]
async fn replay_observes_divergent_sut_behavior() {
    // Replays are deterministic given identical SUT behavior; a changed SUT
    // shows up as a changed verdict, not changed scenarios.
    let store = Arc::new(qw_adapters::MemoryStore::default());
    let ai = Arc::new(per_operation_ai());
    let gateway = Arc::new(ScriptedGateway::new(|call, _| {
        // First run's call passes, the replay's call gets a 500
        if call == 1 {
            (std::time::Duration::ZERO, Ok(json_response(201, json!({"id": "u-1"}))))
        } else {
            (std::time::Duration::ZERO, Ok(json_response(500, json!({"error": "regression"}))))
        }
    }));
    let orchestrator = orchestrator(Arc::clone(&store), ai, gateway);

    let config = RunConfig {
        max_scenarios: 1,
        ..test_config()
    };
    let source_id = orchestrator.submit(test_run(wide_spec(1), config)).await.unwrap();
    assert_eq!(orchestrator.run(&source_id).await.unwrap(), RunStatus::Complete);
    assert_eq!(
        store.load_summary(&source_id).await.unwrap().overall_verdict,
        Verdict::Pass
    );

    let (replay_id, status) = orchestrator.replay(&source_id, None, "replayer").await.unwrap();
    assert_eq!(status, RunStatus::Complete);
    assert_eq!(
        store.load_summary(&replay_id).await.unwrap().overall_verdict,
        Verdict::Fail
    );

    // Same scenarios regardless of the outcome divergence
    let source_scenarios = store.scenarios_for_run(&source_id).await.unwrap();
    let replayed = store.scenarios_for_run(&replay_id).await.unwrap();
    assert_eq!(source_scenarios[0].steps_hash(), replayed[0].steps_hash());
}
