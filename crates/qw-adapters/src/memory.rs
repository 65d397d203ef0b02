//! In-memory persistence adapter
//!
//! Backs every store port with maps behind one `RwLock`, which makes the
//! "status + event in one transaction" contract trivial: both writes
//! happen under the same guard. Event seqs are per run, starting at 1.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use qw_domain::{
    CoverageSnapshot, EventId, GenerationAttempt, NewRunEvent, QaSummary, Run, RunEvent, RunId,
    RunStatus, Scenario, ScenarioId, ScenarioStatus, StepResult,
};
use qw_ports::{
    Clock, EventStore, PayloadStore, ReportStore, RunPatch, RunStore, ScenarioStore, StoreError,
    StepResultStore, SystemClock,
};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    runs: HashMap<String, Run>,
    events: HashMap<String, Vec<RunEvent>>,
    scenarios: HashMap<String, Vec<Scenario>>,
    attempts: HashMap<String, Vec<GenerationAttempt>>,
    results: HashMap<String, Vec<StepResult>>,
    payloads: HashMap<String, Vec<u8>>,
    coverage: HashMap<String, CoverageSnapshot>,
    summaries: HashMap<String, QaSummary>,
}

/// In-process store implementing every persistence port
pub struct MemoryStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
        }
    }
}

fn not_found(entity: &'static str, id: &str) -> StoreError {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
}

fn materialize(run_id: &RunId, seq: u64, event: NewRunEvent, now: chrono::DateTime<Utc>) -> RunEvent {
    RunEvent {
        id: EventId::new(),
        run_id: run_id.clone(),
        seq,
        event_type: event.event_type,
        payload: event.payload,
        scenario_id: event.scenario_id,
        step_result_id: event.step_result_id,
        error_message: event.error_message,
        created_at: now,
    }
}

impl RunStore for MemoryStore {
    async fn insert_run(&self, run: Run) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.runs.insert(run.id.as_str().to_string(), run);
        Ok(())
    }

    async fn load_run(&self, run_id: &RunId) -> Result<Run, StoreError> {
        let inner = self.inner.read().await;
        inner
            .runs
            .get(run_id.as_str())
            .cloned()
            .ok_or_else(|| not_found("run", run_id.as_str()))
    }

    async fn transition_run(
        &self,
        run_id: &RunId,
        expected: RunStatus,
        next: RunStatus,
        patch: RunPatch,
        event: Option<NewRunEvent>,
    ) -> Result<(Run, Option<RunEvent>), StoreError> {
        let mut inner = self.inner.write().await;
        let now = self.clock.now();

        let run = inner
            .runs
            .get(run_id.as_str())
            .ok_or_else(|| not_found("run", run_id.as_str()))?;
        if run.status != expected {
            return Err(StoreError::Conflict {
                expected: expected.to_string(),
                actual: run.status.to_string(),
            });
        }

        let appended = match event {
            Some(event) => {
                let events = inner.events.entry(run_id.as_str().to_string()).or_default();
                let seq = events.last().map(|e| e.seq).unwrap_or(0) + 1;
                let record = materialize(run_id, seq, event, now);
                events.push(record.clone());
                Some(record)
            }
            None => None,
        };

        let run = inner
            .runs
            .get_mut(run_id.as_str())
            .ok_or_else(|| not_found("run", run_id.as_str()))?;
        run.status = next;
        if let Some(started_at) = patch.started_at {
            run.started_at = Some(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            run.completed_at = Some(completed_at);
        }
        if let Some(duration_ms) = patch.duration_ms {
            run.duration_ms = Some(duration_ms);
        }
        if let Some(error_message) = patch.error_message {
            run.error_message = Some(error_message);
        }
        if let Some(spec_hash) = patch.spec_hash {
            run.spec_hash = Some(spec_hash);
        }

        Ok((run.clone(), appended))
    }

    async fn status_snapshot(&self, run_id: &RunId) -> Result<(RunStatus, u64), StoreError> {
        let inner = self.inner.read().await;
        let run = inner
            .runs
            .get(run_id.as_str())
            .ok_or_else(|| not_found("run", run_id.as_str()))?;
        let latest = inner
            .events
            .get(run_id.as_str())
            .and_then(|events| events.last())
            .map(|e| e.seq)
            .unwrap_or(0);
        Ok((run.status, latest))
    }
}

impl EventStore for MemoryStore {
    async fn append_event(&self, run_id: &RunId, event: NewRunEvent) -> Result<RunEvent, StoreError> {
        let mut inner = self.inner.write().await;
        let now = self.clock.now();
        if !inner.runs.contains_key(run_id.as_str()) {
            return Err(not_found("run", run_id.as_str()));
        }
        let events = inner.events.entry(run_id.as_str().to_string()).or_default();
        let seq = events.last().map(|e| e.seq).unwrap_or(0) + 1;
        let record = materialize(run_id, seq, event, now);
        events.push(record.clone());
        Ok(record)
    }

    async fn events_for_run(&self, run_id: &RunId) -> Result<Vec<RunEvent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.events.get(run_id.as_str()).cloned().unwrap_or_default())
    }
}

impl ScenarioStore for MemoryStore {
    async fn insert_scenario(&self, scenario: Scenario) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .scenarios
            .entry(scenario.run_id.as_str().to_string())
            .or_default()
            .push(scenario);
        Ok(())
    }

    async fn update_scenario_status(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
        status: ScenarioStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let scenario = inner
            .scenarios
            .get_mut(run_id.as_str())
            .and_then(|list| list.iter_mut().find(|s| &s.id == scenario_id))
            .ok_or_else(|| not_found("scenario", scenario_id.as_str()))?;
        scenario.status = status;
        scenario.version += 1;
        Ok(())
    }

    async fn scenarios_for_run(&self, run_id: &RunId) -> Result<Vec<Scenario>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.scenarios.get(run_id.as_str()).cloned().unwrap_or_default())
    }

    async fn record_attempt(&self, attempt: GenerationAttempt) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let attempts = inner
            .attempts
            .entry(attempt.run_id.as_str().to_string())
            .or_default();
        match attempts.iter_mut().find(|a| a.id == attempt.id) {
            Some(existing) => *existing = attempt,
            None => attempts.push(attempt),
        }
        Ok(())
    }

    async fn attempts_for_run(&self, run_id: &RunId) -> Result<Vec<GenerationAttempt>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.attempts.get(run_id.as_str()).cloned().unwrap_or_default())
    }
}

impl StepResultStore for MemoryStore {
    async fn insert_step_result(&self, result: StepResult) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .results
            .entry(result.run_id.as_str().to_string())
            .or_default()
            .push(result);
        Ok(())
    }

    async fn results_for_scenario(
        &self,
        run_id: &RunId,
        scenario_id: &ScenarioId,
    ) -> Result<Vec<StepResult>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .results
            .get(run_id.as_str())
            .map(|list| {
                list.iter()
                    .filter(|r| &r.scenario_id == scenario_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn results_for_run(&self, run_id: &RunId) -> Result<Vec<StepResult>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.results.get(run_id.as_str()).cloned().unwrap_or_default())
    }
}

impl PayloadStore for MemoryStore {
    async fn save_payload(&self, run_id: &RunId, blob: Vec<u8>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.payloads.insert(run_id.as_str().to_string(), blob);
        Ok(())
    }

    async fn load_payload(&self, run_id: &RunId) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.read().await;
        inner
            .payloads
            .get(run_id.as_str())
            .cloned()
            .ok_or_else(|| not_found("payload", run_id.as_str()))
    }
}

impl ReportStore for MemoryStore {
    async fn save_coverage(&self, run_id: &RunId, coverage: CoverageSnapshot) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.coverage.insert(run_id.as_str().to_string(), coverage);
        Ok(())
    }

    async fn load_coverage(&self, run_id: &RunId) -> Result<CoverageSnapshot, StoreError> {
        let inner = self.inner.read().await;
        inner
            .coverage
            .get(run_id.as_str())
            .cloned()
            .ok_or_else(|| not_found("coverage", run_id.as_str()))
    }

    async fn save_summary(&self, run_id: &RunId, summary: QaSummary) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.summaries.insert(run_id.as_str().to_string(), summary);
        Ok(())
    }

    async fn load_summary(&self, run_id: &RunId) -> Result<QaSummary, StoreError> {
        let inner = self.inner.read().await;
        inner
            .summaries
            .get(run_id.as_str())
            .cloned()
            .ok_or_else(|| not_found("summary", run_id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qw_domain::{RunConfig, RunEventType, RunMode, SpecSource};

    fn test_run() -> Run {
        Run::new(
            "smoke",
            SpecSource::Inline("{}".to_string()),
            "http://api.example.com",
            RunMode::Standard,
            RunConfig::default(),
            "tester",
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn seq_is_strictly_increasing_across_appends_and_transitions() {
        let store = MemoryStore::default();
        let run = test_run();
        let run_id = run.id.clone();
        store.insert_run(run).await.unwrap();

        let e1 = store
            .append_event(&run_id, NewRunEvent::new(RunEventType::Requested))
            .await
            .unwrap();
        let (_, e2) = store
            .transition_run(
                &run_id,
                RunStatus::Requested,
                RunStatus::SpecFetched,
                RunPatch::default(),
                Some(NewRunEvent::new(RunEventType::SpecFetched)),
            )
            .await
            .unwrap();
        let e3 = store
            .append_event(&run_id, NewRunEvent::new(RunEventType::ScenarioCreated))
            .await
            .unwrap();

        assert_eq!(e1.seq, 1);
        assert_eq!(e2.unwrap().seq, 2);
        assert_eq!(e3.seq, 3);

        let (status, latest) = store.status_snapshot(&run_id).await.unwrap();
        assert_eq!(status, RunStatus::SpecFetched);
        assert_eq!(latest, 3);
    }

    #[tokio::test]
    async fn transition_cas_rejects_stale_status_and_leaves_state_intact() {
        let store = MemoryStore::default();
        let run = test_run();
        let run_id = run.id.clone();
        store.insert_run(run).await.unwrap();

        let err = store
            .transition_run(
                &run_id,
                RunStatus::SpecFetched,
                RunStatus::AiSuccess,
                RunPatch::default(),
                Some(NewRunEvent::new(RunEventType::AiSuccess)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let (status, latest) = store.status_snapshot(&run_id).await.unwrap();
        assert_eq!(status, RunStatus::Requested);
        assert_eq!(latest, 0, "failed transition must not append an event");
    }

    #[tokio::test]
    async fn attempts_upsert_by_id() {
        let store = MemoryStore::default();
        let run = test_run();
        let run_id = run.id.clone();
        store.insert_run(run).await.unwrap();

        let mut attempt = GenerationAttempt::new(run_id.clone(), None, 1, Utc::now());
        store.record_attempt(attempt.clone()).await.unwrap();
        attempt.status = qw_domain::AttemptStatus::Passed;
        store.record_attempt(attempt.clone()).await.unwrap();

        let attempts = store.attempts_for_run(&run_id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, qw_domain::AttemptStatus::Passed);
    }
}
