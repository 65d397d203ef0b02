//! The streaming pipeline orchestrator
//!
//! Drives a run from REQUESTED to a terminal state: spec fetch, bounded AI
//! generation fanned out over operations, bounded scenario execution
//! consuming generated scenarios as they stream in, a collector that folds
//! outcomes into coverage, and the final summary.
//!
//! Scenario outcomes execute as soon as they stream off the generation
//! stage, but their success/failure journal records are held by the
//! collector until the generation stage drains, so AI_SUCCESS always
//! precedes every EXECUTION_SUCCESS in seq order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use qw_domain::{
    enumerate_operations, spec_hash, validate_base_url, DomainError, ErrorKind, NewRunEvent,
    Operation, Run, RunEventType, RunId, RunPayload, RunStatus, Scenario, ScenarioSource,
    SpecSource,
};
use qw_ports::{
    AiProvider, Clock, GatewayRequest, HttpGateway, MessageBus, Persistence, RunPatch, StoreError,
};
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::coverage::{build_coverage, build_summary};
use crate::generator::{AiGenerator, GenerationOutcome, GeneratorSettings};
use crate::journal::{JournalError, RunJournal};
use crate::payload::{decode_payload, encode_payload, PayloadError};
use crate::resilience::{
    BulkheadConfig, CircuitBreakerConfig, EnvelopeConfig, RateLimiterConfig, ResilienceEnvelope,
    RetryConfig,
};
use crate::scenario_executor::{ScenarioExecutor, ScenarioRun};
use crate::step_executor::ExecutionPolicy;

/// Timeout for downloading the spec document.
const SPEC_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Orchestrator failures. Most run problems become terminal run states,
/// not errors; these are the ones the embedder must see.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Run {run_id} is {status}, not runnable")]
    NotRunnable { run_id: RunId, status: RunStatus },
}

/// Resilience tuning for the two volatile dependencies. Bulkhead widths
/// come from the run config at pipeline start.
#[derive(Debug, Clone, Copy)]
pub struct ResilienceSettings {
    pub ai_rate_limiter: RateLimiterConfig,
    pub sut_rate_limiter: RateLimiterConfig,
    pub ai_breaker: CircuitBreakerConfig,
    pub sut_breaker: CircuitBreakerConfig,
    pub ai_retry: RetryConfig,
    pub bulkhead_queue_timeout: Duration,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            ai_rate_limiter: RateLimiterConfig {
                period: Duration::from_millis(200),
                burst: 5,
            },
            sut_rate_limiter: RateLimiterConfig {
                period: Duration::from_millis(10),
                burst: 50,
            },
            ai_breaker: CircuitBreakerConfig::default(),
            sut_breaker: CircuitBreakerConfig::default(),
            ai_retry: RetryConfig {
                max_retries: 2,
                base_delay: Duration::from_millis(500),
                factor: 2.0,
                jitter: 0.2,
            },
            bulkhead_queue_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything the pipeline needs, passed in at construction
pub struct RuntimeContext<P, A, H, B> {
    pub store: Arc<P>,
    pub ai: Arc<A>,
    pub gateway: Arc<H>,
    pub bus: Option<Arc<B>>,
    pub clock: Arc<dyn Clock>,
    pub resilience: ResilienceSettings,
}

/// Generation stage outcome broadcast to the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AiStage {
    Pending,
    Success,
    Failed,
    Cancelled,
}

pub struct Orchestrator<P, A, H, B> {
    store: Arc<P>,
    ai: Arc<A>,
    gateway: Arc<H>,
    clock: Arc<dyn Clock>,
    resilience: ResilienceSettings,
    journal: Arc<RunJournal<P, B>>,
    active: Mutex<HashMap<RunId, CancellationToken>>,
}

impl<P, A, H, B> Orchestrator<P, A, H, B>
where
    P: Persistence + Send + Sync,
    A: AiProvider + 'static,
    H: HttpGateway + 'static,
    B: MessageBus + 'static,
{
    pub fn new(context: RuntimeContext<P, A, H, B>) -> Self {
        let journal = Arc::new(RunJournal::new(
            Arc::clone(&context.store),
            context.bus.clone(),
            Arc::clone(&context.clock),
        ));
        Self {
            store: context.store,
            ai: context.ai,
            gateway: context.gateway,
            clock: context.clock,
            resilience: context.resilience,
            journal,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn journal(&self) -> &Arc<RunJournal<P, B>> {
        &self.journal
    }

    /// Persist a freshly created run and journal its REQUESTED event.
    pub async fn submit(&self, run: Run) -> Result<RunId, OrchestratorError> {
        let run_id = run.id.clone();
        self.store.insert_run(run).await?;
        self.journal
            .append(&run_id, NewRunEvent::new(RunEventType::Requested))
            .await?;
        Ok(run_id)
    }

    /// Request cancellation. Idempotent on terminal runs.
    pub async fn cancel(&self, run_id: &RunId) -> Result<RunStatus, OrchestratorError> {
        let token = self.active.lock().await.get(run_id).cloned();
        match token {
            Some(token) => {
                info!(run_id = %run_id, "cancellation requested");
                token.cancel();
                let (status, _) = self.journal.status(run_id).await?;
                Ok(status)
            }
            None => Ok(self.journal.cancel(run_id, "cancelled by request").await?),
        }
    }

    /// Drive a REQUESTED run to a terminal state.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn run(&self, run_id: &RunId) -> Result<RunStatus, OrchestratorError> {
        let run = self.store.load_run(run_id).await?;
        if run.status != RunStatus::Requested {
            return Err(OrchestratorError::NotRunnable {
                run_id: run_id.clone(),
                status: run.status,
            });
        }

        let cancel = CancellationToken::new();
        self.active
            .lock()
            .await
            .insert(run_id.clone(), cancel.clone());

        let outcome = self.drive(run, cancel.clone()).await;

        self.active.lock().await.remove(run_id);

        match outcome {
            Ok(status) => Ok(status),
            Err(e) => {
                error!(run_id = %run_id, error = %e, "pipeline failed");
                let _ = self.fail_run(run_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Replay a completed run's payload against a (possibly new) base URL.
    /// The AI stage is skipped entirely: the new run takes SPEC_FETCHED and
    /// AI_SUCCESS as vacuous transitions with no events.
    #[instrument(skip(self), fields(source = %source_run_id))]
    pub async fn replay(
        &self,
        source_run_id: &RunId,
        base_url_override: Option<String>,
        triggered_by: &str,
    ) -> Result<(RunId, RunStatus), OrchestratorError> {
        let source = self.store.load_run(source_run_id).await?;
        let payload = decode_payload(&self.store.load_payload(source_run_id).await?)?;

        let base_url = base_url_override.unwrap_or_else(|| payload.base_url.clone());
        validate_base_url(&base_url)?;

        let mut run = Run::new(
            format!("{} (replay)", source.name),
            source.spec_source.clone(),
            base_url,
            source.mode,
            payload.config.clone(),
            triggered_by,
            self.clock.now(),
        )?;
        run.description = source.description.clone();
        run.requirement_text = source.requirement_text.clone();
        let run_id = run.id.clone();

        self.store.insert_run(run.clone()).await?;
        self.journal
            .append(
                &run_id,
                NewRunEvent::new(RunEventType::Requested)
                    .with_payload(json!({ "replayOf": source_run_id.as_str() })),
            )
            .await?;

        let cancel = CancellationToken::new();
        self.active
            .lock()
            .await
            .insert(run_id.clone(), cancel.clone());

        let outcome = self
            .drive_replay(run, payload, cancel.clone())
            .await;

        self.active.lock().await.remove(&run_id);

        match outcome {
            Ok(status) => Ok((run_id, status)),
            Err(e) => {
                error!(run_id = %run_id, error = %e, "replay pipeline failed");
                let _ = self.fail_run(&run_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Stage composition
    // ========================================================================

    async fn drive(&self, run: Run, cancel: CancellationToken) -> Result<RunStatus, OrchestratorError> {
        // --- SpecFetch (serial) ---
        let document = match self.fetch_spec(&run).await {
            Ok(document) => document,
            Err((kind, message)) => {
                warn!(run_id = %run.id, kind = %kind, "spec fetch failed");
                self.journal
                    .transition(
                        &run.id,
                        RunStatus::FailedSpecFetch,
                        RunPatch {
                            completed_at: Some(self.clock.now()),
                            error_message: Some(message.clone()),
                            ..RunPatch::default()
                        },
                        Some(
                            NewRunEvent::new(RunEventType::SpecFetchFailed)
                                .with_payload(json!({ "errorKind": kind }))
                                .with_error(message),
                        ),
                    )
                    .await?;
                return Ok(RunStatus::FailedSpecFetch);
            }
        };

        let hash = spec_hash(&document);
        let operations = enumerate_operations(&document);
        if operations.is_empty() {
            self.journal
                .transition(
                    &run.id,
                    RunStatus::FailedSpecFetch,
                    RunPatch {
                        completed_at: Some(self.clock.now()),
                        error_message: Some("spec contains no operations".to_string()),
                        ..RunPatch::default()
                    },
                    Some(
                        NewRunEvent::new(RunEventType::SpecFetchFailed)
                            .with_payload(json!({ "errorKind": ErrorKind::SpecInvalid }))
                            .with_error("spec contains no operations"),
                    ),
                )
                .await?;
            return Ok(RunStatus::FailedSpecFetch);
        }

        let run = self
            .journal
            .transition(
                &run.id,
                RunStatus::SpecFetched,
                RunPatch {
                    started_at: Some(self.clock.now()),
                    spec_hash: Some(hash.clone()),
                    ..RunPatch::default()
                },
                Some(NewRunEvent::new(RunEventType::SpecFetched).with_payload(json!({
                    "specHash": hash,
                    "operations": operations.len(),
                }))),
            )
            .await?;

        info!(
            run_id = %run.id,
            operations = operations.len(),
            "spec fetched, starting generation"
        );

        // --- Channels and stage wiring ---
        let run = Arc::new(run);
        let operations = Arc::new(operations);
        let budget = run.config.max_scenarios as usize;
        let ai_workers = run.config.ai_concurrency.max(1) as usize;

        let (ops_tx, ops_rx) = mpsc::channel::<Operation>(budget.max(1));
        let ops_rx = Arc::new(Mutex::new(ops_rx));
        let (scn_tx, scn_rx) = mpsc::channel::<Scenario>((ai_workers * 2).max(1));
        let (ai_tx, ai_rx) = watch::channel(AiStage::Pending);
        let fatal: Arc<OnceLock<String>> = Arc::new(OnceLock::new());

        // Feeder: up to maxScenarios operation descriptors, then close.
        {
            let ops = Arc::clone(&operations);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for op in ops.iter().take(budget).cloned() {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        sent = ops_tx.send(op) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        // AI stage: N generation workers.
        let ai_envelope = Arc::new(ResilienceEnvelope::new(EnvelopeConfig {
            bulkhead: BulkheadConfig {
                max_concurrent: ai_workers,
                queue_timeout: self.resilience.bulkhead_queue_timeout,
            },
            rate_limiter: self.resilience.ai_rate_limiter,
            breaker: self.resilience.ai_breaker,
            retry: self.resilience.ai_retry,
        }));
        let generator = Arc::new(AiGenerator::new(
            Arc::clone(&self.ai),
            Arc::clone(&self.store),
            ai_envelope,
            Arc::clone(&self.clock),
            GeneratorSettings::from_config(&run.config),
        ));

        let attempted = Arc::new(AtomicU32::new(0));
        let produced = Arc::new(AtomicU32::new(0));
        let failures = Arc::new(AtomicU32::new(0));

        let mut ai_set = JoinSet::new();
        for _ in 0..ai_workers {
            ai_set.spawn(ai_worker(
                Arc::clone(&run),
                Arc::clone(&operations),
                Arc::clone(&generator),
                Arc::clone(&self.store),
                Arc::clone(&self.journal),
                Arc::clone(&ops_rx),
                scn_tx.clone(),
                cancel.clone(),
                Arc::clone(&attempted),
                Arc::clone(&produced),
                Arc::clone(&failures),
                Arc::clone(&fatal),
            ));
        }
        drop(scn_tx);

        // AI stage closer: decides the stage outcome, persists the payload,
        // and performs the AI_SUCCESS / FAILED_GENERATION transition.
        let ai_stage = {
            let run = Arc::clone(&run);
            let operations = Arc::clone(&operations);
            let store = Arc::clone(&self.store);
            let journal = Arc::clone(&self.journal);
            let cancel = cancel.clone();
            let fatal = Arc::clone(&fatal);
            let attempted = Arc::clone(&attempted);
            let produced = Arc::clone(&produced);
            let failures = Arc::clone(&failures);
            tokio::spawn(async move {
                while ai_set.join_next().await.is_some() {}

                if cancel.is_cancelled() {
                    let _ = ai_tx.send(AiStage::Cancelled);
                    return;
                }

                let attempted = attempted.load(Ordering::SeqCst);
                let produced = produced.load(Ordering::SeqCst);
                let failures = failures.load(Ordering::SeqCst);

                if attempted > 0 && produced == 0 && failures == attempted {
                    let outcome = journal
                        .transition(
                            &run.id,
                            RunStatus::FailedGeneration,
                            RunPatch {
                                error_message: Some("all scenario generations failed".to_string()),
                                ..RunPatch::default()
                            },
                            Some(
                                NewRunEvent::new(RunEventType::AiFailed)
                                    .with_error("all scenario generations failed"),
                            ),
                        )
                        .await;
                    if let Err(e) = outcome {
                        let _ = fatal.set(e.to_string());
                        cancel.cancel();
                    }
                    let _ = ai_tx.send(AiStage::Failed);
                    return;
                }

                let result = finish_generation(&run, &operations, store, journal).await;
                match result {
                    Ok(()) => {
                        let _ = ai_tx.send(AiStage::Success);
                    }
                    Err(e) => {
                        let _ = fatal.set(e.to_string());
                        cancel.cancel();
                        let _ = ai_tx.send(AiStage::Cancelled);
                    }
                }
            })
        };

        let status = self
            .execute_and_finalize(Arc::clone(&run), operations, scn_rx, ai_rx, cancel, fatal)
            .await;
        let _ = ai_stage.await;
        status
    }

    async fn drive_replay(
        &self,
        run: Run,
        payload: RunPayload,
        cancel: CancellationToken,
    ) -> Result<RunStatus, OrchestratorError> {
        // Vacuous transitions: the stored payload stands in for spec fetch
        // and generation, and no events are journaled for them.
        self.journal
            .transition(
                &run.id,
                RunStatus::SpecFetched,
                RunPatch {
                    started_at: Some(self.clock.now()),
                    spec_hash: Some(payload.spec_hash.clone()),
                    ..RunPatch::default()
                },
                None,
            )
            .await?;
        self.journal
            .transition(&run.id, RunStatus::AiSuccess, RunPatch::default(), None)
            .await?;
        self.journal
            .transition(&run.id, RunStatus::ExecutionInProgress, RunPatch::default(), None)
            .await?;

        let run = Arc::new(self.store.load_run(&run.id).await?);
        let operations = Arc::new(payload.operations.clone());

        let (scn_tx, scn_rx) = mpsc::channel::<Scenario>(payload.scenarios.len().max(1));
        let (ai_tx, ai_rx) = watch::channel(AiStage::Success);
        let fatal: Arc<OnceLock<String>> = Arc::new(OnceLock::new());

        // Preloaded feed: same scenario ids and step order as the payload.
        {
            let store = Arc::clone(&self.store);
            let journal = Arc::clone(&self.journal);
            let run = Arc::clone(&run);
            let cancel = cancel.clone();
            let fatal = Arc::clone(&fatal);
            let scenarios = payload.scenarios;
            tokio::spawn(async move {
                for mut scenario in scenarios {
                    if cancel.is_cancelled() {
                        break;
                    }
                    scenario.run_id = run.id.clone();
                    scenario.source = ScenarioSource::Replayed;
                    let scenario_id = scenario.id.clone();
                    let persisted = async {
                        store.insert_scenario(scenario.clone()).await?;
                        journal
                            .append(
                                &run.id,
                                NewRunEvent::new(RunEventType::ScenarioCreated)
                                    .with_scenario(scenario_id.clone())
                                    .with_payload(json!({ "source": "REPLAYED" })),
                            )
                            .await
                            .map_err(store_or_domain)?;
                        Ok::<(), StoreError>(())
                    }
                    .await;
                    if let Err(e) = persisted {
                        let _ = fatal.set(e.to_string());
                        cancel.cancel();
                        break;
                    }
                    if scn_tx.send(scenario).await.is_err() {
                        break;
                    }
                }
                let _ = ai_tx;
            });
        }

        self.execute_and_finalize(run, operations, scn_rx, ai_rx, cancel, fatal)
            .await
    }

    /// Exec stage + collector + QA evaluation + terminal transition.
    async fn execute_and_finalize(
        &self,
        run: Arc<Run>,
        operations: Arc<Vec<Operation>>,
        scn_rx: mpsc::Receiver<Scenario>,
        mut ai_rx: watch::Receiver<AiStage>,
        cancel: CancellationToken,
        fatal: Arc<OnceLock<String>>,
    ) -> Result<RunStatus, OrchestratorError> {
        let exec_workers = run.config.effective_exec_concurrency() as usize;
        let scn_rx = Arc::new(Mutex::new(scn_rx));
        let (res_tx, mut res_rx) = mpsc::channel::<ScenarioRun>(4 * exec_workers);

        let sut_envelope = Arc::new(ResilienceEnvelope::new(EnvelopeConfig {
            bulkhead: BulkheadConfig {
                max_concurrent: exec_workers,
                queue_timeout: self.resilience.bulkhead_queue_timeout,
            },
            rate_limiter: self.resilience.sut_rate_limiter,
            breaker: self.resilience.sut_breaker,
            retry: RetryConfig {
                max_retries: run.config.step_max_retries,
                base_delay: Duration::from_millis(100),
                factor: 2.0,
                jitter: 0.2,
            },
        }));
        let policy = ExecutionPolicy::from_config(&run.config);

        let mut exec_set = JoinSet::new();
        for _ in 0..exec_workers {
            exec_set.spawn(exec_worker(
                Arc::clone(&run),
                Arc::clone(&self.store),
                Arc::clone(&self.journal),
                Arc::clone(&self.gateway),
                Arc::clone(&sut_envelope),
                Arc::clone(&self.clock),
                policy.clone(),
                Arc::clone(&scn_rx),
                res_tx.clone(),
                cancel.clone(),
                Arc::clone(&fatal),
            ));
        }
        drop(res_tx);
        let exec_stage = tokio::spawn(async move {
            while exec_set.join_next().await.is_some() {}
        });

        // Collector: outcome events are journaled only once the generation
        // stage has reported success.
        let mut ai_stage = *ai_rx.borrow();
        let mut pending: Vec<ScenarioRun> = Vec::new();
        let mut outcomes: Vec<ScenarioRun> = Vec::new();

        loop {
            tokio::select! {
                changed = ai_rx.changed(), if ai_stage == AiStage::Pending => {
                    ai_stage = if changed.is_ok() {
                        *ai_rx.borrow()
                    } else {
                        AiStage::Cancelled
                    };
                    if ai_stage == AiStage::Success {
                        for scenario_run in pending.drain(..) {
                            self.journal_outcome(&run.id, &scenario_run).await?;
                            outcomes.push(scenario_run);
                        }
                    }
                }
                received = res_rx.recv() => match received {
                    Some(scenario_run) => {
                        if ai_stage == AiStage::Success {
                            self.journal_outcome(&run.id, &scenario_run).await?;
                            outcomes.push(scenario_run);
                        } else {
                            pending.push(scenario_run);
                        }
                    }
                    None => break,
                }
            }
        }

        // The channel closed; wait out the generation verdict if it has not
        // landed yet, then flush whatever was held back.
        while ai_stage == AiStage::Pending {
            if ai_rx.changed().await.is_err() {
                ai_stage = AiStage::Cancelled;
                break;
            }
            ai_stage = *ai_rx.borrow();
        }
        for scenario_run in pending.drain(..) {
            self.journal_outcome(&run.id, &scenario_run).await?;
            outcomes.push(scenario_run);
        }

        let _ = exec_stage.await;

        // Terminal handling, in priority order: internal fault, explicit
        // cancellation, generation failure, then the happy path.
        if let Some(reason) = fatal.get() {
            return Ok(self.fail_run(&run.id, reason).await?);
        }
        if cancel.is_cancelled() {
            return Ok(self.journal.cancel(&run.id, "run cancelled").await?);
        }
        if ai_stage == AiStage::Failed {
            let (status, _) = self.journal.status(&run.id).await?;
            return Ok(status);
        }

        self.finalize(&run, &operations, outcomes).await
    }

    async fn finalize(
        &self,
        run: &Run,
        operations: &[Operation],
        outcomes: Vec<ScenarioRun>,
    ) -> Result<RunStatus, OrchestratorError> {
        self.journal
            .transition(&run.id, RunStatus::ExecutionComplete, RunPatch::default(), None)
            .await?;
        self.journal
            .transition(
                &run.id,
                RunStatus::QaEvalInProgress,
                RunPatch::default(),
                Some(NewRunEvent::new(RunEventType::QaEvalStarted)),
            )
            .await?;

        let coverage = build_coverage(operations, &outcomes, self.clock.now());
        self.store.save_coverage(&run.id, coverage.clone()).await?;

        let ai_envelope = Arc::new(ResilienceEnvelope::new(EnvelopeConfig {
            bulkhead: BulkheadConfig::default(),
            rate_limiter: self.resilience.ai_rate_limiter,
            breaker: self.resilience.ai_breaker,
            retry: RetryConfig {
                max_retries: 0,
                ..self.resilience.ai_retry
            },
        }));
        let summary = build_summary(run, &coverage, &outcomes, Some((&self.ai, &ai_envelope))).await;
        self.store.save_summary(&run.id, summary.clone()).await?;

        self.journal
            .transition(
                &run.id,
                RunStatus::QaEvalDone,
                RunPatch::default(),
                Some(NewRunEvent::new(RunEventType::QaEvalDone).with_payload(json!({
                    "verdict": summary.overall_verdict,
                    "qualityScore": summary.quality_score,
                }))),
            )
            .await?;

        let loaded = self.store.load_run(&run.id).await?;
        let completed_at = self.clock.now();
        let duration_ms = loaded
            .started_at
            .map(|started| (completed_at - started).num_milliseconds().max(0) as u64);
        self.journal
            .transition(
                &run.id,
                RunStatus::Complete,
                RunPatch {
                    completed_at: Some(completed_at),
                    duration_ms,
                    ..RunPatch::default()
                },
                Some(NewRunEvent::new(RunEventType::Complete).with_payload(json!({
                    "verdict": summary.overall_verdict,
                }))),
            )
            .await?;

        info!(
            run_id = %run.id,
            verdict = ?summary.overall_verdict,
            quality_score = summary.quality_score,
            "run complete"
        );
        Ok(RunStatus::Complete)
    }

    async fn journal_outcome(
        &self,
        run_id: &RunId,
        scenario_run: &ScenarioRun,
    ) -> Result<(), JournalError> {
        let event_type = if scenario_run.verdict.is_passed() {
            RunEventType::ExecutionSuccess
        } else {
            RunEventType::ExecutionFailed
        };
        self.journal
            .append(
                run_id,
                NewRunEvent::new(event_type)
                    .with_scenario(scenario_run.scenario.id.clone())
                    .with_payload(json!({
                        "verdict": scenario_run.verdict,
                        "steps": scenario_run.results.len(),
                    })),
            )
            .await?;
        Ok(())
    }

    /// Route an internal failure to the legal FAILED_* state for wherever
    /// the run currently is.
    async fn fail_run(&self, run_id: &RunId, reason: &str) -> Result<RunStatus, JournalError> {
        let (current, _) = self.journal.status(run_id).await?;
        if current.is_terminal() {
            return Ok(current);
        }
        let target = match current {
            RunStatus::Requested => RunStatus::FailedSpecFetch,
            RunStatus::SpecFetched => RunStatus::FailedGeneration,
            RunStatus::AiSuccess | RunStatus::ExecutionInProgress => RunStatus::FailedExecution,
            // Past the execution stage there is no failure edge left;
            // record what broke, then take the cancellation exit.
            RunStatus::QaEvalInProgress | RunStatus::QaEvalDone => {
                let _ = self
                    .journal
                    .append(
                        run_id,
                        NewRunEvent::new(RunEventType::QaEvalFailed).with_error(reason),
                    )
                    .await;
                return self.journal.cancel(run_id, reason).await;
            }
            _ => return self.journal.cancel(run_id, reason).await,
        };
        self.journal
            .transition(
                run_id,
                target,
                RunPatch {
                    completed_at: Some(self.clock.now()),
                    error_message: Some(reason.to_string()),
                    ..RunPatch::default()
                },
                Some(NewRunEvent::new(RunEventType::Failed).with_error(reason)),
            )
            .await?;
        Ok(target)
    }

    async fn fetch_spec(&self, run: &Run) -> Result<serde_json::Value, (ErrorKind, String)> {
        match &run.spec_source {
            SpecSource::Inline(text) => serde_json::from_str(text)
                .map_err(|e| (ErrorKind::SpecFetch, format!("inline spec is not valid JSON: {e}"))),
            SpecSource::Url(url) => {
                let request = GatewayRequest {
                    method: qw_domain::HttpMethod::Get,
                    url: url.clone(),
                    headers: vec![("Accept".to_string(), "application/json".to_string())],
                    body: None,
                    timeout: SPEC_FETCH_TIMEOUT,
                };
                let response = self
                    .gateway
                    .send(request)
                    .await
                    .map_err(|e| (ErrorKind::SpecFetch, e.to_string()))?;
                if !(200..300).contains(&response.status) {
                    return Err((
                        ErrorKind::SpecFetch,
                        format!("spec endpoint answered {}", response.status),
                    ));
                }
                serde_json::from_slice(&response.body)
                    .map_err(|e| (ErrorKind::SpecFetch, format!("spec is not valid JSON: {e}")))
            }
        }
    }
}

/// Persist the canonical payload and take the AI_SUCCESS transition.
async fn finish_generation<P, B>(
    run: &Run,
    operations: &[Operation],
    store: Arc<P>,
    journal: Arc<RunJournal<P, B>>,
) -> Result<(), OrchestratorError>
where
    P: Persistence + Send + Sync,
    B: MessageBus + 'static,
{
    let scenarios: Vec<Scenario> = store
        .scenarios_for_run(&run.id)
        .await?
        .into_iter()
        .filter(|s| s.status == qw_domain::ScenarioStatus::Ready)
        .collect();

    let payload = RunPayload {
        run_id: run.id.clone(),
        spec_hash: run.spec_hash.clone().unwrap_or_default(),
        base_url: run.base_url.clone(),
        env: run.config.environment.clone(),
        config: run.config.clone(),
        operations: operations.to_vec(),
        scenarios,
    };
    let count = payload.scenarios.len();
    store.save_payload(&run.id, encode_payload(&payload)?).await?;

    journal
        .transition(
            &run.id,
            RunStatus::AiSuccess,
            RunPatch::default(),
            Some(NewRunEvent::new(RunEventType::AiSuccess).with_payload(json!({
                "scenarios": count,
            }))),
        )
        .await?;
    journal
        .transition(&run.id, RunStatus::ExecutionInProgress, RunPatch::default(), None)
        .await?;
    Ok(())
}

fn store_or_domain(e: JournalError) -> StoreError {
    match e {
        JournalError::Store(e) => e,
        JournalError::Domain(e) => StoreError::Serialization {
            message: e.to_string(),
        },
    }
}

// ============================================================================
// Workers
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn ai_worker<P, A, B>(
    run: Arc<Run>,
    operations: Arc<Vec<Operation>>,
    generator: Arc<AiGenerator<A, P>>,
    store: Arc<P>,
    journal: Arc<RunJournal<P, B>>,
    ops_rx: Arc<Mutex<mpsc::Receiver<Operation>>>,
    scn_tx: mpsc::Sender<Scenario>,
    cancel: CancellationToken,
    attempted: Arc<AtomicU32>,
    produced: Arc<AtomicU32>,
    failures: Arc<AtomicU32>,
    fatal: Arc<OnceLock<String>>,
) where
    P: Persistence + Send + Sync,
    A: AiProvider + 'static,
    B: MessageBus + 'static,
{
    loop {
        let operation = tokio::select! {
            () = cancel.cancelled() => None,
            op = async { ops_rx.lock().await.recv().await } => op,
        };
        let Some(operation) = operation else { break };
        attempted.fetch_add(1, Ordering::SeqCst);

        let outcome = match generator
            .generate_for_operation(&run, &operations, &operation)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = fatal.set(e.to_string());
                cancel.cancel();
                break;
            }
        };

        let step = handle_generation_outcome(
            &run,
            &operation,
            outcome,
            &store,
            &journal,
            &scn_tx,
            &cancel,
            &produced,
            &failures,
        )
        .await;
        if let Err(e) = step {
            let _ = fatal.set(e.to_string());
            cancel.cancel();
            break;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_generation_outcome<P, B>(
    run: &Run,
    operation: &Operation,
    outcome: GenerationOutcome,
    store: &Arc<P>,
    journal: &Arc<RunJournal<P, B>>,
    scn_tx: &mpsc::Sender<Scenario>,
    cancel: &CancellationToken,
    produced: &AtomicU32,
    failures: &AtomicU32,
) -> Result<(), StoreError>
where
    P: Persistence + Send + Sync,
    B: MessageBus + 'static,
{
    match outcome {
        GenerationOutcome::Verified(scenarios) => {
            for scenario in scenarios {
                if produced.fetch_add(1, Ordering::SeqCst) >= run.config.max_scenarios {
                    produced.fetch_sub(1, Ordering::SeqCst);
                    debug!(run_id = %run.id, "scenario budget reached; dropping surplus generation");
                    break;
                }
                emit_scenario(run, scenario, store, journal, scn_tx, cancel).await?;
            }
        }
        GenerationOutcome::Fallback(scenario) => {
            produced.fetch_add(1, Ordering::SeqCst);
            emit_scenario(run, scenario, store, journal, scn_tx, cancel).await?;
        }
        GenerationOutcome::Invalid { scenarios, violations } => {
            failures.fetch_add(1, Ordering::SeqCst);
            for scenario in scenarios {
                store.insert_scenario(scenario).await?;
            }
            let messages: Vec<&str> = violations.iter().map(|v| v.message.as_str()).collect();
            journal
                .append(
                    &run.id,
                    NewRunEvent::new(RunEventType::ScenarioGenerationFailed)
                        .with_payload(json!({
                            "operation": operation.key(),
                            "violations": messages,
                        }))
                        .with_error("generation output failed verification"),
                )
                .await
                .map_err(store_or_domain)?;
        }
        GenerationOutcome::ProviderFailed { kind, message } => {
            failures.fetch_add(1, Ordering::SeqCst);
            journal
                .append(
                    &run.id,
                    NewRunEvent::new(RunEventType::ScenarioGenerationFailed)
                        .with_payload(json!({
                            "operation": operation.key(),
                            "errorKind": kind,
                        }))
                        .with_error(message),
                )
                .await
                .map_err(store_or_domain)?;
        }
    }
    Ok(())
}

async fn emit_scenario<P, B>(
    run: &Run,
    scenario: Scenario,
    store: &Arc<P>,
    journal: &Arc<RunJournal<P, B>>,
    scn_tx: &mpsc::Sender<Scenario>,
    cancel: &CancellationToken,
) -> Result<(), StoreError>
where
    P: Persistence + Send + Sync,
    B: MessageBus + 'static,
{
    store.insert_scenario(scenario.clone()).await?;
    journal
        .append(
            &run.id,
            NewRunEvent::new(RunEventType::ScenarioCreated)
                .with_scenario(scenario.id.clone())
                .with_payload(json!({
                    "name": scenario.name.clone(),
                    "operationId": scenario.operation_id.clone(),
                    "source": scenario.source,
                })),
        )
        .await
        .map_err(store_or_domain)?;

    tokio::select! {
        () = cancel.cancelled() => {}
        sent = scn_tx.send(scenario) => {
            if sent.is_err() {
                debug!(run_id = %run.id, "execution stage gone; dropping scenario");
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn exec_worker<P, H, B>(
    run: Arc<Run>,
    store: Arc<P>,
    journal: Arc<RunJournal<P, B>>,
    gateway: Arc<H>,
    envelope: Arc<ResilienceEnvelope>,
    clock: Arc<dyn Clock>,
    policy: ExecutionPolicy,
    scn_rx: Arc<Mutex<mpsc::Receiver<Scenario>>>,
    res_tx: mpsc::Sender<ScenarioRun>,
    cancel: CancellationToken,
    fatal: Arc<OnceLock<String>>,
) where
    P: Persistence + Send + Sync,
    H: HttpGateway + 'static,
    B: MessageBus + 'static,
{
    let executor = ScenarioExecutor::new(
        gateway,
        envelope,
        store,
        policy,
        clock,
        run.base_url.clone(),
        run.config.environment.clone(),
    );

    loop {
        let scenario = tokio::select! {
            () = cancel.cancelled() => None,
            scenario = async { scn_rx.lock().await.recv().await } => scenario,
        };
        let Some(scenario) = scenario else { break };

        // Cancelled scenarios never start: no EXECUTION_STARTED event.
        if cancel.is_cancelled() {
            break;
        }

        let started = journal
            .append(
                &run.id,
                NewRunEvent::new(RunEventType::ExecutionStarted)
                    .with_scenario(scenario.id.clone()),
            )
            .await;
        if let Err(e) = started {
            let _ = fatal.set(e.to_string());
            cancel.cancel();
            break;
        }

        match executor.execute(scenario, &cancel).await {
            Ok(scenario_run) => {
                if res_tx.send(scenario_run).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = fatal.set(e.to_string());
                cancel.cancel();
                break;
            }
        }
    }
}
