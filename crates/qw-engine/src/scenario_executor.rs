//! Scenario execution: ordered steps sharing one context
//!
//! Steps run in index order against a fresh context seeded with the run
//! environment. Extracted values merge into the context between steps.
//! When stop-on-first-failure is set, a failed or errored step turns the
//! rest of the scenario into SKIPPED results.

use std::collections::BTreeMap;
use std::sync::Arc;

use qw_domain::{Scenario, ScenarioVerdict, StepResult, StepStatus};
use qw_ports::{Clock, HttpGateway, StepResultStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::context::ExecutionContext;
use crate::step_executor::{ExecutionPolicy, StepExecutor};

/// A completed scenario with its ordered step results
#[derive(Debug, Clone)]
pub struct ScenarioRun {
    pub scenario: Scenario,
    pub results: Vec<StepResult>,
    pub verdict: ScenarioVerdict,
}

/// Runs one scenario end to end, persisting each step result as it lands
pub struct ScenarioExecutor<H, S> {
    gateway: Arc<H>,
    envelope: Arc<crate::resilience::ResilienceEnvelope>,
    results: Arc<S>,
    policy: ExecutionPolicy,
    clock: Arc<dyn Clock>,
    base_url: String,
    environment: BTreeMap<String, String>,
}

impl<H: HttpGateway, S: StepResultStore> ScenarioExecutor<H, S> {
    pub fn new(
        gateway: Arc<H>,
        envelope: Arc<crate::resilience::ResilienceEnvelope>,
        results: Arc<S>,
        policy: ExecutionPolicy,
        clock: Arc<dyn Clock>,
        base_url: String,
        environment: BTreeMap<String, String>,
    ) -> Self {
        Self {
            gateway,
            envelope,
            results,
            policy,
            clock,
            base_url,
            environment,
        }
    }

    #[instrument(skip_all, fields(scenario_id = %scenario.id, scenario = %scenario.name))]
    pub async fn execute(
        &self,
        scenario: Scenario,
        cancel: &CancellationToken,
    ) -> Result<ScenarioRun, qw_ports::StoreError> {
        let mut context = ExecutionContext::new(self.environment.clone());
        let steps = StepExecutor::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.envelope),
            self.policy.clone(),
            Arc::clone(&self.clock),
            self.base_url.clone(),
            scenario.run_id.clone(),
            scenario.id.clone(),
        );

        let mut results: Vec<StepResult> = Vec::with_capacity(scenario.steps.len());
        let mut halted = false;

        for step in &scenario.steps {
            if halted {
                let result = steps.skipped(step, "previous step failed");
                self.results.insert_step_result(result.clone()).await?;
                results.push(result);
                continue;
            }

            // A reference to a variable an earlier step declared but failed
            // to extract is reported as a missing extraction, without
            // performing the HTTP call.
            let result = match missing_extraction(&scenario, step, &context) {
                Some(variable) => steps.failed(
                    step,
                    self.clock.now(),
                    std::time::Instant::now(),
                    qw_domain::ErrorKind::ExtractionMissing,
                    format!("variable '{variable}' was declared by an earlier step but never extracted"),
                ),
                None => steps.execute(step, &context, cancel).await,
            };

            context.merge(&result.extracted);
            debug!(
                step_index = step.index,
                status = ?result.status,
                duration_ms = result.duration_ms,
                "step finished"
            );

            let failed = matches!(result.status, StepStatus::Failed | StepStatus::Error);
            self.results.insert_step_result(result.clone()).await?;
            results.push(result);

            if failed && self.policy.stop_on_first_failure {
                halted = true;
            }
        }

        let verdict = ScenarioVerdict::from_steps(results.iter().map(|r| &r.status));
        Ok(ScenarioRun {
            scenario,
            results,
            verdict,
        })
    }
}

/// Find a placeholder the step needs that an earlier step declared as an
/// extraction but did not supply.
fn missing_extraction(scenario: &Scenario, step: &qw_domain::Step, context: &ExecutionContext) -> Option<String> {
    let declared_earlier = scenario.variables_before(step.index);
    let mut referenced = qw_domain::contract::find_placeholders(&step.endpoint);
    for (name, value) in &step.headers {
        referenced.extend(qw_domain::contract::find_placeholders(name));
        referenced.extend(qw_domain::contract::find_placeholders(value));
    }
    if let Some(body) = &step.body {
        referenced.extend(qw_domain::contract::find_placeholders(body));
    }

    referenced
        .into_iter()
        .find(|name| !context.has(name) && declared_earlier.contains(&name.as_str()))
}
