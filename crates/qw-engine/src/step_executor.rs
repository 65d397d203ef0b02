//! Step execution: one HTTP action with resolution, safety checks,
//! retries, extraction, and assertion evaluation

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use qw_domain::{
    ErrorKind, Locator, RunConfig, RunId, ScenarioId, Step, StepResult, StepResultId, StepStatus,
};
use qw_ports::{Clock, GatewayRequest, HttpGateway, HttpGatewayError};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::{Host, Url};

use crate::context::ExecutionContext;
use crate::evaluator::{self, evaluate, ObservedResponse};
use crate::resilience::{ResilienceEnvelope, ResilienceError};

/// Per-run execution policy derived from the run config
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub step_timeout: Duration,
    pub max_retries: u32,
    pub stop_on_first_failure: bool,
    pub allow_internal: bool,
    /// Bytes of response body retained on a result; the digest always
    /// covers the full body
    pub body_capture_limit: usize,
}

impl ExecutionPolicy {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            step_timeout: Duration::from_millis(config.step_timeout_ms),
            max_retries: config.step_max_retries,
            stop_on_first_failure: config.stop_on_first_failure,
            allow_internal: config.allow_internal,
            body_capture_limit: 64 * 1024,
        }
    }
}

/// Executes the steps of one scenario against the system under test
pub struct StepExecutor<H> {
    gateway: Arc<H>,
    envelope: Arc<ResilienceEnvelope>,
    policy: ExecutionPolicy,
    clock: Arc<dyn Clock>,
    base_url: String,
    run_id: RunId,
    scenario_id: ScenarioId,
}

impl<H: HttpGateway> StepExecutor<H> {
    pub fn new(
        gateway: Arc<H>,
        envelope: Arc<ResilienceEnvelope>,
        policy: ExecutionPolicy,
        clock: Arc<dyn Clock>,
        base_url: String,
        run_id: RunId,
        scenario_id: ScenarioId,
    ) -> Self {
        Self {
            gateway,
            envelope,
            policy,
            clock,
            base_url,
            run_id,
            scenario_id,
        }
    }

    /// Execute one step. Never panics and never propagates errors: every
    /// outcome becomes a `StepResult`.
    pub async fn execute(
        &self,
        step: &Step,
        context: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> StepResult {
        let started_at = self.clock.now();
        let timer = Instant::now();

        // 1. Resolve endpoint, headers, and body against the context.
        let endpoint = context.resolve(&step.endpoint);
        let mut unresolved = endpoint.unresolved.clone();
        let mut headers = Vec::with_capacity(step.headers.len());
        for (name, value) in &step.headers {
            let resolved = context.resolve(value);
            unresolved.extend(resolved.unresolved);
            headers.push((name.clone(), resolved.text));
        }
        let body = step.body.as_ref().map(|b| {
            let resolved = context.resolve(b);
            unresolved.extend(resolved.unresolved.clone());
            resolved.text
        });

        if !unresolved.is_empty() {
            let mut seen = Vec::new();
            unresolved.retain(|name| {
                let fresh = !seen.contains(name);
                seen.push(name.clone());
                fresh
            });
            return self.failed(
                step,
                started_at,
                timer,
                ErrorKind::PlaceholderUnresolved,
                format!("unresolved placeholders: {}", unresolved.join(", ")),
            );
        }

        // 2. Build the target URL.
        let target = build_target_url(&self.base_url, &endpoint.text);

        // 3. URL safety.
        match enforce_url_policy(&target, self.policy.allow_internal).await {
            Ok(()) => {}
            Err(UrlPolicyError::Forbidden { host }) => {
                return self.failed(
                    step,
                    started_at,
                    timer,
                    ErrorKind::SsrfBlocked,
                    format!("target host '{host}' is forbidden by policy"),
                );
            }
            Err(UrlPolicyError::Invalid { reason }) => {
                return self.errored(
                    step,
                    started_at,
                    timer,
                    ErrorKind::Network,
                    format!("invalid target URL: {reason}"),
                );
            }
            Err(UrlPolicyError::Resolution { reason }) => {
                return self.errored(
                    step,
                    started_at,
                    timer,
                    ErrorKind::Network,
                    format!("DNS resolution failed: {reason}"),
                );
            }
        }

        // 4-6. Send, retrying transport-level failures. A non-2xx response
        // is not a transport failure; it goes to the evaluator.
        let request = GatewayRequest {
            method: step.method,
            url: target.clone(),
            headers,
            body,
            timeout: self.policy.step_timeout,
        };

        let send = self.envelope.call(HttpGatewayError::is_transport, || {
            let request = request.clone();
            let gateway = Arc::clone(&self.gateway);
            async move { gateway.send(request).await }
        });

        // Cancellation grace: an in-flight call gets one step timeout to
        // finish after the signal trips.
        let grace = self.policy.step_timeout;
        let response = tokio::select! {
            outcome = send => outcome,
            () = async {
                cancel.cancelled().await;
                tokio::time::sleep(grace).await;
            } => {
                return self.errored(
                    step,
                    started_at,
                    timer,
                    ErrorKind::Cancelled,
                    "cancelled while in flight",
                );
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(ResilienceError::Overloaded) => {
                return self.errored(
                    step,
                    started_at,
                    timer,
                    ErrorKind::Overloaded,
                    "outbound bulkhead rejected the call",
                );
            }
            Err(ResilienceError::CircuitOpen) => {
                return self.errored(
                    step,
                    started_at,
                    timer,
                    ErrorKind::Network,
                    "outbound circuit breaker is open",
                );
            }
            Err(ResilienceError::Inner(err)) => {
                let kind = if err.is_timeout() {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Network
                };
                warn!(
                    run_id = %self.run_id,
                    scenario_id = %self.scenario_id,
                    step_index = step.index,
                    error = %err,
                    "step transport failed after retries"
                );
                return self.errored(step, started_at, timer, kind, err.to_string());
            }
        };

        debug!(
            run_id = %self.run_id,
            step_index = step.index,
            status = response.status,
            url = %target,
            "step response received"
        );

        let observed = ObservedResponse::from_gateway(response);

        // 7. Extractions. A failed extraction does not fail the step here;
        // the scenario executor reports it if a later step needs the value.
        let mut extracted = BTreeMap::new();
        for (var, locator) in &step.extractions {
            match locate_for_extraction(&observed, locator) {
                Some(value) => {
                    extracted.insert(var.clone(), value);
                }
                None => {
                    debug!(
                        run_id = %self.run_id,
                        step_index = step.index,
                        variable = %var,
                        locator = %locator,
                        "extraction did not resolve"
                    );
                }
            }
        }

        // 8. Assertions.
        let assertions = evaluate(&step.expected, &observed, context);
        let passed = assertions.iter().all(|check| check.passed);

        let (status, error_kind, failure_reason) = if passed {
            (StepStatus::Passed, None, None)
        } else {
            let summary = assertions
                .iter()
                .filter(|check| !check.passed)
                .map(|check| {
                    format!(
                        "{}: {}",
                        check.locator,
                        check.reason.as_deref().unwrap_or("failed")
                    )
                })
                .collect::<Vec<_>>()
                .join("; ");
            (StepStatus::Failed, Some(ErrorKind::Assertion), Some(summary))
        };

        let excerpt_len = observed.body.len().min(self.policy.body_capture_limit);
        StepResult {
            id: StepResultId::new(),
            run_id: self.run_id.clone(),
            scenario_id: self.scenario_id.clone(),
            step_index: step.index,
            status,
            actual_status_code: Some(observed.status),
            actual_headers: observed.headers.clone(),
            body_digest: Some(hex::encode(Sha256::digest(&observed.body))),
            body_excerpt: (!observed.body.is_empty())
                .then(|| String::from_utf8_lossy(&observed.body[..excerpt_len]).into_owned()),
            assertions,
            extracted,
            duration_ms: timer.elapsed().as_millis() as u64,
            started_at,
            finished_at: self.clock.now(),
            failure_reason,
            error_kind,
        }
    }

    /// A FAILED result produced without performing the HTTP call.
    pub fn failed(
        &self,
        step: &Step,
        started_at: chrono::DateTime<chrono::Utc>,
        timer: Instant,
        kind: ErrorKind,
        reason: impl Into<String>,
    ) -> StepResult {
        self.terminal(step, started_at, timer, StepStatus::Failed, kind, reason)
    }

    fn errored(
        &self,
        step: &Step,
        started_at: chrono::DateTime<chrono::Utc>,
        timer: Instant,
        kind: ErrorKind,
        reason: impl Into<String>,
    ) -> StepResult {
        self.terminal(step, started_at, timer, StepStatus::Error, kind, reason)
    }

    /// A SKIPPED result for a step that never ran.
    pub fn skipped(&self, step: &Step, reason: &str) -> StepResult {
        let now = self.clock.now();
        StepResult {
            id: StepResultId::new(),
            run_id: self.run_id.clone(),
            scenario_id: self.scenario_id.clone(),
            step_index: step.index,
            status: StepStatus::Skipped,
            actual_status_code: None,
            actual_headers: Vec::new(),
            body_digest: None,
            body_excerpt: None,
            assertions: Vec::new(),
            extracted: BTreeMap::new(),
            duration_ms: 0,
            started_at: now,
            finished_at: now,
            failure_reason: Some(reason.to_string()),
            error_kind: None,
        }
    }

    fn terminal(
        &self,
        step: &Step,
        started_at: chrono::DateTime<chrono::Utc>,
        timer: Instant,
        status: StepStatus,
        kind: ErrorKind,
        reason: impl Into<String>,
    ) -> StepResult {
        StepResult {
            id: StepResultId::new(),
            run_id: self.run_id.clone(),
            scenario_id: self.scenario_id.clone(),
            step_index: step.index,
            status,
            actual_status_code: None,
            actual_headers: Vec::new(),
            body_digest: None,
            body_excerpt: None,
            assertions: Vec::new(),
            extracted: BTreeMap::new(),
            duration_ms: timer.elapsed().as_millis() as u64,
            started_at,
            finished_at: self.clock.now(),
            failure_reason: Some(reason.into()),
            error_kind: Some(kind),
        }
    }
}

fn locate_for_extraction(observed: &ObservedResponse, locator: &Locator) -> Option<String> {
    match &observed.parsed {
        Some(body) => locator.resolve(body).map(evaluator::render),
        None if locator.is_root() && !observed.body.is_empty() => {
            Some(observed.body_text().into_owned())
        }
        None => None,
    }
}

/// Concatenate base URL and endpoint unless the endpoint is absolute,
/// normalizing duplicate slashes at the seam and inside the path.
pub fn build_target_url(base_url: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    let base = base_url.trim_end_matches('/');
    let (path, query) = match endpoint.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (endpoint, None),
    };
    let mut normalized = String::with_capacity(path.len() + 1);
    normalized.push('/');
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        normalized.push_str(segment);
    }
    match query {
        Some(q) => format!("{base}{normalized}?{q}"),
        None => format!("{base}{normalized}"),
    }
}

#[derive(Debug)]
enum UrlPolicyError {
    Forbidden { host: String },
    Invalid { reason: String },
    Resolution { reason: String },
}

/// Reject targets that resolve to loopback, link-local, or private ranges
/// unless the policy allows internal hosts.
async fn enforce_url_policy(target: &str, allow_internal: bool) -> Result<(), UrlPolicyError> {
    if allow_internal {
        return Ok(());
    }
    let parsed = Url::parse(target).map_err(|e| UrlPolicyError::Invalid {
        reason: e.to_string(),
    })?;
    let host = parsed.host().ok_or_else(|| UrlPolicyError::Invalid {
        reason: "missing host".to_string(),
    })?;

    match host {
        Host::Ipv4(addr) => {
            if is_forbidden_ip(IpAddr::V4(addr)) {
                return Err(UrlPolicyError::Forbidden {
                    host: addr.to_string(),
                });
            }
        }
        Host::Ipv6(addr) => {
            if is_forbidden_ip(IpAddr::V6(addr)) {
                return Err(UrlPolicyError::Forbidden {
                    host: addr.to_string(),
                });
            }
        }
        Host::Domain(domain) => {
            let port = parsed.port_or_known_default().unwrap_or(80);
            let addrs = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|e| UrlPolicyError::Resolution {
                    reason: e.to_string(),
                })?;
            for addr in addrs {
                if is_forbidden_ip(addr.ip()) {
                    return Err(UrlPolicyError::Forbidden {
                        host: domain.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn is_forbidden_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_link_local()
                || v4.is_private()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique-local fc00::/7
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // Link-local fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                // V4-mapped addresses carry their V4 class
                || v6.to_ipv4_mapped().is_some_and(|v4| is_forbidden_ip(IpAddr::V4(v4)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_base_and_endpoint_with_single_slashes() {
        assert_eq!(
            build_target_url("http://api.test/", "/users//42"),
            "http://api.test/users/42"
        );
        assert_eq!(
            build_target_url("http://api.test", "users"),
            "http://api.test/users"
        );
        assert_eq!(
            build_target_url("http://api.test/v1/", "/users?limit=10"),
            "http://api.test/v1/users?limit=10"
        );
    }

    #[test]
    fn absolute_endpoints_bypass_the_base() {
        assert_eq!(
            build_target_url("http://api.test", "https://other.test/ping"),
            "https://other.test/ping"
        );
    }

    #[tokio::test]
    async fn loopback_and_private_literals_are_forbidden() {
        for target in [
            "http://127.0.0.1/x",
            "http://10.1.2.3/x",
            "http://172.16.9.1/x",
            "http://192.168.1.1/x",
            "http://169.254.1.1/x",
            "http://[::1]/x",
        ] {
            assert!(
                matches!(
                    enforce_url_policy(target, false).await,
                    Err(UrlPolicyError::Forbidden { .. })
                ),
                "{target} should be forbidden"
            );
        }
    }

    #[tokio::test]
    async fn allow_internal_bypasses_the_guard() {
        assert!(enforce_url_policy("http://127.0.0.1/x", true).await.is_ok());
    }

    #[tokio::test]
    async fn localhost_resolves_to_loopback_and_is_forbidden() {
        match enforce_url_policy("http://localhost:8080/x", false).await {
            Err(UrlPolicyError::Forbidden { host }) => assert_eq!(host, "localhost"),
            other => panic!("expected forbidden, got {other:?}"),
        }
    }

    #[test]
    fn public_literals_pass_the_ip_filter() {
        assert!(!is_forbidden_ip("93.184.216.34".parse().unwrap()));
        assert!(!is_forbidden_ip("2606:2800:220:1::1".parse().unwrap()));
    }
}
