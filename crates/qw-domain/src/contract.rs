//! The scenario JSON contract: the stable boundary between generation
//! and execution
//!
//! A generator response is either a single scenario object or an array of
//! them. Decoding is strict and happens once: tokens and locators come out
//! as their parsed ASTs, and every violation is collected (not just the
//! first) so the verifier can hand the generator a corrective hint.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::ser::SerializeMap;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use ulid::Ulid;

use crate::assertion::{AssertionToken, StatusExpectation};
use crate::errors::ErrorKind;
use crate::locator::Locator;
use crate::run::RunId;
use crate::scenario::{
    BodyFieldCheck, Expectation, HeaderCheck, HttpMethod, Scenario, ScenarioId, ScenarioSource,
    ScenarioStatus, Step,
};

/// Hard shape limits on generator output
pub const MAX_STEP_BODY_BYTES: usize = 1024 * 1024;
pub const MAX_HEADERS_PER_STEP: usize = 64;
pub const MAX_ENDPOINT_LEN: usize = 2048;

/// Placeholder grammar: `${NAME}` with NAME = `[A-Za-z_][A-Za-z0-9_.]*`
pub static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.]*)\}").expect("valid placeholder regex"));

static VAR_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").expect("valid variable-name regex"));

/// Documented synthetic placeholders the resolver materializes per scenario
pub const SYNTHETIC_PLACEHOLDERS: &[&str] = &["random.email", "random.uuid", "random.string"];

/// Scan a template for placeholder names, in order of appearance.
pub fn find_placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .map(|cap| cap[1].to_string())
        .collect()
}

/// `${env.KEY}` references resolve from the frozen environment namespace.
pub fn is_env_ref(name: &str) -> bool {
    name.strip_prefix("env.").is_some_and(|key| !key.is_empty())
}

pub fn is_synthetic(name: &str) -> bool {
    SYNTHETIC_PLACEHOLDERS.contains(&name)
}

/// Per-run scenario/step count limits, taken from the run config
#[derive(Debug, Clone, Copy)]
pub struct ShapeLimits {
    pub max_scenarios: u32,
    pub max_steps_per_scenario: u32,
}

impl Default for ShapeLimits {
    fn default() -> Self {
        Self {
            max_scenarios: 10,
            max_steps_per_scenario: 10,
        }
    }
}

/// Verification failure classes, in check order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifyFailureKind {
    Schema,
    Alignment,
    Placeholder,
    Shape,
}

impl VerifyFailureKind {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            VerifyFailureKind::Schema => ErrorKind::AiSchema,
            VerifyFailureKind::Alignment => ErrorKind::AiAlignment,
            VerifyFailureKind::Placeholder => ErrorKind::AiPlaceholder,
            VerifyFailureKind::Shape => ErrorKind::AiShape,
        }
    }
}

/// One specific contract violation, suitable for a corrective hint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: VerifyFailureKind,
    pub message: String,
}

impl Violation {
    pub fn schema(message: impl Into<String>) -> Self {
        Self {
            kind: VerifyFailureKind::Schema,
            message: message.into(),
        }
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self {
            kind: VerifyFailureKind::Shape,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// A decoded scenario before it is attached to a run
#[derive(Debug, Clone)]
pub struct ScenarioDraft {
    pub name: String,
    pub description: Option<String>,
    pub operation_id: Option<String>,
    pub steps: Vec<Step>,
}

impl ScenarioDraft {
    pub fn into_scenario(
        self,
        run_id: RunId,
        source: ScenarioSource,
        now: DateTime<Utc>,
    ) -> Scenario {
        Scenario {
            id: ScenarioId::new(),
            run_id,
            name: self.name,
            description: self.description,
            source,
            operation_id: self.operation_id,
            steps: self.steps,
            status: ScenarioStatus::Pending,
            tags: Vec::new(),
            priority: 0,
            version: 1,
            created_at: now,
        }
    }

    /// Placeholder safety: every `${name}` that is not an env reference or a
    /// documented synthetic must be supplied by an earlier step's extraction.
    pub fn placeholder_violations(&self) -> Vec<Violation> {
        let mut violations = Vec::new();
        let mut defined: Vec<&str> = Vec::new();
        for step in &self.steps {
            let mut referenced: Vec<String> = find_placeholders(&step.endpoint);
            for (name, value) in &step.headers {
                referenced.extend(find_placeholders(name));
                referenced.extend(find_placeholders(value));
            }
            if let Some(body) = &step.body {
                referenced.extend(find_placeholders(body));
            }
            for check in &step.expected.body_fields {
                if let AssertionToken::Placeholder(name) = &check.token {
                    referenced.push(name.clone());
                }
            }
            for check in &step.expected.headers {
                if let AssertionToken::Placeholder(name) = &check.token {
                    referenced.push(name.clone());
                }
            }

            for name in referenced {
                if is_env_ref(&name) || is_synthetic(&name) {
                    continue;
                }
                if !defined.contains(&name.as_str()) {
                    violations.push(Violation {
                        kind: VerifyFailureKind::Placeholder,
                        message: format!(
                            "step {} references ${{{name}}} before any extraction defines it",
                            step.index
                        ),
                    });
                }
            }

            defined.extend(step.extractions.iter().map(|(name, _)| name.as_str()));
        }
        violations
    }
}

/// Decode a generator response document into scenario drafts.
///
/// Covers the schema and shape checks; alignment and placeholder checks are
/// composed by the verifier on top of the drafts.
pub fn parse_scenario_document(
    document: &Value,
    limits: &ShapeLimits,
) -> Result<Vec<ScenarioDraft>, Vec<Violation>> {
    let items: Vec<&Value> = match document {
        Value::Object(_) => vec![document],
        Value::Array(items) => items.iter().collect(),
        _ => {
            return Err(vec![Violation::schema(
                "top level must be a scenario object or an array of scenarios",
            )])
        }
    };

    let mut violations = Vec::new();
    if items.len() > limits.max_scenarios as usize {
        violations.push(Violation::shape(format!(
            "document contains {} scenarios; at most {} allowed",
            items.len(),
            limits.max_scenarios
        )));
    }

    let mut drafts = Vec::new();
    for (position, item) in items.iter().enumerate() {
        match parse_scenario(item, position, limits) {
            Ok(draft) => drafts.push(draft),
            Err(mut errs) => violations.append(&mut errs),
        }
    }

    if violations.is_empty() {
        Ok(drafts)
    } else {
        Err(violations)
    }
}

fn parse_scenario(
    value: &Value,
    position: usize,
    limits: &ShapeLimits,
) -> Result<ScenarioDraft, Vec<Violation>> {
    let Some(obj) = value.as_object() else {
        return Err(vec![Violation::schema(format!(
            "scenario {position} is not an object"
        ))]);
    };

    let mut violations = Vec::new();

    let name = match obj.get("name").and_then(Value::as_str) {
        Some(n) if !n.trim().is_empty() => n.to_string(),
        _ => {
            violations.push(Violation::schema(format!(
                "scenario {position} is missing a non-empty 'name'"
            )));
            String::new()
        }
    };
    let description = obj.get("description").and_then(Value::as_str).map(String::from);
    let operation_id = obj.get("operationId").and_then(Value::as_str).map(String::from);

    let steps_value = match obj.get("steps") {
        Some(Value::Array(steps)) if !steps.is_empty() => steps.as_slice(),
        Some(Value::Array(_)) => {
            violations.push(Violation::schema(format!(
                "scenario '{name}': 'steps' must be non-empty"
            )));
            &[]
        }
        _ => {
            violations.push(Violation::schema(format!(
                "scenario '{name}': missing required field 'steps'"
            )));
            &[]
        }
    };

    if steps_value.len() > limits.max_steps_per_scenario as usize {
        violations.push(Violation::shape(format!(
            "scenario '{name}' has {} steps; at most {} allowed",
            steps_value.len(),
            limits.max_steps_per_scenario
        )));
    }

    let mut steps = Vec::new();
    for (step_position, step_value) in steps_value.iter().enumerate() {
        match parse_step(step_value, Some(step_position as u32)) {
            Ok(step) => {
                if step.index != step_position as u32 {
                    violations.push(Violation::schema(format!(
                        "scenario '{name}': step at position {step_position} declares index {}; \
                         indices must be contiguous from 0",
                        step.index
                    )));
                }
                steps.push(step);
            }
            Err(mut errs) => {
                for err in &mut errs {
                    err.message = format!("scenario '{name}': {}", err.message);
                }
                violations.append(&mut errs);
            }
        }
    }

    if violations.is_empty() {
        Ok(ScenarioDraft {
            name,
            description,
            operation_id,
            steps,
        })
    } else {
        Err(violations)
    }
}

fn parse_step(value: &Value, fallback_index: Option<u32>) -> Result<Step, Vec<Violation>> {
    let Some(obj) = value.as_object() else {
        return Err(vec![Violation::schema("step is not an object")]);
    };

    let mut violations = Vec::new();

    let index = match obj.get("index") {
        Some(v) => v
            .as_u64()
            .and_then(|i| u32::try_from(i).ok())
            .unwrap_or_else(|| {
                violations.push(Violation::schema("step 'index' must be a non-negative integer"));
                fallback_index.unwrap_or(0)
            }),
        None => match fallback_index {
            Some(i) => i,
            None => {
                violations.push(Violation::schema("step is missing required field 'index'"));
                0
            }
        },
    };

    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| format!("step {index}"));

    let method = match obj.get("method").and_then(Value::as_str) {
        Some(m) => match HttpMethod::parse(m) {
            Some(method) => method,
            None => {
                violations.push(Violation::schema(format!(
                    "step {index}: unknown method '{m}'"
                )));
                HttpMethod::Get
            }
        },
        None => {
            violations.push(Violation::schema(format!(
                "step {index}: missing required field 'method'"
            )));
            HttpMethod::Get
        }
    };

    let endpoint = match obj.get("endpoint").and_then(Value::as_str) {
        Some(e) if !e.is_empty() => e.to_string(),
        _ => {
            violations.push(Violation::schema(format!(
                "step {index}: missing required field 'endpoint'"
            )));
            String::new()
        }
    };
    if endpoint.len() > MAX_ENDPOINT_LEN {
        violations.push(Violation::shape(format!(
            "step {index}: endpoint exceeds {MAX_ENDPOINT_LEN} characters"
        )));
    }

    let mut headers = Vec::new();
    if let Some(value) = obj.get("headers") {
        match value.as_object() {
            Some(map) => {
                for (k, v) in map {
                    match v.as_str() {
                        Some(s) => headers.push((k.clone(), s.to_string())),
                        None => violations.push(Violation::schema(format!(
                            "step {index}: header '{k}' must be a string"
                        ))),
                    }
                }
            }
            None => violations.push(Violation::schema(format!(
                "step {index}: 'headers' must be an object"
            ))),
        }
    }
    if headers.len() > MAX_HEADERS_PER_STEP {
        violations.push(Violation::shape(format!(
            "step {index}: {} headers; at most {MAX_HEADERS_PER_STEP} allowed",
            headers.len()
        )));
    }

    let body = match obj.get("body") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };
    if body.as_ref().is_some_and(|b| b.len() > MAX_STEP_BODY_BYTES) {
        violations.push(Violation::shape(format!(
            "step {index}: body exceeds {MAX_STEP_BODY_BYTES} bytes"
        )));
    }

    let expected = match obj.get("expected") {
        Some(value) => match parse_expectation(value, index) {
            Ok(expected) => expected,
            Err(mut errs) => {
                violations.append(&mut errs);
                Expectation {
                    status: StatusExpectation::Exact(200),
                    body_fields: Vec::new(),
                    headers: Vec::new(),
                }
            }
        },
        None => {
            violations.push(Violation::schema(format!(
                "step {index}: missing required field 'expected'"
            )));
            Expectation {
                status: StatusExpectation::Exact(200),
                body_fields: Vec::new(),
                headers: Vec::new(),
            }
        }
    };

    let mut extractions = Vec::new();
    if let Some(value) = obj.get("extractions") {
        match value.as_object() {
            Some(map) => {
                for (var, loc) in map {
                    if !VAR_NAME_RE.is_match(var) {
                        violations.push(Violation::schema(format!(
                            "step {index}: invalid extraction variable name '{var}'"
                        )));
                        continue;
                    }
                    match loc.as_str().map(Locator::parse) {
                        Some(Ok(locator)) => extractions.push((var.clone(), locator)),
                        Some(Err(e)) => violations.push(Violation::schema(format!(
                            "step {index}: extraction '{var}': {e}"
                        ))),
                        None => violations.push(Violation::schema(format!(
                            "step {index}: extraction '{var}' must be a locator string"
                        ))),
                    }
                }
            }
            None => violations.push(Violation::schema(format!(
                "step {index}: 'extractions' must be an object"
            ))),
        }
    }

    if violations.is_empty() {
        Ok(Step {
            index,
            name,
            method,
            endpoint,
            headers,
            body,
            expected,
            extractions,
        })
    } else {
        Err(violations)
    }
}

fn parse_expectation(value: &Value, step_index: u32) -> Result<Expectation, Vec<Violation>> {
    let Some(obj) = value.as_object() else {
        return Err(vec![Violation::schema(format!(
            "step {step_index}: 'expected' must be an object"
        ))]);
    };

    let mut violations = Vec::new();

    let status = match obj.get("status") {
        Some(value) => match StatusExpectation::from_contract(value) {
            Ok(status) => status,
            Err(e) => {
                violations.push(Violation::schema(format!("step {step_index}: {e}")));
                StatusExpectation::Exact(200)
            }
        },
        None => {
            violations.push(Violation::schema(format!(
                "step {step_index}: 'expected' is missing required field 'status'"
            )));
            StatusExpectation::Exact(200)
        }
    };

    let mut body_fields = Vec::new();
    if let Some(value) = obj.get("bodyFields") {
        match value.as_object() {
            Some(map) => {
                for (loc, token) in map {
                    let locator = match Locator::parse(loc) {
                        Ok(locator) => locator,
                        Err(e) => {
                            violations
                                .push(Violation::schema(format!("step {step_index}: {e}")));
                            continue;
                        }
                    };
                    match token_from_value(token) {
                        Ok(token) => body_fields.push(BodyFieldCheck { locator, token }),
                        Err(message) => violations.push(Violation::schema(format!(
                            "step {step_index}: bodyFields['{loc}']: {message}"
                        ))),
                    }
                }
            }
            None => violations.push(Violation::schema(format!(
                "step {step_index}: 'bodyFields' must be an object"
            ))),
        }
    }

    let mut header_checks = Vec::new();
    if let Some(value) = obj.get("headers") {
        match value.as_object() {
            Some(map) => {
                for (name, token) in map {
                    match token_from_value(token) {
                        Ok(token) => header_checks.push(HeaderCheck {
                            name: name.clone(),
                            token,
                        }),
                        Err(message) => violations.push(Violation::schema(format!(
                            "step {step_index}: headers['{name}']: {message}"
                        ))),
                    }
                }
            }
            None => violations.push(Violation::schema(format!(
                "step {step_index}: expected 'headers' must be an object"
            ))),
        }
    }

    if violations.is_empty() {
        Ok(Expectation {
            status,
            body_fields,
            headers: header_checks,
        })
    } else {
        Err(violations)
    }
}

fn token_from_value(value: &Value) -> Result<AssertionToken, String> {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Number(_) | Value::Bool(_) | Value::Null => value.to_string(),
        _ => return Err("assertion token must be a scalar".to_string()),
    };
    AssertionToken::parse(&raw).map_err(|e| e.to_string())
}

// ============================================================================
// Canonical (de)serialization of steps and expectations
// ============================================================================

impl Serialize for Step {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("index", &self.index)?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("method", self.method.as_str())?;
        map.serialize_entry("endpoint", &self.endpoint)?;
        if !self.headers.is_empty() {
            map.serialize_entry("headers", &PairsAsMap(&self.headers))?;
        }
        if let Some(body) = &self.body {
            map.serialize_entry("body", body)?;
        }
        map.serialize_entry("expected", &self.expected)?;
        if !self.extractions.is_empty() {
            let pairs: Vec<(String, String)> = self
                .extractions
                .iter()
                .map(|(var, loc)| (var.clone(), loc.as_str().to_string()))
                .collect();
            map.serialize_entry("extractions", &PairsAsMap(&pairs))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        parse_step(&value, None).map_err(|violations| {
            de::Error::custom(
                violations
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })
    }
}

impl Serialize for Expectation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("status", &self.status)?;
        if !self.body_fields.is_empty() {
            let pairs: Vec<(String, String)> = self
                .body_fields
                .iter()
                .map(|c| (c.locator.as_str().to_string(), c.token.to_string()))
                .collect();
            map.serialize_entry("bodyFields", &PairsAsMap(&pairs))?;
        }
        if !self.headers.is_empty() {
            let pairs: Vec<(String, String)> = self
                .headers
                .iter()
                .map(|c| (c.name.clone(), c.token.to_string()))
                .collect();
            map.serialize_entry("headers", &PairsAsMap(&pairs))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Expectation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        parse_expectation(&value, 0).map_err(|violations| {
            de::Error::custom(
                violations
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })
    }
}

/// Serialize an ordered pair list as a JSON object, preserving order
struct PairsAsMap<'a>(&'a [(String, String)]);

impl Serialize for PairsAsMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

// ============================================================================
// Generation attempts
// ============================================================================

/// Lifecycle of one generation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Pending,
    Retrying,
    Passed,
    Failed,
}

/// Record of one generator invocation for one operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationAttempt {
    pub id: String,
    pub run_id: RunId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    /// 1-based attempt counter
    pub attempt: u32,
    pub status: AttemptStatus,
    #[serde(default)]
    pub failure_kinds: Vec<VerifyFailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GenerationAttempt {
    pub fn new(run_id: RunId, operation_id: Option<String>, attempt: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("att_{}", Ulid::new()),
            run_id,
            operation_id,
            attempt,
            status: AttemptStatus::Pending,
            failure_kinds: Vec::new(),
            hint: None,
            created_at: now,
        }
    }
}
