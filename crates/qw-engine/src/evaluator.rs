//! Assertion evaluation: compare an observed response against a declared
//! expectation
//!
//! Checks run in declaration order (status, then headers, then body
//! fields) and every check runs even after a failure. The step verdict is
//! PASSED only when all of them pass.

use qw_domain::{AssertionCheck, AssertionToken, Expectation};
use qw_ports::GatewayResponse;
use serde_json::Value;

use crate::context::ExecutionContext;

/// An observed HTTP response with its body parsed at most once
#[derive(Debug, Clone)]
pub struct ObservedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Present when the body parses as JSON
    pub parsed: Option<Value>,
}

impl ObservedResponse {
    pub fn from_gateway(response: GatewayResponse) -> Self {
        let parsed = serde_json::from_slice(&response.body).ok();
        Self {
            status: response.status,
            headers: response.headers,
            body: response.body,
            parsed,
        }
    }

    /// Case-insensitive header lookup, first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Evaluate every declared check. The caller derives the verdict from
/// `all(|c| c.passed)`.
pub fn evaluate(
    expected: &Expectation,
    observed: &ObservedResponse,
    context: &ExecutionContext,
) -> Vec<AssertionCheck> {
    let mut checks = Vec::new();

    // 1. Status
    let status_ok = expected.status.matches(observed.status);
    checks.push(if status_ok {
        AssertionCheck::passed("status", expected.status.to_string(), Some(observed.status.to_string()))
    } else {
        AssertionCheck::failed(
            "status",
            expected.status.to_string(),
            Some(observed.status.to_string()),
            "status mismatch",
        )
    });

    // 2. Headers, each declared one; undeclared headers are ignored
    for check in &expected.headers {
        let label = format!("header:{}", check.name);
        match observed.header(&check.name) {
            Some(value) => {
                let actual = Value::String(value.to_string());
                match check_token(&check.token, &actual, context) {
                    Ok(()) => checks.push(AssertionCheck::passed(
                        label,
                        check.token.to_string(),
                        Some(value.to_string()),
                    )),
                    Err(reason) => checks.push(AssertionCheck::failed(
                        label,
                        check.token.to_string(),
                        Some(value.to_string()),
                        reason,
                    )),
                }
            }
            None => checks.push(AssertionCheck::failed(
                label,
                check.token.to_string(),
                None,
                "header absent",
            )),
        }
    }

    // 3. Body fields, in declaration order
    for check in &expected.body_fields {
        let label = check.locator.as_str().to_string();
        let resolved = locate(observed, &check.locator);
        match resolved {
            Some(actual) => match check_token(&check.token, &actual, context) {
                Ok(()) => checks.push(AssertionCheck::passed(
                    label,
                    check.token.to_string(),
                    Some(render(&actual)),
                )),
                Err(reason) => checks.push(AssertionCheck::failed(
                    label,
                    check.token.to_string(),
                    Some(render(&actual)),
                    reason,
                )),
            },
            None => checks.push(AssertionCheck::failed(
                label,
                check.token.to_string(),
                None,
                "locator unresolved",
            )),
        }
    }

    checks
}

/// Resolve a body locator. For non-JSON bodies only `$` matches, yielding
/// the raw text.
fn locate(observed: &ObservedResponse, locator: &qw_domain::Locator) -> Option<Value> {
    match &observed.parsed {
        Some(body) => locator.resolve(body).cloned(),
        None if locator.is_root() && !observed.body.is_empty() => {
            Some(Value::String(observed.body_text().into_owned()))
        }
        None => None,
    }
}

fn check_token(
    token: &AssertionToken,
    actual: &Value,
    context: &ExecutionContext,
) -> Result<(), String> {
    match token {
        AssertionToken::Any => Ok(()),

        AssertionToken::Literal(expected) => {
            if values_equal(expected, actual) {
                Ok(())
            } else {
                Err("value mismatch".to_string())
            }
        }

        AssertionToken::Contains(needle) => match actual {
            Value::String(s) => {
                if s.contains(needle) {
                    Ok(())
                } else {
                    Err(format!("'{needle}' not found in string"))
                }
            }
            Value::Array(items) => {
                let needle_value =
                    serde_json::from_str::<Value>(needle).unwrap_or_else(|_| Value::String(needle.clone()));
                if items.iter().any(|item| item == &needle_value) {
                    Ok(())
                } else {
                    Err(format!("'{needle}' is not an element of the array"))
                }
            }
            Value::Object(map) => {
                if map.contains_key(needle) {
                    Ok(())
                } else {
                    Err(format!("key '{needle}' absent from object"))
                }
            }
            other => Err(format!("contains: not applicable to {}", kind_of(other))),
        },

        AssertionToken::Regex(re) => {
            let text = match actual {
                Value::String(s) => s.clone(),
                Value::Number(_) | Value::Bool(_) => actual.to_string(),
                other => return Err(format!("regex: not applicable to {}", kind_of(other))),
            };
            if re.is_full_match(&text) {
                Ok(())
            } else {
                Err(format!("does not fully match /{}/", re.pattern()))
            }
        }

        AssertionToken::Comparator(op, expected) => match as_finite_number(actual) {
            Some(observed) => {
                if op.compare(observed, *expected) {
                    Ok(())
                } else {
                    Err(format!("{observed} is not {} {expected}", op.as_str()))
                }
            }
            None => Err("observed value is not a finite number".to_string()),
        },

        AssertionToken::Placeholder(name) => match context.lookup(name) {
            Some(expected) => {
                if render(actual) == expected {
                    Ok(())
                } else {
                    Err(format!("does not equal ${{{name}}}"))
                }
            }
            None => Err(format!("variable '{name}' not set in context")),
        },
    }
}

/// Structural equality, with numbers compared by value
fn values_equal(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => expected == actual,
    }
}

fn as_finite_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Scalar display form: strings are raw, everything else is JSON text.
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
