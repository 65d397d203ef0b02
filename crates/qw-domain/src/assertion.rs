//! Assertion tokens: the tagged variants an expectation can declare
//!
//! Tokens arrive as strings on the scenario JSON contract and are decoded
//! once when the scenario is loaded. `Display` renders the canonical token
//! text back, so payload round-trips are stable.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::errors::DomainError;

static PLACEHOLDER_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$\{([A-Za-z_][A-Za-z0-9_.]*)\}$").expect("valid placeholder regex"));

static COMPARATOR_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(>=|<=|!=|>|<)\s*(-?\d+(?:\.\d+)?)$").expect("valid comparator regex"));

/// Numeric comparison operators admitted by comparator tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Gt,
    Lt,
    Ge,
    Le,
    Ne,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
            CmpOp::Ne => "!=",
        }
    }

    pub fn compare(&self, left: f64, right: f64) -> bool {
        match self {
            CmpOp::Gt => left > right,
            CmpOp::Lt => left < right,
            CmpOp::Ge => left >= right,
            CmpOp::Le => left <= right,
            CmpOp::Ne => left != right,
        }
    }

    fn parse(op: &str) -> Option<Self> {
        match op {
            ">" => Some(CmpOp::Gt),
            "<" => Some(CmpOp::Lt),
            ">=" => Some(CmpOp::Ge),
            "<=" => Some(CmpOp::Le),
            "!=" => Some(CmpOp::Ne),
            _ => None,
        }
    }
}

/// A regex pattern anchored at both ends, kept with its raw source
#[derive(Debug, Clone)]
pub struct AnchoredRegex {
    raw: String,
    compiled: Regex,
}

impl AnchoredRegex {
    pub fn compile(pattern: &str) -> Result<Self, DomainError> {
        let compiled =
            Regex::new(&format!("^(?:{pattern})$")).map_err(|e| DomainError::InvalidToken {
                token: format!("regex:{pattern}"),
                reason: e.to_string(),
            })?;
        Ok(Self {
            raw: pattern.to_string(),
            compiled,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.raw
    }

    pub fn is_full_match(&self, text: &str) -> bool {
        self.compiled.is_match(text)
    }
}

impl PartialEq for AnchoredRegex {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for AnchoredRegex {}

/// A decoded assertion token
#[derive(Debug, Clone, PartialEq)]
pub enum AssertionToken {
    /// `<any>`: the locator must resolve (null counts)
    Any,
    /// Substring, element-membership, or key-membership check
    Contains(String),
    /// Anchored full-match regex
    Regex(AnchoredRegex),
    /// Numeric comparison against the observed value
    Comparator(CmpOp, f64),
    /// Equality against a resolved context variable
    Placeholder(String),
    /// Structural equality against a literal scalar
    Literal(Value),
}

impl AssertionToken {
    /// Decode a token string. Every string decodes to something: unrecognized
    /// forms fall back to a literal. Only a malformed regex is an error.
    pub fn parse(token: &str) -> Result<Self, DomainError> {
        if token == "<any>" {
            return Ok(AssertionToken::Any);
        }
        if let Some(needle) = token.strip_prefix("contains:") {
            return Ok(AssertionToken::Contains(needle.to_string()));
        }
        if let Some(pattern) = token.strip_prefix("regex:") {
            return Ok(AssertionToken::Regex(AnchoredRegex::compile(pattern)?));
        }
        if let Some(cap) = PLACEHOLDER_TOKEN_RE.captures(token) {
            return Ok(AssertionToken::Placeholder(cap[1].to_string()));
        }
        if let Some(cap) = COMPARATOR_TOKEN_RE.captures(token) {
            let op = CmpOp::parse(&cap[1]).ok_or_else(|| DomainError::InvalidToken {
                token: token.to_string(),
                reason: "unknown comparator".to_string(),
            })?;
            let value = cap[2].parse::<f64>().map_err(|e| DomainError::InvalidToken {
                token: token.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(AssertionToken::Comparator(op, value));
        }
        match serde_json::from_str::<Value>(token) {
            Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => {
                Ok(AssertionToken::Literal(v))
            }
            _ => Ok(AssertionToken::Literal(Value::String(token.to_string()))),
        }
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

impl std::fmt::Display for AssertionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssertionToken::Any => f.write_str("<any>"),
            AssertionToken::Contains(needle) => write!(f, "contains:{needle}"),
            AssertionToken::Regex(re) => write!(f, "regex:{}", re.pattern()),
            AssertionToken::Comparator(op, value) => {
                write!(f, "{}{}", op.as_str(), format_number(*value))
            }
            AssertionToken::Placeholder(name) => write!(f, "${{{name}}}"),
            AssertionToken::Literal(Value::String(s)) => f.write_str(s),
            AssertionToken::Literal(v) => f.write_str(&v.to_string()),
        }
    }
}

impl Serialize for AssertionToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AssertionToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AssertionToken::parse(&raw).map_err(de::Error::custom)
    }
}

/// What a step expects of the observed HTTP status code
#[derive(Debug, Clone, PartialEq)]
pub enum StatusExpectation {
    Exact(u16),
    Cmp(CmpOp, u16),
}

impl StatusExpectation {
    /// Decode from the contract value: an integer, or a predicate string
    /// like `">=200"`, or a bare number in string form.
    pub fn from_contract(value: &Value) -> Result<Self, DomainError> {
        match value {
            Value::Number(n) => {
                let code = n.as_u64().and_then(|v| u16::try_from(v).ok()).ok_or_else(|| {
                    DomainError::InvalidToken {
                        token: n.to_string(),
                        reason: "status must be a small positive integer".to_string(),
                    }
                })?;
                Ok(StatusExpectation::Exact(code))
            }
            Value::String(s) => Self::parse(s),
            other => Err(DomainError::InvalidToken {
                token: other.to_string(),
                reason: "status must be an integer or predicate string".to_string(),
            }),
        }
    }

    pub fn parse(text: &str) -> Result<Self, DomainError> {
        let trimmed = text.trim();
        if let Some(cap) = COMPARATOR_TOKEN_RE.captures(trimmed) {
            let op = CmpOp::parse(&cap[1]).ok_or_else(|| DomainError::InvalidToken {
                token: text.to_string(),
                reason: "unknown comparator".to_string(),
            })?;
            let code = cap[2].parse::<u16>().map_err(|e| DomainError::InvalidToken {
                token: text.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(StatusExpectation::Cmp(op, code));
        }
        let code = trimmed.parse::<u16>().map_err(|e| DomainError::InvalidToken {
            token: text.to_string(),
            reason: e.to_string(),
        })?;
        Ok(StatusExpectation::Exact(code))
    }

    pub fn matches(&self, observed: u16) -> bool {
        match self {
            StatusExpectation::Exact(code) => observed == *code,
            StatusExpectation::Cmp(op, code) => op.compare(observed as f64, *code as f64),
        }
    }

    /// Render back to the contract form: exact codes as numbers,
    /// predicates as strings.
    pub fn to_contract(&self) -> Value {
        match self {
            StatusExpectation::Exact(code) => Value::from(*code),
            StatusExpectation::Cmp(op, code) => Value::String(format!("{}{}", op.as_str(), code)),
        }
    }
}

impl std::fmt::Display for StatusExpectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusExpectation::Exact(code) => write!(f, "{code}"),
            StatusExpectation::Cmp(op, code) => write!(f, "{}{}", op.as_str(), code),
        }
    }
}

impl Serialize for StatusExpectation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StatusExpectation::Exact(code) => serializer.serialize_u16(*code),
            StatusExpectation::Cmp(..) => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for StatusExpectation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        StatusExpectation::from_contract(&value).map_err(de::Error::custom)
    }
}
