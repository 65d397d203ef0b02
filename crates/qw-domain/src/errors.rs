//! Domain errors and the error taxonomy carried on results and events

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Domain errors for QAWave
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Invalid status transition: cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid locator '{locator}': {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("Invalid assertion token '{token}': {reason}")]
    InvalidToken { token: String, reason: String },

    #[error("Invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("Invariant violation: {invariant}")]
    InvariantViolation { invariant: String },
}

/// Error classification carried as `error_kind` on step results and events.
///
/// The taxonomy is exhaustive: every failure a run can observe maps to
/// exactly one of these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Cannot retrieve or parse the spec
    SpecFetch,
    /// Spec syntactically valid but contains no operations
    SpecInvalid,
    /// Generator output violates the scenario schema
    AiSchema,
    /// Generated step references an unknown operation
    AiAlignment,
    /// Generated step uses an unresolved or undefined placeholder
    AiPlaceholder,
    /// Generator output exceeds size or count limits
    AiShape,
    /// Upstream AI call failed after retries
    AiProvider,
    /// Connect / reset / DNS / TLS error contacting the system under test
    Network,
    /// Step exceeded its timeout
    Timeout,
    /// Target host forbidden by policy
    SsrfBlocked,
    /// Context lacks a referenced variable at execution time
    PlaceholderUnresolved,
    /// A later step references a variable an earlier extraction did not supply
    ExtractionMissing,
    /// Status, body, or header expectation violated
    Assertion,
    /// Cooperative cancellation
    Cancelled,
    /// Resilience bulkhead rejected the call
    Overloaded,
    /// Unexpected invariant violation
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SpecFetch => "SPEC_FETCH",
            ErrorKind::SpecInvalid => "SPEC_INVALID",
            ErrorKind::AiSchema => "AI_SCHEMA",
            ErrorKind::AiAlignment => "AI_ALIGNMENT",
            ErrorKind::AiPlaceholder => "AI_PLACEHOLDER",
            ErrorKind::AiShape => "AI_SHAPE",
            ErrorKind::AiProvider => "AI_PROVIDER",
            ErrorKind::Network => "NETWORK",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::SsrfBlocked => "SSRF_BLOCKED",
            ErrorKind::PlaceholderUnresolved => "PLACEHOLDER_UNRESOLVED",
            ErrorKind::ExtractionMissing => "EXTRACTION_MISSING",
            ErrorKind::Assertion => "ASSERTION",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Overloaded => "OVERLOADED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
