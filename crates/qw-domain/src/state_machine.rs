//! The run status graph and its transition rules

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Requested,
    SpecFetched,
    AiSuccess,
    ExecutionInProgress,
    ExecutionComplete,
    QaEvalInProgress,
    QaEvalDone,
    Complete,
    Cancelled,
    FailedSpecFetch,
    FailedGeneration,
    FailedExecution,
}

impl RunStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Complete
                | RunStatus::Cancelled
                | RunStatus::FailedSpecFetch
                | RunStatus::FailedGeneration
                | RunStatus::FailedExecution
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Requested => "REQUESTED",
            RunStatus::SpecFetched => "SPEC_FETCHED",
            RunStatus::AiSuccess => "AI_SUCCESS",
            RunStatus::ExecutionInProgress => "EXECUTION_IN_PROGRESS",
            RunStatus::ExecutionComplete => "EXECUTION_COMPLETE",
            RunStatus::QaEvalInProgress => "QA_EVAL_IN_PROGRESS",
            RunStatus::QaEvalDone => "QA_EVAL_DONE",
            RunStatus::Complete => "COMPLETE",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::FailedSpecFetch => "FAILED_SPEC_FETCH",
            RunStatus::FailedGeneration => "FAILED_GENERATION",
            RunStatus::FailedExecution => "FAILED_EXECUTION",
        };
        f.write_str(s)
    }
}

/// Run state machine: validates that a proposed transition is legal
pub struct RunStateMachine;

impl RunStateMachine {
    /// Validate and compute the next state. The journal calls this before
    /// any status write; an illegal pair leaves the stored state intact.
    pub fn transition(current: RunStatus, next: RunStatus) -> Result<RunStatus, DomainError> {
        use RunStatus::*;

        let legal = match (current, next) {
            // Happy path
            (Requested, SpecFetched)
            | (SpecFetched, AiSuccess)
            | (AiSuccess, ExecutionInProgress)
            | (ExecutionInProgress, ExecutionComplete)
            | (ExecutionComplete, QaEvalInProgress)
            | (QaEvalInProgress, QaEvalDone)
            | (QaEvalDone, Complete) => true,

            // Failure edges
            (Requested, FailedSpecFetch)
            | (SpecFetched, FailedGeneration)
            | (AiSuccess, FailedExecution)
            | (ExecutionInProgress, FailedExecution) => true,

            // Cancellation from any non-terminal state
            (current, Cancelled) => !current.is_terminal(),

            _ => false,
        };

        if legal {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            })
        }
    }
}
