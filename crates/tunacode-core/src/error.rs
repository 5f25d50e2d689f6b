// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

use crate::state::AgentState;

/// Errors surfaced to callers of the orchestration core.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Cooperative cancellation requested by the user.  Abort cleanup has
    /// already run by the time this reaches the caller.
    #[error("operation aborted by user")]
    UserAbort,

    /// The whole turn exceeded `settings.global_request_timeout`.  Distinct
    /// from user abort; the cached model client has been invalidated.
    #[error("request exceeded the global timeout of {timeout}s")]
    GlobalRequestTimeout { timeout: f64 },

    /// History corruption: a tool return without a registered call.
    /// Unreachable while the pre-turn sanitizer holds its invariants.
    #[error("state error: {0}")]
    State(String),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: AgentState, to: AgentState },

    /// The model transport failed to open or advance a run.
    #[error("model run failed: {0}")]
    Model(anyhow::Error),
}

/// Errors produced by tool callbacks.  The dispatcher records these in the
/// registry; only [`ToolError::Aborted`] propagates out of the turn.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool observed the user abort signal mid-execution.
    #[error("tool call aborted: {0}")]
    Aborted(String),

    /// The tool asks the model to retry with corrected arguments.
    #[error("tool retry requested: {0}")]
    Retry(String),

    #[error("{kind}: {message}")]
    Execution { kind: String, message: String },

    /// Several failures collected from one batch.
    #[error("aggregate tool failure ({} errors)", .0.len())]
    Aggregate(Vec<String>),
}

impl ToolError {
    pub fn execution(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution { kind: kind.into(), message: message.into() }
    }

    /// Registry-facing failure detail, formatted `<ErrorType>: <message>`.
    pub fn detail(&self) -> String {
        match self {
            ToolError::Aborted(reason) => reason.clone(),
            ToolError::Retry(msg) => format!("ToolRetryError: {msg}"),
            ToolError::Execution { kind, message } => {
                if message.is_empty() {
                    kind.clone()
                } else {
                    format!("{kind}: {message}")
                }
            }
            ToolError::Aggregate(errors) => {
                format!("AggregateToolError: {}", errors.join("; "))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_detail_formats_type_and_message() {
        let e = ToolError::execution("FileNotFoundError", "no such file: a.py");
        assert_eq!(e.detail(), "FileNotFoundError: no such file: a.py");
    }

    #[test]
    fn execution_detail_without_message_is_type_only() {
        let e = ToolError::execution("Timeout", "");
        assert_eq!(e.detail(), "Timeout");
    }

    #[test]
    fn aggregate_detail_joins_errors() {
        let e = ToolError::Aggregate(vec!["a failed".into(), "b failed".into()]);
        assert_eq!(e.detail(), "AggregateToolError: a failed; b failed");
    }

    #[test]
    fn timeout_error_displays_seconds() {
        let e = AgentError::GlobalRequestTimeout { timeout: 120.0 };
        assert!(e.to_string().contains("120"));
    }
}
