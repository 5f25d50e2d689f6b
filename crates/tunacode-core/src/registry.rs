// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::AgentError;

pub type ToolArgs = Map<String, Value>;

/// Lifecycle of one tool call within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallState {
    Registered,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Per-turn record of a single tool call.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: ToolArgs,
    pub state: ToolCallState,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle table for every tool call of the current turn.
///
/// Records live for the duration of one user turn; the orchestrator clears
/// the table at turn start and again during abort cleanup.  Insertion order
/// is kept so diagnostics can name the most recent tools.
#[derive(Debug, Default)]
pub struct ToolCallRegistry {
    records: HashMap<String, ToolCallRecord>,
    order: Vec<String>,
}

impl ToolCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a record in `Registered`.  Re-registering an id replaces the
    /// record but keeps its original position in the order.
    pub fn register(
        &mut self,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        args: ToolArgs,
    ) {
        let id = tool_call_id.into();
        if !self.records.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.records.insert(
            id.clone(),
            ToolCallRecord {
                tool_call_id: id,
                tool_name: tool_name.into(),
                args,
                state: ToolCallState::Registered,
                result: None,
                error: None,
                created_at: Utc::now(),
            },
        );
    }

    /// REGISTERED → RUNNING.  A record whose return already arrived (or that
    /// failed) keeps its terminal state.
    pub fn start(&mut self, tool_call_id: &str) {
        match self.records.get_mut(tool_call_id) {
            Some(rec) if rec.state == ToolCallState::Registered => {
                rec.state = ToolCallState::Running;
            }
            Some(_) => {}
            None => debug!(tool_call_id, "start() on unregistered tool call"),
        }
    }

    pub fn complete(&mut self, tool_call_id: &str, result: Option<String>) {
        if let Some(rec) = self.records.get_mut(tool_call_id) {
            rec.state = ToolCallState::Completed;
            rec.result = result;
        }
    }

    pub fn fail(&mut self, tool_call_id: &str, error_detail: impl Into<String>) {
        if let Some(rec) = self.records.get_mut(tool_call_id) {
            rec.state = ToolCallState::Failed;
            rec.error = Some(error_detail.into());
        }
    }

    pub fn cancel(&mut self, tool_call_id: &str, reason: impl Into<String>) {
        if let Some(rec) = self.records.get_mut(tool_call_id) {
            rec.state = ToolCallState::Cancelled;
            rec.error = Some(reason.into());
        }
    }

    /// Stored args for a tool return.  The matching call MUST have been
    /// registered this turn; a missing record means history corruption.
    pub fn get_args(&self, tool_call_id: &str) -> Result<ToolArgs, AgentError> {
        self.records
            .get(tool_call_id)
            .map(|rec| rec.args.clone())
            .ok_or_else(|| {
                AgentError::State(format!(
                    "no registered tool call for tool_call_id {tool_call_id}"
                ))
            })
    }

    pub fn get(&self, tool_call_id: &str) -> Option<&ToolCallRecord> {
        self.records.get(tool_call_id)
    }

    /// The last `limit` records in registration order, for diagnostic prompts.
    pub fn recent_calls(&self, limit: usize) -> Vec<&ToolCallRecord> {
        let start = self.order.len().saturating_sub(limit);
        self.order[start..]
            .iter()
            .filter_map(|id| self.records.get(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
