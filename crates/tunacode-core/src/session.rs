// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tracing::debug;
use tunacode_config::Settings;
use tunacode_model::{
    pricing::{calculate_cost, get_model_pricing},
    Message, Usage, UsageMetrics,
};

use crate::registry::ToolCallRegistry;

/// The conversation history; the single source of truth across turns.
#[derive(Debug, Default)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Approximate token count of the whole history (chars/4 heuristic).
    pub fn approx_tokens(&self) -> usize {
        self.messages.iter().map(Message::approx_tokens).sum()
    }
}

/// Per-turn runtime bookkeeping, reset at the start of every request.
#[derive(Debug, Default)]
pub struct RuntimeState {
    pub request_id: String,
    pub iteration_count: u32,
    pub batch_counter: u32,
    pub consecutive_empty_responses: u32,
    /// Messages appended to the conversation by the current run (requests and
    /// thoughts).  Lets persistence tell the run's own records apart from
    /// messages appended externally while the run was in flight.
    pub turn_message_count: usize,
    pub tool_registry: ToolCallRegistry,
}

#[derive(Debug, Default)]
pub struct TaskState {
    /// First user query of the turn; set once per turn.
    pub original_query: String,
}

#[derive(Debug, Default)]
pub struct UsageState {
    pub last_call_usage: UsageMetrics,
    pub session_total_usage: UsageMetrics,
}

/// All mutable state for one interactive session.
///
/// Created at process start and owned by the front-end; the orchestrator
/// borrows it for the duration of one turn.  Messages persist across turns
/// unless explicitly cleared; runtime/task fields are reset per turn.
pub struct Session {
    pub conversation: Conversation,
    pub runtime: RuntimeState,
    pub task: TaskState,
    pub usage: UsageState,
    pub settings: Settings,
    pub current_model: String,
    /// Partial assistant text accumulated while streaming the current node;
    /// consumed by abort cleanup to preserve interrupted output.
    pub streaming_buffer: String,
    pub debug_mode: bool,
}

impl Session {
    pub fn new(settings: Settings, model: impl Into<String>) -> Self {
        let debug_mode = settings.debug_metrics;
        Self {
            conversation: Conversation::default(),
            runtime: RuntimeState::default(),
            task: TaskState::default(),
            usage: UsageState::default(),
            settings,
            current_model: model.into(),
            streaming_buffer: String::new(),
            debug_mode,
        }
    }

    /// Reset the per-turn fields at the entry of the orchestrator.
    pub fn reset_for_turn(&mut self) {
        self.runtime.iteration_count = 0;
        self.runtime.batch_counter = 0;
        self.runtime.consecutive_empty_responses = 0;
        self.runtime.turn_message_count = 0;
        self.runtime.tool_registry.clear();
        self.task.original_query.clear();
        self.streaming_buffer.clear();
    }

    pub fn set_original_query_once(&mut self, query: &str) {
        if self.task.original_query.is_empty() {
            self.task.original_query = query.to_string();
        }
    }

    /// Append a message produced by the current run, keeping the run-message
    /// counter in sync for persistence.
    pub fn push_turn_message(&mut self, message: Message) {
        self.conversation.messages.push(message);
        self.runtime.turn_message_count += 1;
    }

    /// Fold one model call's usage into the per-call and session totals,
    /// pricing it against the current model (unknown model → cost 0).
    pub fn update_usage(&mut self, usage: Option<&Usage>) {
        let Some(usage) = usage else { return };
        let cost = match get_model_pricing(&self.current_model) {
            Some(pricing) => {
                let non_cached = usage.prompt_tokens.saturating_sub(usage.cached_tokens);
                calculate_cost(
                    &pricing,
                    non_cached,
                    usage.cached_tokens,
                    usage.completion_tokens,
                )
            }
            None => 0.0,
        };
        self.usage.last_call_usage = UsageMetrics {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cached_tokens: usage.cached_tokens,
            cost,
        };
        self.usage
            .session_total_usage
            .add(&self.usage.last_call_usage);
        debug!(
            prompt = usage.prompt_tokens,
            completion = usage.completion_tokens,
            cached = usage.cached_tokens,
            cost,
            "usage updated"
        );
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
