// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};
use tunacode_model::{Message, ModelProvider, ModelRun, Node, StreamDelta};
use uuid::Uuid;

use crate::abort::AbortController;
use crate::callbacks::RequestCallbacks;
use crate::dispatch::flush_tool_buffer;
use crate::engine::Engine;
use crate::error::AgentError;
use crate::executor::ToolBuffer;
use crate::history;
use crate::processor::{process_node, EmptyReason};
use crate::registry::ToolCallRecord;
use crate::session::Session;
use crate::state::ResponseState;

const REQUEST_ID_LENGTH: usize = 8;
const RECENT_TOOL_LIMIT: usize = 3;
const TASK_PREVIEW_LENGTH: usize = 200;

/// What one completed turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub request_id: String,
    pub iterations: u32,
    pub task_completed: bool,
    /// Final output text reported by the model run, when any.
    pub result_output: Option<String>,
}

/// Drives one user turn: prepares history, iterates model nodes, intervenes
/// on empty responses, enforces the iteration cap and the global timeout,
/// and persists the run's authoritative messages.
pub struct RequestOrchestrator<'a> {
    message: String,
    model: String,
    session: &'a mut Session,
    engine: &'a Engine,
    abort: AbortController,
    callbacks: RequestCallbacks,
}

impl<'a> RequestOrchestrator<'a> {
    pub fn new(
        message: impl Into<String>,
        model: impl Into<String>,
        session: &'a mut Session,
        engine: &'a Engine,
    ) -> Self {
        Self {
            message: message.into(),
            model: model.into(),
            session,
            engine,
            abort: AbortController::new(),
            callbacks: RequestCallbacks::default(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: RequestCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_abort(mut self, abort: AbortController) -> Self {
        self.abort = abort;
        self
    }

    /// Run the turn, wrapped in the global request timeout when configured.
    pub async fn run(mut self) -> Result<TurnOutcome, AgentError> {
        let Some(timeout_secs) = self.session.settings.global_request_timeout else {
            return self.run_impl().await;
        };
        let result =
            tokio::time::timeout(Duration::from_secs_f64(timeout_secs), self.run_impl()).await;
        match result {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                // The cached HTTP client may be mid-request; rebuild next turn.
                self.engine.invalidate(&self.model);
                warn!(
                    timeout = timeout_secs,
                    "global request timeout; provider cache invalidated"
                );
                Err(AgentError::GlobalRequestTimeout {
                    timeout: timeout_secs,
                })
            }
        }
    }

    async fn run_impl(&mut self) -> Result<TurnOutcome, AgentError> {
        let request_id = new_request_id();
        self.session.reset_for_turn();
        self.session.runtime.request_id = request_id.clone();
        self.session.set_original_query_once(&self.message);
        info!(request_id = %request_id, "request started");

        let (message_history, baseline_len) = self.prepare_history();
        let provider = self
            .engine
            .get_or_create(&self.model, &self.session.settings)
            .map_err(AgentError::Model)?;

        let result = self
            .run_iterations(provider, message_history, baseline_len)
            .await;
        if matches!(result, Err(AgentError::UserAbort)) {
            self.handle_abort_cleanup();
        }
        result
    }

    /// Sanitize the conversation in place and snapshot the submission copy.
    ///
    /// Idempotent: running it twice in a row yields the same history.
    fn prepare_history(&mut self) -> (Vec<Message>, usize) {
        let messages = &mut self.session.conversation.messages;

        let (_pruned, tokens_reclaimed) = history::prune_old_tool_outputs(messages);
        if tokens_reclaimed > 0 {
            debug!(tokens_reclaimed, "history pruned");
        }

        let (_changed, dangling) = history::run_cleanup_loop(messages);
        if !dangling.is_empty() {
            debug!(ids = ?dangling, "dangling tool calls removed before submission");
        }

        if !self.message.is_empty() {
            history::drop_trailing_request(messages);
        }

        let baseline_len = messages.len();
        (messages.clone(), baseline_len)
    }

    async fn run_iterations(
        &mut self,
        provider: Arc<dyn ModelProvider>,
        message_history: Vec<Message>,
        baseline_len: usize,
    ) -> Result<TurnOutcome, AgentError> {
        let callbacks = self.callbacks.clone();
        let abort = self.abort.clone();
        let mut buffer = ToolBuffer::new();
        let response_state = ResponseState::new();

        let mut run = tokio::select! {
            biased;
            _ = abort.wait_for_abort() => return Err(AgentError::UserAbort),
            opened = provider.iter(&self.message, message_history) => {
                opened.map_err(AgentError::Model)?
            }
        };

        let max_iterations = self.session.settings.max_iterations.max(1);
        let request_delay = self.session.settings.request_delay;
        let mut iteration: u32 = 1;
        let mut result_output: Option<String> = None;

        loop {
            abort.check_abort().await?;
            if request_delay > 0.0 {
                pre_request_delay(request_delay, &callbacks, &abort).await?;
            }

            let next = tokio::select! {
                biased;
                _ = abort.wait_for_abort() => return Err(AgentError::UserAbort),
                node = run.next_node() => node,
            };
            let Some(node_result) = next else { break };
            let mut node = node_result.map_err(AgentError::Model)?;

            self.session.runtime.iteration_count = iteration;
            debug!(iteration, node = ?node, "processing node");

            if node.is_model_request() && callbacks.streaming.is_some() {
                stream_node_deltas(&mut node, self.session, &callbacks, &abort).await?;
            }
            if let Some(output) = node.result.as_ref().and_then(|r| r.output.clone()) {
                result_output = Some(output);
            }

            let outcome = process_node(
                node,
                self.session,
                &mut buffer,
                &response_state,
                &callbacks,
                &abort,
            )
            .await?;

            if outcome.empty {
                self.session.runtime.consecutive_empty_responses += 1;
            } else {
                self.session.runtime.consecutive_empty_responses = 0;
            }
            if outcome.empty && self.session.runtime.consecutive_empty_responses >= 1 {
                self.send_empty_response_notice(outcome.reason, iteration, &callbacks);
                self.session.runtime.consecutive_empty_responses = 0;
            }

            if response_state.task_completed() {
                debug!(iteration, "task completed");
                break;
            }
            if iteration >= max_iterations {
                debug!(max_iterations, "iteration cap reached");
                break;
            }
            iteration += 1;
        }

        // Reads buffered by the final node still have to run.
        flush_tool_buffer(self.session, &mut buffer, &callbacks, &abort).await?;

        self.persist_run_messages(&*run, baseline_len);
        info!(request_id = %self.session.runtime.request_id, "request complete");

        Ok(TurnOutcome {
            request_id: self.session.runtime.request_id.clone(),
            iterations: self.session.runtime.iteration_count,
            task_completed: response_state.task_completed(),
            result_output,
        })
    }

    /// Replace the conversation with the run's authoritative message list,
    /// keeping messages appended externally while the run was in flight.
    fn persist_run_messages(&mut self, run: &dyn ModelRun, baseline_len: usize) {
        let mut merged = run.all_messages();
        history::strip_completion_markers(&mut merged);

        let conversation = &mut self.session.conversation.messages;
        let external_start =
            (baseline_len + self.session.runtime.turn_message_count).min(conversation.len());
        let external: Vec<Message> = conversation[external_start..].to_vec();
        merged.extend(external);
        *conversation = merged;
    }

    fn send_empty_response_notice(
        &self,
        reason: Option<EmptyReason>,
        iteration: u32,
        callbacks: &RequestCallbacks,
    ) {
        let reason = reason.map(EmptyReason::as_str).unwrap_or("empty");
        warn!(reason, iteration, "empty response detected");
        let Some(notice_cb) = &callbacks.notice else {
            return;
        };

        let recent = self
            .session
            .runtime
            .tool_registry
            .recent_calls(RECENT_TOOL_LIMIT);
        let tools_context = if recent.is_empty() {
            "No tools used yet".to_string()
        } else {
            let described: Vec<String> = recent.iter().map(|r| describe_tool(r)).collect();
            format!("Recent tools: {}", described.join(", "))
        };

        let task_preview: String = self
            .session
            .task
            .original_query
            .chars()
            .take(TASK_PREVIEW_LENGTH)
            .collect();

        let notice = format!(
            "Response appears {reason} or incomplete. Let's troubleshoot and try again.\n\
             \n\
             Task: {task_preview}\n\
             {tools_context}\n\
             Attempt: {iteration}\n\
             \n\
             Please take one of these specific actions:\n\
             1. Search yielded no results? Try alternative search terms or broader patterns.\n\
             2. Found what you need? State the result and finish with the completion marker.\n\
             3. Encountering a blocker? Explain the specific issue preventing progress.\n\
             4. Need more context? Use list_dir or expand your search scope.\n\
             \n\
             Execute at least one tool or provide substantial analysis; if stuck, describe \
             what you have tried and what is blocking you."
        );
        notice_cb(&notice);
    }

    fn handle_abort_cleanup(&mut self) {
        let partial = std::mem::take(&mut self.session.streaming_buffer);
        history::abort_cleanup(&mut self.session.conversation.messages, &partial);
        self.session.runtime.tool_registry.clear();
        if self.engine.invalidate(&self.model) {
            debug!(model = %self.model, "provider cache invalidated after abort");
        }
    }
}

/// One-call entry point matching the front-end's needs.
pub async fn process_request(
    message: &str,
    model: &str,
    session: &mut Session,
    engine: &Engine,
    callbacks: RequestCallbacks,
    abort: AbortController,
) -> Result<TurnOutcome, AgentError> {
    RequestOrchestrator::new(message, model, session, engine)
        .with_callbacks(callbacks)
        .with_abort(abort)
        .run()
        .await
}

fn new_request_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..REQUEST_ID_LENGTH].to_string()
}

/// Forward one node's token deltas to the streaming sink, accumulating the
/// partial text for abort recovery.  A failing stream degrades to
/// non-streaming processing of the node.
async fn stream_node_deltas(
    node: &mut Node,
    session: &mut Session,
    callbacks: &RequestCallbacks,
    abort: &AbortController,
) -> Result<(), AgentError> {
    let Some(streaming_cb) = callbacks.streaming.clone() else {
        return Ok(());
    };
    let Some(mut deltas) = node.deltas.take() else {
        return Ok(());
    };

    session.streaming_buffer.clear();
    loop {
        let event = tokio::select! {
            biased;
            _ = abort.wait_for_abort() => return Err(AgentError::UserAbort),
            ev = deltas.next() => ev,
        };
        let Some(event) = event else { break };
        match event {
            Ok(StreamDelta::Content(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                session.streaming_buffer.push_str(&chunk);
                streaming_cb(chunk).await;
            }
            Err(err) => {
                warn!(error = %err, "model stream failed; continuing without streaming for this node");
                break;
            }
        }
    }
    Ok(())
}

/// Fixed pre-request throttle with a one-second countdown to the status hook.
async fn pre_request_delay(
    delay_secs: f64,
    callbacks: &RequestCallbacks,
    abort: &AbortController,
) -> Result<(), AgentError> {
    let mut remaining = delay_secs;
    while remaining > 0.0 {
        abort.check_abort().await?;
        if let Some(status_cb) = &callbacks.status {
            status_cb(&format!("next request in {}s", remaining.ceil() as u64));
        }
        let step = remaining.min(1.0);
        tokio::select! {
            biased;
            _ = abort.wait_for_abort() => return Err(AgentError::UserAbort),
            _ = tokio::time::sleep(Duration::from_secs_f64(step)) => {}
        }
        remaining -= step;
    }
    Ok(())
}

fn describe_tool(record: &ToolCallRecord) -> String {
    let arg = |key: &str| {
        record
            .args
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    match record.tool_name.as_str() {
        "grep" | "glob" => arg("pattern")
            .map(|p| format!("{}('{}')", record.tool_name, p))
            .unwrap_or_else(|| record.tool_name.clone()),
        "read_file" => arg("file_path")
            .or_else(|| arg("filepath"))
            .map(|p| format!("read_file('{p}')"))
            .unwrap_or_else(|| record.tool_name.clone()),
        _ => record.tool_name.clone(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
