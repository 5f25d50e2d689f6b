// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use regex::Regex;
use tracing::{debug, warn};
use tunacode_model::{Message, Node, Part};

use crate::abort::AbortController;
use crate::callbacks::{RequestCallbacks, ToolResultEvent};
use crate::dispatch::{dispatch_tools, ToolDispatchResult};
use crate::error::AgentError;
use crate::executor::ToolBuffer;
use crate::session::Session;
use crate::state::{AgentState, ResponseState};

const TOOL_RESULT_STATUS_COMPLETED: &str = "completed";
const CONTENT_JOINER: &str = " ";
const THOUGHT_PREVIEW_LENGTH: usize = 80;

/// Phrases that signal the model intends further work.
const PENDING_PHRASES: &[&str] = &[
    "let me",
    "i'll check",
    "i will",
    "going to",
    "about to",
    "need to check",
    "let's check",
    "i should",
    "need to find",
    "let me see",
    "i'll look",
    "let me search",
    "let me find",
];

/// Action gerunds that suggest an unfinished step when they end the text.
const ACTION_ENDINGS: &[&str] = &[
    "checking",
    "searching",
    "looking",
    "finding",
    "reading",
    "analyzing",
];

/// Why a node counted as an empty response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyReason {
    Empty,
    Truncated,
}

impl EmptyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EmptyReason::Empty => "empty",
            EmptyReason::Truncated => "truncated",
        }
    }
}

/// Result of processing one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeOutcome {
    pub empty: bool,
    pub reason: Option<EmptyReason>,
}

impl NodeOutcome {
    fn ok() -> Self {
        Self { empty: false, reason: None }
    }

    fn empty(reason: EmptyReason) -> Self {
        Self { empty: true, reason: Some(reason) }
    }
}

// ─── Completion marker detection ──────────────────────────────────────────────

/// Check a text for a task-completion marker.
///
/// Returns the content with the marker line cleaned when one is found; the
/// remainder of the marker line (the model's closing message) is preserved.
pub fn check_task_completion(content: &str) -> Option<String> {
    if content.is_empty() {
        return None;
    }
    let markers = [
        Regex::new(r"(?i)^\s*TUNACODE\s+DONE:\s*").unwrap(),
        Regex::new(r"(?i)^\s*TUNACODE[_\s]+TASK_COMPLETE\s*:?\s*").unwrap(),
    ];

    let lines: Vec<&str> = content.split('\n').collect();
    for (idx, line) in lines.iter().enumerate() {
        for pattern in &markers {
            if let Some(m) = pattern.find(line) {
                let remainder = line[m.end()..].trim();
                let mut cleaned: Vec<&str> = lines[..idx].to_vec();
                if !remainder.is_empty() {
                    cleaned.push(remainder);
                }
                cleaned.extend(lines[idx + 1..].iter().copied());
                return Some(cleaned.join("\n").trim().to_string());
            }
        }
    }
    None
}

// ─── Truncation heuristic ─────────────────────────────────────────────────────

/// Heuristic: does this text look cut off mid-structure or mid-word?
pub fn check_for_truncation(content: &str) -> bool {
    if content.is_empty() {
        return false;
    }

    // Trailing single ellipsis (not a sentence ending in four dots).
    if (content.ends_with("...") || content.ends_with('…'))
        && !(content.ends_with("....") || content.ends_with("…."))
    {
        return true;
    }

    // Mid-word cutoff: ends on a letter whose last word looks incomplete.
    if content.chars().last().is_some_and(|c| c.is_alphabetic()) {
        if let Some(last_word) = content.split_whitespace().last() {
            let lower = last_word.to_lowercase();
            const INCOMPLETE_PREFIXES: &[&str] =
                &["referen", "inte", "proces", "analy", "deve", "imple", "execu"];
            const COMPLETE_SUFFIXES: &[&str] = &[
                "ing", "ed", "ly", "er", "est", "tion", "ment", "ness", "ity", "ous", "ive",
                "able", "ible",
            ];
            if INCOMPLETE_PREFIXES.iter().any(|p| lower.ends_with(p)) {
                return true;
            }
            if last_word.chars().count() > 2
                && !COMPLETE_SUFFIXES.iter().any(|s| lower.ends_with(s))
            {
                return true;
            }
        }
    }

    // Unclosed code fence.
    if content.matches("```").count() % 2 != 0 {
        return true;
    }

    // More openers than closers.
    let opens = content.matches(['[', '(', '{']).count();
    let closes = content.matches([']', ')', '}']).count();
    opens > closes
}

// ─── Node processing ──────────────────────────────────────────────────────────

/// Process a single node from the model iterator.
///
/// Ordering is fixed: record request → transition → record thought → update
/// usage → scan parts (completion after structured-tool detection, so
/// premature completions are caught) → dispatch tools → transition.
pub async fn process_node(
    node: Node,
    session: &mut Session,
    buffer: &mut ToolBuffer,
    response_state: &ResponseState,
    callbacks: &RequestCallbacks,
    abort: &AbortController,
) -> Result<NodeOutcome, AgentError> {
    let mut has_non_empty_content = false;
    let mut appears_truncated = false;
    let mut empty_response_detected = false;

    if response_state.can_transition_to(AgentState::Assistant) {
        response_state.transition_to(AgentState::Assistant)?;
    }

    if let Some(request) = node.request {
        if session.debug_mode {
            for (idx, part) in request.parts.iter().enumerate() {
                debug!(idx, part = ?part, "model request part");
            }
        }
        emit_tool_returns(&request, session, callbacks)?;
        session.push_turn_message(request);
    }

    if let Some(thought) = node.thought {
        let preview: String = thought.chars().take(THOUGHT_PREVIEW_LENGTH).collect();
        debug!(preview = %preview.replace('\n', "\\n"), "thought");
        session.push_turn_message(Message::response(vec![Part::thought(thought)]));
    }

    let mut dispatched = ToolDispatchResult {
        has_tool_calls: false,
        used_fallback: false,
    };

    if let Some(response) = &node.model_response {
        session.update_usage(response.usage.as_ref());
        if session.debug_mode {
            for (idx, part) in response.parts.iter().enumerate() {
                debug!(idx, part = ?part, "model response part");
            }
        }

        let has_structured_tools = response.has_tool_calls();
        let mut content_parts: Vec<&str> = Vec::new();
        for part in &response.parts {
            if let Part::AssistantText { content } = part {
                if !content.trim().is_empty() {
                    has_non_empty_content = true;
                    content_parts.push(content);
                }
            }
        }

        let combined_content = content_parts.join(CONTENT_JOINER).trim().to_string();
        if !combined_content.is_empty() {
            appears_truncated = check_for_truncation(&combined_content);
        }

        scan_for_completion(
            response,
            has_structured_tools,
            &combined_content,
            session.runtime.iteration_count,
            response_state,
        );

        let no_tools = !has_structured_tools;
        if (!has_non_empty_content && no_tools) || (appears_truncated && no_tools) {
            empty_response_detected = true;
        }

        dispatched = dispatch_tools(
            &response.parts,
            session,
            buffer,
            response_state,
            callbacks,
            abort,
        )
        .await?;
    }

    if response_state.can_transition_to(AgentState::Response) && !response_state.is_completed() {
        response_state.transition_to(AgentState::Response)?;
    }

    if let Some(output) = node.result.as_ref().and_then(|r| r.output.as_deref()) {
        if !output.is_empty() {
            response_state.set_has_user_response(true);
        }
    }

    if empty_response_detected {
        // Fallback-extracted calls still count as tool work this node.
        if dispatched.has_tool_calls {
            return Ok(NodeOutcome::ok());
        }
        let reason = if appears_truncated {
            EmptyReason::Truncated
        } else {
            EmptyReason::Empty
        };
        return Ok(NodeOutcome::empty(reason));
    }
    Ok(NodeOutcome::ok())
}

/// Completion-marker validation for one response.
///
/// A marker alongside structured tool calls is premature: the marker is
/// stripped at persistence time but the turn continues so the tools run.  A
/// clean marker completes the turn; stated intentions on the very first
/// iteration are logged as suspicious but still accepted.
fn scan_for_completion(
    response: &Message,
    has_structured_tools: bool,
    combined_content: &str,
    iteration_count: u32,
    response_state: &ResponseState,
) {
    for part in &response.parts {
        let Part::AssistantText { content } = part else {
            continue;
        };
        if check_task_completion(content).is_none() {
            continue;
        }

        if has_structured_tools {
            let pending = response.tool_calls().count();
            warn!(
                pending_tools = pending,
                "premature completion detected; marker overridden so tools can run"
            );
        } else {
            let lower = combined_content.to_lowercase();
            let has_pending_intention = PENDING_PHRASES.iter().any(|p| lower.contains(p));
            let ends_with_action = ACTION_ENDINGS
                .iter()
                .any(|e| lower.trim_end().ends_with(e));
            if (has_pending_intention || ends_with_action) && iteration_count <= 1 {
                warn!(
                    iteration = iteration_count,
                    "suspicious completion: stated intentions but completing early"
                );
            }
            response_state.set_task_completed(true);
            response_state.set_has_user_response(true);
        }
        break;
    }
}

/// Complete registry records and notify the UI for every tool return carried
/// by an incoming request.
fn emit_tool_returns(
    request: &Message,
    session: &mut Session,
    callbacks: &RequestCallbacks,
) -> Result<(), AgentError> {
    for part in &request.parts {
        let Part::ToolReturn(tr) = part else { continue };
        debug!(tool = %tr.tool_name, id = %tr.tool_call_id, "tool return received");

        let args = session.runtime.tool_registry.get_args(&tr.tool_call_id)?;
        session
            .runtime
            .tool_registry
            .complete(&tr.tool_call_id, Some(tr.content.clone()));

        if let Some(cb) = &callbacks.tool_result {
            cb(&ToolResultEvent {
                tool_name: tr.tool_name.clone(),
                status: TOOL_RESULT_STATUS_COMPLETED,
                args,
                result: Some(tr.content.clone()),
                error: None,
            });
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ToolCallState;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tunacode_config::Settings;

    // ── Completion markers ────────────────────────────────────────────────────

    #[test]
    fn detects_done_marker_and_strips_it() {
        let cleaned = check_task_completion("TUNACODE DONE: all tests pass").unwrap();
        assert_eq!(cleaned, "all tests pass");
    }

    #[test]
    fn detects_task_complete_marker() {
        assert!(check_task_completion("TUNACODE_TASK_COMPLETE: finished").is_some());
        assert!(check_task_completion("tunacode task_complete finished").is_some());
    }

    #[test]
    fn marker_is_case_insensitive_and_may_be_indented() {
        let cleaned = check_task_completion("  tunacode done:   result here").unwrap();
        assert_eq!(cleaned, "result here");
    }

    #[test]
    fn marker_on_a_later_line_is_found() {
        let text = "Summary of changes\nTUNACODE DONE: shipped\ntrailing notes";
        let cleaned = check_task_completion(text).unwrap();
        assert_eq!(cleaned, "Summary of changes\nshipped\ntrailing notes");
    }

    #[test]
    fn bare_marker_cleans_to_empty() {
        assert_eq!(check_task_completion("TUNACODE DONE:").unwrap(), "");
    }

    #[test]
    fn no_marker_returns_none() {
        assert!(check_task_completion("just a normal response").is_none());
        assert!(check_task_completion("").is_none());
        // Marker must start the line.
        assert!(check_task_completion("see TUNACODE DONE: mid-sentence").is_none());
    }

    // ── Truncation heuristic ──────────────────────────────────────────────────

    #[test]
    fn trailing_ellipsis_is_truncated() {
        assert!(check_for_truncation("I will now check the file..."));
        assert!(check_for_truncation("And then…"));
    }

    #[test]
    fn four_dots_is_not_truncated() {
        assert!(!check_for_truncation("That is all there is to it...."));
    }

    #[test]
    fn known_incomplete_prefix_is_truncated() {
        assert!(check_for_truncation("see the referen"));
        assert!(check_for_truncation("still proces"));
    }

    #[test]
    fn common_suffix_word_is_complete() {
        assert!(!check_for_truncation("the task is pending."));
        assert!(!check_for_truncation("we finished processing"));
        assert!(!check_for_truncation("it was implemented"));
    }

    #[test]
    fn unknown_long_trailing_word_counts_as_truncated() {
        assert!(check_for_truncation("opening the databa"));
    }

    #[test]
    fn odd_code_fence_count_is_truncated() {
        assert!(check_for_truncation("here:\n```rust\nfn main() {}\n"));
        assert!(!check_for_truncation("here:\n```rust\nfn main() {}\n```\ndone."));
    }

    #[test]
    fn unbalanced_brackets_are_truncated() {
        assert!(check_for_truncation("call foo(bar, baz."));
        assert!(!check_for_truncation("call foo(bar) instead."));
    }

    #[test]
    fn empty_text_is_not_truncated() {
        assert!(!check_for_truncation(""));
    }

    // ── process_node ──────────────────────────────────────────────────────────

    fn session() -> Session {
        Session::new(Settings::default(), "scripted-mock-model")
    }

    fn node_with_response(parts: Vec<Part>) -> Node {
        Node {
            model_response: Some(Message::response(parts)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_response_is_reported() {
        let mut sess = session();
        let mut buffer = ToolBuffer::new();
        let state = ResponseState::new();
        let cbs = RequestCallbacks::new();
        let abort = AbortController::new();

        let node = node_with_response(vec![Part::assistant_text("")]);
        let outcome = process_node(node, &mut sess, &mut buffer, &state, &cbs, &abort)
            .await
            .unwrap();
        assert!(outcome.empty);
        assert_eq!(outcome.reason, Some(EmptyReason::Empty));
    }

    #[tokio::test]
    async fn truncated_response_is_reported() {
        let mut sess = session();
        let mut buffer = ToolBuffer::new();
        let state = ResponseState::new();
        let cbs = RequestCallbacks::new();
        let abort = AbortController::new();

        let node = node_with_response(vec![Part::assistant_text("I am now analy")]);
        let outcome = process_node(node, &mut sess, &mut buffer, &state, &cbs, &abort)
            .await
            .unwrap();
        assert!(outcome.empty);
        assert_eq!(outcome.reason, Some(EmptyReason::Truncated));
    }

    #[tokio::test]
    async fn normal_text_response_is_not_empty() {
        let mut sess = session();
        let mut buffer = ToolBuffer::new();
        let state = ResponseState::new();
        let cbs = RequestCallbacks::new();
        let abort = AbortController::new();

        let node = node_with_response(vec![Part::assistant_text("All done here.")]);
        let outcome = process_node(node, &mut sess, &mut buffer, &state, &cbs, &abort)
            .await
            .unwrap();
        assert!(!outcome.empty);
        assert_eq!(state.current_state(), AgentState::Response);
    }

    #[tokio::test]
    async fn completion_marker_completes_the_turn() {
        let mut sess = session();
        let mut buffer = ToolBuffer::new();
        let state = ResponseState::new();
        let cbs = RequestCallbacks::new();
        let abort = AbortController::new();

        let node = node_with_response(vec![Part::assistant_text("TUNACODE DONE: shipped")]);
        process_node(node, &mut sess, &mut buffer, &state, &cbs, &abort)
            .await
            .unwrap();
        assert!(state.task_completed());
        assert!(state.has_user_response());
    }

    #[tokio::test]
    async fn premature_completion_with_tools_does_not_complete() {
        let mut sess = session();
        let mut buffer = ToolBuffer::new();
        let state = ResponseState::new();
        let cbs = RequestCallbacks::new().with_tool(|_p| async { Ok("ok".into()) });
        let abort = AbortController::new();

        let node = node_with_response(vec![
            Part::assistant_text("TUNACODE DONE: finished"),
            Part::tool_call("t1", "read_file", json!({"file_path": "a.py"})),
        ]);
        let outcome = process_node(node, &mut sess, &mut buffer, &state, &cbs, &abort)
            .await
            .unwrap();

        assert!(!state.task_completed(), "tools must run first");
        assert!(!outcome.empty);
        // The read-only call got buffered for the batch flush.
        assert_eq!(buffer.len(), 1);
    }

    #[tokio::test]
    async fn suspicious_completion_is_still_accepted() {
        let mut sess = session();
        sess.runtime.iteration_count = 1;
        let mut buffer = ToolBuffer::new();
        let state = ResponseState::new();
        let cbs = RequestCallbacks::new();
        let abort = AbortController::new();

        let node = node_with_response(vec![Part::assistant_text(
            "TUNACODE DONE: let me check the config",
        )]);
        process_node(node, &mut sess, &mut buffer, &state, &cbs, &abort)
            .await
            .unwrap();
        assert!(state.task_completed());
    }

    #[tokio::test]
    async fn tool_returns_complete_registry_and_fire_callback() {
        let mut sess = session();
        sess.runtime.tool_registry.register(
            "t1",
            "read_file",
            [("file_path".to_string(), json!("main.py"))]
                .into_iter()
                .collect(),
        );
        let mut buffer = ToolBuffer::new();
        let state = ResponseState::new();
        let events: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let sink = Arc::clone(&events);
        let cbs = RequestCallbacks::new().on_tool_result(move |ev| {
            sink.lock()
                .unwrap()
                .push((ev.tool_name.clone(), ev.result.clone().unwrap_or_default()));
        });
        let abort = AbortController::new();

        let node = Node {
            request: Some(Message::request(vec![Part::tool_return(
                "t1",
                "read_file",
                "<file bytes>",
            )])),
            ..Default::default()
        };
        process_node(node, &mut sess, &mut buffer, &state, &cbs, &abort)
            .await
            .unwrap();

        let rec = sess.runtime.tool_registry.get("t1").unwrap();
        assert_eq!(rec.state, ToolCallState::Completed);
        assert_eq!(rec.result.as_deref(), Some("<file bytes>"));
        assert_eq!(
            events.lock().unwrap().as_slice(),
            [("read_file".to_string(), "<file bytes>".to_string())]
        );
    }

    #[tokio::test]
    async fn unmatched_tool_return_is_a_state_error() {
        let mut sess = session();
        let mut buffer = ToolBuffer::new();
        let state = ResponseState::new();
        let cbs = RequestCallbacks::new();
        let abort = AbortController::new();

        let node = Node {
            request: Some(Message::request(vec![Part::tool_return(
                "ghost",
                "read_file",
                "data",
            )])),
            ..Default::default()
        };
        let err = process_node(node, &mut sess, &mut buffer, &state, &cbs, &abort)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::State(_)));
    }

    #[tokio::test]
    async fn thought_is_recorded_in_conversation() {
        let mut sess = session();
        let mut buffer = ToolBuffer::new();
        let state = ResponseState::new();
        let cbs = RequestCallbacks::new();
        let abort = AbortController::new();

        let node = Node {
            thought: Some("planning the next read".into()),
            ..Default::default()
        };
        process_node(node, &mut sess, &mut buffer, &state, &cbs, &abort)
            .await
            .unwrap();

        assert_eq!(sess.conversation.messages.len(), 1);
        assert!(matches!(
            sess.conversation.messages[0].parts[0],
            Part::Thought { .. }
        ));
        assert_eq!(sess.runtime.turn_message_count, 1);
    }

    #[tokio::test]
    async fn result_output_sets_has_user_response() {
        let mut sess = session();
        let mut buffer = ToolBuffer::new();
        let state = ResponseState::new();
        let cbs = RequestCallbacks::new();
        let abort = AbortController::new();

        let node = Node {
            result: Some(tunacode_model::NodeResult {
                output: Some("final answer".into()),
            }),
            ..Default::default()
        };
        process_node(node, &mut sess, &mut buffer, &state, &cbs, &abort)
            .await
            .unwrap();
        assert!(state.has_user_response());
    }
}
