// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! History sanitization and pruning.
//!
//! The orchestrator runs these rules to a fixed point before every turn so
//! the submitted history is well-formed: every tool return is preceded by
//! its call, no response is blank, and no two requests are adjacent.  The
//! same pipeline runs during abort cleanup, after salvaging any partially
//! streamed assistant text.

use tracing::debug;
use tunacode_model::{Message, MessageKind, Part};

use crate::processor::check_task_completion;

/// Messages at the tail of the history whose tool outputs are never pruned.
const PRUNE_PROTECT_RECENT: usize = 10;

/// Tool-return payloads above this size are candidates for pruning.
const PRUNE_MAX_RESULT_CHARS: usize = 2000;

const CHARS_PER_TOKEN: usize = 4;

const INTERRUPTED_PREFIX: &str = "[INTERRUPTED]\n\n";

/// Replace large, stale tool outputs with a compact placeholder.
///
/// Only messages before the protected tail are touched.  Returns whether
/// anything changed and the approximate number of tokens reclaimed.
pub fn prune_old_tool_outputs(messages: &mut [Message]) -> (bool, usize) {
    let protected_from = messages.len().saturating_sub(PRUNE_PROTECT_RECENT);
    let mut chars_reclaimed = 0usize;

    for message in &mut messages[..protected_from] {
        for part in &mut message.parts {
            let Part::ToolReturn(tr) = part else { continue };
            if tr.content.len() <= PRUNE_MAX_RESULT_CHARS {
                continue;
            }
            let placeholder = format!("[tool output pruned: {} chars]", tr.content.len());
            chars_reclaimed += tr.content.len() - placeholder.len();
            tr.content = placeholder;
        }
    }

    let tokens = chars_reclaimed / CHARS_PER_TOKEN;
    (tokens > 0, tokens)
}

/// Remove tool calls with no later matching return, and returns with no
/// earlier matching call.  A message emptied by the removal is dropped.
///
/// Returns whether anything changed plus the removed dangling call ids.
pub fn remove_dangling_tool_calls(messages: &mut Vec<Message>) -> (bool, Vec<String>) {
    // Global part positions, so ordering across messages is respected.
    let mut call_positions: Vec<(usize, usize, String)> = Vec::new();
    let mut return_positions: Vec<(usize, usize, String)> = Vec::new();
    for (mi, message) in messages.iter().enumerate() {
        for (pi, part) in message.parts.iter().enumerate() {
            match part {
                Part::ToolCall(tc) => call_positions.push((mi, pi, tc.tool_call_id.clone())),
                Part::ToolReturn(tr) => return_positions.push((mi, pi, tr.tool_call_id.clone())),
                _ => {}
            }
        }
    }

    let mut dangling_ids: Vec<String> = Vec::new();
    let mut to_remove: Vec<(usize, usize)> = Vec::new();

    for (mi, pi, id) in &call_positions {
        let has_later_return = return_positions
            .iter()
            .any(|(rmi, rpi, rid)| rid == id && (rmi, rpi) > (mi, pi));
        if !has_later_return {
            dangling_ids.push(id.clone());
            to_remove.push((*mi, *pi));
        }
    }
    for (mi, pi, id) in &return_positions {
        let has_earlier_call = call_positions
            .iter()
            .any(|(cmi, cpi, cid)| cid == id && (cmi, cpi) < (mi, pi));
        if !has_earlier_call {
            debug!(tool_call_id = %id, "removing orphan tool return");
            to_remove.push((*mi, *pi));
        }
    }

    if to_remove.is_empty() {
        return (false, dangling_ids);
    }

    let mut rebuilt: Vec<Message> = Vec::with_capacity(messages.len());
    for (mi, mut message) in std::mem::take(messages).into_iter().enumerate() {
        let before = message.parts.len();
        let mut pi = 0usize;
        message.parts.retain(|_| {
            let keep = !to_remove.contains(&(mi, pi));
            pi += 1;
            keep
        });
        let removed_here = message.parts.len() < before;
        if removed_here && message.parts.is_empty() {
            continue;
        }
        rebuilt.push(message);
    }
    *messages = rebuilt;

    if !dangling_ids.is_empty() {
        debug!(ids = ?dangling_ids, "removed dangling tool calls");
    }
    (true, dangling_ids)
}

/// Drop response messages whose parts are all blank.
pub fn remove_empty_responses(messages: &mut Vec<Message>) -> bool {
    let before = messages.len();
    messages.retain(|m| !m.is_empty_response());
    messages.len() < before
}

/// Collapse adjacent request messages, keeping the newer one.
pub fn remove_consecutive_requests(messages: &mut Vec<Message>) -> bool {
    let mut changed = false;
    let mut i = 0;
    while i + 1 < messages.len() {
        if messages[i].kind == MessageKind::Request && messages[i + 1].kind == MessageKind::Request
        {
            messages.remove(i);
            changed = true;
        } else {
            i += 1;
        }
    }
    changed
}

/// Run the sanitization rules until one full pass makes no change.
///
/// Terminates because every rule only shrinks the history.  Returns whether
/// anything changed at all and the dangling call ids that were removed.
pub fn run_cleanup_loop(messages: &mut Vec<Message>) -> (bool, Vec<String>) {
    let mut any_change = false;
    let mut all_dangling: Vec<String> = Vec::new();

    loop {
        let (dangling_changed, mut dangling_ids) = remove_dangling_tool_calls(messages);
        let empty_changed = remove_empty_responses(messages);
        let consecutive_changed = remove_consecutive_requests(messages);

        all_dangling.append(&mut dangling_ids);
        if !(dangling_changed || empty_changed || consecutive_changed) {
            break;
        }
        any_change = true;
    }
    (any_change, all_dangling)
}

/// Remove a trailing request so that enqueueing a new user message cannot
/// produce two consecutive requests in the next submission.
pub fn drop_trailing_request(messages: &mut Vec<Message>) -> bool {
    match messages.last() {
        Some(m) if m.kind == MessageKind::Request => {
            debug!("dropping trailing request to avoid consecutive requests");
            messages.pop();
            true
        }
        _ => false,
    }
}

/// Strip completion markers from assistant text across the history.
///
/// Applied when persisting the run's authoritative message list, so markers
/// never linger in the submitted history of the next turn.
pub fn strip_completion_markers(messages: &mut [Message]) -> bool {
    let mut changed = false;
    for message in messages {
        if message.kind != MessageKind::Response {
            continue;
        }
        for part in &mut message.parts {
            let Part::AssistantText { content } = part else { continue };
            if let Some(cleaned) = check_task_completion(content) {
                *content = cleaned;
                changed = true;
            }
        }
    }
    changed
}

/// Abort cleanup: salvage partially streamed assistant text, then sanitize.
pub fn abort_cleanup(messages: &mut Vec<Message>, partial_stream: &str) {
    if !partial_stream.trim().is_empty() {
        let content = format!("{INTERRUPTED_PREFIX}{partial_stream}");
        messages.push(Message::response(vec![Part::assistant_text(content)]));
    }
    run_cleanup_loop(messages);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
