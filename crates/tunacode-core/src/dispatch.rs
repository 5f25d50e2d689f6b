// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;
use tracing::{debug, warn};
use tunacode_model::{Part, ToolCallPart};
use uuid::Uuid;

use crate::abort::AbortController;
use crate::callbacks::RequestCallbacks;
use crate::error::{AgentError, ToolError};
use crate::executor::{execute_tools_parallel, is_read_only_tool, ToolBuffer};
use crate::registry::ToolArgs;
use crate::session::Session;
use crate::state::{AgentState, ResponseState};

pub const UNKNOWN_TOOL_NAME: &str = "unknown";

/// Characters that never appear in a valid tool name.
const INVALID_TOOL_NAME_CHARS: &[char] =
    &['<', '>', '(', ')', '{', '}', '[', ']', '"', '\'', '`'];
const MAX_TOOL_NAME_LEN: usize = 50;

const TOOL_BATCH_PREVIEW_COUNT: usize = 3;
const TOOL_NAME_JOINER: &str = ", ";
const TOOL_NAME_SUFFIX: &str = "...";

/// Summary of tool dispatch work for one model response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolDispatchResult {
    pub has_tool_calls: bool,
    pub used_fallback: bool,
}

// ─── Name and argument normalization ──────────────────────────────────────────

/// Strip whitespace; an empty name becomes the `"unknown"` sentinel.
pub fn normalize_tool_name(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        UNKNOWN_TOOL_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Malformed-looking names signal a model formatting bug; they still pass
/// through, but get flagged in the debug log.
pub fn is_suspicious_tool_name(tool_name: &str) -> bool {
    if tool_name.is_empty() || tool_name.len() > MAX_TOOL_NAME_LEN {
        return true;
    }
    tool_name.chars().any(|c| INVALID_TOOL_NAME_CHARS.contains(&c))
}

/// Tolerant argument parser: accepts an already-decoded object or a
/// JSON-encoded string.  Invalid escape sequences from the model are repaired
/// before giving up; anything unparseable degrades to an empty object.
pub fn parse_tool_args(raw: &Value) -> ToolArgs {
    match raw {
        Value::Object(map) => map.clone(),
        Value::Null => ToolArgs::new(),
        Value::String(s) => {
            if s.trim().is_empty() {
                return ToolArgs::new();
            }
            match serde_json::from_str::<Value>(s) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    warn!(value_type = ?other, "tool args decoded to a non-object; substituting {{}}");
                    ToolArgs::new()
                }
                Err(parse_err) => {
                    let repaired = fix_invalid_json_escapes(s);
                    match serde_json::from_str::<Value>(&repaired) {
                        Ok(Value::Object(map)) => {
                            warn!("repaired invalid JSON escapes in tool args");
                            map
                        }
                        _ => {
                            warn!(error = %parse_err, "unparseable tool args; substituting {{}}");
                            ToolArgs::new()
                        }
                    }
                }
            }
        }
        other => {
            warn!(value_type = ?other, "unexpected tool args value; substituting {{}}");
            ToolArgs::new()
        }
    }
}

/// Walk a JSON string and escape any invalid escape sequence inside string
/// values.  Valid JSON escapes are `" \ / b f n r t u`; anything else
/// (e.g. `\c`, `\(`) becomes `\\X` so the value round-trips through serde.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}

// ─── Text-fallback tool-call extraction ───────────────────────────────────────

/// Cheap pre-scan: does the text plausibly embed a tool invocation?
pub fn has_potential_tool_call(text: &str) -> bool {
    text.contains("\"tool\"") || text.contains("\"tool_name\"") || text.contains("<tool_call>")
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub tool_name: String,
    pub args: ToolArgs,
}

/// Scan free text (including fenced code blocks) for JSON objects of the
/// shape `{"tool": <name>, "args": {...}}`.  Tolerant of surrounding prose;
/// objects that parse but lack a tool name are skipped.
pub fn parse_tool_calls_from_text(text: &str) -> Vec<ParsedToolCall> {
    let mut calls = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let Some(object_len) = balanced_object_len(&text[i..]) else {
            i += 1;
            continue;
        };
        let candidate = &text[i..i + object_len];
        if let Some(call) = parse_candidate(candidate) {
            calls.push(call);
            i += object_len;
        } else {
            i += 1;
        }
    }
    calls
}

/// Length of the balanced JSON object starting at the first byte of `text`
/// (which must be `{`), honouring strings and escapes.  `None` if unbalanced.
fn balanced_object_len(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_candidate(candidate: &str) -> Option<ParsedToolCall> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let obj = value.as_object()?;
    let name = obj
        .get("tool")
        .or_else(|| obj.get("tool_name"))?
        .as_str()?
        .trim();
    if name.is_empty() {
        return None;
    }
    let args = match obj.get("args") {
        Some(raw) => parse_tool_args(raw),
        None => ToolArgs::new(),
    };
    Some(ParsedToolCall {
        tool_name: name.to_string(),
        args,
    })
}

fn new_fallback_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("fallback_{}", &id[..8])
}

// ─── Dispatch ─────────────────────────────────────────────────────────────────

/// Extract, register and schedule the tool calls of one model response.
///
/// Structured `tool-call` parts are the primary path; when none are present
/// and the text looks like it embeds tool invocations, the fallback parser
/// synthesizes parts with fresh ids and dispatches them identically.
///
/// Batching: read-only tools queue in `buffer`; any mutating tool first
/// flushes the pending batch, then runs alone.  The remaining buffer is
/// flushed by the orchestrator at turn end.
pub async fn dispatch_tools(
    parts: &[Part],
    session: &mut Session,
    buffer: &mut ToolBuffer,
    response_state: &ResponseState,
    callbacks: &RequestCallbacks,
    abort: &AbortController,
) -> Result<ToolDispatchResult, AgentError> {
    let mut has_tool_calls = false;
    let mut structured_seen = false;

    for part in parts {
        let Part::ToolCall(tc) = part else { continue };
        structured_seen = true;
        has_tool_calls = true;

        if response_state.can_transition_to(AgentState::ToolExecution) {
            response_state.transition_to(AgentState::ToolExecution)?;
        }

        let exec_part = register_tool_call(session, tc);
        route_tool_call(session, buffer, exec_part, callbacks, abort).await?;
    }

    let mut used_fallback = false;
    if !structured_seen && callbacks.tool.is_some() {
        let fallback_parts = extract_fallback_tool_calls(parts, session, response_state)?;
        if !fallback_parts.is_empty() {
            used_fallback = true;
            has_tool_calls = true;
            debug!(count = fallback_parts.len(), "fallback tool parsing used");
            for part in fallback_parts {
                route_tool_call(session, buffer, part, callbacks, abort).await?;
            }
        }
    }

    if has_tool_calls && response_state.can_transition_to(AgentState::Response) {
        response_state.transition_to(AgentState::Response)?;
    }

    Ok(ToolDispatchResult {
        has_tool_calls,
        used_fallback,
    })
}

/// Normalize, log and register one structured tool call.  Parts are treated
/// as immutable: when normalization changes the name, a fresh part is built.
fn register_tool_call(session: &mut Session, tc: &ToolCallPart) -> ToolCallPart {
    let name = normalize_tool_name(&tc.tool_name);
    if is_suspicious_tool_name(&name) {
        let preview: String = name.chars().take(100).collect();
        debug!(
            tool_name_preview = %preview,
            tool_name_len = name.len(),
            "suspicious tool name detected"
        );
    }
    let args = parse_tool_args(&tc.args);
    session
        .runtime
        .tool_registry
        .register(&tc.tool_call_id, &name, args);

    if name != tc.tool_name {
        ToolCallPart {
            tool_call_id: tc.tool_call_id.clone(),
            tool_name: name,
            args: tc.args.clone(),
        }
    } else {
        tc.clone()
    }
}

fn extract_fallback_tool_calls(
    parts: &[Part],
    session: &mut Session,
    response_state: &ResponseState,
) -> Result<Vec<ToolCallPart>, AgentError> {
    let segments: Vec<&str> = parts
        .iter()
        .filter_map(|p| match p {
            Part::AssistantText { content } if !content.is_empty() => Some(content.as_str()),
            _ => None,
        })
        .collect();
    if segments.is_empty() {
        return Ok(Vec::new());
    }

    let text = segments.join("\n");
    if !has_potential_tool_call(&text) {
        return Ok(Vec::new());
    }

    let parsed = parse_tool_calls_from_text(&text);
    if parsed.is_empty() {
        debug!("fallback indicators found but no valid tool calls extracted");
        return Ok(Vec::new());
    }

    if response_state.can_transition_to(AgentState::ToolExecution) {
        response_state.transition_to(AgentState::ToolExecution)?;
    }

    let mut out = Vec::with_capacity(parsed.len());
    for call in parsed {
        let id = new_fallback_id();
        session
            .runtime
            .tool_registry
            .register(&id, &call.tool_name, call.args.clone());
        out.push(ToolCallPart {
            tool_call_id: id,
            tool_name: call.tool_name,
            args: Value::Object(call.args),
        });
    }
    Ok(out)
}

async fn route_tool_call(
    session: &mut Session,
    buffer: &mut ToolBuffer,
    part: ToolCallPart,
    callbacks: &RequestCallbacks,
    abort: &AbortController,
) -> Result<(), AgentError> {
    if callbacks.tool.is_none() {
        return Ok(());
    }
    if is_read_only_tool(&part.tool_name) {
        debug!(tool = %part.tool_name, buffered = buffer.len() + 1, "buffered read-only tool");
        buffer.add(part);
        return Ok(());
    }
    // A mutating tool is a serialization barrier: pending reads flush first.
    flush_tool_buffer(session, buffer, callbacks, abort).await?;
    execute_sequential(session, part, callbacks, abort).await
}

/// Execute and clear any buffered read-only batch.  Also called by the
/// orchestrator at turn end.
pub(crate) async fn flush_tool_buffer(
    session: &mut Session,
    buffer: &mut ToolBuffer,
    callbacks: &RequestCallbacks,
    abort: &AbortController,
) -> Result<(), AgentError> {
    if !buffer.has_tasks() {
        return Ok(());
    }
    let tasks = buffer.flush();
    run_parallel_batch(session, tasks, callbacks, abort).await
}

async fn run_parallel_batch(
    session: &mut Session,
    tasks: Vec<ToolCallPart>,
    callbacks: &RequestCallbacks,
    abort: &AbortController,
) -> Result<(), AgentError> {
    let Some(tool_cb) = callbacks.tool.clone() else {
        return Ok(());
    };
    abort.check_abort().await?;

    for task in &tasks {
        session.runtime.tool_registry.start(&task.tool_call_id);
    }
    session.runtime.batch_counter += 1;
    debug!(
        batch = session.runtime.batch_counter,
        count = tasks.len(),
        "executing parallel read-only batch"
    );

    if let Some(start_cb) = &callbacks.tool_start {
        start_cb(&batch_display_name(&tasks));
    }

    let results = execute_tools_parallel(tasks.clone(), &tool_cb).await;
    record_batch_results(session, &tasks, results)
}

fn batch_display_name(tasks: &[ToolCallPart]) -> String {
    let names: Vec<&str> = tasks
        .iter()
        .take(TOOL_BATCH_PREVIEW_COUNT)
        .map(|t| t.tool_name.as_str())
        .collect();
    let mut display = names.join(TOOL_NAME_JOINER);
    if tasks.len() > TOOL_BATCH_PREVIEW_COUNT {
        display.push_str(TOOL_NAME_SUFFIX);
    }
    display
}

fn record_batch_results(
    session: &mut Session,
    tasks: &[ToolCallPart],
    results: Vec<Result<String, ToolError>>,
) -> Result<(), AgentError> {
    let mut aborted = false;
    for (part, result) in tasks.iter().zip(results) {
        match result {
            // Success: the record completes when the matching ToolReturn
            // arrives in the next node's request.
            Ok(_) => {}
            Err(ToolError::Aborted(reason)) => {
                session
                    .runtime
                    .tool_registry
                    .cancel(&part.tool_call_id, reason);
                aborted = true;
            }
            Err(err) => {
                warn!(tool = %part.tool_name, error = %err, "tool failed");
                session
                    .runtime
                    .tool_registry
                    .fail(&part.tool_call_id, err.detail());
            }
        }
    }
    if aborted {
        return Err(AgentError::UserAbort);
    }
    Ok(())
}

async fn execute_sequential(
    session: &mut Session,
    part: ToolCallPart,
    callbacks: &RequestCallbacks,
    abort: &AbortController,
) -> Result<(), AgentError> {
    let Some(tool_cb) = callbacks.tool.clone() else {
        return Ok(());
    };
    abort.check_abort().await?;

    session.runtime.tool_registry.start(&part.tool_call_id);
    debug!(tool = %part.tool_name, "executing write/execute tool sequentially");

    match (tool_cb)(part.clone()).await {
        Ok(_) => Ok(()),
        Err(ToolError::Aborted(reason)) => {
            session
                .runtime
                .tool_registry
                .cancel(&part.tool_call_id, reason);
            Err(AgentError::UserAbort)
        }
        Err(err) => {
            warn!(tool = %part.tool_name, error = %err, "tool failed");
            session
                .runtime
                .tool_registry
                .fail(&part.tool_call_id, err.detail());
            Ok(())
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
