// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod abort;
mod callbacks;
mod dispatch;
mod engine;
mod error;
mod executor;
mod history;
mod orchestrator;
mod processor;
mod registry;
mod session;
mod state;

pub use abort::AbortController;
pub use callbacks::{
    NoticeCallback, RequestCallbacks, StatusCallback, StreamingCallback, ToolCallback,
    ToolResultCallback, ToolResultEvent, ToolStartCallback,
};
pub use dispatch::{
    dispatch_tools, has_potential_tool_call, is_suspicious_tool_name, normalize_tool_name,
    parse_tool_args, parse_tool_calls_from_text, ParsedToolCall, ToolDispatchResult,
    UNKNOWN_TOOL_NAME,
};
pub use engine::{Engine, ProviderFactory};
pub use error::{AgentError, ToolError};
pub use executor::{
    execute_tools_parallel, is_read_only_tool, max_parallel, ToolBuffer, MAX_PARALLEL_ENV,
    READ_ONLY_TOOLS,
};
pub use history::{
    abort_cleanup, drop_trailing_request, prune_old_tool_outputs, remove_consecutive_requests,
    remove_dangling_tool_calls, remove_empty_responses, run_cleanup_loop,
    strip_completion_markers,
};
pub use orchestrator::{process_request, RequestOrchestrator, TurnOutcome};
pub use processor::{
    check_for_truncation, check_task_completion, process_node, EmptyReason, NodeOutcome,
};
pub use registry::{ToolArgs, ToolCallRecord, ToolCallRegistry, ToolCallState};
pub use session::{Conversation, RuntimeState, Session, TaskState, UsageState};
pub use state::{AgentState, ResponseState};
