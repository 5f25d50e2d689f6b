// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tunacode_model::ToolCallPart;

use crate::error::ToolError;
use crate::registry::ToolArgs;

/// Executes a single tool call.  The returned string becomes the
/// `ToolReturn` content the transport feeds back on the next node.
pub type ToolCallback =
    Arc<dyn Fn(ToolCallPart) -> BoxFuture<'static, Result<String, ToolError>> + Send + Sync>;

/// Receives partial assistant text deltas during streaming.
pub type StreamingCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// UI hint that a tool batch is starting; the argument is a short display
/// name (first tool names, comma-joined).
pub type ToolStartCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Fired per tool return observed in the next node's request.
pub type ToolResultCallback = Arc<dyn Fn(&ToolResultEvent) + Send + Sync>;

/// Fired when the consecutive-empty-response intervention triggers.
pub type NoticeCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// UI status line updates (pre-request delay countdown).
pub type StatusCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One observed tool return, as delivered to [`ToolResultCallback`].
#[derive(Debug, Clone)]
pub struct ToolResultEvent {
    pub tool_name: String,
    pub status: &'static str,
    pub args: ToolArgs,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// The optional hooks a front-end wires into one request.
///
/// All hooks are optional; an empty set runs the turn headless (tools are
/// skipped entirely without a [`ToolCallback`], mirroring the transport-side
/// execution path).
#[derive(Clone, Default)]
pub struct RequestCallbacks {
    pub tool: Option<ToolCallback>,
    pub streaming: Option<StreamingCallback>,
    pub tool_start: Option<ToolStartCallback>,
    pub tool_result: Option<ToolResultCallback>,
    pub notice: Option<NoticeCallback>,
    pub status: Option<StatusCallback>,
}

impl RequestCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(ToolCallPart) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        self.tool = Some(Arc::new(move |part| Box::pin(f(part))));
        self
    }

    pub fn with_streaming<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.streaming = Some(Arc::new(move |chunk| Box::pin(f(chunk))));
        self
    }

    pub fn on_tool_start(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.tool_start = Some(Arc::new(f));
        self
    }

    pub fn on_tool_result(
        mut self,
        f: impl Fn(&ToolResultEvent) + Send + Sync + 'static,
    ) -> Self {
        self.tool_result = Some(Arc::new(f));
        self
    }

    pub fn on_notice(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.notice = Some(Arc::new(f));
        self
    }

    pub fn on_status(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.status = Some(Arc::new(f));
        self
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[tokio::test]
    async fn tool_callback_builder_wraps_async_closure() {
        let cbs = RequestCallbacks::new()
            .with_tool(|part| async move { Ok(format!("ran {}", part.tool_name)) });
        let part = ToolCallPart {
            tool_call_id: "t1".into(),
            tool_name: "grep".into(),
            args: json!({}),
        };
        let out = (cbs.tool.unwrap())(part).await.unwrap();
        assert_eq!(out, "ran grep");
    }

    #[test]
    fn notice_callback_receives_text() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let cbs = RequestCallbacks::new().on_notice(move |text| {
            sink.lock().unwrap().push(text.to_string());
        });
        (cbs.notice.unwrap())("response was empty");
        assert_eq!(seen.lock().unwrap().as_slice(), ["response was empty"]);
    }

    #[test]
    fn default_callbacks_are_all_unset() {
        let cbs = RequestCallbacks::default();
        assert!(cbs.tool.is_none());
        assert!(cbs.streaming.is_none());
        assert!(cbs.tool_start.is_none());
        assert!(cbs.tool_result.is_none());
        assert!(cbs.notice.is_none());
        assert!(cbs.status.is_none());
    }
}
