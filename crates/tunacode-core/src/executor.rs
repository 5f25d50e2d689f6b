// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tracing::{debug, warn};
use tunacode_model::ToolCallPart;

use crate::callbacks::ToolCallback;
use crate::error::ToolError;

/// Tools that cannot mutate the workspace and are safe to fan out.
pub const READ_ONLY_TOOLS: &[&str] = &["read_file", "grep", "glob", "list_dir"];

/// Environment override for the parallel batch width.
pub const MAX_PARALLEL_ENV: &str = "TUNACODE_MAX_PARALLEL";

const FALLBACK_PARALLEL: usize = 4;

pub fn is_read_only_tool(name: &str) -> bool {
    READ_ONLY_TOOLS.contains(&name)
}

/// Batch width: `TUNACODE_MAX_PARALLEL` when set to a positive integer,
/// otherwise the CPU count.
pub fn max_parallel() -> usize {
    if let Ok(raw) = std::env::var(MAX_PARALLEL_ENV) {
        match raw.parse::<usize>() {
            Ok(n) if n > 0 => return n,
            _ => warn!(%raw, "ignoring invalid {MAX_PARALLEL_ENV}"),
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_PARALLEL)
}

/// Ordered queue of read-only tool calls awaiting a parallel flush.
///
/// Owned by the orchestrator for exactly one turn; never shared across tasks.
#[derive(Debug, Default)]
pub struct ToolBuffer {
    tasks: Vec<ToolCallPart>,
}

impl ToolBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, part: ToolCallPart) {
        self.tasks.push(part);
    }

    /// Return buffered tasks and clear the buffer.
    pub fn flush(&mut self) -> Vec<ToolCallPart> {
        std::mem::take(&mut self.tasks)
    }

    pub fn has_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Run `callback` for every task with bounded concurrency.
///
/// Tasks beyond the parallel cap execute in sequential batches of cap size;
/// results always come back in input order.  Failures are wrapped in the
/// result vector rather than propagated, and a panicking task surfaces as a
/// wrapped error so one bad tool cannot take down the batch.
pub async fn execute_tools_parallel(
    tasks: Vec<ToolCallPart>,
    callback: &ToolCallback,
) -> Vec<Result<String, ToolError>> {
    let cap = max_parallel().max(1);
    let total = tasks.len();
    let mut results = Vec::with_capacity(total);

    let mut remaining = tasks.into_iter();
    loop {
        let batch: Vec<ToolCallPart> = remaining.by_ref().take(cap).collect();
        if batch.is_empty() {
            break;
        }
        debug!(batch_len = batch.len(), cap, "executing tool batch");

        // Spawned so tasks are isolated: a panic in one tool is reported in
        // its slot while the others complete normally.
        let mut handles = Vec::with_capacity(batch.len());
        for part in batch {
            let fut = (callback)(part);
            handles.push(tokio::spawn(fut));
        }
        for handle in handles {
            let result = match handle.await {
                Ok(r) => r,
                Err(join_err) => Err(ToolError::execution(
                    "ToolPanicked",
                    format!("tool task failed: {join_err}"),
                )),
            };
            results.push(result);
        }
    }

    debug_assert_eq!(results.len(), total);
    results
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::RequestCallbacks;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn part(id: &str, name: &str) -> ToolCallPart {
        ToolCallPart {
            tool_call_id: id.into(),
            tool_name: name.into(),
            args: json!({}),
        }
    }

    #[test]
    fn read_only_set_matches_contract() {
        for name in ["read_file", "grep", "glob", "list_dir"] {
            assert!(is_read_only_tool(name), "{name} should be read-only");
        }
        assert!(!is_read_only_tool("write_file"));
        assert!(!is_read_only_tool("bash"));
    }

    #[test]
    fn buffer_add_flush_clears() {
        let mut buf = ToolBuffer::new();
        assert!(!buf.has_tasks());
        buf.add(part("t1", "read_file"));
        buf.add(part("t2", "grep"));
        assert_eq!(buf.len(), 2);
        let flushed = buf.flush();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].tool_call_id, "t1");
        assert!(!buf.has_tasks());
    }

    #[tokio::test]
    async fn results_preserve_input_order() {
        // Later tasks finish first; results must still come back in order.
        let cbs = RequestCallbacks::new().with_tool(|part| async move {
            let delay = match part.tool_call_id.as_str() {
                "t0" => 30,
                "t1" => 20,
                _ => 1,
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(part.tool_call_id.clone())
        });
        let tasks = vec![part("t0", "grep"), part("t1", "grep"), part("t2", "grep")];
        let results = execute_tools_parallel(tasks, cbs.tool.as_ref().unwrap()).await;
        let ids: Vec<String> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(ids, vec!["t0", "t1", "t2"]);
    }

    #[tokio::test]
    async fn callback_invoked_exactly_once_per_task() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let cbs = RequestCallbacks::new().with_tool(move |_part| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("ok".into())
            }
        });
        let tasks: Vec<ToolCallPart> =
            (0..9).map(|i| part(&format!("t{i}"), "read_file")).collect();
        let results = execute_tools_parallel(tasks, cbs.tool.as_ref().unwrap()).await;
        assert_eq!(results.len(), 9);
        assert_eq!(count.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn failures_are_wrapped_not_propagated() {
        let cbs = RequestCallbacks::new().with_tool(|part| async move {
            if part.tool_call_id == "t1" {
                Err(ToolError::execution("IoError", "boom"))
            } else {
                Ok("fine".into())
            }
        });
        let tasks = vec![part("t0", "grep"), part("t1", "grep"), part("t2", "grep")];
        let results = execute_tools_parallel(tasks, cbs.tool.as_ref().unwrap()).await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn panicking_tool_is_reported_in_its_slot() {
        let cbs = RequestCallbacks::new().with_tool(|part| async move {
            if part.tool_call_id == "t0" {
                panic!("tool exploded");
            }
            Ok("fine".into())
        });
        let tasks = vec![part("t0", "grep"), part("t1", "grep")];
        let results = execute_tools_parallel(tasks, cbs.tool.as_ref().unwrap()).await;
        assert!(matches!(
            &results[0],
            Err(ToolError::Execution { kind, .. }) if kind == "ToolPanicked"
        ));
        assert_eq!(results[1].as_deref().unwrap(), "fine");
    }

    #[tokio::test]
    async fn more_tasks_than_cap_run_in_sequential_batches() {
        // Track the high-water mark of concurrently running callbacks.
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (running2, peak2) = (Arc::clone(&running), Arc::clone(&peak));

        std::env::set_var(MAX_PARALLEL_ENV, "2");
        let cbs = RequestCallbacks::new().with_tool(move |_part| {
            let running = Arc::clone(&running2);
            let peak = Arc::clone(&peak2);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok("ok".into())
            }
        });
        let tasks: Vec<ToolCallPart> =
            (0..6).map(|i| part(&format!("t{i}"), "read_file")).collect();
        let results = execute_tools_parallel(tasks, cbs.tool.as_ref().unwrap()).await;
        std::env::remove_var(MAX_PARALLEL_ENV);

        assert_eq!(results.len(), 6);
        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "no more than MAX_PARALLEL tools may run at once"
        );
    }
}
