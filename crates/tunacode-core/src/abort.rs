// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::error::AgentError;

/// Single-writer cancellation signal for one request.
///
/// The controller is the only object in the core that is written from outside
/// the orchestrator task (key bindings, signal handlers).  `abort` is
/// flag-plus-notify: it never blocks and is idempotent, so it is safe to call
/// from any context.  Clones share the same signal.
#[derive(Clone, Default)]
pub struct AbortController {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    aborted: AtomicBool,
    notify: Notify,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl AbortController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal all controlled operations to abort.
    ///
    /// Idempotent: the first call wins, later calls return immediately.
    /// Once set, the flag stays set until [`reset`](Self::reset).
    pub fn abort(&self, trigger: &str) {
        if self.inner.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.notify.notify_waiters();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for handle in &tasks {
            handle.abort();
        }
        debug!(trigger, cancelled_tasks = tasks.len(), "abort signal sent");
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Return immediately, or fail with [`AgentError::UserAbort`] when the
    /// abort flag is set.  Call this periodically in long operations.
    pub async fn check_abort(&self) -> Result<(), AgentError> {
        if self.is_aborted() {
            return Err(AgentError::UserAbort);
        }
        Ok(())
    }

    /// Suspend until abort is requested.
    pub async fn wait_for_abort(&self) {
        while !self.is_aborted() {
            // The Notified future must exist before the flag re-check, or a
            // notify_waiters between check and await would be lost.
            let notified = self.inner.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    /// Associate a spawned task for cancellation propagation on abort.
    ///
    /// If the controller is already aborted the task is cancelled on the spot.
    pub fn register(&self, handle: AbortHandle) {
        if self.is_aborted() {
            handle.abort();
            return;
        }
        self.inner.tasks.lock().unwrap().push(handle);
    }

    /// Clear the flag and the registered-task set so the controller can be
    /// reused for the next request.
    pub fn reset(&self) {
        self.inner.aborted.store(false, Ordering::SeqCst);
        self.inner.tasks.lock().unwrap().clear();
        debug!("abort controller reset");
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
