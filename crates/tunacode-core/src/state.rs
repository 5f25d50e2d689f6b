// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use crate::error::AgentError;

/// Where the agent is within one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    UserInput,
    Assistant,
    ToolExecution,
    Response,
}

impl AgentState {
    fn as_u8(self) -> u8 {
        match self {
            AgentState::UserInput => 0,
            AgentState::Assistant => 1,
            AgentState::ToolExecution => 2,
            AgentState::Response => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => AgentState::UserInput,
            1 => AgentState::Assistant,
            2 => AgentState::ToolExecution,
            _ => AgentState::Response,
        }
    }
}

/// The allowed transition table.  RESPONSE → ASSISTANT closes the loop for
/// the next iteration.
fn is_valid_transition(from: AgentState, to: AgentState) -> bool {
    use AgentState::*;
    matches!(
        (from, to),
        (UserInput, Assistant)
            | (Assistant, ToolExecution)
            | (Assistant, Response)
            | (ToolExecution, Response)
            | (Response, Assistant)
    )
}

struct Machine {
    state: AgentState,
    completion_detected: bool,
}

/// Turn-level response state: the enum state machine plus the legacy boolean
/// flags kept for external consumers.
///
/// Mutations take the internal lock; reads come from atomic mirrors so legacy
/// callers on other tasks get lock-free snapshots.  `task_completed()` is
/// OR-ed with the machine's own completion on read.
pub struct ResponseState {
    machine: Mutex<Machine>,
    state_mirror: AtomicU8,
    completion_mirror: AtomicBool,
    has_user_response: AtomicBool,
    task_completed: AtomicBool,
    awaiting_user_guidance: AtomicBool,
    has_final_synthesis: AtomicBool,
}

impl Default for ResponseState {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseState {
    pub fn new() -> Self {
        Self {
            machine: Mutex::new(Machine {
                state: AgentState::UserInput,
                completion_detected: false,
            }),
            state_mirror: AtomicU8::new(AgentState::UserInput.as_u8()),
            completion_mirror: AtomicBool::new(false),
            has_user_response: AtomicBool::new(false),
            task_completed: AtomicBool::new(false),
            awaiting_user_guidance: AtomicBool::new(false),
            has_final_synthesis: AtomicBool::new(false),
        }
    }

    pub fn current_state(&self) -> AgentState {
        AgentState::from_u8(self.state_mirror.load(Ordering::SeqCst))
    }

    pub fn can_transition_to(&self, target: AgentState) -> bool {
        is_valid_transition(self.current_state(), target)
    }

    /// Perform a transition.  Self-transitions are no-ops; anything not in
    /// the table is an [`AgentError::InvalidStateTransition`].
    pub fn transition_to(&self, new_state: AgentState) -> Result<(), AgentError> {
        let mut machine = self.machine.lock().unwrap();
        if machine.state == new_state {
            return Ok(());
        }
        if !is_valid_transition(machine.state, new_state) {
            return Err(AgentError::InvalidStateTransition {
                from: machine.state,
                to: new_state,
            });
        }
        machine.state = new_state;
        self.state_mirror.store(new_state.as_u8(), Ordering::SeqCst);
        Ok(())
    }

    pub fn set_completion_detected(&self, detected: bool) {
        let mut machine = self.machine.lock().unwrap();
        machine.completion_detected = detected;
        self.completion_mirror.store(detected, Ordering::SeqCst);
    }

    /// Completed means: in RESPONSE with completion detected.
    pub fn is_completed(&self) -> bool {
        self.current_state() == AgentState::Response
            && self.completion_mirror.load(Ordering::SeqCst)
    }

    // ── Legacy boolean flags ──────────────────────────────────────────────────

    pub fn has_user_response(&self) -> bool {
        self.has_user_response.load(Ordering::SeqCst)
    }

    pub fn set_has_user_response(&self, value: bool) {
        self.has_user_response.store(value, Ordering::SeqCst);
    }

    /// Legacy completion flag, OR-ed with the state machine on read.
    pub fn task_completed(&self) -> bool {
        self.task_completed.load(Ordering::SeqCst) || self.is_completed()
    }

    /// Set the legacy flag and sync the machine: completion implies RESPONSE
    /// when that transition is currently allowed (best effort otherwise).
    pub fn set_task_completed(&self, value: bool) {
        self.task_completed.store(value, Ordering::SeqCst);
        if value {
            if self.current_state() != AgentState::Response
                && self.can_transition_to(AgentState::Response)
            {
                let _ = self.transition_to(AgentState::Response);
            }
            self.set_completion_detected(true);
        } else {
            self.set_completion_detected(false);
        }
    }

    pub fn awaiting_user_guidance(&self) -> bool {
        self.awaiting_user_guidance.load(Ordering::SeqCst)
    }

    pub fn set_awaiting_user_guidance(&self, value: bool) {
        self.awaiting_user_guidance.store(value, Ordering::SeqCst);
    }

    pub fn has_final_synthesis(&self) -> bool {
        self.has_final_synthesis.load(Ordering::SeqCst)
    }

    pub fn set_has_final_synthesis(&self, value: bool) {
        self.has_final_synthesis.store(value, Ordering::SeqCst);
    }

    /// Back to USER_INPUT with all flags cleared.
    pub fn reset(&self) {
        let mut machine = self.machine.lock().unwrap();
        machine.state = AgentState::UserInput;
        machine.completion_detected = false;
        self.state_mirror
            .store(AgentState::UserInput.as_u8(), Ordering::SeqCst);
        self.completion_mirror.store(false, Ordering::SeqCst);
        self.has_user_response.store(false, Ordering::SeqCst);
        self.task_completed.store(false, Ordering::SeqCst);
        self.awaiting_user_guidance.store(false, Ordering::SeqCst);
        self.has_final_synthesis.store(false, Ordering::SeqCst);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
