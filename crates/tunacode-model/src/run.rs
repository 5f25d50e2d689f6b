// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::Message;

/// One streamed delta event from a model-request node.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    /// A partial assistant text chunk (`.delta.content_delta`).
    Content(String),
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamDelta>> + Send>>;

/// Final output attached to the last node of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeResult {
    pub output: Option<String>,
}

/// One step emitted by the model iterator.
///
/// A node may carry a request (messages the transport is about to send or has
/// just sent, including tool returns from the previous step), a thought, a
/// model response, a final result, or any combination of them.  A node with
/// `deltas` set is a *model-request node*: consuming the stream yields the
/// token deltas of the response being generated.
pub struct Node {
    pub request: Option<Message>,
    pub thought: Option<String>,
    pub model_response: Option<Message>,
    pub result: Option<NodeResult>,
    pub deltas: Option<DeltaStream>,
}

impl Node {
    pub fn is_model_request(&self) -> bool {
        self.deltas.is_some()
    }
}

impl Default for Node {
    fn default() -> Self {
        Self {
            request: None,
            thought: None,
            model_response: None,
            result: None,
            deltas: None,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("has_request", &self.request.is_some())
            .field("has_thought", &self.thought.is_some())
            .field("has_response", &self.model_response.is_some())
            .field("has_result", &self.result.is_some())
            .field("is_model_request", &self.deltas.is_some())
            .finish()
    }
}

/// A single in-flight run: the async node iterator plus the authoritative
/// message record for the turn.
#[async_trait]
pub trait ModelRun: Send {
    /// Yield the next node, or `None` when the run is finished.
    async fn next_node(&mut self) -> Option<anyhow::Result<Node>>;

    /// The full message list for this run in emission order: the submitted
    /// history, the new user request, and every request/thought/response
    /// record the run produced.  The orchestrator persists this list at the
    /// end of the turn.
    fn all_messages(&self) -> Vec<Message>;
}

/// The LLM transport contract consumed by the orchestrator.
///
/// Concrete transports (wire formats, retries, streaming plumbing) live
/// outside the core; the core only drives this interface.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Model identifier, used for pricing lookups and cache keys.
    fn model_name(&self) -> &str;

    /// Open a run for one user message against the given history.
    async fn iter(
        &self,
        message: &str,
        history: Vec<Message>,
    ) -> anyhow::Result<Box<dyn ModelRun>>;
}
