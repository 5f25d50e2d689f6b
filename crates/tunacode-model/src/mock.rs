// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use crate::{
    DeltaStream, Message, ModelProvider, ModelRun, Node, NodeResult, Part, StreamDelta, Usage,
};

/// Scripted delta events for a model-request node.  Kept as plain data (not
/// `anyhow::Result`) so scripts stay cloneable.
#[derive(Debug, Clone)]
pub enum StreamScript {
    Content(String),
    /// Produces a stream error, exercising the degrade-to-non-streaming path.
    Error(String),
}

/// Blueprint for one [`Node`] yielded by a scripted run.
#[derive(Debug, Clone, Default)]
pub struct NodeScript {
    request: Option<Message>,
    thought: Option<String>,
    response: Option<Message>,
    output: Option<String>,
    stream: Option<Vec<StreamScript>>,
}

impl NodeScript {
    /// Node carrying a model response with the given parts.
    pub fn response(parts: Vec<Part>) -> Self {
        Self { response: Some(Message::response(parts)), ..Default::default() }
    }

    /// Node carrying a request with the given parts (e.g. tool returns).
    pub fn request(parts: Vec<Part>) -> Self {
        Self { request: Some(Message::request(parts)), ..Default::default() }
    }

    pub fn with_request(mut self, parts: Vec<Part>) -> Self {
        self.request = Some(Message::request(parts));
        self
    }

    pub fn with_response(mut self, parts: Vec<Part>) -> Self {
        self.response = Some(Message::response(parts));
        self
    }

    /// Attach provider usage to the node's response message.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        if let Some(resp) = self.response.as_mut() {
            resp.usage = Some(usage);
        }
        self
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = Some(thought.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Make this a model-request node streaming the given delta script.
    pub fn with_stream(mut self, deltas: Vec<StreamScript>) -> Self {
        self.stream = Some(deltas);
        self
    }

    fn into_node(self) -> Node {
        let deltas: Option<DeltaStream> = self.stream.map(|script| {
            let items: Vec<anyhow::Result<StreamDelta>> = script
                .into_iter()
                .map(|s| match s {
                    StreamScript::Content(c) => Ok(StreamDelta::Content(c)),
                    StreamScript::Error(e) => Err(anyhow::anyhow!(e)),
                })
                .collect();
            Box::pin(stream::iter(items)) as DeltaStream
        });
        Node {
            request: self.request,
            thought: self.thought,
            model_response: self.response,
            result: self.output.map(|output| NodeResult { output: Some(output) }),
            deltas,
        }
    }
}

/// A pre-scripted model.  Each `iter()` call pops the next script (a node
/// sequence) from the front of the queue, so tests can specify exact turns,
/// including tool calls and stream failures, without network access.
pub struct ScriptedModel {
    model_name: String,
    scripts: Mutex<VecDeque<Vec<NodeScript>>>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Vec<NodeScript>>) -> Self {
        Self {
            model_name: "scripted-mock-model".into(),
            scripts: Mutex::new(scripts.into()),
        }
    }

    /// Override the reported model name (pricing lookups key off it).
    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    /// Convenience: model that always answers with a single text response.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![vec![NodeScript::response(vec![Part::assistant_text(
            reply,
        )])]])
    }
}

#[async_trait]
impl ModelProvider for ScriptedModel {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn iter(
        &self,
        message: &str,
        history: Vec<Message>,
    ) -> anyhow::Result<Box<dyn ModelRun>> {
        let nodes = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        let mut messages = history;
        messages.push(Message::user_text(message));
        Ok(Box::new(ScriptedRun { nodes: nodes.into(), messages }))
    }
}

struct ScriptedRun {
    nodes: VecDeque<NodeScript>,
    messages: Vec<Message>,
}

#[async_trait]
impl ModelRun for ScriptedRun {
    async fn next_node(&mut self) -> Option<anyhow::Result<Node>> {
        let script = self.nodes.pop_front()?;
        // Record the node's messages as they are emitted so `all_messages`
        // stays the authoritative transcript of the run.
        if let Some(req) = &script.request {
            self.messages.push(req.clone());
        }
        if let Some(thought) = &script.thought {
            self.messages
                .push(Message::response(vec![Part::thought(thought.clone())]));
        }
        if let Some(resp) = &script.response {
            self.messages.push(resp.clone());
        }
        Some(Ok(script.into_node()))
    }

    fn all_messages(&self) -> Vec<Message> {
        self.messages.clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
