use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Message parts ────────────────────────────────────────────────────────────

/// A tool invocation requested by the model.
///
/// `args` is kept raw: providers deliver either an already-decoded JSON object
/// or a JSON-encoded string, and some models emit malformed fragments.  The
/// dispatcher owns normalization so that one tolerant parser handles every
/// source of arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPart {
    /// Globally unique per turn; pairs the call with its later return.
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

/// The result of a tool invocation, paired to its call by `tool_call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolReturnPart {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
}

/// A single part of a conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "part_kind", rename_all = "kebab-case")]
pub enum Part {
    SystemPrompt { content: String },
    UserText { content: String },
    /// Assistant-visible text.  Serialized as `text` on the wire.
    #[serde(rename = "text")]
    AssistantText { content: String },
    /// Free-form chain-of-thought the model emits alongside a response.
    Thought { content: String },
    ToolCall(ToolCallPart),
    ToolReturn(ToolReturnPart),
}

impl Part {
    pub fn system_prompt(content: impl Into<String>) -> Self {
        Self::SystemPrompt { content: content.into() }
    }

    pub fn user_text(content: impl Into<String>) -> Self {
        Self::UserText { content: content.into() }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::AssistantText { content: content.into() }
    }

    pub fn thought(content: impl Into<String>) -> Self {
        Self::Thought { content: content.into() }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        args: Value,
    ) -> Self {
        Self::ToolCall(ToolCallPart {
            tool_call_id: id.into(),
            tool_name: name.into(),
            args,
        })
    }

    pub fn tool_return(
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::ToolReturn(ToolReturnPart {
            tool_call_id: id.into(),
            tool_name: name.into(),
            content: content.into(),
        })
    }

    /// Text carried by this part, for content-bearing variants.
    pub fn text_content(&self) -> Option<&str> {
        match self {
            Part::SystemPrompt { content }
            | Part::UserText { content }
            | Part::AssistantText { content }
            | Part::Thought { content } => Some(content),
            Part::ToolReturn(r) => Some(&r.content),
            Part::ToolCall(_) => None,
        }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCallPart> {
        match self {
            Part::ToolCall(tc) => Some(tc),
            _ => None,
        }
    }

    pub fn as_tool_return(&self) -> Option<&ToolReturnPart> {
        match self {
            Part::ToolReturn(tr) => Some(tr),
            _ => None,
        }
    }

    /// A part is blank when it carries only whitespace.  Tool calls are never
    /// blank: they represent pending work regardless of their arguments.
    pub fn is_blank(&self) -> bool {
        match self {
            Part::ToolCall(_) => false,
            other => other
                .text_content()
                .map(|c| c.trim().is_empty())
                .unwrap_or(true),
        }
    }

    /// Approximate token weight of this part (chars/4 heuristic).
    pub fn approx_tokens(&self) -> usize {
        let chars = match self {
            Part::ToolCall(tc) => tc.tool_name.len() + tc.args.to_string().len(),
            other => other.text_content().map(str::len).unwrap_or(0),
        };
        (chars / 4).max(1)
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Input to the model: user text, system prompt, tool returns.
    Request,
    /// Output from the model: assistant text, thoughts, tool calls.
    Response,
}

/// One message in the conversation history that the orchestrator curates
/// between turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub parts: Vec<Part>,
    /// Token usage attached by the provider to response messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Message {
    pub fn request(parts: Vec<Part>) -> Self {
        Self { kind: MessageKind::Request, parts, usage: None }
    }

    pub fn response(parts: Vec<Part>) -> Self {
        Self { kind: MessageKind::Response, parts, usage: None }
    }

    pub fn response_with_usage(parts: Vec<Part>, usage: Usage) -> Self {
        Self { kind: MessageKind::Response, parts, usage: Some(usage) }
    }

    /// Request message holding a single user text part.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::request(vec![Part::user_text(text)])
    }

    /// Response message holding a single assistant text part.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::response(vec![Part::assistant_text(text)])
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::ToolCall(_)))
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallPart> {
        self.parts.iter().filter_map(Part::as_tool_call)
    }

    pub fn tool_returns(&self) -> impl Iterator<Item = &ToolReturnPart> {
        self.parts.iter().filter_map(Part::as_tool_return)
    }

    /// True for response messages whose parts are all blank.
    pub fn is_empty_response(&self) -> bool {
        self.kind == MessageKind::Response && self.parts.iter().all(Part::is_blank)
    }

    /// Approximate token count used for history budget accounting.
    pub fn approx_tokens(&self) -> usize {
        self.parts.iter().map(Part::approx_tokens).sum::<usize>().max(1)
    }
}

// ─── Usage accounting ─────────────────────────────────────────────────────────

/// Raw token counts reported by a provider for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Prompt tokens served from the provider's cache.
    pub cached_tokens: u64,
}

/// Normalised usage for one model call, including the computed cost.
///
/// The session total is the additive accumulation of these across calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cached_tokens: u64,
    pub cost: f64,
}

impl UsageMetrics {
    pub fn add(&mut self, other: &UsageMetrics) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cached_tokens += other.cached_tokens;
        self.cost += other.cost;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Part construction and accessors ───────────────────────────────────────

    #[test]
    fn tool_call_part_has_no_text_content() {
        let p = Part::tool_call("t1", "grep", json!({"pattern": "TODO"}));
        assert!(p.text_content().is_none());
        assert!(p.as_tool_call().is_some());
    }

    #[test]
    fn tool_return_text_content_is_payload() {
        let p = Part::tool_return("t1", "grep", "3 matches");
        assert_eq!(p.text_content(), Some("3 matches"));
        assert_eq!(p.as_tool_return().unwrap().tool_call_id, "t1");
    }

    #[test]
    fn blank_detection() {
        assert!(Part::assistant_text("   \n").is_blank());
        assert!(!Part::assistant_text("hi").is_blank());
        // Tool calls are pending work, never blank.
        assert!(!Part::tool_call("t", "read_file", json!({})).is_blank());
        assert!(Part::tool_return("t", "grep", "  ").is_blank());
    }

    // ── Message accessors ─────────────────────────────────────────────────────

    #[test]
    fn user_text_message_is_request_kind() {
        let m = Message::user_text("show me main.py");
        assert_eq!(m.kind, MessageKind::Request);
        assert_eq!(m.parts.len(), 1);
    }

    #[test]
    fn has_tool_calls_detects_structured_parts() {
        let m = Message::response(vec![
            Part::assistant_text("reading"),
            Part::tool_call("t1", "read_file", json!({"file_path": "a.py"})),
        ]);
        assert!(m.has_tool_calls());
        assert_eq!(m.tool_calls().count(), 1);
    }

    #[test]
    fn empty_response_detection() {
        assert!(Message::response(vec![Part::assistant_text("")]).is_empty_response());
        assert!(Message::response(vec![]).is_empty_response());
        assert!(!Message::assistant_text("done").is_empty_response());
        // A request is never an "empty response".
        assert!(!Message::user_text("").is_empty_response());
        // Tool calls keep a response non-empty.
        let m = Message::response(vec![Part::tool_call("t", "glob", json!({}))]);
        assert!(!m.is_empty_response());
    }

    #[test]
    fn approx_tokens_divides_by_four() {
        let m = Message::assistant_text("12345678");
        assert_eq!(m.approx_tokens(), 2);
        assert_eq!(Message::response(vec![]).approx_tokens(), 1);
    }

    // ── Usage accumulation ────────────────────────────────────────────────────

    #[test]
    fn usage_metrics_accumulate() {
        let mut total = UsageMetrics::default();
        total.add(&UsageMetrics { prompt_tokens: 10, completion_tokens: 5, cached_tokens: 2, cost: 0.01 });
        total.add(&UsageMetrics { prompt_tokens: 20, completion_tokens: 1, cached_tokens: 0, cost: 0.02 });
        assert_eq!(total.prompt_tokens, 30);
        assert_eq!(total.completion_tokens, 6);
        assert_eq!(total.cached_tokens, 2);
        assert!((total.cost - 0.03).abs() < 1e-9);
    }

    // ── Serialisation ─────────────────────────────────────────────────────────

    #[test]
    fn part_kind_tags_on_the_wire() {
        let call = serde_json::to_string(&Part::tool_call("t1", "grep", json!({}))).unwrap();
        assert!(call.contains("\"part_kind\":\"tool-call\""), "{call}");
        let text = serde_json::to_string(&Part::assistant_text("x")).unwrap();
        assert!(text.contains("\"part_kind\":\"text\""), "{text}");
    }

    #[test]
    fn message_round_trip() {
        let m = Message::response_with_usage(
            vec![
                Part::assistant_text("hi"),
                Part::tool_call("t1", "list_dir", json!({"directory": "."})),
            ],
            Usage { prompt_tokens: 100, completion_tokens: 10, cached_tokens: 50 },
        );
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
