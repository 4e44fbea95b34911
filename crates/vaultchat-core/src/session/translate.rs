//! Translation of raw agent stream-json messages into typed turn events
//!
//! The agent CLI emits newline-delimited JSON objects tagged by `type`
//! (`system`, `stream_event`, `assistant`, `user`, `result`, ...). Every
//! shape check lives here: the controller only ever sees [`TurnEvent`].
//!
//! Text can arrive twice: as `stream_event` deltas when partial messages
//! are enabled, and again inside the final `assistant` message. Once any
//! delta has been seen the translator ignores text blocks of assistant
//! messages so content is not duplicated.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

/// Normalised event produced for the controller
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// The agent reported the authoritative session id
    SessionInit {
        session_id: String,
        model: Option<String>,
    },
    TextDelta(String),
    ToolStarted {
        tool_use_id: String,
        tool_name: String,
    },
    ToolInput {
        tool_use_id: String,
        input: serde_json::Value,
    },
    ToolCompleted {
        tool_use_id: String,
        output: String,
    },
    /// The turn finished successfully
    Completed(TurnResult),
    /// The turn failed
    Failed { message: String },
}

/// Final accounting of a successful turn
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnResult {
    pub session_id: Option<String>,
    pub duration_ms: Option<u64>,
    pub usage: TokenUsage,
    pub context_window: Option<u64>,
    pub model: Option<String>,
}

/// Token usage as reported by the agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    /// Every token billed for the turn, saturating at `u64::MAX`
    pub fn total(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_creation_input_tokens)
            .saturating_add(self.cache_read_input_tokens)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawMessage {
    System {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    StreamEvent {
        event: RawStreamEvent,
    },
    Assistant {
        message: RawAssistantMessage,
    },
    User {
        message: RawUserMessage,
    },
    Result(RawResult),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawStreamEvent {
    MessageStart,
    ContentBlockStart { content_block: RawContentBlock },
    ContentBlockDelta { delta: RawDelta },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct RawAssistantMessage {
    #[serde(default)]
    content: Vec<RawContentBlock>,
}

#[derive(Debug, Deserialize)]
struct RawUserMessage {
    #[serde(default)]
    content: RawUserContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawUserContent {
    Text(String),
    Blocks(Vec<RawContentBlock>),
}

impl Default for RawUserContent {
    fn default() -> Self {
        RawUserContent::Blocks(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct RawResult {
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    duration_ms: Option<u64>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    usage: TokenUsage,
    #[serde(default, rename = "modelUsage")]
    model_usage: HashMap<String, RawModelUsage>,
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawModelUsage {
    #[serde(default, rename = "contextWindow")]
    context_window: Option<u64>,
}

/// Stateful translator for one turn
#[derive(Debug, Default)]
pub struct TurnTranslator {
    model: Option<String>,
    streaming_text: bool,
    started_tools: HashSet<String>,
}

impl TurnTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one raw message into zero or more turn events
    ///
    /// Unknown message types translate to nothing; structurally invalid
    /// messages are a protocol error.
    pub fn translate(&mut self, raw: serde_json::Value) -> Result<Vec<TurnEvent>> {
        let message: RawMessage = serde_json::from_value(raw)
            .map_err(|e| Error::Protocol(format!("Unrecognised agent message: {}", e)))?;

        let events = match message {
            RawMessage::System {
                subtype,
                session_id,
                model,
            } => match (subtype.as_str(), session_id) {
                ("init", Some(session_id)) => {
                    if model.is_some() {
                        self.model = model.clone();
                    }
                    vec![TurnEvent::SessionInit { session_id, model }]
                }
                ("init", None) => {
                    return Err(Error::Protocol("init message without session_id".to_string()));
                }
                _ => Vec::new(),
            },
            RawMessage::StreamEvent { event } => self.translate_stream_event(event),
            RawMessage::Assistant { message } => self.translate_assistant(message),
            RawMessage::User { message } => translate_user(message),
            RawMessage::Result(result) => vec![self.translate_result(result)],
            RawMessage::Other => Vec::new(),
        };

        Ok(events)
    }

    fn translate_stream_event(&mut self, event: RawStreamEvent) -> Vec<TurnEvent> {
        match event {
            RawStreamEvent::ContentBlockDelta {
                delta: RawDelta::TextDelta { text },
            } => {
                self.streaming_text = true;
                if text.is_empty() {
                    Vec::new()
                } else {
                    vec![TurnEvent::TextDelta(text)]
                }
            }
            RawStreamEvent::ContentBlockStart {
                content_block: RawContentBlock::ToolUse { id, name, .. },
            } => self.start_tool(id, name).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    fn translate_assistant(&mut self, message: RawAssistantMessage) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        for block in message.content {
            match block {
                RawContentBlock::Text { text } if !self.streaming_text && !text.is_empty() => {
                    events.push(TurnEvent::TextDelta(text));
                }
                RawContentBlock::ToolUse { id, name, input } => {
                    events.extend(self.start_tool(id.clone(), name));
                    events.push(TurnEvent::ToolInput {
                        tool_use_id: id,
                        input,
                    });
                }
                _ => {}
            }
        }
        events
    }

    fn start_tool(&mut self, id: String, name: String) -> Option<TurnEvent> {
        if self.started_tools.insert(id.clone()) {
            Some(TurnEvent::ToolStarted {
                tool_use_id: id,
                tool_name: name,
            })
        } else {
            None
        }
    }

    fn translate_result(&mut self, result: RawResult) -> TurnEvent {
        if result.is_error || result.subtype.starts_with("error") {
            let message = result
                .errors
                .first()
                .cloned()
                .or(result.result)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("Agent turn failed ({})", result.subtype));
            return TurnEvent::Failed { message };
        }

        let model = self
            .model
            .clone()
            .or_else(|| result.model_usage.keys().next().cloned());
        let context_window = model
            .as_ref()
            .and_then(|m| result.model_usage.get(m))
            .and_then(|u| u.context_window)
            .or_else(|| {
                result
                    .model_usage
                    .values()
                    .filter_map(|u| u.context_window)
                    .max()
            });

        TurnEvent::Completed(TurnResult {
            session_id: result.session_id,
            duration_ms: result.duration_ms,
            usage: result.usage,
            context_window,
            model,
        })
    }
}

fn translate_user(message: RawUserMessage) -> Vec<TurnEvent> {
    let RawUserContent::Blocks(blocks) = message.content else {
        return Vec::new();
    };
    blocks
        .into_iter()
        .filter_map(|block| match block {
            RawContentBlock::ToolResult {
                tool_use_id,
                content,
            } => Some(TurnEvent::ToolCompleted {
                tool_use_id,
                output: tool_output_text(&content),
            }),
            _ => None,
        })
        .collect()
}

/// Flatten tool result content (a string or a list of content blocks)
fn tool_output_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_init_message() {
        let mut translator = TurnTranslator::new();
        let events = translator
            .translate(json!({
                "type": "system",
                "subtype": "init",
                "session_id": "sess-1",
                "model": "claude-sonnet-4-5",
                "tools": ["Read"]
            }))
            .unwrap();
        assert_eq!(
            events,
            vec![TurnEvent::SessionInit {
                session_id: "sess-1".to_string(),
                model: Some("claude-sonnet-4-5".to_string()),
            }]
        );
    }

    #[test]
    fn test_init_without_session_id_is_protocol_error() {
        let mut translator = TurnTranslator::new();
        let result = translator.translate(json!({"type": "system", "subtype": "init"}));
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unknown_types_are_ignored() {
        let mut translator = TurnTranslator::new();
        assert!(translator.translate(json!({"type": "keep_alive"})).unwrap().is_empty());
        assert!(
            translator
                .translate(json!({"type": "system", "subtype": "compact_boundary"}))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_untagged_message_is_protocol_error() {
        let mut translator = TurnTranslator::new();
        assert!(translator.translate(json!({"hello": "world"})).is_err());
        assert!(translator.translate(json!("text")).is_err());
    }

    #[test]
    fn test_streamed_text_suppresses_assistant_text() {
        let mut translator = TurnTranslator::new();
        let delta = translator
            .translate(json!({
                "type": "stream_event",
                "event": {"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}}
            }))
            .unwrap();
        assert_eq!(delta, vec![TurnEvent::TextDelta("Hel".to_string())]);

        let full = translator
            .translate(json!({
                "type": "assistant",
                "message": {"content": [{"type": "text", "text": "Hello"}]}
            }))
            .unwrap();
        assert!(full.is_empty());
    }

    #[test]
    fn test_assistant_text_without_streaming() {
        let mut translator = TurnTranslator::new();
        let events = translator
            .translate(json!({
                "type": "assistant",
                "message": {"content": [{"type": "text", "text": "Hello"}, {"type": "thinking", "thinking": "hm"}]}
            }))
            .unwrap();
        assert_eq!(events, vec![TurnEvent::TextDelta("Hello".to_string())]);
    }

    #[test]
    fn test_tool_lifecycle() {
        let mut translator = TurnTranslator::new();

        let start = translator
            .translate(json!({
                "type": "stream_event",
                "event": {"type": "content_block_start", "index": 1,
                          "content_block": {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {}}}
            }))
            .unwrap();
        assert_eq!(
            start,
            vec![TurnEvent::ToolStarted {
                tool_use_id: "toolu_1".to_string(),
                tool_name: "Read".to_string(),
            }]
        );

        // The full message repeats the tool use; only the input is new
        let input = translator
            .translate(json!({
                "type": "assistant",
                "message": {"content": [{"type": "tool_use", "id": "toolu_1", "name": "Read",
                                         "input": {"file_path": "daily/today.md"}}]}
            }))
            .unwrap();
        assert_eq!(
            input,
            vec![TurnEvent::ToolInput {
                tool_use_id: "toolu_1".to_string(),
                input: json!({"file_path": "daily/today.md"}),
            }]
        );

        let done = translator
            .translate(json!({
                "type": "user",
                "message": {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1",
                     "content": [{"type": "text", "text": "line 1"}, {"type": "text", "text": "line 2"}]}
                ]}
            }))
            .unwrap();
        assert_eq!(
            done,
            vec![TurnEvent::ToolCompleted {
                tool_use_id: "toolu_1".to_string(),
                output: "line 1\nline 2".to_string(),
            }]
        );
    }

    #[test]
    fn test_tool_use_without_stream_start() {
        let mut translator = TurnTranslator::new();
        let events = translator
            .translate(json!({
                "type": "assistant",
                "message": {"content": [{"type": "tool_use", "id": "toolu_9", "name": "Glob", "input": {"pattern": "*.md"}}]}
            }))
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TurnEvent::ToolStarted { .. }));
        assert!(matches!(events[1], TurnEvent::ToolInput { .. }));
    }

    #[test]
    fn test_plain_user_text_is_ignored() {
        let mut translator = TurnTranslator::new();
        let events = translator
            .translate(json!({"type": "user", "message": {"role": "user", "content": "hi"}}))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_success_result_with_usage() {
        let mut translator = TurnTranslator::new();
        translator
            .translate(json!({"type": "system", "subtype": "init", "session_id": "s", "model": "claude-x"}))
            .unwrap();

        let events = translator
            .translate(json!({
                "type": "result",
                "subtype": "success",
                "is_error": false,
                "duration_ms": 1200,
                "result": "done",
                "session_id": "s",
                "usage": {"input_tokens": 100, "output_tokens": 20, "cache_read_input_tokens": 5},
                "modelUsage": {"claude-x": {"contextWindow": 200000, "inputTokens": 100}}
            }))
            .unwrap();

        let TurnEvent::Completed(result) = &events[0] else {
            panic!("Expected Completed");
        };
        assert_eq!(result.duration_ms, Some(1200));
        assert_eq!(result.usage.total(), 125);
        assert_eq!(result.context_window, Some(200_000));
        assert_eq!(result.model.as_deref(), Some("claude-x"));
    }

    #[test]
    fn test_error_result() {
        let mut translator = TurnTranslator::new();
        let events = translator
            .translate(json!({
                "type": "result",
                "subtype": "error_during_execution",
                "is_error": true,
                "errors": ["API Error: 401"]
            }))
            .unwrap();
        assert_eq!(
            events,
            vec![TurnEvent::Failed {
                message: "API Error: 401".to_string()
            }]
        );
    }

    #[test]
    fn test_error_result_without_message() {
        let mut translator = TurnTranslator::new();
        let events = translator
            .translate(json!({"type": "result", "subtype": "error_max_turns", "is_error": true}))
            .unwrap();
        assert_eq!(
            events,
            vec![TurnEvent::Failed {
                message: "Agent turn failed (error_max_turns)".to_string()
            }]
        );
    }

    #[test]
    fn test_usage_total_saturates() {
        let usage = TokenUsage {
            input_tokens: u64::MAX,
            output_tokens: 1,
            cache_creation_input_tokens: 5,
            cache_read_input_tokens: 0,
        };
        assert_eq!(usage.total(), u64::MAX);
    }
}
