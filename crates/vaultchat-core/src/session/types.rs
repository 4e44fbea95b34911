//! Session types for the active session controller
//!
//! These types define the protocol between the controller and its
//! observers: the events streamed to subscribers, the prompts that pause a
//! turn for a human decision, and the read-only views of controller state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::ErrorCode;

/// Unique identifier for a session
pub type SessionId = String;

/// Externally observable controller state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: Option<SessionId>,
    pub vault_id: Option<String>,
    pub is_processing: bool,
    pub is_streaming: bool,
    pub cumulative_tokens: u64,
    pub context_window: Option<u64>,
    pub active_model: Option<String>,
}

/// A request to run one turn against a vault
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub vault_id: String,
    pub vault_path: PathBuf,
    /// Resume this session; `None` starts a new one
    pub session_id: Option<SessionId>,
    pub prompt: String,
}

impl SendMessageRequest {
    /// Create a request that starts a new session
    pub fn new(
        vault_id: impl Into<String>,
        vault_path: impl Into<PathBuf>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            vault_id: vault_id.into(),
            vault_path: vault_path.into(),
            session_id: None,
            prompt: prompt.into(),
        }
    }

    /// Resume an existing session instead of starting a new one
    pub fn resume(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// What `send_message` reports back to its caller
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// The session identity is known and the turn streams in the background
    Started {
        session_id: SessionId,
        message_id: String,
    },
    /// The turn ended before a session identity was established
    Failed { code: ErrorCode, message: String },
    /// A newer turn or a clear took over before the session was established
    Superseded,
}

impl SendOutcome {
    /// Session id of a started turn
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SendOutcome::Started { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}

/// Kind of human decision a prompt asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    ToolPermission,
    AskUserQuestion,
}

impl std::fmt::Display for PromptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PromptKind::ToolPermission => write!(f, "tool_permission"),
            PromptKind::AskUserQuestion => write!(f, "ask_user_question"),
        }
    }
}

/// Kind-specific payload of a pending prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PromptPayload {
    ToolPermission {
        tool_name: String,
        input: serde_json::Value,
    },
    AskUserQuestion { questions: Vec<QuestionInfo> },
}

/// A paused point in a turn awaiting a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPrompt {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(flatten)]
    pub payload: PromptPayload,
    pub created_at: DateTime<Utc>,
}

impl PendingPrompt {
    /// Create a tool permission prompt
    pub fn tool_permission(tool_name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::with_payload(PromptPayload::ToolPermission {
            tool_name: tool_name.into(),
            input,
        })
    }

    /// Create an ask-user-question prompt
    pub fn ask_user_question(questions: Vec<QuestionInfo>) -> Self {
        Self::with_payload(PromptPayload::AskUserQuestion { questions })
    }

    fn with_payload(payload: PromptPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool_use_id: None,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Attach the tool use this prompt belongs to
    pub fn with_tool_use_id(mut self, tool_use_id: Option<String>) -> Self {
        self.tool_use_id = tool_use_id;
        self
    }

    pub fn kind(&self) -> PromptKind {
        match self.payload {
            PromptPayload::ToolPermission { .. } => PromptKind::ToolPermission,
            PromptPayload::AskUserQuestion { .. } => PromptKind::AskUserQuestion,
        }
    }
}

/// A human answer to a pending prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum PromptResponse {
    ToolPermission {
        allow: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_input: Option<serde_json::Value>,
    },
    AskUserQuestion { answers: HashMap<String, String> },
}

impl PromptResponse {
    /// Allow the tool call with its original input
    pub fn allow() -> Self {
        Self::ToolPermission {
            allow: true,
            message: None,
            updated_input: None,
        }
    }

    /// Deny the tool call
    pub fn deny(message: impl Into<String>) -> Self {
        Self::ToolPermission {
            allow: false,
            message: Some(message.into()),
            updated_input: None,
        }
    }

    /// Answer a question prompt (question text -> chosen answer)
    pub fn answers(answers: HashMap<String, String>) -> Self {
        Self::AskUserQuestion { answers }
    }

    pub fn kind(&self) -> PromptKind {
        match self {
            PromptResponse::ToolPermission { .. } => PromptKind::ToolPermission,
            PromptResponse::AskUserQuestion { .. } => PromptKind::AskUserQuestion,
        }
    }
}

/// Why a prompt response was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// Unknown, already resolved, expired, or of the wrong kind
    NotFound,
}

/// Information about a question option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Information about a question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionInfo {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default)]
    pub multi_select: bool,
}

/// Context window usage reported at the end of a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsage {
    pub used_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
}

impl ContextUsage {
    pub fn new(used_tokens: u64, context_window: Option<u64>) -> Self {
        let percentage = context_window
            .filter(|w| *w > 0)
            .map(|w| (used_tokens as f64 / w as f64) * 100.0);
        Self {
            used_tokens,
            context_window,
            percentage,
        }
    }
}

/// A tool invocation accumulated during a turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_use_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// A slash command the running agent advertises
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlashCommand {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_hint: Option<String>,
}

/// Events streamed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    /// The turn's session identity is established
    SessionReady {
        session_id: SessionId,
        vault_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created_at: Option<DateTime<Utc>>,
    },
    /// Content accumulation for a turn begins
    ResponseStart { message_id: String },
    /// Incremental assistant text
    ResponseChunk { message_id: String, content: String },
    /// Turn content is complete
    ResponseEnd {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_usage: Option<ContextUsage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    ToolStart { tool_use_id: String, tool_name: String },
    ToolInput {
        tool_use_id: String,
        input: serde_json::Value,
    },
    ToolEnd { tool_use_id: String, output: String },
    /// A human decision is required
    PromptPending { prompt: PendingPrompt },
    /// A prompt response matched no outstanding prompt
    PromptResponseRejected {
        prompt_id: String,
        reason: RejectionReason,
    },
    /// Terminal failure
    Error { code: ErrorCode, message: String },
    /// Session and turn state were reset
    SessionCleared,
}

impl SessionEvent {
    pub fn session_ready(
        session_id: impl Into<SessionId>,
        vault_id: impl Into<String>,
        created_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self::SessionReady {
            session_id: session_id.into(),
            vault_id: vault_id.into(),
            created_at,
        }
    }

    pub fn response_chunk(message_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::ResponseChunk {
            message_id: message_id.into(),
            content: content.into(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn prompt_rejected(prompt_id: impl Into<String>) -> Self {
        Self::PromptResponseRejected {
            prompt_id: prompt_id.into(),
            reason: RejectionReason::NotFound,
        }
    }

    /// Wire name of this event
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::SessionReady { .. } => "session_ready",
            SessionEvent::ResponseStart { .. } => "response_start",
            SessionEvent::ResponseChunk { .. } => "response_chunk",
            SessionEvent::ResponseEnd { .. } => "response_end",
            SessionEvent::ToolStart { .. } => "tool_start",
            SessionEvent::ToolInput { .. } => "tool_input",
            SessionEvent::ToolEnd { .. } => "tool_end",
            SessionEvent::PromptPending { .. } => "prompt_pending",
            SessionEvent::PromptResponseRejected { .. } => "prompt_response_rejected",
            SessionEvent::Error { .. } => "error",
            SessionEvent::SessionCleared => "session_cleared",
        }
    }

    /// Whether this event ends a turn
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::ResponseEnd { .. } | SessionEvent::Error { .. })
    }
}

/// A consistent read of the controller's state and accumulated turn content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub message_id: Option<String>,
    pub content: String,
    pub tool_invocations: Vec<ToolInvocation>,
    pub pending_prompts: Vec<PendingPrompt>,
}
