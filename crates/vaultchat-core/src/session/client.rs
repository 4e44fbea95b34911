//! Agent turn client - the seam between the controller and the agent runtime
//!
//! A client starts one turn and hands back a bounded stream of raw agent
//! messages plus an interrupt handle. Tool permission callbacks flow the
//! other way through [`PermissionHandler`], which the controller implements
//! on top of its pending prompt registry.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::types::{SessionId, SlashCommand};
use crate::error::Result;

/// Name of the agent tool that asks the user multiple-choice questions
pub const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";

/// A raw agent message, or a transport failure that ends the turn
pub type RawEvent = Result<Value>;

/// Everything a client needs to start a turn
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub prompt: String,
    /// Continue this agent session instead of starting a new one
    pub resume_session_id: Option<SessionId>,
    /// Working directory for the agent (the vault root)
    pub vault_path: PathBuf,
    pub model: Option<String>,
    /// Capacity of the event channel
    pub event_buffer: usize,
}

/// A running turn
pub struct TurnHandle {
    /// Raw messages in arrival order; closes when the turn is over
    pub events: mpsc::Receiver<RawEvent>,
    pub interrupt: Arc<dyn TurnInterrupt>,
    /// Slash commands the agent advertised during initialisation
    pub supported_commands: Vec<SlashCommand>,
}

impl std::fmt::Debug for TurnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnHandle")
            .field("supported_commands", &self.supported_commands)
            .finish_non_exhaustive()
    }
}

/// Starts agent turns
#[async_trait]
pub trait AgentTurnClient: Send + Sync {
    /// Start a turn. Resolves once the agent accepted the request; events
    /// then arrive on the returned handle.
    async fn start(
        &self,
        request: TurnRequest,
        permissions: Arc<dyn PermissionHandler>,
    ) -> Result<TurnHandle>;
}

/// Asks a running turn to stop
#[async_trait]
pub trait TurnInterrupt: Send + Sync {
    async fn interrupt(&self) -> Result<()>;
}

/// A tool call the agent wants permission for
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    pub tool_name: String,
    pub input: Value,
    pub tool_use_id: Option<String>,
}

/// Answer returned to the agent
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    Allow { updated_input: Value },
    Deny { message: String },
}

impl PermissionDecision {
    pub fn deny(message: impl Into<String>) -> Self {
        Self::Deny {
            message: message.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, PermissionDecision::Allow { .. })
    }
}

/// Decides tool permissions while a turn runs
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn can_use_tool(&self, request: PermissionRequest) -> PermissionDecision;
}
