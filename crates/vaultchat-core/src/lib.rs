//! Vaultchat Core - agent chat sessions over a notes vault
//!
//! This crate provides the core functionality for vaultchat:
//! - The active session controller and its event stream
//! - Human-in-the-loop prompts for tool permissions and questions
//! - The agent CLI client speaking stream-json
//! - Session persistence and configuration

pub mod config;
pub mod error;
pub mod session;

pub use config::{AgentConfig, Config, ConfigManager, GeneralConfig, SessionSettings};
pub use error::{Error, ErrorCode, Result};

// Session exports
pub use session::{
    ActiveSessionController, AgentTurnClient, ControllerConfig, FileSessionStore,
    MemorySessionStore, PendingPrompt, ProcessTurnClient, PromptResponse, SendMessageRequest,
    SendOutcome, SessionEvent, SessionMetadata, SessionState, SessionStore, Subscription,
};
