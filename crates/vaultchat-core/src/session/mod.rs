//! Session module - the active chat session of a vault
//!
//! Key components:
//!
//! - `ActiveSessionController`: runs turns, guards them by generation and
//!   streams their events
//! - `SubscriberBus`: multicast of `SessionEvent`s to observers
//! - `PendingPromptRegistry`: human decisions a turn is waiting on
//! - `AgentTurnClient`: the seam to the agent runtime (`ProcessTurnClient`
//!   drives the agent CLI)
//! - `SessionStore`: persisted session metadata
//!
//! # Architecture
//!
//! ```text
//!  send_message ──▶ ActiveSessionController ──start──▶ AgentTurnClient
//!                        │      ▲                            │
//!                        │      └──── raw events (mpsc) ─────┘
//!                        │      └──── can_use_tool ──▶ PendingPromptRegistry
//!                        ▼
//!                   SubscriberBus ──▶ callbacks / channels
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! use vaultchat_core::session::{
//!     ActiveSessionController, ControllerConfig, FileSessionStore, ProcessTurnClient,
//!     PromptResponse, SendMessageRequest, SessionEvent,
//! };
//!
//! let controller = ActiveSessionController::new(
//!     Arc::new(ProcessTurnClient::new("claude", vec![])),
//!     Arc::new(FileSessionStore::new(sessions_dir)),
//!     ControllerConfig::default(),
//! );
//! let (_subscription, mut events) = controller.subscribe_channel();
//!
//! controller
//!     .send_message(SendMessageRequest::new("vault-1", "/notes", "Tidy my inbox"))
//!     .await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::ResponseChunk { content, .. } => print!("{}", content),
//!         SessionEvent::PromptPending { prompt } => {
//!             controller.respond_to_prompt(&prompt.id, PromptResponse::allow());
//!         }
//!         event if event.is_terminal() => break,
//!         _ => {}
//!     }
//! }
//! ```

mod bus;
mod client;
mod controller;
mod process_client;
mod prompts;
mod store;
mod translate;
mod types;

pub use bus::{EventCallback, EventReceiver, SubscriberBus, Subscription};
pub use client::{
    ASK_USER_QUESTION_TOOL, AgentTurnClient, PermissionDecision, PermissionHandler,
    PermissionRequest, RawEvent, TurnHandle, TurnInterrupt, TurnRequest,
};
pub use controller::{ActiveSessionController, ControllerConfig};
pub use process_client::ProcessTurnClient;
pub use prompts::{PendingPromptRegistry, PromptOutcome};
pub use store::{
    FileSessionStore, MemorySessionStore, MessageRole, SessionMetadata, SessionStore,
    StoredMessage, title_from_prompt,
};
pub use translate::{TokenUsage, TurnEvent, TurnResult, TurnTranslator};
pub use types::{
    ContextUsage, PendingPrompt, PromptKind, PromptPayload, PromptResponse, QuestionInfo,
    QuestionOption, RejectionReason, SendMessageRequest, SendOutcome, SessionEvent, SessionId,
    SessionSnapshot, SessionState, SlashCommand, ToolInvocation,
};
