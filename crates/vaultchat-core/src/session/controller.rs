//! Active session controller
//!
//! Owns the lifecycle of the one conversation a vault UI is showing:
//! starting and resuming turns, streaming their events to subscribers,
//! pausing for human decisions, and clearing or aborting on request.
//!
//! ## Generation guard
//!
//! Every new turn and every clear bumps `generation`. A turn captures the
//! value it started under and re-checks it, under the state lock, before
//! each mutation and before its final cleanup. A superseded turn therefore
//! cannot overwrite the state of its successor: its late events and its
//! cleanup become no-ops.
//!
//! ## Ordering
//!
//! Events are published outside the state lock but inside a separate
//! re-entrant ordering lock. Clearing holds the same lock while it bumps the
//! generation, so no event of a stale turn can follow `session_cleared`.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::bus::{EventReceiver, SubscriberBus, Subscription};
use super::client::{
    ASK_USER_QUESTION_TOOL, AgentTurnClient, PermissionDecision, PermissionHandler,
    PermissionRequest, RawEvent, TurnHandle, TurnInterrupt, TurnRequest,
};
use super::prompts::{PendingPromptRegistry, PromptOutcome};
use super::store::{SessionMetadata, SessionStore};
use super::translate::{TurnEvent, TurnResult, TurnTranslator};
use super::types::{
    ContextUsage, PendingPrompt, PromptResponse, QuestionInfo, SendMessageRequest, SendOutcome,
    SessionEvent, SessionSnapshot, SessionState, SlashCommand, ToolInvocation,
};
use crate::config::{Config, DEFAULT_EVENT_BUFFER, DEFAULT_PROMPT_TIMEOUT_SECS};
use crate::error::{Error, ErrorCode, Result};

/// Tuning for an [`ActiveSessionController`]
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// How long a pending prompt waits before it is denied
    pub prompt_timeout: Duration,
    /// Capacity of the client -> controller event channel
    pub event_buffer: usize,
    /// Model override passed to the agent
    pub model: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            prompt_timeout: Duration::from_secs(DEFAULT_PROMPT_TIMEOUT_SECS),
            event_buffer: DEFAULT_EVENT_BUFFER,
            model: None,
        }
    }
}

impl ControllerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            prompt_timeout: config.session.prompt_timeout(),
            event_buffer: config.session.event_buffer.max(1),
            model: config.agent.model.clone(),
        }
    }
}

#[derive(Default)]
struct ControllerState {
    generation: u64,
    session: SessionState,
    vault_path: Option<PathBuf>,
    created_at: Option<DateTime<Utc>>,
    message_id: Option<String>,
    content: String,
    tools: Vec<ToolInvocation>,
    interrupt: Option<Arc<dyn TurnInterrupt>>,
    interrupt_requested: bool,
    supported_commands: Vec<SlashCommand>,
}

impl ControllerState {
    /// Reset everything except the generation, handing back the interrupt
    /// of whatever turn was running
    fn reset(&mut self) -> Option<Arc<dyn TurnInterrupt>> {
        let interrupt = self.interrupt.take();
        *self = ControllerState {
            generation: self.generation,
            ..Default::default()
        };
        interrupt
    }
}

struct Shared {
    state: Mutex<ControllerState>,
    /// Serialises publication against generation changes
    order: ReentrantMutex<()>,
    generation_tx: watch::Sender<u64>,
    bus: SubscriberBus,
    prompts: PendingPromptRegistry,
    client: Arc<dyn AgentTurnClient>,
    store: Arc<dyn SessionStore>,
    config: ControllerConfig,
}

impl Shared {
    fn bump_generation(&self, state: &mut ControllerState) -> u64 {
        state.generation += 1;
        self.generation_tx.send_replace(state.generation);
        state.generation
    }

    /// Bump the generation and reset all session state
    fn clear_locked(&self, state: &mut ControllerState) -> Option<Arc<dyn TurnInterrupt>> {
        self.bump_generation(state);
        state.reset()
    }

    fn with_current<R>(&self, generation: u64, f: impl FnOnce(&mut ControllerState) -> R) -> Option<R> {
        let mut state = self.state.lock();
        if state.generation == generation {
            Some(f(&mut state))
        } else {
            None
        }
    }

    /// Apply `f` and publish `event` if `generation` is still current
    fn apply_and_emit(
        &self,
        generation: u64,
        f: impl FnOnce(&mut ControllerState),
        event: SessionEvent,
    ) -> bool {
        let _order = self.order.lock();
        if self.with_current(generation, f).is_none() {
            debug!(
                "Dropping {} from stale turn {}",
                event.event_type(),
                generation
            );
            return false;
        }
        self.bus.publish(&event);
        true
    }

    fn emit_current(&self, generation: u64, event: SessionEvent) -> bool {
        self.apply_and_emit(generation, |_| {}, event)
    }

    fn emit(&self, event: SessionEvent) {
        let _order = self.order.lock();
        self.bus.publish(&event);
    }

    async fn request_decision(&self, generation: u64, request: PermissionRequest) -> PermissionDecision {
        let prompt = prompt_for(&request);
        let prompt_id = prompt.id.clone();
        let kind = prompt.kind();
        let waiter = self.prompts.register(prompt.clone());

        if !self.emit_current(generation, SessionEvent::PromptPending { prompt }) {
            self.prompts.abandon(&prompt_id);
            return PermissionDecision::deny("The turn is no longer active");
        }
        info!(
            "Waiting for {} decision on {} ({})",
            kind, request.tool_name, prompt_id
        );

        match waiter.await {
            Ok(PromptOutcome::Answered(response)) => decision_from_response(request, response),
            Ok(PromptOutcome::TimedOut) => PermissionDecision::deny(format!(
                "No response within {} seconds",
                self.prompts.timeout().as_secs()
            )),
            Err(_) => {
                debug!("Prompt {} abandoned", prompt_id);
                PermissionDecision::deny("The prompt was abandoned")
            }
        }
    }
}

/// Controller for the active chat session of a vault
#[derive(Clone)]
pub struct ActiveSessionController {
    shared: Arc<Shared>,
}

impl ActiveSessionController {
    pub fn new(
        client: Arc<dyn AgentTurnClient>,
        store: Arc<dyn SessionStore>,
        config: ControllerConfig,
    ) -> Self {
        let (generation_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ControllerState::default()),
                order: ReentrantMutex::new(()),
                generation_tx,
                bus: SubscriberBus::new(),
                prompts: PendingPromptRegistry::new(config.prompt_timeout),
                client,
                store,
                config,
            }),
        }
    }

    /// Receive every event published from now on
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(callback)
    }

    /// Receive events through an unbounded channel
    pub fn subscribe_channel(&self) -> (Subscription, EventReceiver) {
        self.shared.bus.subscribe_channel()
    }

    /// Start a turn, creating or resuming a session
    ///
    /// Resolves once the agent reported the session identity, or once the
    /// turn ended without one. The turn itself keeps streaming in a spawned
    /// task. Fails with [`Error::AlreadyProcessing`] when the requested
    /// session already has a turn in flight.
    ///
    /// A resume that fails validation still supersedes a running turn, so
    /// its `error` event follows `session_cleared` rather than landing in
    /// the middle of another turn.
    pub async fn send_message(&self, request: SendMessageRequest) -> Result<SendOutcome> {
        self.ensure_not_processing(&request)?;

        let resumed = match &request.session_id {
            Some(session_id) => match self.load_resumable(session_id, &request.vault_id).await {
                Ok(metadata) => Some(metadata),
                Err(e) => {
                    // The request still replaces whatever turn is running
                    let superseded = self.supersede_running();
                    let outcome = self.reject_request(e);
                    if let Some(interrupt) = superseded {
                        interrupt_quietly(interrupt).await;
                    }
                    return Ok(outcome);
                }
            },
            None => None,
        };

        let message_id = uuid::Uuid::new_v4().to_string();
        let (generation, superseded) = {
            let _order = self.shared.order.lock();
            let (generation, superseded, was_processing) = {
                let mut state = self.shared.state.lock();
                if is_duplicate(&state, &request) {
                    return Err(Error::AlreadyProcessing(
                        request.session_id.clone().unwrap_or_default(),
                    ));
                }

                let was_processing = state.session.is_processing;
                let superseded = if was_processing {
                    self.shared.clear_locked(&mut state)
                } else {
                    None
                };

                let generation = self.shared.bump_generation(&mut state);
                state.session = SessionState {
                    session_id: request.session_id.clone(),
                    vault_id: Some(request.vault_id.clone()),
                    is_processing: true,
                    is_streaming: false,
                    cumulative_tokens: resumed.as_ref().map_or(0, |m| m.cumulative_tokens),
                    context_window: resumed.as_ref().and_then(|m| m.context_window),
                    active_model: resumed
                        .as_ref()
                        .and_then(|m| m.model.clone())
                        .or_else(|| self.shared.config.model.clone()),
                };
                state.vault_path = Some(request.vault_path.clone());
                state.created_at = resumed.as_ref().map(|m| m.created_at);
                state.message_id = Some(message_id.clone());
                state.content.clear();
                state.tools.clear();
                state.interrupt = None;
                state.interrupt_requested = false;

                (generation, superseded, was_processing)
            };

            if was_processing {
                info!("Superseding running turn with turn {}", generation);
                self.shared.prompts.abandon_all();
                self.shared.bus.publish(&SessionEvent::SessionCleared);
            }
            (generation, superseded)
        };

        if let Some(interrupt) = superseded {
            interrupt_quietly(interrupt).await;
        }

        info!(
            "Starting turn {} in vault {} ({})",
            generation,
            request.vault_id,
            request
                .session_id
                .as_deref()
                .map_or("new session".to_string(), |id| format!("resuming {}", id))
        );

        let turn_request = TurnRequest {
            prompt: request.prompt.clone(),
            resume_session_id: request.session_id.clone(),
            vault_path: request.vault_path.clone(),
            model: self.shared.config.model.clone(),
            event_buffer: self.shared.config.event_buffer,
        };
        let broker: Arc<dyn PermissionHandler> = Arc::new(PromptBroker {
            shared: Arc::downgrade(&self.shared),
            generation,
        });

        let handle = match self.shared.client.start(turn_request, broker).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to start agent turn: {}", e);
                let message = e.to_string();
                let current = self.shared.apply_and_emit(
                    generation,
                    end_turn,
                    SessionEvent::error(ErrorCode::SdkError, message.clone()),
                );
                return Ok(if current {
                    SendOutcome::Failed {
                        code: ErrorCode::SdkError,
                        message,
                    }
                } else {
                    SendOutcome::Superseded
                });
            }
        };

        let TurnHandle {
            events,
            interrupt,
            supported_commands,
        } = handle;

        let interrupt_now = self.shared.with_current(generation, |state| {
            state.interrupt = Some(interrupt.clone());
            state.supported_commands = supported_commands;
            state.interrupt_requested
        });
        match interrupt_now {
            None => {
                debug!("Turn {} superseded while starting", generation);
                interrupt_quietly(interrupt).await;
                return Ok(SendOutcome::Superseded);
            }
            Some(true) => interrupt_quietly(interrupt).await,
            Some(false) => {}
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = TurnTask {
            shared: self.shared.clone(),
            generation,
            vault_id: request.vault_id,
            prompt: request.prompt,
            message_id,
            started_at: Instant::now(),
            translator: TurnTranslator::new(),
            ready: Some(ready_tx),
        };
        tokio::spawn(task.run(events));

        Ok(ready_rx.await.unwrap_or(SendOutcome::Superseded))
    }

    /// Drop the current session and anything running in it
    ///
    /// Always emits exactly one `session_cleared`, even with no session.
    pub async fn clear_session(&self) {
        let interrupt = {
            let _order = self.shared.order.lock();
            let (generation, interrupt) = {
                let mut state = self.shared.state.lock();
                let interrupt = self.shared.clear_locked(&mut state);
                (state.generation, interrupt)
            };
            self.shared.prompts.abandon_all();
            self.shared.bus.publish(&SessionEvent::SessionCleared);
            info!("Session cleared (generation {})", generation);
            interrupt
        };

        if let Some(interrupt) = interrupt {
            interrupt_quietly(interrupt).await;
        }
    }

    /// Ask the running turn to stop
    ///
    /// The turn ends through its normal cleanup. Returns whether a turn was
    /// running.
    pub async fn abort_processing(&self) -> bool {
        let (generation, interrupt) = {
            let mut state = self.shared.state.lock();
            if !state.session.is_processing {
                debug!("Abort requested with no turn running");
                return false;
            }
            state.interrupt_requested = true;
            (state.generation, state.interrupt.clone())
        };

        info!("Interrupting turn {}", generation);
        // Without a handle yet, send_message interrupts once start returns
        if let Some(interrupt) = interrupt {
            interrupt_quietly(interrupt).await;
        }
        true
    }

    /// Answer a pending prompt
    ///
    /// Unknown, expired or mismatched prompts emit
    /// `prompt_response_rejected`. Returns whether the response was taken.
    pub fn respond_to_prompt(&self, prompt_id: &str, response: PromptResponse) -> bool {
        match self.shared.prompts.resolve(prompt_id, response) {
            Ok(()) => true,
            Err(reason) => {
                warn!("Rejected response for prompt {}", prompt_id);
                self.shared.emit(SessionEvent::PromptResponseRejected {
                    prompt_id: prompt_id.to_string(),
                    reason,
                });
                false
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state.lock().session.clone()
    }

    /// State, content, tools and prompts read together
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.shared.state.lock();
        SessionSnapshot {
            state: state.session.clone(),
            message_id: state.message_id.clone(),
            content: state.content.clone(),
            tool_invocations: state.tools.clone(),
            pending_prompts: self.shared.prompts.list(),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.shared.state.lock().session.is_processing
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.state.lock().session.is_streaming
    }

    pub fn pending_prompts(&self) -> Vec<PendingPrompt> {
        self.shared.prompts.list()
    }

    pub fn generation(&self) -> u64 {
        self.shared.state.lock().generation
    }

    /// Slash commands advertised by the most recent agent
    pub fn supported_commands(&self) -> Vec<SlashCommand> {
        self.shared.state.lock().supported_commands.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.bus.subscriber_count()
    }

    fn ensure_not_processing(&self, request: &SendMessageRequest) -> Result<()> {
        let state = self.shared.state.lock();
        if is_duplicate(&state, request) {
            debug!("Rejecting duplicate turn for {:?}", request.session_id);
            return Err(Error::AlreadyProcessing(
                request.session_id.clone().unwrap_or_default(),
            ));
        }
        Ok(())
    }

    async fn load_resumable(&self, session_id: &str, vault_id: &str) -> Result<SessionMetadata> {
        match self.shared.store.load(session_id).await {
            Ok(Some(metadata)) if metadata.vault_id == vault_id => Ok(metadata),
            Ok(Some(metadata)) => Err(Error::SessionInvalid {
                id: session_id.to_string(),
                reason: format!("belongs to vault {}", metadata.vault_id),
            }),
            Ok(None) => Err(Error::SessionNotFound(session_id.to_string())),
            Err(e) => Err(Error::SessionInvalid {
                id: session_id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Clear a running turn ahead of a request that replaces it
    fn supersede_running(&self) -> Option<Arc<dyn TurnInterrupt>> {
        let _order = self.shared.order.lock();
        let (generation, interrupt) = {
            let mut state = self.shared.state.lock();
            if !state.session.is_processing {
                return None;
            }
            let interrupt = self.shared.clear_locked(&mut state);
            (state.generation, interrupt)
        };
        self.shared.prompts.abandon_all();
        self.shared.bus.publish(&SessionEvent::SessionCleared);
        info!("Running turn superseded (generation {})", generation);
        interrupt
    }

    fn reject_request(&self, e: Error) -> SendOutcome {
        warn!("Cannot start turn: {}", e);
        let code = e.code();
        let message = e.to_string();
        self.shared.emit(SessionEvent::error(code, message.clone()));
        SendOutcome::Failed { code, message }
    }
}

fn is_duplicate(state: &ControllerState, request: &SendMessageRequest) -> bool {
    state.session.is_processing
        && request.session_id.is_some()
        && state.session.session_id == request.session_id
}

fn end_turn(state: &mut ControllerState) {
    state.session.is_processing = false;
    state.session.is_streaming = false;
    state.interrupt = None;
    state.interrupt_requested = false;
}

async fn interrupt_quietly(interrupt: Arc<dyn TurnInterrupt>) {
    if let Err(e) = interrupt.interrupt().await {
        warn!("Failed to interrupt agent turn: {}", e);
    }
}

/// Permission handler handed to the client for one turn
struct PromptBroker {
    shared: Weak<Shared>,
    generation: u64,
}

#[async_trait::async_trait]
impl PermissionHandler for PromptBroker {
    async fn can_use_tool(&self, request: PermissionRequest) -> PermissionDecision {
        let Some(shared) = self.shared.upgrade() else {
            return PermissionDecision::deny("The session controller is gone");
        };
        shared.request_decision(self.generation, request).await
    }
}

fn prompt_for(request: &PermissionRequest) -> PendingPrompt {
    let prompt = if request.tool_name == ASK_USER_QUESTION_TOOL {
        let questions = request
            .input
            .get("questions")
            .cloned()
            .map(serde_json::from_value::<Vec<QuestionInfo>>);
        match questions {
            Some(Ok(questions)) => PendingPrompt::ask_user_question(questions),
            _ => {
                warn!("Malformed {} input, asking for permission instead", ASK_USER_QUESTION_TOOL);
                PendingPrompt::tool_permission(&request.tool_name, request.input.clone())
            }
        }
    } else {
        PendingPrompt::tool_permission(&request.tool_name, request.input.clone())
    };
    prompt.with_tool_use_id(request.tool_use_id.clone())
}

fn decision_from_response(request: PermissionRequest, response: PromptResponse) -> PermissionDecision {
    match response {
        PromptResponse::ToolPermission {
            allow: true,
            updated_input,
            ..
        } => PermissionDecision::Allow {
            updated_input: updated_input.unwrap_or(request.input),
        },
        PromptResponse::ToolPermission { message, .. } => PermissionDecision::deny(
            message.unwrap_or_else(|| "The user denied this tool call".to_string()),
        ),
        PromptResponse::AskUserQuestion { answers } => {
            let answers: serde_json::Map<String, serde_json::Value> = answers
                .into_iter()
                .map(|(question, answer)| (question, serde_json::Value::String(answer)))
                .collect();
            let mut input = match request.input {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            input.insert("answers".to_string(), serde_json::Value::Object(answers));
            PermissionDecision::Allow {
                updated_input: serde_json::Value::Object(input),
            }
        }
    }
}

/// How the event loop of a turn stopped
enum TurnEnd {
    Completed(TurnResult),
    Failed(String),
    /// The event stream closed without a result
    Closed,
    Superseded,
}

/// Turn data gathered for persistence
struct TurnRecord {
    session_id: Option<String>,
    vault_path: PathBuf,
    created_at: Option<DateTime<Utc>>,
    content: String,
    tools: Vec<ToolInvocation>,
    cumulative_tokens: u64,
    context_window: Option<u64>,
    model: Option<String>,
    interrupted: bool,
}

/// Consumes one turn's events on a spawned task
struct TurnTask {
    shared: Arc<Shared>,
    generation: u64,
    vault_id: String,
    prompt: String,
    message_id: String,
    started_at: Instant,
    translator: TurnTranslator,
    /// Reports the outcome to `send_message`; taken once identity is known
    ready: Option<oneshot::Sender<SendOutcome>>,
}

impl TurnTask {
    async fn run(mut self, mut events: mpsc::Receiver<RawEvent>) {
        let mut generation_rx = self.shared.generation_tx.subscribe();
        let end = if *generation_rx.borrow_and_update() != self.generation {
            TurnEnd::Superseded
        } else {
            loop {
                tokio::select! {
                    biased;
                    _ = generation_rx.changed() => {
                        break TurnEnd::Superseded;
                    }
                    item = events.recv() => {
                        let Some(item) = item else {
                            break TurnEnd::Closed;
                        };
                        match item {
                            Err(e) => break TurnEnd::Failed(e.to_string()),
                            Ok(raw) => match self.translator.translate(raw) {
                                Ok(turn_events) => {
                                    if let Some(end) = self.apply(turn_events) {
                                        break end;
                                    }
                                }
                                Err(e) => warn!("Skipping agent message: {}", e),
                            },
                        }
                    }
                }
            }
        };
        drop(events);
        self.finish(end).await;
    }

    fn apply(&mut self, events: Vec<TurnEvent>) -> Option<TurnEnd> {
        for event in events {
            let applied = match event {
                TurnEvent::SessionInit { session_id, model } => {
                    self.on_session_init(session_id, model)
                }
                TurnEvent::TextDelta(text) => self.shared.apply_and_emit(
                    self.generation,
                    |state| {
                        state.session.is_streaming = true;
                        state.content.push_str(&text);
                    },
                    SessionEvent::response_chunk(&self.message_id, text.clone()),
                ),
                TurnEvent::ToolStarted {
                    tool_use_id,
                    tool_name,
                } => self.shared.apply_and_emit(
                    self.generation,
                    |state| {
                        tool_entry(state, &tool_use_id, &tool_name);
                    },
                    SessionEvent::ToolStart {
                        tool_use_id: tool_use_id.clone(),
                        tool_name: tool_name.clone(),
                    },
                ),
                TurnEvent::ToolInput { tool_use_id, input } => self.shared.apply_and_emit(
                    self.generation,
                    |state| {
                        tool_entry(state, &tool_use_id, "").input = Some(input.clone());
                    },
                    SessionEvent::ToolInput {
                        tool_use_id: tool_use_id.clone(),
                        input: input.clone(),
                    },
                ),
                TurnEvent::ToolCompleted {
                    tool_use_id,
                    output,
                } => self.shared.apply_and_emit(
                    self.generation,
                    |state| {
                        tool_entry(state, &tool_use_id, "").output = Some(output.clone());
                    },
                    SessionEvent::ToolEnd {
                        tool_use_id: tool_use_id.clone(),
                        output: output.clone(),
                    },
                ),
                TurnEvent::Completed(result) => return Some(TurnEnd::Completed(result)),
                TurnEvent::Failed { message } => return Some(TurnEnd::Failed(message)),
            };
            if !applied {
                return Some(TurnEnd::Superseded);
            }
        }
        None
    }

    fn on_session_init(&mut self, session_id: String, model: Option<String>) -> bool {
        let created_at = self.shared.with_current(self.generation, |state| {
            state.session.session_id = Some(session_id.clone());
            if model.is_some() {
                state.session.active_model = model.clone();
            }
            *state.created_at.get_or_insert_with(Utc::now)
        });
        let Some(created_at) = created_at else {
            return false;
        };

        let Some(ready) = self.ready.take() else {
            return true;
        };
        info!("Turn {} attached to session {}", self.generation, session_id);
        let ready_sent = self.shared.emit_current(
            self.generation,
            SessionEvent::session_ready(&session_id, &self.vault_id, Some(created_at)),
        ) && self.shared.emit_current(
            self.generation,
            SessionEvent::ResponseStart {
                message_id: self.message_id.clone(),
            },
        );
        let _ = ready.send(SendOutcome::Started {
            session_id,
            message_id: self.message_id.clone(),
        });
        ready_sent
    }

    async fn finish(mut self, end: TurnEnd) {
        let (result, failure) = match end {
            TurnEnd::Superseded => {
                debug!("Turn {} superseded, skipping cleanup", self.generation);
                self.settle(SendOutcome::Superseded);
                return;
            }
            TurnEnd::Completed(result) => (Some(result), None),
            TurnEnd::Closed => (None, None),
            TurnEnd::Failed(message) => (None, Some(message)),
        };

        let Some(record) = self.shared.with_current(self.generation, |state| TurnRecord {
            session_id: state.session.session_id.clone(),
            vault_path: state.vault_path.clone().unwrap_or_default(),
            created_at: state.created_at,
            content: state.content.clone(),
            tools: state.tools.clone(),
            cumulative_tokens: state.session.cumulative_tokens,
            context_window: state.session.context_window,
            model: state.session.active_model.clone(),
            interrupted: state.interrupt_requested,
        }) else {
            debug!("Turn {} went stale before cleanup", self.generation);
            self.settle(SendOutcome::Superseded);
            return;
        };

        // An interrupted turn ends normally even if the agent reports an error
        let failure = failure.filter(|_| !record.interrupted);
        let established = self.ready.is_none();

        if !established {
            let message = failure.unwrap_or_else(|| {
                if record.interrupted {
                    "The turn was interrupted before a session was established".to_string()
                } else {
                    "The agent ended the turn without establishing a session".to_string()
                }
            });
            self.fail(message);
            return;
        }

        let usage = result.as_ref().map(|r| r.usage).unwrap_or_default();
        let cumulative_tokens = record.cumulative_tokens.saturating_add(usage.total());
        let context_window = result
            .as_ref()
            .and_then(|r| r.context_window)
            .or(record.context_window);
        let model = result
            .as_ref()
            .and_then(|r| r.model.clone())
            .or_else(|| record.model.clone());

        if let Some(session_id) = &record.session_id {
            self.persist(session_id, &record, cumulative_tokens, context_window, model.clone())
                .await;
        }

        let update = |state: &mut ControllerState| {
            end_turn(state);
            state.session.cumulative_tokens = cumulative_tokens;
            state.session.context_window = context_window;
            state.session.active_model = model.clone();
        };

        if let Some(message) = failure {
            warn!("Turn {} failed: {}", self.generation, message);
            self.shared.apply_and_emit(
                self.generation,
                update,
                SessionEvent::error(ErrorCode::SdkError, message),
            );
            return;
        }

        let duration_ms = result
            .as_ref()
            .and_then(|r| r.duration_ms)
            .unwrap_or_else(|| self.started_at.elapsed().as_millis() as u64);
        let context_usage = result
            .as_ref()
            .map(|r| ContextUsage::new(r.usage.total(), context_window));

        let ended = self.shared.apply_and_emit(
            self.generation,
            update,
            SessionEvent::ResponseEnd {
                message_id: self.message_id.clone(),
                context_usage,
                duration_ms: Some(duration_ms),
            },
        );
        if ended {
            info!(
                "Turn {} finished in {}ms ({} tokens total)",
                self.generation, duration_ms, cumulative_tokens
            );
        }
    }

    /// End the turn with an `SDK_ERROR` before any session was established
    fn fail(&mut self, message: String) {
        warn!("Turn {} failed: {}", self.generation, message);
        let current = self.shared.apply_and_emit(
            self.generation,
            end_turn,
            SessionEvent::error(ErrorCode::SdkError, message.clone()),
        );
        self.settle(if current {
            SendOutcome::Failed {
                code: ErrorCode::SdkError,
                message,
            }
        } else {
            SendOutcome::Superseded
        });
    }

    fn settle(&mut self, outcome: SendOutcome) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(outcome);
        }
    }

    async fn persist(
        &self,
        session_id: &str,
        record: &TurnRecord,
        cumulative_tokens: u64,
        context_window: Option<u64>,
        model: Option<String>,
    ) {
        let store = &self.shared.store;
        let mut metadata = match store.load(session_id).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => SessionMetadata::new(
                session_id,
                &self.vault_id,
                record.vault_path.clone(),
                &self.prompt,
            ),
            Err(e) => {
                warn!("Replacing unreadable session {}: {}", session_id, e);
                SessionMetadata::new(
                    session_id,
                    &self.vault_id,
                    record.vault_path.clone(),
                    &self.prompt,
                )
            }
        };

        // A clear during the load makes this turn stale; the remaining
        // window is the save itself
        if self.shared.with_current(self.generation, |_| ()).is_none() {
            debug!("Turn {} went stale while persisting, skipping save", self.generation);
            return;
        }

        if let Some(created_at) = record.created_at {
            metadata.created_at = created_at;
        }
        metadata.vault_path = record.vault_path.clone();
        metadata.record_turn(&self.prompt, &record.content, record.tools.clone());
        metadata.cumulative_tokens = cumulative_tokens;
        metadata.context_window = context_window;
        metadata.model = model;

        match store.save(&metadata).await {
            Ok(()) => debug!("Persisted session {}", session_id),
            Err(e) => error!("Failed to persist session {}: {}", session_id, e),
        }
    }
}

/// Find the invocation for `tool_use_id`, creating it if needed
fn tool_entry<'a>(
    state: &'a mut ControllerState,
    tool_use_id: &str,
    tool_name: &str,
) -> &'a mut ToolInvocation {
    let index = match state.tools.iter().position(|t| t.tool_use_id == tool_use_id) {
        Some(index) => index,
        None => {
            state.tools.push(ToolInvocation {
                tool_use_id: tool_use_id.to_string(),
                tool_name: tool_name.to_string(),
                input: None,
                output: None,
            });
            state.tools.len() - 1
        }
    };
    &mut state.tools[index]
}
