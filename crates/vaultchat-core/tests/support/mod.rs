//! Shared helpers for controller integration tests
//!
//! `ScriptedTurnClient` plays back one `TurnScript` per started turn,
//! emitting the same stream-json messages the agent CLI would.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use vaultchat_core::error::{Error, Result};
use vaultchat_core::session::{
    ActiveSessionController, AgentTurnClient, ControllerConfig, EventReceiver,
    MemorySessionStore, PermissionDecision, PermissionHandler, PermissionRequest,
    SendMessageRequest, SessionEvent, SessionMetadata, SessionStore, SlashCommand, TurnHandle,
    TurnInterrupt, TurnRequest,
};

pub const VAULT_ID: &str = "vault-1";
pub const VAULT_PATH: &str = "/tmp/vault-1";

/// One step of a scripted turn
#[derive(Debug, Clone)]
pub enum Step {
    /// Emit a raw agent message
    Raw(Value),
    /// Pause; an interrupt ends the turn early
    Delay(Duration),
    /// Ask the controller for permission and record the decision
    Permission {
        tool_name: String,
        input: Value,
        tool_use_id: Option<String>,
    },
    /// Fail the transport
    Fail(String),
    /// Block until interrupted, then close the stream
    WaitForInterrupt,
}

/// Playback for one turn
#[derive(Debug, Clone, Default)]
pub struct TurnScript {
    pub steps: Vec<Step>,
    pub start_error: Option<String>,
    pub start_delay: Option<Duration>,
    pub commands: Vec<SlashCommand>,
}

impl TurnScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// init, chunks separated by `gap`, then a successful result
    pub fn streaming(session_id: &str, chunks: &[&str], gap: Duration) -> Self {
        let mut script = Self::new().raw(init(session_id));
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 && !gap.is_zero() {
                script = script.delay(gap);
            }
            script = script.raw(text(chunk));
        }
        script.raw(success(session_id, 100, 20))
    }

    pub fn raw(mut self, message: Value) -> Self {
        self.steps.push(Step::Raw(message));
        self
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(Step::Delay(duration));
        self
    }

    pub fn permission(mut self, tool_name: &str, input: Value) -> Self {
        self.steps.push(Step::Permission {
            tool_name: tool_name.to_string(),
            input,
            tool_use_id: Some(format!("toolu_{}", self.steps.len())),
        });
        self
    }

    pub fn fail(mut self, message: &str) -> Self {
        self.steps.push(Step::Fail(message.to_string()));
        self
    }

    pub fn wait_for_interrupt(mut self) -> Self {
        self.steps.push(Step::WaitForInterrupt);
        self
    }

    pub fn start_error(mut self, message: &str) -> Self {
        self.start_error = Some(message.to_string());
        self
    }

    pub fn start_delay(mut self, duration: Duration) -> Self {
        self.start_delay = Some(duration);
        self
    }

    pub fn commands(mut self, names: &[&str]) -> Self {
        self.commands = names
            .iter()
            .map(|name| SlashCommand {
                name: name.to_string(),
                description: String::new(),
                argument_hint: None,
            })
            .collect();
        self
    }
}

pub fn init(session_id: &str) -> Value {
    json!({"type": "system", "subtype": "init", "session_id": session_id, "model": "claude-test"})
}

pub fn text(chunk: &str) -> Value {
    json!({
        "type": "stream_event",
        "event": {"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": chunk}}
    })
}

pub fn tool_use(id: &str, name: &str, input: Value) -> Value {
    json!({
        "type": "assistant",
        "message": {"content": [{"type": "tool_use", "id": id, "name": name, "input": input}]}
    })
}

pub fn tool_result(id: &str, output: &str) -> Value {
    json!({
        "type": "user",
        "message": {"role": "user", "content": [{"type": "tool_result", "tool_use_id": id, "content": output}]}
    })
}

pub fn success(session_id: &str, input_tokens: u64, output_tokens: u64) -> Value {
    json!({
        "type": "result",
        "subtype": "success",
        "is_error": false,
        "duration_ms": 42,
        "session_id": session_id,
        "usage": {"input_tokens": input_tokens, "output_tokens": output_tokens},
        "modelUsage": {"claude-test": {"contextWindow": 200000}}
    })
}

pub fn error_result(message: &str) -> Value {
    json!({"type": "result", "subtype": "error_during_execution", "is_error": true, "errors": [message]})
}

struct ScriptedInterrupt {
    notify: Arc<Notify>,
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl TurnInterrupt for ScriptedInterrupt {
    async fn interrupt(&self) -> Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
        Ok(())
    }
}

/// Agent turn client that plays back scripts in order
#[derive(Default)]
pub struct ScriptedTurnClient {
    scripts: Mutex<VecDeque<TurnScript>>,
    requests: Mutex<Vec<TurnRequest>>,
    decisions: Arc<Mutex<Vec<PermissionDecision>>>,
    interrupts: Arc<AtomicUsize>,
}

impl ScriptedTurnClient {
    pub fn new(scripts: Vec<TurnScript>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        })
    }

    pub fn push(&self, script: TurnScript) {
        self.scripts.lock().push_back(script);
    }

    /// Requests seen by `start`, in order
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().clone()
    }

    /// Permission decisions returned by the controller
    pub fn decisions(&self) -> Vec<PermissionDecision> {
        self.decisions.lock().clone()
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentTurnClient for ScriptedTurnClient {
    async fn start(
        &self,
        request: TurnRequest,
        permissions: Arc<dyn PermissionHandler>,
    ) -> Result<TurnHandle> {
        self.requests.lock().push(request.clone());
        let script = self.scripts.lock().pop_front().unwrap_or_default();

        if let Some(delay) = script.start_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = script.start_error {
            return Err(Error::Agent(message));
        }

        let (tx, rx) = mpsc::channel(request.event_buffer.max(1));
        let notify = Arc::new(Notify::new());
        let decisions = self.decisions.clone();
        let steps = script.steps;
        let interrupted = notify.clone();

        tokio::spawn(async move {
            for step in steps {
                match step {
                    Step::Raw(message) => {
                        if tx.send(Ok(message)).await.is_err() {
                            return;
                        }
                    }
                    Step::Delay(duration) => {
                        tokio::select! {
                            _ = tokio::time::sleep(duration) => {}
                            _ = interrupted.notified() => return,
                        }
                    }
                    Step::Permission {
                        tool_name,
                        input,
                        tool_use_id,
                    } => {
                        let decision = permissions
                            .can_use_tool(PermissionRequest {
                                tool_name,
                                input,
                                tool_use_id,
                            })
                            .await;
                        decisions.lock().push(decision);
                    }
                    Step::Fail(message) => {
                        let _ = tx.send(Err(Error::Agent(message))).await;
                        return;
                    }
                    Step::WaitForInterrupt => {
                        interrupted.notified().await;
                        return;
                    }
                }
            }
        });

        Ok(TurnHandle {
            events: rx,
            interrupt: Arc::new(ScriptedInterrupt {
                notify,
                count: self.interrupts.clone(),
            }),
            supported_commands: script.commands,
        })
    }
}

/// Memory store whose `load` signals `loading` and then waits for `release`
#[derive(Default)]
pub struct GatedStore {
    pub inner: MemorySessionStore,
    pub loading: Notify,
    pub release: Notify,
}

#[async_trait]
impl SessionStore for GatedStore {
    async fn save(&self, session: &SessionMetadata) -> Result<()> {
        self.inner.save(session).await
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionMetadata>> {
        self.loading.notify_one();
        self.release.notified().await;
        self.inner.load(session_id).await
    }

    async fn list(&self) -> Result<Vec<SessionMetadata>> {
        self.inner.list().await
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        self.inner.delete(session_id).await
    }
}

pub fn controller(client: Arc<ScriptedTurnClient>) -> (ActiveSessionController, Arc<MemorySessionStore>) {
    controller_with_timeout(client, Duration::from_secs(60))
}

pub fn controller_with_timeout(
    client: Arc<ScriptedTurnClient>,
    prompt_timeout: Duration,
) -> (ActiveSessionController, Arc<MemorySessionStore>) {
    let store = Arc::new(MemorySessionStore::new());
    let controller = controller_with_store(client, store.clone(), prompt_timeout);
    (controller, store)
}

pub fn controller_with_store(
    client: Arc<ScriptedTurnClient>,
    store: Arc<dyn SessionStore>,
    prompt_timeout: Duration,
) -> ActiveSessionController {
    let config = ControllerConfig {
        prompt_timeout,
        ..Default::default()
    };
    ActiveSessionController::new(client, store, config)
}

pub fn new_session(prompt: &str) -> SendMessageRequest {
    SendMessageRequest::new(VAULT_ID, VAULT_PATH, prompt)
}

pub fn resume(session_id: &str, prompt: &str) -> SendMessageRequest {
    new_session(prompt).resume(session_id)
}

/// Receive the next event, failing the test after five seconds
pub async fn next_event(rx: &mut EventReceiver) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Receive events up to and including the first one matching `pred`
pub async fn recv_until(
    rx: &mut EventReceiver,
    pred: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = pred(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Receive events up to and including the next `response_end` or `error`
pub async fn recv_until_terminal(rx: &mut EventReceiver) -> Vec<SessionEvent> {
    recv_until(rx, SessionEvent::is_terminal).await
}

pub fn event_types(events: &[SessionEvent]) -> Vec<&'static str> {
    events.iter().map(SessionEvent::event_type).collect()
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
