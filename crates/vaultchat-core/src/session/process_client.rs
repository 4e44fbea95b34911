//! Agent turn client backed by the agent CLI
//!
//! Each turn spawns the configured command in the vault directory with
//! stream-json on both stdin and stdout:
//!
//! 1. an `initialize` control request is sent and its reply supplies the
//!    advertised slash commands
//! 2. the user message is written
//! 3. stdout lines are forwarded as raw events until the `result` message,
//!    after which stdin is closed and the process exits
//!
//! `can_use_tool` control requests are answered through the
//! [`PermissionHandler`]; interrupting sends an `interrupt` control request.
//! The child is killed once the event receiver is dropped.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::client::{
    AgentTurnClient, PermissionDecision, PermissionHandler, PermissionRequest, RawEvent,
    TurnHandle, TurnInterrupt, TurnRequest,
};
use super::types::SlashCommand;
use crate::config::AgentConfig;
use crate::error::{Error, Result};

/// How long the agent may take to answer `initialize`
const INITIALIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// Spawns the agent CLI once per turn
#[derive(Debug, Clone)]
pub struct ProcessTurnClient {
    command: String,
    args: Vec<String>,
}

impl ProcessTurnClient {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }

    fn command_args(&self, request: &TurnRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
            "--permission-prompt-tool",
            "stdio",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if let Some(model) = &request.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(session_id) = &request.resume_session_id {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        args.extend(self.args.iter().cloned());
        args
    }
}

#[async_trait]
impl AgentTurnClient for ProcessTurnClient {
    async fn start(
        &self,
        request: TurnRequest,
        permissions: Arc<dyn PermissionHandler>,
    ) -> Result<TurnHandle> {
        let mut cmd = Command::new(&self.command);
        cmd.args(self.command_args(&request))
            .current_dir(&request.vault_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Agent(format!("Failed to spawn {}: {}", self.command, e)))?;
        info!(
            "Spawned {} in {:?} (pid={})",
            self.command,
            request.vault_path,
            child.id().unwrap_or(0)
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Agent("Failed to open agent stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Agent("Failed to open agent stdout".to_string()))?;

        let last_stderr = Arc::new(Mutex::new(None::<String>));
        if let Some(stderr) = child.stderr.take() {
            let last_stderr = last_stderr.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if !line.trim().is_empty() {
                        debug!("agent stderr: {}", line);
                        *last_stderr.lock() = Some(line);
                    }
                }
            });
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(stdin, out_rx));
        let control = Arc::new(ControlChannel {
            tx: out_tx,
            next_id: AtomicU64::new(1),
        });

        let mut lines = BufReader::new(stdout).lines();
        let init_id = control.request(json!({"subtype": "initialize", "hooks": null}))?;
        let (supported_commands, early) =
            tokio::time::timeout(INITIALIZE_TIMEOUT, await_initialize(&mut lines, &init_id))
                .await
                .map_err(|_| Error::Agent("Timed out waiting for the agent to initialize".to_string()))??;
        debug!("Agent advertised {} slash commands", supported_commands.len());

        control.send(user_message(&request.prompt))?;

        let (events_tx, events_rx) = mpsc::channel(request.event_buffer.max(1));
        let reader = StdoutReader {
            lines,
            child,
            events: events_tx,
            control: control.clone(),
            permissions,
            last_stderr,
        };
        tokio::spawn(reader.run(early));

        Ok(TurnHandle {
            events: events_rx,
            interrupt: Arc::new(ProcessInterrupt { control }),
            supported_commands,
        })
    }
}

enum Outbound {
    Line(Value),
    Close,
}

/// Writes control messages to the agent's stdin
struct ControlChannel {
    tx: mpsc::UnboundedSender<Outbound>,
    next_id: AtomicU64,
}

impl ControlChannel {
    fn send(&self, message: Value) -> Result<()> {
        self.tx
            .send(Outbound::Line(message))
            .map_err(|_| Error::Agent("The agent process is no longer accepting input".to_string()))
    }

    /// Send a control request, returning its request id
    fn request(&self, body: Value) -> Result<String> {
        let request_id = format!("req_{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.send(json!({
            "type": "control_request",
            "request_id": request_id,
            "request": body,
        }))?;
        Ok(request_id)
    }

    fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

struct ProcessInterrupt {
    control: Arc<ControlChannel>,
}

#[async_trait]
impl TurnInterrupt for ProcessInterrupt {
    async fn interrupt(&self) -> Result<()> {
        let request_id = self.control.request(json!({"subtype": "interrupt"}))?;
        debug!("Sent interrupt ({})", request_id);
        Ok(())
    }
}

async fn write_lines(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        let Outbound::Line(message) = outbound else {
            break;
        };
        if let Err(e) = write_line(&mut stdin, &message).await {
            warn!("Failed to write to agent: {}", e);
            break;
        }
    }
    // Dropping stdin closes the pipe
}

async fn write_line(stdin: &mut ChildStdin, message: &Value) -> Result<()> {
    let json = serde_json::to_string(message)?;
    stdin.write_all(json.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    Ok(())
}

fn user_message(prompt: &str) -> Value {
    json!({
        "type": "user",
        "message": {"role": "user", "content": prompt},
        "parent_tool_use_id": null,
        "session_id": "default",
    })
}

#[derive(Debug, Deserialize)]
struct IncomingControlRequest {
    request_id: String,
    request: ControlRequestBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlRequestBody {
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct IncomingControlResponse {
    response: ControlResponseBody,
}

#[derive(Debug, Deserialize)]
struct ControlResponseBody {
    subtype: String,
    request_id: String,
    #[serde(default)]
    response: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct InitializeResponse {
    #[serde(default)]
    commands: Vec<SlashCommand>,
}

fn message_type(message: &Value) -> &str {
    message.get("type").and_then(Value::as_str).unwrap_or_default()
}

/// Read until the reply to `initialize`, keeping anything else for later
async fn await_initialize(
    lines: &mut Lines<BufReader<ChildStdout>>,
    request_id: &str,
) -> Result<(Vec<SlashCommand>, Vec<Value>)> {
    let mut early = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let Some(message) = parse_line(&line) else {
            continue;
        };
        if message_type(&message) != "control_response" {
            early.push(message);
            continue;
        }
        let reply: IncomingControlResponse = serde_json::from_value(message)
            .map_err(|e| Error::Protocol(format!("Malformed control response: {}", e)))?;
        if reply.response.request_id != request_id {
            continue;
        }
        return match reply.response.subtype.as_str() {
            "success" => {
                let init: InitializeResponse = match reply.response.response {
                    Some(body) => serde_json::from_value(body).unwrap_or_else(|e| {
                        warn!("Ignoring unreadable initialize reply: {}", e);
                        InitializeResponse::default()
                    }),
                    None => InitializeResponse::default(),
                };
                Ok((init.commands, early))
            }
            _ => Err(Error::Agent(format!(
                "Agent rejected initialize: {}",
                reply.response.error.unwrap_or_else(|| "unknown error".to_string())
            ))),
        };
    }
    Err(Error::Agent("The agent exited during initialization".to_string()))
}

fn parse_line(line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Skipping non-JSON agent output: {}", e);
            None
        }
    }
}

fn permission_reply(request_id: &str, decision: &PermissionDecision) -> Value {
    let body = match decision {
        PermissionDecision::Allow { updated_input } => {
            json!({"behavior": "allow", "updatedInput": updated_input})
        }
        PermissionDecision::Deny { message } => json!({"behavior": "deny", "message": message}),
    };
    json!({
        "type": "control_response",
        "response": {"subtype": "success", "request_id": request_id, "response": body},
    })
}

fn unsupported_reply(request_id: &str) -> Value {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": "Unsupported control request",
        },
    })
}

/// Forwards agent stdout to the controller for one turn
struct StdoutReader {
    lines: Lines<BufReader<ChildStdout>>,
    child: Child,
    events: mpsc::Sender<RawEvent>,
    control: Arc<ControlChannel>,
    permissions: Arc<dyn PermissionHandler>,
    last_stderr: Arc<Mutex<Option<String>>>,
}

impl StdoutReader {
    async fn run(mut self, early: Vec<Value>) {
        let mut saw_result = false;
        for message in early {
            if !self.dispatch(message, &mut saw_result).await {
                return;
            }
        }

        loop {
            let line = tokio::select! {
                _ = self.events.closed() => {
                    debug!("Turn receiver dropped, stopping agent");
                    return;
                }
                line = self.lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    let Some(message) = parse_line(&line) else {
                        continue;
                    };
                    if !self.dispatch(message, &mut saw_result).await {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = self
                        .events
                        .send(Err(Error::Agent(format!("Failed to read agent output: {}", e))))
                        .await;
                    return;
                }
            }
        }

        let status = self.child.wait().await;
        debug!("Agent exited: {:?}", status);
        if !saw_result {
            let detail = self
                .last_stderr
                .lock()
                .clone()
                .unwrap_or_else(|| match &status {
                    Ok(status) => format!("exit status {}", status),
                    Err(e) => e.to_string(),
                });
            let _ = self
                .events
                .send(Err(Error::Agent(format!(
                    "The agent exited before finishing the turn: {}",
                    detail
                ))))
                .await;
        }
    }

    /// Handle one message; returns false once the controller stopped listening
    async fn dispatch(&mut self, message: Value, saw_result: &mut bool) -> bool {
        let kind = message_type(&message).to_string();
        match kind.as_str() {
            "control_request" => {
                self.handle_control_request(message);
                true
            }
            "control_response" | "control_cancel_request" => {
                debug!("Ignoring {}", kind);
                true
            }
            "result" => {
                *saw_result = true;
                let forwarded = self.events.send(Ok(message)).await.is_ok();
                // The turn is over; let the agent exit
                self.control.close();
                forwarded
            }
            _ => self.events.send(Ok(message)).await.is_ok(),
        }
    }

    fn handle_control_request(&self, message: Value) {
        let request: IncomingControlRequest = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed control request from agent: {}", e);
                return;
            }
        };

        match request.request {
            ControlRequestBody::CanUseTool {
                tool_name,
                input,
                tool_use_id,
            } => {
                // Answered on its own task so output keeps flowing while a
                // human decides
                let permissions = self.permissions.clone();
                let control = self.control.clone();
                let request_id = request.request_id;
                tokio::spawn(async move {
                    let decision = permissions
                        .can_use_tool(PermissionRequest {
                            tool_name,
                            input,
                            tool_use_id,
                        })
                        .await;
                    if let Err(e) = control.send(permission_reply(&request_id, &decision)) {
                        debug!("Could not deliver permission decision: {}", e);
                    }
                });
            }
            ControlRequestBody::Other => {
                debug!("Unsupported control request {}", request.request_id);
                let _ = self.control.send(unsupported_reply(&request.request_id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn turn_request() -> TurnRequest {
        TurnRequest {
            prompt: "hello".to_string(),
            resume_session_id: None,
            vault_path: PathBuf::from("/tmp"),
            model: None,
            event_buffer: 16,
        }
    }

    #[test]
    fn test_command_args_for_new_session() {
        let client = ProcessTurnClient::new("claude", vec!["--debug".to_string()]);
        let args = client.command_args(&turn_request());
        assert!(args.windows(2).any(|w| w == ["--output-format", "stream-json"]));
        assert!(args.windows(2).any(|w| w == ["--permission-prompt-tool", "stdio"]));
        assert!(!args.contains(&"--resume".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--debug"));
    }

    #[test]
    fn test_command_args_for_resume_with_model() {
        let client = ProcessTurnClient::from_config(&AgentConfig::default());
        let mut request = turn_request();
        request.resume_session_id = Some("sess-1".to_string());
        request.model = Some("sonnet".to_string());

        let args = client.command_args(&request);
        assert!(args.windows(2).any(|w| w == ["--resume", "sess-1"]));
        assert!(args.windows(2).any(|w| w == ["--model", "sonnet"]));
    }

    #[test]
    fn test_user_message_shape() {
        let message = user_message("Summarise my inbox");
        assert_eq!(message["type"], "user");
        assert_eq!(message["message"]["content"], "Summarise my inbox");
    }

    #[test]
    fn test_permission_reply_shapes() {
        let allow = permission_reply(
            "req-7",
            &PermissionDecision::Allow {
                updated_input: json!({"command": "ls"}),
            },
        );
        assert_eq!(allow["type"], "control_response");
        assert_eq!(allow["response"]["request_id"], "req-7");
        assert_eq!(allow["response"]["response"]["behavior"], "allow");
        assert_eq!(allow["response"]["response"]["updatedInput"]["command"], "ls");

        let deny = permission_reply("req-8", &PermissionDecision::deny("nope"));
        assert_eq!(deny["response"]["response"]["behavior"], "deny");
        assert_eq!(deny["response"]["response"]["message"], "nope");
    }

    #[test]
    fn test_control_request_parsing() {
        let request: IncomingControlRequest = serde_json::from_value(json!({
            "type": "control_request",
            "request_id": "abc",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "Write",
                "input": {"file_path": "a.md"},
                "permission_suggestions": [],
                "tool_use_id": "toolu_1"
            }
        }))
        .unwrap();
        assert_eq!(request.request_id, "abc");
        assert!(matches!(
            request.request,
            ControlRequestBody::CanUseTool { ref tool_name, .. } if tool_name == "Write"
        ));

        let other: IncomingControlRequest = serde_json::from_value(json!({
            "type": "control_request",
            "request_id": "def",
            "request": {"subtype": "hook_callback", "callback_id": "x"}
        }))
        .unwrap();
        assert!(matches!(other.request, ControlRequestBody::Other));
    }

    #[test]
    fn test_initialize_response_commands() {
        let init: InitializeResponse = serde_json::from_value(json!({
            "commands": [{"name": "compact", "description": "Compact the conversation", "argumentHint": "<instructions>"}],
            "models": []
        }))
        .unwrap();
        assert_eq!(init.commands.len(), 1);
        assert_eq!(init.commands[0].argument_hint.as_deref(), Some("<instructions>"));
    }

    #[test]
    fn test_parse_line_skips_noise() {
        assert!(parse_line("   ").is_none());
        assert!(parse_line("not json").is_none());
        assert_eq!(parse_line(r#"{"type":"result"}"#).map(|v| message_type(&v).to_string()), Some("result".to_string()));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_agent_error() {
        struct DenyAll;
        #[async_trait]
        impl PermissionHandler for DenyAll {
            async fn can_use_tool(&self, _request: PermissionRequest) -> PermissionDecision {
                PermissionDecision::deny("no")
            }
        }

        let client = ProcessTurnClient::new("vaultchat-agent-that-does-not-exist", Vec::new());
        let result = client.start(turn_request(), Arc::new(DenyAll)).await;
        assert!(matches!(result, Err(Error::Agent(_))));
    }
}
