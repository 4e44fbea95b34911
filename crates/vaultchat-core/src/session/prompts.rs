//! Pending prompt registry
//!
//! Holds the prompts that pause a turn until a human decides. Each entry
//! owns the `oneshot` sender its waiter listens on and the handle of a
//! deadline task.
//!
//! ## Resolution
//!
//! - `resolve` removes the entry (only when the response kind matches),
//!   cancels the deadline and delivers `PromptOutcome::Answered`
//! - the deadline task removes the entry and delivers `PromptOutcome::TimedOut`
//! - `abandon_all` drains every entry; waiters see a closed channel
//!
//! All three go through removal under the registry mutex, so exactly one
//! of them wins for a given prompt and the others are no-ops.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::types::{PendingPrompt, PromptResponse, RejectionReason};

/// How a pending prompt was settled
#[derive(Debug, Clone, PartialEq)]
pub enum PromptOutcome {
    Answered(PromptResponse),
    /// Nobody answered before the deadline
    TimedOut,
}

struct PendingEntry {
    prompt: PendingPrompt,
    responder: oneshot::Sender<PromptOutcome>,
    deadline: Option<JoinHandle<()>>,
}

type EntryMap = Mutex<HashMap<String, PendingEntry>>;

/// In-memory map from prompt id to an outstanding human decision
#[derive(Clone)]
pub struct PendingPromptRegistry {
    entries: Arc<EntryMap>,
    timeout: Duration,
}

impl PendingPromptRegistry {
    /// Create a registry whose prompts expire after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a prompt and start its deadline
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(&self, prompt: PendingPrompt) -> oneshot::Receiver<PromptOutcome> {
        let (responder, waiter) = oneshot::channel();
        let id = prompt.id.clone();

        self.entries.lock().insert(
            id.clone(),
            PendingEntry {
                prompt,
                responder,
                deadline: None,
            },
        );

        let weak = Arc::downgrade(&self.entries);
        let timeout = self.timeout;
        let deadline_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(&weak, &deadline_id);
        });

        // The deadline may already have fired for a zero timeout
        match self.entries.lock().get_mut(&id) {
            Some(entry) => entry.deadline = Some(handle),
            None => handle.abort(),
        }

        debug!("Registered pending prompt {}", id);
        waiter
    }

    /// Deliver a human response to a pending prompt
    ///
    /// Unknown ids and responses whose kind does not match the prompt are
    /// rejected; a mismatched response leaves the prompt outstanding.
    pub fn resolve(&self, prompt_id: &str, response: PromptResponse) -> Result<(), RejectionReason> {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.get(prompt_id) {
                Some(entry) if entry.prompt.kind() == response.kind() => entries.remove(prompt_id),
                Some(entry) => {
                    debug!(
                        "Response kind {} does not match prompt {} ({})",
                        response.kind(),
                        prompt_id,
                        entry.prompt.kind()
                    );
                    None
                }
                None => None,
            }
        };

        let Some(entry) = entry else {
            return Err(RejectionReason::NotFound);
        };

        if let Some(deadline) = entry.deadline {
            deadline.abort();
        }
        // The waiter may already be gone if its turn was interrupted
        let _ = entry.responder.send(PromptOutcome::Answered(response));
        debug!("Resolved pending prompt {}", prompt_id);
        Ok(())
    }

    /// Drop every outstanding prompt without answering it
    ///
    /// Waiters observe a closed channel. Returns the number abandoned.
    pub fn abandon_all(&self) -> usize {
        let drained: Vec<PendingEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            if let Some(deadline) = entry.deadline {
                deadline.abort();
            }
        }
        if count > 0 {
            info!("Abandoned {} pending prompt(s)", count);
        }
        count
    }

    /// Remove a single prompt without answering it
    pub fn abandon(&self, prompt_id: &str) -> bool {
        let entry = self.entries.lock().remove(prompt_id);
        match entry {
            Some(entry) => {
                if let Some(deadline) = entry.deadline {
                    deadline.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Outstanding prompts, oldest first
    pub fn list(&self) -> Vec<PendingPrompt> {
        let mut prompts: Vec<PendingPrompt> = self
            .entries
            .lock()
            .values()
            .map(|e| e.prompt.clone())
            .collect();
        prompts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        prompts
    }

    pub fn contains(&self, prompt_id: &str) -> bool {
        self.entries.lock().contains_key(prompt_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn expire(entries: &Weak<EntryMap>, prompt_id: &str) {
    let Some(entries) = entries.upgrade() else {
        return;
    };
    let entry = entries.lock().remove(prompt_id);
    if let Some(entry) = entry {
        info!("Pending prompt {} timed out, denying", prompt_id);
        let _ = entry.responder.send(PromptOutcome::TimedOut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn permission_prompt() -> PendingPrompt {
        PendingPrompt::tool_permission("Bash", json!({"command": "ls"}))
    }

    #[tokio::test]
    async fn test_resolve_delivers_response() {
        let registry = PendingPromptRegistry::new(Duration::from_secs(60));
        let prompt = permission_prompt();
        let id = prompt.id.clone();
        let waiter = registry.register(prompt);
        assert!(registry.contains(&id));

        registry.resolve(&id, PromptResponse::allow()).unwrap();

        assert_eq!(waiter.await.unwrap(), PromptOutcome::Answered(PromptResponse::allow()));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown_prompt() {
        let registry = PendingPromptRegistry::new(Duration::from_secs(60));
        let result = registry.resolve("missing", PromptResponse::allow());
        assert_eq!(result, Err(RejectionReason::NotFound));
    }

    #[tokio::test]
    async fn test_kind_mismatch_keeps_prompt_outstanding() {
        let registry = PendingPromptRegistry::new(Duration::from_secs(60));
        let prompt = permission_prompt();
        let id = prompt.id.clone();
        let _waiter = registry.register(prompt);

        let result = registry.resolve(&id, PromptResponse::answers(HashMap::new()));
        assert_eq!(result, Err(RejectionReason::NotFound));
        assert!(registry.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_times_out_prompt() {
        let registry = PendingPromptRegistry::new(Duration::from_secs(60));
        let prompt = permission_prompt();
        let id = prompt.id.clone();
        let waiter = registry.register(prompt);

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(waiter.await.unwrap(), PromptOutcome::TimedOut);
        assert!(!registry.contains(&id));
        assert_eq!(
            registry.resolve(&id, PromptResponse::allow()),
            Err(RejectionReason::NotFound)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_before_deadline_wins() {
        let registry = PendingPromptRegistry::new(Duration::from_secs(60));
        let prompt = permission_prompt();
        let id = prompt.id.clone();
        let waiter = registry.register(prompt);

        tokio::time::advance(Duration::from_secs(30)).await;
        registry.resolve(&id, PromptResponse::deny("no")).unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;

        assert_eq!(
            waiter.await.unwrap(),
            PromptOutcome::Answered(PromptResponse::deny("no"))
        );
    }

    #[tokio::test]
    async fn test_abandon_all_closes_waiters() {
        let registry = PendingPromptRegistry::new(Duration::from_secs(60));
        let first = registry.register(permission_prompt());
        let second = registry.register(PendingPrompt::ask_user_question(vec![]));
        assert_eq!(registry.len(), 2);

        assert_eq!(registry.abandon_all(), 2);
        assert!(registry.is_empty());
        assert!(first.await.is_err());
        assert!(second.await.is_err());
    }

    #[tokio::test]
    async fn test_abandon_single_prompt() {
        let registry = PendingPromptRegistry::new(Duration::from_secs(60));
        let prompt = permission_prompt();
        let id = prompt.id.clone();
        let waiter = registry.register(prompt);

        assert!(registry.abandon(&id));
        assert!(!registry.abandon(&id));
        assert!(waiter.await.is_err());
    }

    #[tokio::test]
    async fn test_list_is_oldest_first() {
        let registry = PendingPromptRegistry::new(Duration::from_secs(60));
        let first = permission_prompt();
        let mut second = permission_prompt();
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        let first_id = first.id.clone();

        let _b = registry.register(second);
        let _a = registry.register(first);

        let listed = registry.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first_id);
    }
}
