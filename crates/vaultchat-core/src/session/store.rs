//! Session store - save and load session metadata
//!
//! A session's metadata is written after every turn so it can be resumed
//! later and listed per vault. The file store keeps one JSON document per
//! session under the sessions directory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::types::{SessionId, ToolInvocation};
use crate::error::{Error, Result};

/// Maximum length of a generated session title
const TITLE_MAX_CHARS: usize = 80;

/// Who wrote a stored message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One message of a stored conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            tool_invocations: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>, tool_invocations: Vec<ToolInvocation>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_invocations,
            timestamp: Utc::now(),
        }
    }
}

/// Persisted description of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub id: SessionId,
    pub vault_id: String,
    pub vault_path: PathBuf,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
    #[serde(default)]
    pub cumulative_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionMetadata {
    /// Create metadata for a session whose first prompt is `first_prompt`
    pub fn new(
        id: impl Into<SessionId>,
        vault_id: impl Into<String>,
        vault_path: impl Into<PathBuf>,
        first_prompt: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            vault_id: vault_id.into(),
            vault_path: vault_path.into(),
            title: title_from_prompt(first_prompt),
            messages: Vec::new(),
            cumulative_tokens: 0,
            context_window: None,
            model: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a completed exchange and bump `updated_at`
    pub fn record_turn(&mut self, prompt: &str, content: &str, tools: Vec<ToolInvocation>) {
        self.messages.push(StoredMessage::user(prompt));
        if !content.is_empty() || !tools.is_empty() {
            self.messages.push(StoredMessage::assistant(content, tools));
        }
        self.updated_at = Utc::now();
    }
}

/// First line of the prompt, trimmed to a title
pub fn title_from_prompt(prompt: &str) -> String {
    let line = prompt.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if line.is_empty() {
        return "Untitled session".to_string();
    }
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    let mut title: String = line.chars().take(TITLE_MAX_CHARS - 3).collect();
    title.push_str("...");
    title
}

/// Storage for session metadata
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session: &SessionMetadata) -> Result<()>;

    /// Load a session; `Ok(None)` when it does not exist
    async fn load(&self, session_id: &str) -> Result<Option<SessionMetadata>>;

    /// All sessions, most recently updated first
    async fn list(&self) -> Result<Vec<SessionMetadata>>;

    /// Delete a session; returns whether it existed
    async fn delete(&self, session_id: &str) -> Result<bool>;

    /// Sessions belonging to one vault, most recently updated first
    async fn list_for_vault(&self, vault_id: &str) -> Result<Vec<SessionMetadata>> {
        let sessions = self.list().await?;
        Ok(sessions.into_iter().filter(|s| s.vault_id == vault_id).collect())
    }
}

/// One JSON file per session
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, session_id: &str) -> Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(Error::Store(format!("Invalid session id: {:?}", session_id)));
        }
        Ok(self.dir.join(format!("{}.json", session_id)))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, session: &SessionMetadata) -> Result<()> {
        let path = self.session_path(&session.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let json = serde_json::to_string_pretty(session)?;
        // Write then rename so readers never see a partial file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Saved session {} to {:?}", session.id, path);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionMetadata>> {
        let path = self.session_path(session_id)?;
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let session: SessionMetadata = serde_json::from_str(&json)?;
        Ok(Some(session))
    }

    async fn list(&self) -> Result<Vec<SessionMetadata>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(json) => match serde_json::from_str::<SessionMetadata>(&json) {
                    Ok(session) => sessions.push(session),
                    Err(e) => warn!("Failed to parse session {:?}: {}", path, e),
                },
                Err(e) => warn!("Failed to read session {:?}: {}", path, e),
            }
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let path = self.session_path(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store, for tests and ephemeral use
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionId, SessionMetadata>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &SessionMetadata) -> Result<()> {
        self.sessions.lock().insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<SessionMetadata>> {
        Ok(self.sessions.lock().get(session_id).cloned())
    }

    async fn list(&self) -> Result<Vec<SessionMetadata>> {
        let mut sessions: Vec<SessionMetadata> = self.sessions.lock().values().cloned().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.lock().remove(session_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn metadata(id: &str, vault: &str) -> SessionMetadata {
        SessionMetadata::new(id, vault, "/vaults/notes", "Summarise today's notes")
    }

    #[test]
    fn test_title_from_prompt() {
        assert_eq!(title_from_prompt("  \n Plan my week\nmore"), "Plan my week");
        assert_eq!(title_from_prompt("   "), "Untitled session");

        let long = "x".repeat(200);
        let title = title_from_prompt(&long);
        assert_eq!(title.chars().count(), 80);
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_record_turn_appends_messages() {
        let mut meta = metadata("s-1", "v");
        meta.record_turn("hi", "hello", Vec::new());
        meta.record_turn("again", "", Vec::new());
        assert_eq!(meta.messages.len(), 3);
        assert_eq!(meta.messages[0].role, MessageRole::User);
        assert_eq!(meta.messages[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path().join("sessions"));

        let mut meta = metadata("sess-1", "vault-a");
        meta.cumulative_tokens = 1234;
        store.save(&meta).await.unwrap();

        let loaded = store.load("sess-1").await.unwrap().unwrap();
        assert_eq!(loaded, meta);
        assert!(store.load("sess-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        assert!(matches!(store.load("../etc/passwd").await, Err(Error::Store(_))));
        assert!(matches!(store.load("").await, Err(Error::Store(_))));
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = FileSessionStore::new(dir.path());

        assert!(store.load("bad").await.is_err());
        // Listing skips unreadable entries
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_list_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        assert!(store.list().await.unwrap().is_empty());

        let older = metadata("a", "vault-a");
        let mut newer = metadata("b", "vault-b");
        newer.updated_at = older.updated_at + chrono::Duration::seconds(10);
        store.save(&older).await.unwrap();
        store.save(&newer).await.unwrap();

        let all = store.list().await.unwrap();
        assert_eq!(all.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);

        let vault_a = store.list_for_vault("vault-a").await.unwrap();
        assert_eq!(vault_a.len(), 1);

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_missing_dir_lists_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path().join("does-not-exist"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySessionStore::new();
        store.save(&metadata("m", "v")).await.unwrap();
        assert!(store.load("m").await.unwrap().is_some());
        assert_eq!(store.list_for_vault("v").await.unwrap().len(), 1);
        assert!(store.delete("m").await.unwrap());
        assert!(store.load("m").await.unwrap().is_none());
    }
}
