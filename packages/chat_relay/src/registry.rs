//! Conversation Registry
//!
//! Process-scoped map from conversation id to conversation state. Entries are
//! created on first reference and never evicted; closing a conversation marks
//! it inactive but keeps the entry, so a closed id permanently rejects new
//! connections.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::models::{ChatMessage, Role};

/// WebSocket close code sent on rejected or force-closed connections.
pub const POLICY_VIOLATION: u16 = 1008;

/// Payloads pushed to a connection's outbound channel by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// One incremental fragment of the assistant reply, forwarded verbatim.
    Fragment(String),
    /// Structured error payload, serialized as `{"error": text}`.
    Error(String),
}

/// Handle to one live connection, held in the conversation's attachment set.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub tx: mpsc::Sender<Outbound>,
    /// Cancelled to force-disconnect the connection (conversation close).
    pub cancel: CancellationToken,
}

struct ConversationInner {
    messages: Vec<ChatMessage>,
    active: bool,
    connections: HashMap<String, ConnectionHandle>,
}

/// One conversation's state. All mutation of `messages`, `active`, and the
/// attachment set is serialized behind a single per-conversation mutex;
/// different conversations never share a lock.
pub struct Conversation {
    id: String,
    inner: Mutex<ConversationInner>,
}

impl Conversation {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            inner: Mutex::new(ConversationInner {
                messages: vec![ChatMessage::system_prompt()],
                active: true,
                connections: HashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.active
    }

    pub async fn attach(&self, connection_id: &str, handle: ConnectionHandle) {
        let mut inner = self.inner.lock().await;
        inner.connections.insert(connection_id.to_string(), handle);
    }

    /// Remove a connection from the live set. Tolerant of ids not present.
    pub async fn detach(&self, connection_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.connections.remove(connection_id);
    }

    /// Append one message to history. History is append-only; callers check
    /// `is_active` before starting a turn — append itself does not reject.
    pub async fn append(&self, role: Role, content: impl Into<String>) -> ChatMessage {
        let message = ChatMessage::new(role, content);
        let mut inner = self.inner.lock().await;
        inner.messages.push(message.clone());
        message
    }

    /// Snapshot of the full ordered history.
    pub async fn history(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.messages.clone()
    }

    /// Load durable history into a freshly created conversation. No-op once
    /// any turn exists, so concurrent connects hydrate exactly once. A stored
    /// history without a leading system message gets one inserted.
    pub async fn hydrate_if_empty(&self, stored: Vec<ChatMessage>) {
        let mut inner = self.inner.lock().await;
        if inner.messages.len() > 1 || stored.is_empty() {
            return;
        }

        let mut messages = Vec::with_capacity(stored.len() + 1);
        if stored.first().map(|m| m.role) != Some(Role::System) {
            messages.push(ChatMessage::system_prompt());
        }
        messages.extend(stored);
        inner.messages = messages;
    }

    /// Mark the conversation inactive and force-disconnect every attached
    /// connection. Runs entirely under the conversation lock so no connection
    /// can attach mid-close without observing the flag afterwards.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.active = false;
        for handle in inner.connections.values() {
            handle.cancel.cancel();
        }
        inner.connections.clear();
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }
}

/// Process-wide registry. `get_or_create` is an atomic insert-if-absent:
/// concurrent calls with the same new id observe one state object.
pub struct ConversationRegistry {
    conversations: Mutex<HashMap<String, Arc<Conversation>>>,
}

impl Default for ConversationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, id: &str) -> Arc<Conversation> {
        let mut map = self.conversations.lock().await;
        map.entry(id.to_string())
            .or_insert_with(|| Arc::new(Conversation::new(id)))
            .clone()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Conversation>> {
        self.conversations.lock().await.get(id).cloned()
    }
}
