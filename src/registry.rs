use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::Conversation;

/// Shared handle to one active conversation. The mutex serializes
/// concurrent `send`/`compare` calls against the same conversation.
pub type SharedConversation = Arc<Mutex<Conversation>>;

#[derive(Clone)]
struct Entry {
    /// Conversation id, duplicated outside the mutex so lookups never block
    /// on an in-flight model call.
    conversation_id: String,
    handle: SharedConversation,
}

/// Active conversations keyed by client session id. Injected into the API
/// layer through the router state; each session holds at most one
/// conversation at a time.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Entry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a conversation for a session, replacing (abandoning) any
    /// previous one held by the same session.
    pub fn insert(&self, session_id: &str, conversation: Conversation) -> SharedConversation {
        let entry = Entry {
            conversation_id: conversation.id.clone(),
            handle: Arc::new(Mutex::new(conversation)),
        };
        let handle = entry.handle.clone();
        self.sessions.insert(session_id.to_string(), entry);
        handle
    }

    /// Look up an active conversation by its conversation id.
    pub fn find_by_conversation_id(&self, conversation_id: &str) -> Option<SharedConversation> {
        self.sessions.iter().find_map(|entry| {
            (entry.value().conversation_id == conversation_id)
                .then(|| entry.value().handle.clone())
        })
    }

    /// Remove the session entry holding the given conversation id.
    /// Returns the conversation handle for final persistence.
    pub fn remove_by_conversation_id(&self, conversation_id: &str) -> Option<SharedConversation> {
        let session_id = self.sessions.iter().find_map(|entry| {
            (entry.value().conversation_id == conversation_id).then(|| entry.key().clone())
        })?;
        self.sessions
            .remove(&session_id)
            .map(|(_, entry)| entry.handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
