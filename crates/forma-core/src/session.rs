use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use crate::history::{BoundedHistory, HistoryEntry, HISTORY_CAPACITY};

struct SessionState {
    history: BoundedHistory,
    artifact_slot: Option<String>,
}

struct SessionInner {
    id: String,
    created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    // Serializes script executions within one session so a re-run always
    // observes the previous run's completed file state.
    exec_lock: Mutex<()>,
}

/// Cheap clonable handle to one connection's conversational state.
///
/// Histories are never shared between sessions; all mutation goes through
/// this handle's own locks, so appends preserve arrival order.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl SessionHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4().to_string(),
                created_at: Utc::now(),
                state: RwLock::new(SessionState {
                    history: BoundedHistory::new(HISTORY_CAPACITY),
                    artifact_slot: None,
                }),
                exec_lock: Mutex::new(()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub async fn append_history(&self, entry: HistoryEntry) {
        let mut state = self.inner.state.write().await;
        state.history.push(entry);
    }

    pub async fn history_len(&self) -> usize {
        self.inner.state.read().await.history.len()
    }

    /// The full prompt for the next model turn: every retained history
    /// entry joined with newlines in insertion order.
    pub async fn build_prompt(&self) -> String {
        self.inner.state.read().await.history.render()
    }

    pub async fn artifact_slot(&self) -> Option<String> {
        self.inner.state.read().await.artifact_slot.clone()
    }

    /// Reuse the session's artifact slot, or mint one and record it so
    /// subsequent runs overwrite the same files.
    pub async fn resolve_artifact_slot(&self, mint: impl FnOnce() -> String) -> String {
        let mut state = self.inner.state.write().await;
        if let Some(slot) = &state.artifact_slot {
            return slot.clone();
        }
        let slot = mint();
        state.artifact_slot = Some(slot.clone());
        slot
    }

    pub async fn lock_execution(&self) -> MutexGuard<'_, ()> {
        self.inner.exec_lock.lock().await
    }
}

#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session under a fresh connection-scoped id. Identity is
    /// never derived from the peer address.
    pub async fn create(&self) -> SessionHandle {
        let handle = SessionHandle::new();
        self.sessions
            .write()
            .await
            .insert(handle.id().to_string(), handle.clone());
        handle
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop the session and hand back its artifact slot (if any) so the
    /// caller can delete the files.
    pub async fn destroy(&self, id: &str) -> Option<String> {
        let handle = self.sessions.write().await.remove(id)?;
        handle.artifact_slot().await
    }
}
