use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::AppResult;
use crate::storage::{ConversationState, Storage};

/// Shared, persisted view of one conversation's research state.
///
/// Concurrent task futures within a level mutate the state through
/// [`StateHandle::update`], which applies the change and persists it while
/// holding the lock so every write lands in order.
#[derive(Clone)]
pub struct StateHandle {
    storage: Arc<dyn Storage>,
    state: Arc<Mutex<ConversationState>>,
}

impl StateHandle {
    /// Wrap a loaded state.
    pub fn new(storage: Arc<dyn Storage>, state: ConversationState) -> Self {
        Self {
            storage,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Clone the current state.
    pub async fn snapshot(&self) -> ConversationState {
        self.state.lock().await.clone()
    }

    /// Apply a mutation and persist the result.
    pub async fn update<R>(&self, f: impl FnOnce(&mut ConversationState) -> R) -> AppResult<R> {
        let mut state = self.state.lock().await;
        let result = f(&mut state);
        state.updated_at = Utc::now();
        self.storage.update_conversation_state(&state).await?;
        Ok(result)
    }
}
