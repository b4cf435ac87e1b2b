//! Session registry
//!
//! Maps session ids to shells under a single lock. Only map mutations happen
//! under the lock; shells are never terminated while it is held, so a slow
//! shutdown never blocks lookups on other sessions.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::shell::ShellSession;

/// Errors raised by registry mutations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Maximum sessions limit reached ({max})")]
    CapacityExceeded { max: usize },

    #[error("Session already exists: {0}")]
    DuplicateId(String),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Concurrency-safe map of live sessions with a capacity limit
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<ShellSession>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Insert a session, failing when the registry is full
    pub async fn create(&self, session: Arc<ShellSession>) -> RegistryResult<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= self.max_sessions {
            return Err(RegistryError::CapacityExceeded {
                max: self.max_sessions,
            });
        }
        if sessions.contains_key(session.id()) {
            return Err(RegistryError::DuplicateId(session.id().to_string()));
        }
        debug!(session_id = %session.id(), "Registered session");
        sessions.insert(session.id().to_string(), session);
        Ok(())
    }

    /// Whether another session would fit right now
    pub async fn has_capacity(&self) -> bool {
        self.sessions.lock().await.len() < self.max_sessions
    }

    /// Look up a live session
    ///
    /// A session whose shell has died is evicted and reported as absent.
    pub async fn get(&self, id: &str) -> Option<Arc<ShellSession>> {
        let dead = {
            let mut sessions = self.sessions.lock().await;
            if !sessions.get(id)?.is_dead() {
                return sessions.get(id).cloned();
            }
            sessions.remove(id)
        };

        if let Some(session) = dead {
            debug!(session_id = %id, "Evicting dead session on lookup");
            if let Err(e) = session.terminate().await {
                warn!(session_id = %id, error = %e, "Failed to clean up dead session");
            }
        }
        None
    }

    /// Look up a session without checking liveness
    pub async fn peek(&self, id: &str) -> Option<Arc<ShellSession>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Remove `session` only if it is still the entry registered under its id
    pub async fn evict(&self, session: &Arc<ShellSession>) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(session.id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.id());
                true
            }
            _ => false,
        }
    }

    /// Terminate a session, then remove its entry
    ///
    /// Returns whether this call removed it; concurrent deletes of one id
    /// report `true` exactly once.
    pub async fn delete(&self, id: &str) -> bool {
        let Some(session) = self.peek(id).await else {
            return false;
        };

        if let Err(e) = session.terminate().await {
            warn!(session_id = %id, error = %e, "Failed to terminate deleted session");
        }
        let removed = self.evict(&session).await;
        if removed {
            debug!(session_id = %id, "Deleted session");
        }
        removed
    }

    /// Snapshot of registered ids
    pub async fn list_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Snapshot of registered sessions
    pub async fn snapshot(&self) -> Vec<Arc<ShellSession>> {
        self.sessions.lock().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Remove every entry, returning the removed sessions
    pub async fn drain(&self) -> Vec<Arc<ShellSession>> {
        self.sessions
            .lock()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect()
    }
}
