//! Live session registry
//!
//! The name-to-handle map is the only state shared between the dispatcher
//! and the public handles. The lock is held for map access only, never
//! across I/O.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A running relay session owned by the registry.
#[derive(Debug)]
pub struct SessionHandle {
    session_name: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn new(session_name: String, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            session_name,
            cancel,
            task,
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Signal the session to stop without waiting for it.
    ///
    /// Idempotent; cancelling an already-cancelled session is a no-op.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Signal the session to stop and wait up to `wait` for its task.
    pub async fn shutdown(self, wait: Duration) {
        self.cancel.cancel();
        match tokio::time::timeout(wait, self.task).await {
            Ok(Ok(())) => debug!("Session '{}' stopped", self.session_name),
            Ok(Err(e)) => warn!("Session '{}' task failed: {}", self.session_name, e),
            Err(_) => warn!(
                "Session '{}' did not stop within {:?}",
                self.session_name, wait
            ),
        }
    }
}

/// Concurrency-safe map from session name to running session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, session_name: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(session_name)
    }

    /// Register a session under its name, replacing any previous entry.
    pub fn insert(&self, handle: SessionHandle) {
        self.sessions
            .lock()
            .unwrap()
            .insert(handle.session_name.clone(), handle);
    }

    pub fn remove(&self, session_name: &str) -> Option<SessionHandle> {
        self.sessions.lock().unwrap().remove(session_name)
    }

    /// Snapshot of the registered session names.
    pub fn names(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    /// Remove and return every registered session.
    pub fn drain(&self) -> Vec<SessionHandle> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.drain().map(|(_, handle)| handle).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_handle(name: &str) -> SessionHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { cancel.cancelled().await }
        });
        SessionHandle::new(name.to_string(), cancel, task)
    }

    #[tokio::test]
    async fn test_insert_and_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());

        registry.insert(idle_handle("db-visitor"));
        assert!(registry.contains("db-visitor"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names(), vec!["db-visitor".to_string()]);

        let handle = registry.remove("db-visitor").unwrap();
        assert!(registry.is_empty());
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_remove_unknown_name() {
        let registry = SessionRegistry::new();
        assert!(registry.remove("missing-visitor").is_none());
    }

    #[tokio::test]
    async fn test_drain_empties_registry() {
        let registry = SessionRegistry::new();
        registry.insert(idle_handle("db-visitor"));
        registry.insert(idle_handle("web-visitor"));

        let handles = registry.drain();
        assert_eq!(handles.len(), 2);
        assert!(registry.is_empty());
        for handle in handles {
            handle.shutdown(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let handle = idle_handle("db-visitor");
        handle.close();
        handle.close();
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stuck_task() {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(async {
            std::future::pending::<()>().await;
        });
        let handle = SessionHandle::new("stuck-visitor".to_string(), cancel, task);
        // Returns after the wait elapses even though the task never does.
        handle.shutdown(Duration::from_millis(50)).await;
    }
}
