// src/manager.rs

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::TransferConfig;
use crate::models::{Progress, SessionState};
use crate::session::{SessionHandle, TransferSession};

/// Default number of sessions allowed to transfer at the same time.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 3;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("session with ID {0} not found")]
    SessionNotFound(u64),
}

/// Snapshot of one tracked session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: u64,
    pub url: String,
    pub progress: Progress,
}

struct TrackedSession {
    url: String,
    cancel: CancellationToken,
    progress: watch::Receiver<Progress>,
}

/// Admits sessions into a fixed number of transfer slots.
///
/// Sessions started here wait in `Created` until a slot frees up, then run
/// exactly like a standalone session.
pub struct TransferManager {
    gate: Arc<Semaphore>,
    max_concurrent_transfers: usize,
    sessions: Mutex<HashMap<u64, TrackedSession>>,
}

impl TransferManager {
    pub fn new(max_concurrent_transfers: usize) -> Self {
        let max_concurrent_transfers = max_concurrent_transfers.max(1);
        Self {
            gate: Arc::new(Semaphore::new(max_concurrent_transfers)),
            max_concurrent_transfers,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_concurrent_transfers(&self) -> usize {
        self.max_concurrent_transfers
    }

    pub async fn start(&self, url: impl Into<String>, config: TransferConfig) -> SessionHandle {
        let handle = TransferSession::new(url, config).with_gate(Arc::clone(&self.gate)).start();
        self.sessions.lock().await.insert(
            handle.id(),
            TrackedSession {
                url: handle.url().to_string(),
                cancel: handle.cancellation_token(),
                progress: handle.subscribe(),
            },
        );
        info!(id = handle.id(), url = handle.url(), "session queued");
        handle
    }

    pub async fn progress(&self, id: u64) -> Result<Progress, ManagerError> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(&id).ok_or(ManagerError::SessionNotFound(id))?;
        let progress = session.progress.borrow().clone();
        Ok(progress)
    }

    pub async fn cancel(&self, id: u64) -> Result<(), ManagerError> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(&id).ok_or(ManagerError::SessionNotFound(id))?;
        if !session.progress.borrow().state.is_terminal() {
            debug!(id, "cancelling session");
            session.cancel.cancel();
        }
        Ok(())
    }

    pub async fn cancel_all(&self) {
        let sessions = self.sessions.lock().await;
        for (id, session) in sessions.iter() {
            if !session.progress.borrow().state.is_terminal() {
                debug!(id, "cancelling session");
                session.cancel.cancel();
            }
        }
    }

    pub async fn snapshots(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.lock().await;
        let mut result: Vec<_> = sessions
            .iter()
            .map(|(id, s)| SessionSummary {
                id: *id,
                url: s.url.clone(),
                progress: s.progress.borrow().clone(),
            })
            .collect();
        result.sort_by_key(|s| s.id);
        result
    }

    /// Sessions currently holding a transfer slot.
    pub async fn active_count(&self) -> usize {
        self.count_where(|state| {
            matches!(state, SessionState::Probing | SessionState::Planning | SessionState::Transferring)
        })
        .await
    }

    /// Sessions still waiting for a slot.
    pub async fn waiting_count(&self) -> usize {
        self.count_where(|state| state == SessionState::Created).await
    }

    async fn count_where(&self, pred: impl Fn(SessionState) -> bool) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.values().filter(|s| pred(s.progress.borrow().state)).count()
    }

    /// Forget sessions that reached a terminal state. Returns how many were removed.
    pub async fn prune_finished(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.progress.borrow().state.is_terminal());
        let pruned = before - sessions.len();
        if pruned > 0 {
            debug!(pruned, "pruned finished sessions");
        }
        pruned
    }
}

impl Default for TransferManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_TRANSFERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_ids_are_reported() {
        let manager = TransferManager::default();
        assert!(matches!(manager.progress(42).await, Err(ManagerError::SessionNotFound(42))));
        assert!(matches!(manager.cancel(42).await, Err(ManagerError::SessionNotFound(42))));
    }

    #[tokio::test]
    async fn zero_limit_is_raised_to_one() {
        assert_eq!(TransferManager::new(0).max_concurrent_transfers(), 1);
    }

    #[tokio::test]
    async fn prunes_terminal_sessions() {
        let manager = TransferManager::new(1);
        let config = TransferConfig { retry_ceiling: 0, ..Default::default() };
        let handle = manager.start("http://127.0.0.1:9/never-contacted", config).await;
        let id = handle.id();
        let completion = handle.wait().await;
        assert_eq!(completion.state, SessionState::Failed);

        assert_eq!(manager.progress(id).await.unwrap().state, SessionState::Failed);
        assert_eq!(manager.prune_finished().await, 1);
        assert!(manager.snapshots().await.is_empty());
    }
}
