//! Supervised singleton manager.
//!
//! At most one manager runs per process, owned by the subject that is signed in.
//! Start, stop and replace all go through one async mutex, so a replace never
//! overlaps the previous manager's shutdown.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::SyncManager;

struct Running {
    owner: i64,
    manager: Arc<SyncManager>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Running {
    async fn shut_down(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(owner = self.owner, "Sync manager task failed: {e}");
        }
    }
}

#[derive(Default)]
pub struct SyncSupervisor {
    current: Mutex<Option<Running>>,
}

impl SyncSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `manager` for `owner`.
    ///
    /// A live manager for the same owner is kept and `false` returned. A manager
    /// for another owner, or one whose loop already exited, is shut down and
    /// replaced.
    pub async fn start(&self, owner: i64, manager: Arc<SyncManager>) -> bool {
        let mut current = self.current.lock().await;
        if let Some(running) = current.as_ref()
            && running.owner == owner
            && !running.handle.is_finished()
        {
            tracing::debug!(owner, "Sync manager already running");
            return false;
        }
        if let Some(previous) = current.take() {
            tracing::info!(from = previous.owner, to = owner, "Replacing sync manager");
            previous.shut_down().await;
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn({
            let manager = Arc::clone(&manager);
            let shutdown = shutdown.clone();
            async move { manager.run(shutdown).await }
        });
        *current = Some(Running {
            owner,
            manager,
            shutdown,
            handle,
        });
        true
    }

    /// Shut down the running manager, waiting for its jobs to wind down. Returns
    /// whether one was running.
    pub async fn stop(&self) -> bool {
        let mut current = self.current.lock().await;
        match current.take() {
            Some(running) => {
                running.shut_down().await;
                true
            }
            None => false,
        }
    }

    pub async fn current_owner(&self) -> Option<i64> {
        self.current.lock().await.as_ref().map(|r| r.owner)
    }

    pub async fn manager(&self) -> Option<Arc<SyncManager>> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|r| Arc::clone(&r.manager))
    }
}
