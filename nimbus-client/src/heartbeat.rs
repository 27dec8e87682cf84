use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nimbus_common::NimbusError;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Interval between keep-alive RPCs for an ephemeral Dict/Queue/Volume.
pub const HEARTBEAT_SLEEP: Duration = Duration::from_secs(30);

/// One running heartbeat task, as held by the ephemeral object it keeps
/// alive. Dropping the handle does not stop the task; call [`close`] for
/// that (and to let the registry forget about it).
///
/// [`close`]: EphemeralHandle::close
pub struct EphemeralHandle {
    id: u64,
    cancel: CancellationToken,
    task: AsyncMutex<Option<JoinHandle<()>>>,
    registry: HeartbeatRegistry,
}

impl EphemeralHandle {
    /// Cancels the heartbeat task. Idempotent, and safe to call while a
    /// heartbeat RPC is in flight -- the task notices cancellation at its
    /// next sleep or retry boundary.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.registry.forget(self.id).await;
    }
}

#[derive(Clone, Default)]
pub struct HeartbeatRegistry {
    tasks: Arc<AsyncMutex<HashMap<u64, Arc<EphemeralHandle>>>>,
    next_id: Arc<AtomicU64>,
}

impl HeartbeatRegistry {
    /// Spawns a new heartbeat task that calls `heartbeat_once` immediately
    /// and then every `HEARTBEAT_SLEEP`, swallowing retriable failures and
    /// stopping only on cancellation.
    pub async fn spawn<F, Fut>(&self, heartbeat_once: F) -> Arc<EphemeralHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NimbusError>> + Send,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                if let Err(error) = heartbeat_once().await {
                    if error.is_retriable() {
                        warn!(%error, "ephemeral object heartbeat failed, will retry");
                    } else {
                        warn!(%error, "ephemeral object heartbeat failed permanently");
                        return;
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(HEARTBEAT_SLEEP) => {}
                    _ = task_cancel.cancelled() => return,
                }
            }
        });

        let handle = Arc::new(EphemeralHandle {
            id,
            cancel,
            task: AsyncMutex::new(Some(task)),
            registry: self.clone(),
        });

        self.tasks.lock().await.insert(id, handle.clone());
        handle
    }

    async fn forget(&self, id: u64) {
        self.tasks.lock().await.remove(&id);
    }

    /// Cancels every heartbeat still registered. Called once from
    /// [`crate::Client::close`].
    pub async fn stop_all(&self) {
        let handles: Vec<_> = self.tasks.lock().await.drain().map(|(_, v)| v).collect();
        for handle in handles {
            handle.cancel.cancel();
            if let Some(task) = handle.task.lock().await.take() {
                let _ = task.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use test_r::test;

    #[test]
    async fn close_stops_further_heartbeats() {
        let registry = HeartbeatRegistry::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let handle = registry
            .spawn(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.close().await;
        let after_close = calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after_close);
    }
}
