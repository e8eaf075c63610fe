use std::sync::Arc;

use tokio_util::sync::{CancellationToken, DropGuard};

/// Keeps a background worker (a pool or the topology) running. Clones share one guard; once the
/// last clone is dropped the worker's listener fires and the worker shuts itself down.
#[derive(Debug, Clone)]
pub(crate) struct WorkerHandle {
    _guard: Arc<DropGuard>,
}

/// Held by the worker to learn when every [`WorkerHandle`] is gone.
#[derive(Debug)]
pub(crate) struct WorkerHandleListener {
    token: CancellationToken,
}

impl WorkerHandleListener {
    pub(crate) fn channel() -> (WorkerHandle, WorkerHandleListener) {
        let token = CancellationToken::new();
        let handle = WorkerHandle {
            _guard: Arc::new(token.clone().drop_guard()),
        };
        (handle, WorkerHandleListener { token })
    }

    /// Resolves once all handles have been dropped. Meant to be one arm of a `select!`.
    pub(crate) async fn wait_for_all_handle_drops(&self) {
        self.token.cancelled().await
    }
}
