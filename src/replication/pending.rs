use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::Result;

/// Writes published by this node which are waiting for their completion.
#[derive(Debug, Default)]
pub struct PendingWrites {
    waiters: DashMap<Uuid, oneshot::Sender<Result<()>>>,
}

impl PendingWrites {
    pub fn new() -> PendingWrites {
        PendingWrites::default()
    }

    /// Register a waiter. Must happen before the write is published, the
    /// completion can arrive before `send` returns.
    pub fn register(&self, uuid: Uuid) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(uuid, tx);
        rx
    }

    /// Resolve the waiter of `uuid`, if this node has one.
    pub fn complete(&self, uuid: Uuid, result: Result<()>) -> bool {
        match self.waiters.remove(&uuid) {
            Some((_, tx)) => {
                // The caller may have timed out and gone away.
                let _ = tx.send(result);
                true
            }
            None => {
                debug!(%uuid, "No local waiter for completed write");
                false
            }
        }
    }

    /// Forget a waiter which will not be resolved.
    pub fn cancel(&self, uuid: &Uuid) {
        self.waiters.remove(uuid);
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
