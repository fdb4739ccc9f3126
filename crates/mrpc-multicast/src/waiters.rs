//! Per-object wait queues for the busy locks.
//!
//! A task that finds a group or connection busy enqueues a oneshot under
//! the same lock that showed it busy, drops the lock and awaits. Whoever
//! returns the object to idle (or breaks it) wakes every queued task in
//! arrival order; each woken task re-runs its lookups and may queue again.
use std::collections::{HashMap, VecDeque};

use mrpc_transport::{ConnHandle, GroupSlot};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum WaitKey {
    Group(GroupSlot),
    Connection(ConnHandle),
}

#[derive(Debug, Default)]
pub(crate) struct WaitQueues {
    queues: HashMap<WaitKey, VecDeque<oneshot::Sender<()>>>,
}

impl WaitQueues {
    pub(crate) fn enqueue(&mut self, key: WaitKey) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.queues.entry(key).or_default().push_back(tx);
        rx
    }

    pub(crate) fn wake_all(&mut self, key: WaitKey) {
        if let Some(queue) = self.queues.remove(&key) {
            tracing::trace!("waking {} waiter(s) on {key:?}", queue.len());
            for tx in queue {
                // Receiver gone means the waiter was dropped; nothing to wake.
                let _ = tx.send(());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn waiting(&self, key: WaitKey) -> usize {
        self.queues.get(&key).map_or(0, VecDeque::len)
    }
}
