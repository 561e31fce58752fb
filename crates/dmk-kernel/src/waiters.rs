//! Waiter registry
//!
//! A task that has to wait for something (a reply, a locked item, a
//! revocation) registers here and awaits the receiver it gets back. The
//! token doubles as the request id of outgoing calls, so the reply that
//! carries it wakes exactly this task.

use std::collections::BTreeMap;

use dmk_ipc::Response;
use dmk_kernel_core::{DomainId, KernelError, WaitToken, Woken};
use futures::channel::oneshot;

/// What a parked task is resumed with.
#[derive(Debug)]
pub enum Wake {
    /// Reply to an outgoing request
    Reply {
        served_by: DomainId,
        result: Result<Response, KernelError>,
    },
    /// Outcome of waiting on a locked item
    Item(Woken),
    /// The awaited revocation completed
    Revoked,
}

/// Parked tasks by token.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    next: u64,
    pending: BTreeMap<WaitToken, oneshot::Sender<Wake>>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a token and the receiver to await on it.
    pub fn register(&mut self) -> (WaitToken, oneshot::Receiver<Wake>) {
        self.next += 1;
        let token = WaitToken(self.next);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(token, tx);
        (token, rx)
    }

    /// Resume the task parked on `token`.
    ///
    /// Returns `false` if no task waits on it or the task is gone.
    pub fn notify(&mut self, token: WaitToken, wake: Wake) -> bool {
        self.pending
            .remove(&token)
            .is_some_and(|tx| tx.send(wake).is_ok())
    }

    /// Forget a token without waking anyone.
    pub fn cancel(&mut self, token: WaitToken) {
        self.pending.remove(&token);
    }

    /// Drop every parked task; their receivers resolve as canceled.
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
