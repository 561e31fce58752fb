//! Per-domain event loop
//!
//! A domain is single-threaded and cooperative. The loop owns a
//! `LocalPool`; each poll drains the HAL inbox and, frame by frame, spawns
//! a handler task and runs the pool until no task can make progress. A
//! frame is therefore fully handled (including every task it woke) before
//! the next one is looked at, which keeps FIFO delivery meaningful.

use std::future::Future;

use dmk_hal::HAL;
use futures::executor::{LocalPool, LocalSpawner};
use futures::future::RemoteHandle;
use futures::task::LocalSpawnExt;
use tracing::warn;

use crate::error::Result;
use crate::kernel::Kernel;

/// Event loop driving one domain.
pub struct DomainLoop<H: HAL> {
    kernel: Kernel<H>,
    pool: LocalPool,
    spawner: LocalSpawner,
}

impl<H: HAL> DomainLoop<H> {
    pub fn new(kernel: Kernel<H>) -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Self { kernel, pool, spawner }
    }

    pub fn kernel(&self) -> &Kernel<H> {
        &self.kernel
    }

    /// Run a task on this domain.
    pub fn spawn(&self, task: impl Future<Output = ()> + 'static) -> Result<()> {
        self.spawner.spawn_local(task)?;
        Ok(())
    }

    /// Run a task on this domain and keep a handle to its output.
    ///
    /// Dropping the handle cancels the task.
    pub fn spawn_with_handle<F>(&self, task: F) -> Result<RemoteHandle<F::Output>>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        Ok(self.spawner.spawn_local_with_handle(task)?)
    }

    /// Handle everything that is ready.
    ///
    /// Returns the number of frames taken from the inbox. A stopped domain
    /// takes none.
    pub fn poll(&mut self) -> usize {
        self.pool.run_until_stalled();
        if self.kernel.is_stopped() {
            return 0;
        }
        let frames = self.kernel.hal().poll_messages();
        let count = frames.len();
        for (from, frame) in frames {
            if self.kernel.is_stopped() {
                break;
            }
            let kernel = self.kernel.clone();
            if let Err(err) = self
                .spawner
                .spawn_local(async move { kernel.handle_frame(from, frame).await })
            {
                warn!(target: "dmk::ipc", %from, %err, "handler not spawned");
                continue;
            }
            self.pool.run_until_stalled();
            if cfg!(debug_assertions) {
                for violation in self.kernel.check_invariants() {
                    warn!(target: "dmk::ipc", invariant = violation.invariant, "{}", violation.description);
                }
            }
        }
        count
    }

    pub fn is_stopped(&self) -> bool {
        self.kernel.is_stopped()
    }
}
