//! Store facade
//!
//! Every operation asks the membership table where its key lives. Keys of
//! local partitions are served from the `LocalStore` directly; everything
//! else becomes a request to the owning domain and the calling task parks
//! until the reply arrives.
//!
//! The `serve_*` functions are the owner side of the same operations and
//! are shared by local callers and the request handlers.

use dmk_hal::HAL;
use dmk_ipc::{Request, Response};
use dmk_kernel_core::{
    Access, CapDescriptor, DomainId, Item, ItemType, Key, KernelError, LockToken, MembershipFlags, PeId,
    ServiceDescriptor, Waiter, Woken,
};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::waiters::Wake;

/// Value found under a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Partition item
    Item(Item),
    /// Capability, keyed by a capability type tag
    Capability(CapDescriptor),
    /// Service, keyed by the `Service` type tag
    Service(ServiceDescriptor),
}

impl Value {
    pub fn into_item(self) -> Option<Item> {
        match self {
            Value::Item(item) => Some(item),
            _ => None,
        }
    }
}

/// Outcome of serving a request that may have had to wait.
pub(crate) enum Served<T> {
    Done(T),
    /// The key's partition left this domain while the task waited
    Moved,
}

impl<H: HAL> Kernel<H> {
    // === Lookups ===

    /// Look up `key` wherever it lives.
    ///
    /// Waits while the item is locked. `Ok(None)` if it does not exist.
    pub async fn get(&self, key: Key) -> Result<Option<Value>> {
        self.fetch(key, false).await
    }

    /// Look up a partition item and take its lock.
    ///
    /// The returned item carries the lock token needed by `unlock` and
    /// `put_unlocking`.
    pub async fn get_locking(&self, key: Key) -> Result<Option<Item>> {
        Ok(self.fetch(key, true).await?.and_then(Value::into_item))
    }

    async fn fetch(&self, key: Key, want_lock: bool) -> Result<Option<Value>> {
        loop {
            if self.is_local(key) {
                match self.serve_get(key, want_lock).await? {
                    Served::Done(value) => return Ok(value),
                    Served::Moved => {
                        debug!(target: "dmk::store", %key, "partition moved while waiting, re-routing");
                        continue;
                    }
                }
            }
            let owner = self.route(key)?;
            return match self.call(owner, Request::Get { key, want_lock }).await? {
                Response::Item(item) => Ok(item.map(Value::Item)),
                Response::Capability(desc) => Ok(desc.map(Value::Capability)),
                Response::Service(desc) => Ok(desc.map(Value::Service)),
                _ => Err(Error::UnexpectedReply),
            };
        }
    }

    /// Owner side of `get`, dispatching on the key's type tag.
    pub(crate) async fn serve_get(&self, key: Key, want_lock: bool) -> Result<Served<Option<Value>>> {
        let ty = key.item_type();
        if ty.is_capability() || ty == ItemType::Service {
            if want_lock {
                return Err(KernelError::InvalidArgs.into());
            }
            let state = self.state();
            let value = if ty == ItemType::Service {
                state.services.descriptor(key).map(Value::Service)
            } else {
                state
                    .capability(key)
                    .map(|cap| Value::Capability(cap.descriptor()))
            };
            return Ok(Served::Done(value));
        }

        let rx = {
            let mut state = self.state_mut();
            match state.store.get(key, want_lock) {
                Access::Found(item) => return Ok(Served::Done(Some(Value::Item(item)))),
                Access::NotFound => return Ok(Served::Done(None)),
                Access::Locked => {
                    let (token, rx) = self.register();
                    if !state.store.enqueue(key, Waiter { token, want_lock }) {
                        self.cancel(token);
                        return Ok(Served::Done(None));
                    }
                    debug!(target: "dmk::store", %key, ?token, want_lock, "waiting for locked item");
                    rx
                }
            }
        };
        match self.wait(rx).await? {
            Wake::Item(Woken::Served(item)) => Ok(Served::Done(Some(Value::Item(item)))),
            Wake::Item(Woken::NotFound) => Ok(Served::Done(None)),
            Wake::Item(Woken::Migrated) => Ok(Served::Moved),
            _ => Err(Error::UnexpectedReply),
        }
    }

    // === Updates ===

    /// Insert or replace an item.
    ///
    /// `lock` must be the holder's token if the item is locked, including a
    /// reservation placeholder.
    pub async fn put(&self, key: Key, data: Vec<u8>, lock: Option<LockToken>) -> Result<()> {
        if self.is_local(key) {
            return Ok(self.state_mut().store.put(key, data, lock)?);
        }
        self.expect_done(Request::Put { key, data, lock }).await
    }

    /// Replace a locked item and release its lock.
    pub async fn put_unlocking(&self, key: Key, data: Vec<u8>, lock: LockToken) -> Result<()> {
        if self.is_local(key) {
            let wakeups = self.state_mut().store.put_unlocking(key, data, lock)?;
            self.wake_items(wakeups);
            return Ok(());
        }
        self.expect_done(Request::PutUnlocking { key, data, lock }).await
    }

    /// Take the lock of an existing item without waiting.
    ///
    /// `WouldBlock` if someone else holds it, `NotFound` if absent.
    pub async fn lock(&self, key: Key) -> Result<LockToken> {
        if self.is_local(key) {
            return Ok(self.state_mut().store.lock(key)?);
        }
        match self.call(self.route(key)?, Request::Lock { key }).await? {
            Response::Lock(token) => Ok(token),
            _ => Err(Error::UnexpectedReply),
        }
    }

    /// Release a lock, handing the item to the next queued task.
    pub async fn unlock(&self, key: Key, lock: LockToken) -> Result<()> {
        if self.is_local(key) {
            self.serve_unlock(key, lock)?;
            return Ok(());
        }
        self.expect_done(Request::Unlock { key, lock }).await
    }

    /// Claim a key that does not exist yet.
    ///
    /// Returns the placeholder's lock token, or `None` if the key is taken.
    pub async fn reserve(&self, key: Key) -> Result<Option<LockToken>> {
        if self.is_local(key) {
            return Ok(self.state_mut().store.reserve(key)?);
        }
        match self.call(self.route(key)?, Request::Reserve { key }).await? {
            Response::Reservation(token) => Ok(token),
            _ => Err(Error::UnexpectedReply),
        }
    }

    /// Drop a reservation placeholder.
    pub async fn release(&self, key: Key, lock: LockToken) -> Result<()> {
        if self.is_local(key) {
            self.serve_release(key, lock)?;
            return Ok(());
        }
        self.expect_done(Request::Release { key, lock }).await
    }

    /// Delete an item unconditionally. Tasks waiting on it see `NotFound`.
    pub async fn remove(&self, key: Key) -> Result<()> {
        if self.is_local(key) {
            self.serve_remove(key);
            return Ok(());
        }
        self.expect_done(Request::Remove { key }).await
    }

    async fn expect_done(&self, request: Request) -> Result<()> {
        let Some(key) = request.routing_key() else {
            return Err(KernelError::InvalidArgs.into());
        };
        match self.call(self.route(key)?, request).await? {
            Response::Done => Ok(()),
            _ => Err(Error::UnexpectedReply),
        }
    }

    pub(crate) fn serve_unlock(&self, key: Key, lock: LockToken) -> Result<(), KernelError> {
        let wakeups = self.state_mut().store.unlock(key, lock)?;
        self.wake_items(wakeups);
        Ok(())
    }

    pub(crate) fn serve_release(&self, key: Key, lock: LockToken) -> Result<(), KernelError> {
        let wakeups = self.state_mut().store.release(key, lock)?;
        self.wake_items(wakeups);
        Ok(())
    }

    pub(crate) fn serve_remove(&self, key: Key) {
        let removed = self.state_mut().store.remove(key);
        if let Some(mut item) = removed {
            let wakeups = item.dismiss_waiters(Woken::NotFound);
            self.wake_items(wakeups);
        }
    }

    // === Migration ===

    /// Hand the partitions of `pes` over to `destination`.
    ///
    /// While the transfer is in flight the PEs are flagged `Migrating` and
    /// requests for them are redirected to `destination`. Tasks queued on
    /// their items are told to re-route. If the destination cannot be
    /// reached the partitions are restored.
    pub async fn migrate(&self, pes: &[PeId], destination: DomainId) -> Result<()> {
        let dest_pe = self
            .config()
            .kernel_pe(destination)
            .ok_or(KernelError::InvalidArgs)?;
        if destination == self.domain() || pes.is_empty() {
            return Err(KernelError::InvalidArgs.into());
        }
        let (images, wakeups) = {
            let mut state = self.state_mut();
            let movable = pes.iter().all(|pe| {
                let entry = state.membership.entry(*pe);
                entry.domain == self.domain() && entry.flags == MembershipFlags::Normal
            });
            if !movable {
                return Err(KernelError::InvalidArgs.into());
            }
            state
                .membership
                .update(pes, destination, dest_pe, MembershipFlags::Migrating);
            state.store.take_partitions(pes)
        };
        info!(target: "dmk::store", ?pes, %destination, "migrating partitions");
        self.wake_items(wakeups);

        let backup = images.clone();
        let err = match self
            .call(destination, Request::PartitionMigrate { partitions: images })
            .await
        {
            Ok(Response::Done) => {
                self.update_membership(pes, destination, dest_pe, MembershipFlags::Normal, true);
                return Ok(());
            }
            Ok(_) => Error::UnexpectedReply,
            Err(err) => err,
        };
        warn!(target: "dmk::store", ?pes, %destination, %err, "migration failed, restoring partitions");
        let own_pe = self.config().kernel_pe(self.domain()).unwrap_or(dest_pe);
        if let Err(install_err) = self.state_mut().reclaim_partitions(pes, own_pe, backup) {
            error!(target: "dmk::store", ?pes, %install_err, "restored partitions are empty");
            return Err(install_err.into());
        }
        Err(err)
    }

    /// Destination side of a migration.
    pub(crate) fn accept_partitions(&self, partitions: Vec<dmk_kernel_core::PartitionImage>) -> Result<(), KernelError> {
        let pes: Vec<PeId> = partitions.iter().map(|p| p.pe).collect();
        self.state_mut().store.install(partitions)?;
        let own_pe = self
            .config()
            .kernel_pe(self.domain())
            .ok_or(KernelError::InvalidArgs)?;
        info!(target: "dmk::store", ?pes, "partitions installed");
        self.update_membership(&pes, self.domain(), own_pe, MembershipFlags::Normal, true);
        Ok(())
    }
}
