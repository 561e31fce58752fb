//! Capability operations
//!
//! Creation and local derivation are synchronous. `obtain` derives a
//! capability owned by another domain into a local table: the owner records
//! the child pointer and sends back a descriptor, which is installed at a
//! selector reserved for the duration of the call.

use dmk_hal::HAL;
use dmk_ipc::{Notice, Request, Response};
use dmk_kernel_core::{CapDescriptor, EpId, Key, KernelError, OwnerId, PeId, Selector, TableKind};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::kernel::Kernel;

impl<H: HAL> Kernel<H> {
    /// Root memory capability for `size` bytes at `addr` on memory PE `pe`.
    pub fn create_mem(&self, owner: OwnerId, sel: Selector, pe: PeId, addr: u64, size: u64, perms: u8) -> Result<Key> {
        Ok(self.state_mut().create_mem(owner, sel, pe, addr, size, perms)?)
    }

    /// Root send capability to endpoint `ep` of `receiver`.
    pub fn create_msg(
        &self,
        owner: OwnerId,
        sel: Selector,
        receiver: OwnerId,
        ep: EpId,
        label: u64,
        credits: u32,
    ) -> Result<Key> {
        Ok(self
            .state_mut()
            .create_msg(owner, sel, receiver, ep, label, credits)?)
    }

    pub fn create_map(&self, owner: OwnerId, page: Selector, phys: u64, attr: u8) -> Result<Key> {
        Ok(self.state_mut().create_map(owner, page, phys, attr)?)
    }

    /// Register service `name` and give `owner` its capability.
    pub fn create_service(&self, owner: OwnerId, sel: Selector, name: &str) -> Result<Key> {
        let key = self.state_mut().create_service(owner, sel, name)?;
        debug!(target: "dmk::store", %key, name, "service registered");
        Ok(key)
    }

    pub fn create_session(
        &self,
        owner: OwnerId,
        sel: Selector,
        service: Key,
        ident: u64,
        server_owned: bool,
    ) -> Result<Key> {
        Ok(self
            .state_mut()
            .create_session(owner, sel, service, ident, server_owned)?)
    }

    pub fn create_vpe(&self, owner: OwnerId, sel: Selector, vpe: OwnerId) -> Result<Key> {
        Ok(self.state_mut().create_vpe(owner, sel, vpe)?)
    }

    /// Record that a message or memory capability configured endpoint `ep`.
    pub fn bind_endpoint(&self, key: Key, ep: EpId) -> Result<()> {
        Ok(self.state_mut().bind_endpoint(key, ep)?)
    }

    /// Derive a local capability into another local table.
    pub fn derive(&self, src: Key, dst_owner: OwnerId, dst_sel: Selector) -> Result<Key> {
        if self.state().revocations.is_in_flight(src) {
            return Err(KernelError::NotFound.into());
        }
        Ok(self.state_mut().derive(src, dst_owner, dst_sel)?)
    }

    /// Derive `parent`, wherever it lives, into `(child_owner, child_sel)`.
    pub async fn obtain(&self, parent: Key, child_owner: OwnerId, child_sel: Selector) -> Result<Key> {
        if self.is_local(parent) {
            return self.derive(parent, child_owner, child_sel);
        }
        let owner = self.route(parent)?;
        let kind = TableKind::of(parent);
        {
            let mut state = self.state_mut();
            if !state
                .membership
                .is_local(Key::for_owner(child_owner, kind.generic_type(), child_sel as u64))
            {
                return Err(KernelError::InvalidArgs.into());
            }
            state.table_mut(child_owner, kind).reserve(child_sel)?;
        }

        let reply = self
            .call(
                owner,
                Request::Obtain {
                    parent,
                    child_owner,
                    child_sel,
                },
            )
            .await;
        let desc = match reply {
            Ok(Response::Obtained(desc)) => desc,
            Ok(_) => {
                self.state_mut().table_mut(child_owner, kind).unreserve(child_sel);
                return Err(Error::UnexpectedReply);
            }
            Err(err) => {
                self.state_mut().table_mut(child_owner, kind).unreserve(child_sel);
                return Err(err);
            }
        };

        let installed = self.state_mut().install_obtained(&desc, parent);
        match installed {
            Ok(key) => {
                debug!(target: "dmk::store", %parent, child = %key, "capability obtained");
                Ok(key)
            }
            Err(err) => {
                warn!(target: "dmk::store", %parent, child = %desc.key(), %err, "obtained capability rejected");
                self.state_mut().table_mut(child_owner, kind).unreserve(child_sel);
                self.notify(
                    self.route(parent).unwrap_or(owner),
                    Notice::RemoveChildPointer {
                        parent,
                        child: desc.key(),
                    },
                );
                Err(err.into())
            }
        }
    }

    /// Owner side of `obtain`.
    pub(crate) fn serve_obtain(
        &self,
        parent: Key,
        child_owner: OwnerId,
        child_sel: Selector,
    ) -> Result<CapDescriptor, KernelError> {
        let mut state = self.state_mut();
        if state.revocations.is_in_flight(parent) {
            return Err(KernelError::NotFound);
        }
        state.prepare_obtain(parent, child_owner, child_sel)
    }
}
