//! Capabilities
//!
//! A capability is a right to one kernel object. It carries its global key,
//! the key of the capability it was derived from, and the ordered keys of
//! the capabilities derived from it. Children may live in other domains;
//! only the domain owning a capability ever edits its child list.
//!
//! # Child order
//!
//! ```text
//!   children: [ local.., remote(d0).., remote(d1).., remote(d2).. ]   d0 < d1 < d2
//! ```
//!
//! Local children are kept first so a revocation tears down everything it
//! can reach in-process before it starts messaging. Remote children are
//! grouped per owning domain, ascending, and stay in insertion order within
//! a group.

use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::key::{ItemType, Key};
use crate::membership::MembershipTable;
use crate::services::ServiceRegistry;
use crate::types::{EpId, OwnerId, PeId, Selector};

/// log2 of the page size used for mapping capabilities
pub const PAGE_BITS: u32 = 12;

/// Message gate shared by all message capabilities derived from one root.
#[derive(Debug, PartialEq, Eq)]
pub struct MsgObject {
    /// Key of the gate object
    pub key: Key,
    /// PE hosting the receive endpoint
    pub pe: PeId,
    /// VPE owning the receive endpoint
    pub owner: OwnerId,
    /// Receive endpoint
    pub ep: EpId,
    /// Label delivered with every message
    pub label: u64,
    /// Send credits
    pub credits: u32,
}

/// Memory region shared by all memory capabilities derived from one root.
#[derive(Debug, PartialEq, Eq)]
pub struct MemObject {
    /// Key of the memory object
    pub key: Key,
    /// Memory PE holding the region
    pub pe: PeId,
    /// Start address
    pub addr: u64,
    /// Size in bytes
    pub size: u64,
    /// Access permissions
    pub perms: u8,
    /// Region is a view on memory owned elsewhere and must not be freed
    pub derived: bool,
}

/// Session between a client and a service.
#[derive(Debug, PartialEq, Eq)]
pub struct SessionObject {
    /// Service the session belongs to
    pub service: Key,
    /// Identifier chosen by the server
    pub ident: u64,
    /// Whether the server created the session
    pub server_owned: bool,
}

/// Kind-specific payload of a capability.
#[derive(Clone, Debug)]
pub enum CapKind {
    /// Right to send to a message gate
    Msg {
        obj: Rc<MsgObject>,
        bound_ep: Option<EpId>,
    },
    /// Right to access a memory region
    Mem {
        obj: Rc<MemObject>,
        bound_ep: Option<EpId>,
    },
    /// Page mapping
    Map { phys: u64, attr: u8 },
    /// Right to serve a service
    Service { service: Key },
    /// Right to use a session
    Session { session: Rc<SessionObject> },
    /// Right to control a VPE
    VirtPe { vpe: OwnerId },
}

impl CapKind {
    /// Key type tag for this kind.
    pub fn item_type(&self) -> ItemType {
        match self {
            CapKind::Msg { .. } => ItemType::MsgCap,
            CapKind::Mem { .. } => ItemType::MemCap,
            CapKind::Map { .. } => ItemType::MapCap,
            CapKind::Service { .. } => ItemType::SrvCap,
            CapKind::Session { .. } => ItemType::SessCap,
            CapKind::VirtPe { .. } => ItemType::VpeCap,
        }
    }
}

/// Platform work a revoked capability leaves behind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevokeAction {
    /// Invalidate an endpoint configured from the capability
    InvalidateEndpoint { owner: OwnerId, ep: EpId },
    /// Return a memory region to its allocator
    FreeMemory { pe: PeId, addr: u64, size: u64 },
    /// Remove a page mapping
    Unmap { owner: OwnerId, virt: u64 },
    /// Tell the server a session is gone
    CloseSession { service: Key, ident: u64 },
}

/// Wire form of a capability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapDescriptor {
    Msg {
        key: Key,
        obj: Key,
        pe: PeId,
        owner: OwnerId,
        ep: EpId,
        label: u64,
        credits: u32,
    },
    Mem {
        key: Key,
        obj: Key,
        pe: PeId,
        addr: u64,
        size: u64,
        perms: u8,
    },
    Map {
        key: Key,
        phys: u64,
        attr: u8,
    },
    Service {
        key: Key,
        service: Key,
    },
    Session {
        key: Key,
        service: Key,
        ident: u64,
    },
    VirtPe {
        key: Key,
        vpe: OwnerId,
    },
}

impl CapDescriptor {
    /// Key of the described capability.
    pub fn key(&self) -> Key {
        match self {
            CapDescriptor::Msg { key, .. }
            | CapDescriptor::Mem { key, .. }
            | CapDescriptor::Map { key, .. }
            | CapDescriptor::Service { key, .. }
            | CapDescriptor::Session { key, .. }
            | CapDescriptor::VirtPe { key, .. } => *key,
        }
    }

    /// Type tag matching the descriptor variant.
    pub fn item_type(&self) -> ItemType {
        match self {
            CapDescriptor::Msg { .. } => ItemType::MsgCap,
            CapDescriptor::Mem { .. } => ItemType::MemCap,
            CapDescriptor::Map { .. } => ItemType::MapCap,
            CapDescriptor::Service { .. } => ItemType::SrvCap,
            CapDescriptor::Session { .. } => ItemType::SessCap,
            CapDescriptor::VirtPe { .. } => ItemType::VpeCap,
        }
    }
}

/// A right held in a capability table.
#[derive(Clone, Debug)]
pub struct Capability {
    key: Key,
    parent: Option<Key>,
    children: Vec<Key>,
    kind: CapKind,
}

impl Capability {
    /// Root capability without parent.
    pub fn new(key: Key, kind: CapKind) -> Self {
        debug_assert_eq!(key.item_type(), kind.item_type());
        Self {
            key,
            parent: None,
            children: Vec::new(),
            kind,
        }
    }

    /// Copy of this capability under a new key, derived from this one.
    ///
    /// Shared objects are shared, not duplicated. The new capability has no
    /// children and does not keep the source's endpoint binding.
    pub fn derive(&self, key: Key) -> Self {
        let kind = match &self.kind {
            CapKind::Msg { obj, .. } => CapKind::Msg {
                obj: Rc::clone(obj),
                bound_ep: None,
            },
            CapKind::Mem { obj, .. } => CapKind::Mem {
                obj: Rc::clone(obj),
                bound_ep: None,
            },
            other => other.clone(),
        };
        Self {
            key,
            parent: Some(self.key),
            children: Vec::new(),
            kind,
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn parent(&self) -> Option<Key> {
        self.parent
    }

    pub fn set_parent(&mut self, parent: Option<Key>) {
        self.parent = parent;
    }

    pub fn children(&self) -> &[Key] {
        &self.children
    }

    pub fn kind(&self) -> &CapKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut CapKind {
        &mut self.kind
    }

    /// Selector the capability occupies in its table, `None` when the key's
    /// object id is too wide for one.
    pub fn selector(&self) -> Option<Selector> {
        Selector::try_from(self.key.object_id()).ok()
    }

    /// Detach the child list, leaving it empty.
    pub fn take_children(&mut self) -> Vec<Key> {
        std::mem::take(&mut self.children)
    }

    /// Record a derived capability, keeping the documented child order.
    pub fn add_child(&mut self, child: Key, membership: &MembershipTable) {
        if membership.is_local(child) {
            self.children.insert(0, child);
            return;
        }
        let domain = membership.route_domain(child.pe_id());
        let position = self
            .children
            .iter()
            .rposition(|c| !membership.is_local(*c) && membership.route_domain(c.pe_id()) <= domain)
            .map(|i| i + 1)
            .unwrap_or_else(|| self.children.iter().take_while(|c| membership.is_local(**c)).count());
        self.children.insert(position, child);
    }

    /// Remove a child by exact key.
    pub fn remove_child(&mut self, child: Key) -> bool {
        let before = self.children.len();
        self.children.retain(|c| *c != child);
        self.children.len() != before
    }

    /// Remove a child whatever capability type its key carries.
    pub fn remove_child_all_types(&mut self, child: Key) -> bool {
        let before = self.children.len();
        self.children.retain(|c| !c.same_slot(child));
        self.children.len() != before
    }

    /// Decide the side effects of revoking this capability.
    ///
    /// Must be called while the capability is still in its table, so strong
    /// counts include this capability's own reference. `had_children` tells
    /// whether the child list was non-empty before it was detached.
    pub fn revoke(
        &self,
        membership: &MembershipTable,
        services: &mut ServiceRegistry,
        had_children: bool,
    ) -> Result<Vec<RevokeAction>, KernelError> {
        let owner = self.key.owner_id();
        let mut actions = Vec::new();
        match &self.kind {
            CapKind::Msg { bound_ep, .. } => {
                if let Some(ep) = bound_ep {
                    actions.push(RevokeAction::InvalidateEndpoint { owner, ep: *ep });
                }
            }
            CapKind::Mem { obj, bound_ep } => {
                if let Some(ep) = bound_ep {
                    actions.push(RevokeAction::InvalidateEndpoint { owner, ep: *ep });
                }
                if Rc::strong_count(obj) == 1 && !obj.derived && membership.is_local(obj.key) {
                    actions.push(RevokeAction::FreeMemory {
                        pe: obj.pe,
                        addr: obj.addr,
                        size: obj.size,
                    });
                }
            }
            CapKind::Map { .. } => {
                actions.push(RevokeAction::Unmap {
                    owner,
                    virt: self.key.object_id() << PAGE_BITS,
                });
            }
            CapKind::Service { service } => {
                if let Some(svc) = services.get_mut(*service) {
                    let was_closing = svc.closing;
                    svc.closing = true;
                    if svc.pending > 0 || (had_children && !was_closing) {
                        return Err(KernelError::MessagesWaiting);
                    }
                    services.retire(*service);
                }
            }
            CapKind::Session { session } => {
                // The service and this capability are the only holders left.
                if session.server_owned && Rc::strong_count(session) == 2 {
                    if let Some(svc) = services.get_mut(session.service) {
                        svc.sessions.retain(|s| !Rc::ptr_eq(s, session));
                    }
                    actions.push(RevokeAction::CloseSession {
                        service: session.service,
                        ident: session.ident,
                    });
                }
            }
            CapKind::VirtPe { .. } => {}
        }
        Ok(actions)
    }

    /// Wire form of this capability.
    pub fn descriptor(&self) -> CapDescriptor {
        let key = self.key;
        match &self.kind {
            CapKind::Msg { obj, .. } => CapDescriptor::Msg {
                key,
                obj: obj.key,
                pe: obj.pe,
                owner: obj.owner,
                ep: obj.ep,
                label: obj.label,
                credits: obj.credits,
            },
            CapKind::Mem { obj, .. } => CapDescriptor::Mem {
                key,
                obj: obj.key,
                pe: obj.pe,
                addr: obj.addr,
                size: obj.size,
                perms: obj.perms,
            },
            CapKind::Map { phys, attr } => CapDescriptor::Map {
                key,
                phys: *phys,
                attr: *attr,
            },
            CapKind::Service { service } => CapDescriptor::Service {
                key,
                service: *service,
            },
            CapKind::Session { session } => CapDescriptor::Session {
                key,
                service: session.service,
                ident: session.ident,
            },
            CapKind::VirtPe { vpe } => CapDescriptor::VirtPe { key, vpe: *vpe },
        }
    }

    /// Rebuild a capability received from another domain.
    ///
    /// Objects are recreated locally; memory is marked derived so the copy
    /// never frees a region it does not own.
    pub fn from_descriptor(desc: &CapDescriptor, parent: Option<Key>) -> Result<Self, KernelError> {
        if desc.key().item_type() != desc.item_type() {
            return Err(KernelError::InvalidArgs);
        }
        let kind = match *desc {
            CapDescriptor::Msg {
                obj,
                pe,
                owner,
                ep,
                label,
                credits,
                ..
            } => CapKind::Msg {
                obj: Rc::new(MsgObject {
                    key: obj,
                    pe,
                    owner,
                    ep,
                    label,
                    credits,
                }),
                bound_ep: None,
            },
            CapDescriptor::Mem {
                obj,
                pe,
                addr,
                size,
                perms,
                ..
            } => CapKind::Mem {
                obj: Rc::new(MemObject {
                    key: obj,
                    pe,
                    addr,
                    size,
                    perms,
                    derived: true,
                }),
                bound_ep: None,
            },
            CapDescriptor::Map { phys, attr, .. } => CapKind::Map { phys, attr },
            CapDescriptor::Service { service, .. } => CapKind::Service { service },
            CapDescriptor::Session { service, ident, .. } => CapKind::Session {
                session: Rc::new(SessionObject {
                    service,
                    ident,
                    server_owned: false,
                }),
            },
            CapDescriptor::VirtPe { vpe, .. } => CapKind::VirtPe { vpe },
        };
        Ok(Self {
            key: desc.key(),
            parent,
            children: Vec::new(),
            kind,
        })
    }
}
