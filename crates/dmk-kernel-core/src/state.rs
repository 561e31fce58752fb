//! Kernel state
//!
//! Everything one domain knows: its membership view, the partitions it
//! serves, the capability tables of its VPEs, its services and its
//! in-flight revocations. The runtime owns exactly one `KernelState` per
//! domain and passes it explicitly to every operation.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::cap_table::{CapTable, TableKind};
use crate::capability::{CapDescriptor, CapKind, Capability, MemObject, MsgObject, SessionObject};
use crate::error::KernelError;
use crate::key::{pe_of_owner, ItemType, Key};
use crate::membership::{MembershipEntry, MembershipFlags, MembershipTable};
use crate::partition::PartitionImage;
use crate::revocations::RevocationTracker;
use crate::services::ServiceRegistry;
use crate::store::LocalStore;
use crate::types::{DomainId, EpId, OwnerId, PeId, Selector};

/// Object and mapping tables of one VPE.
#[derive(Debug)]
pub struct VpeTables {
    pub objects: CapTable,
    pub mappings: CapTable,
}

impl VpeTables {
    fn new(owner: OwnerId) -> Self {
        Self {
            objects: CapTable::new(owner, TableKind::Object),
            mappings: CapTable::new(owner, TableKind::Mapping),
        }
    }

    pub fn table(&self, kind: TableKind) -> &CapTable {
        match kind {
            TableKind::Object => &self.objects,
            TableKind::Mapping => &self.mappings,
        }
    }

    pub fn table_mut(&mut self, kind: TableKind) -> &mut CapTable {
        match kind {
            TableKind::Object => &mut self.objects,
            TableKind::Mapping => &mut self.mappings,
        }
    }
}

/// State handed to a domain when it joins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapImage {
    /// Membership snapshot
    pub entries: Vec<MembershipEntry>,
    /// Partitions for the PEs the new domain will serve
    pub partitions: Vec<PartitionImage>,
}

/// Complete state of one domain.
pub struct KernelState {
    /// This domain
    pub domain: DomainId,
    /// PE → domain view
    pub membership: MembershipTable,
    /// Partitions served here
    pub store: LocalStore,
    /// Capability tables by VPE
    pub tables: BTreeMap<OwnerId, VpeTables>,
    /// Services hosted here
    pub services: ServiceRegistry,
    /// In-flight revocations
    pub revocations: RevocationTracker,
    next_object: u64,
}

/// Slot a capability key addresses, if its object id fits a selector.
fn slot(key: Key) -> Option<(OwnerId, TableKind, Selector)> {
    let sel = Selector::try_from(key.object_id()).ok()?;
    Some((key.owner_id(), TableKind::of(key), sel))
}

/// Capability at `key` within a set of tables.
///
/// Free function so callers can borrow the tables and the rest of the state
/// independently.
pub fn lookup(tables: &BTreeMap<OwnerId, VpeTables>, key: Key) -> Option<&Capability> {
    let (owner, kind, sel) = slot(key)?;
    tables
        .get(&owner)?
        .table(kind)
        .get(sel)
        .filter(|cap| cap.key().generic() == key.generic())
}

impl KernelState {
    /// Fresh state serving the PEs `membership` assigns to `domain`.
    pub fn new(domain: DomainId, membership: MembershipTable, seed: u64) -> Self {
        let mut store = LocalStore::new(seed);
        store.populate(&membership.local_pes());
        Self {
            domain,
            membership,
            store,
            tables: BTreeMap::new(),
            services: ServiceRegistry::new(),
            revocations: RevocationTracker::new(),
            next_object: 1,
        }
    }

    /// State for a domain joining with a bootstrap image.
    pub fn from_bootstrap(domain: DomainId, image: BootstrapImage, seed: u64) -> Result<Self, KernelError> {
        let membership = MembershipTable::from_entries(domain, &image.entries);
        for partition in &image.partitions {
            if membership.responsible_domain(partition.pe) != domain {
                return Err(KernelError::InvalidArgs);
            }
        }
        let mut state = Self::new(domain, membership, seed);
        state.store.install(image.partitions)?;
        Ok(state)
    }

    /// Take back partitions whose migration failed.
    ///
    /// Membership for `pes` returns to this domain before the images are
    /// reinstalled, so the PEs never stay `Migrating`. If the images cannot be
    /// installed the PEs are served empty and the error is returned.
    pub fn reclaim_partitions(
        &mut self,
        pes: &[PeId],
        own_pe: PeId,
        images: Vec<PartitionImage>,
    ) -> Result<(), KernelError> {
        self.membership
            .update(pes, self.domain, own_pe, MembershipFlags::Normal);
        let installed = self.store.install(images);
        self.store.populate(pes);
        installed
    }

    /// Bootstrap image for a domain that will serve `pes`.
    pub fn bootstrap_image(&self, pes: &[PeId]) -> BootstrapImage {
        BootstrapImage {
            entries: self.membership.entries().to_vec(),
            partitions: self.store.images(pes),
        }
    }

    fn next_object_id(&mut self) -> u64 {
        let id = self.next_object;
        self.next_object += 1;
        id
    }

    /// Tables of `owner`, created on first use.
    pub fn vpe_mut(&mut self, owner: OwnerId) -> &mut VpeTables {
        self.tables.entry(owner).or_insert_with(|| VpeTables::new(owner))
    }

    pub fn table(&self, owner: OwnerId, kind: TableKind) -> Option<&CapTable> {
        self.tables.get(&owner).map(|t| t.table(kind))
    }

    pub fn table_mut(&mut self, owner: OwnerId, kind: TableKind) -> &mut CapTable {
        self.vpe_mut(owner).table_mut(kind)
    }

    /// Capability addressed by `key`, whatever capability type it names.
    pub fn capability(&self, key: Key) -> Option<&Capability> {
        lookup(&self.tables, key)
    }

    pub fn capability_mut(&mut self, key: Key) -> Option<&mut Capability> {
        let (owner, kind, sel) = slot(key)?;
        self.tables
            .get_mut(&owner)?
            .table_mut(kind)
            .get_mut(sel)
            .filter(|cap| cap.key().generic() == key.generic())
    }

    /// Remove a capability from its table.
    pub fn take_capability(&mut self, key: Key) -> Option<Capability> {
        self.capability(key)?;
        let (owner, kind, sel) = slot(key)?;
        self.tables.get_mut(&owner)?.table_mut(kind).unset(sel)
    }

    fn insert(&mut self, cap: Capability) -> Result<Key, KernelError> {
        let key = cap.key();
        if !self.membership.is_local(key) {
            return Err(KernelError::InvalidArgs);
        }
        self.table_mut(key.owner_id(), TableKind::of(key)).set(cap)?;
        Ok(key)
    }

    /// Root memory capability for a region on memory PE `pe`.
    pub fn create_mem(
        &mut self,
        owner: OwnerId,
        sel: Selector,
        pe: PeId,
        addr: u64,
        size: u64,
        perms: u8,
    ) -> Result<Key, KernelError> {
        if size == 0 {
            return Err(KernelError::InvalidArgs);
        }
        let obj = Rc::new(MemObject {
            key: Key::compose(pe, owner, ItemType::MemObj, self.next_object_id()),
            pe,
            addr,
            size,
            perms,
            derived: false,
        });
        let key = Key::for_owner(owner, ItemType::MemCap, u64::from(sel));
        self.insert(Capability::new(key, CapKind::Mem { obj, bound_ep: None }))
    }

    /// Root send capability to endpoint `ep` of `receiver`.
    pub fn create_msg(
        &mut self,
        owner: OwnerId,
        sel: Selector,
        receiver: OwnerId,
        ep: EpId,
        label: u64,
        credits: u32,
    ) -> Result<Key, KernelError> {
        let pe = pe_of_owner(receiver);
        let obj = Rc::new(MsgObject {
            key: Key::compose(pe, receiver, ItemType::MsgObj, self.next_object_id()),
            pe,
            owner: receiver,
            ep,
            label,
            credits,
        });
        let key = Key::for_owner(owner, ItemType::MsgCap, u64::from(sel));
        self.insert(Capability::new(key, CapKind::Msg { obj, bound_ep: None }))
    }

    /// Mapping capability for virtual page `page`.
    pub fn create_map(&mut self, owner: OwnerId, page: Selector, phys: u64, attr: u8) -> Result<Key, KernelError> {
        let key = Key::for_owner(owner, ItemType::MapCap, u64::from(page));
        self.insert(Capability::new(key, CapKind::Map { phys, attr }))
    }

    /// Register a service and hand its capability to `owner`.
    pub fn create_service(&mut self, owner: OwnerId, sel: Selector, name: &str) -> Result<Key, KernelError> {
        let service = Key::for_owner(owner, ItemType::Service, u64::from(sel));
        let key = Key::for_owner(owner, ItemType::SrvCap, u64::from(sel));
        if self.services.by_name(name).is_some() || !self.services.register(service, name) {
            return Err(KernelError::InvalidArgs);
        }
        self.insert(Capability::new(key, CapKind::Service { service }))
            .inspect_err(|_| {
                self.services.retire(service);
            })
    }

    /// Open a session on a local service.
    pub fn create_session(
        &mut self,
        owner: OwnerId,
        sel: Selector,
        service: Key,
        ident: u64,
        server_owned: bool,
    ) -> Result<Key, KernelError> {
        let svc = self.services.get(service).ok_or(KernelError::NotFound)?;
        if svc.closing {
            return Err(KernelError::InvalidArgs);
        }
        let session = Rc::new(SessionObject {
            service,
            ident,
            server_owned,
        });
        let key = Key::for_owner(owner, ItemType::SessCap, u64::from(sel));
        self.insert(Capability::new(
            key,
            CapKind::Session {
                session: Rc::clone(&session),
            },
        ))?;
        if let Some(svc) = self.services.get_mut(service) {
            svc.sessions.push(session);
        }
        Ok(key)
    }

    /// Capability controlling VPE `vpe`.
    pub fn create_vpe(&mut self, owner: OwnerId, sel: Selector, vpe: OwnerId) -> Result<Key, KernelError> {
        let key = Key::for_owner(owner, ItemType::VpeCap, u64::from(sel));
        self.insert(Capability::new(key, CapKind::VirtPe { vpe }))
    }

    /// Record that a message or memory capability configured endpoint `ep`.
    pub fn bind_endpoint(&mut self, key: Key, ep: EpId) -> Result<(), KernelError> {
        let cap = self.capability_mut(key).ok_or(KernelError::NotFound)?;
        match cap.kind_mut() {
            CapKind::Msg { bound_ep, .. } | CapKind::Mem { bound_ep, .. } => {
                *bound_ep = Some(ep);
                Ok(())
            }
            _ => Err(KernelError::InvalidArgs),
        }
    }

    /// Derive a copy of a local capability into a local table.
    pub fn derive(&mut self, src: Key, dst_owner: OwnerId, dst_sel: Selector) -> Result<Key, KernelError> {
        let parent = self.capability(src).ok_or(KernelError::NotFound)?;
        let ty = parent.key().item_type();
        let key = Key::for_owner(dst_owner, ty, u64::from(dst_sel));
        let child = parent.derive(key);
        let parent_key = parent.key();
        self.insert(child)?;
        self.add_child(parent_key, key)?;
        Ok(key)
    }

    /// Record `child` as derived from the local capability `parent`.
    pub fn add_child(&mut self, parent: Key, child: Key) -> Result<(), KernelError> {
        let Self { tables, membership, .. } = self;
        let (owner, kind, sel) = slot(parent).ok_or(KernelError::NotFound)?;
        let cap = tables
            .get_mut(&owner)
            .and_then(|t| t.table_mut(kind).get_mut(sel))
            .filter(|cap| cap.key().generic() == parent.generic())
            .ok_or(KernelError::NotFound)?;
        cap.add_child(child, membership);
        Ok(())
    }

    /// Drop `child` from the child list of `parent`, ignoring type bits.
    pub fn remove_child_pointer(&mut self, parent: Key, child: Key) -> bool {
        self.capability_mut(parent)
            .is_some_and(|cap| cap.remove_child_all_types(child))
    }

    /// Owner side of a cross-domain obtain.
    ///
    /// Records the child pointer and returns the descriptor the requesting
    /// domain installs at `(child_owner, child_sel)`.
    pub fn prepare_obtain(
        &mut self,
        parent: Key,
        child_owner: OwnerId,
        child_sel: Selector,
    ) -> Result<CapDescriptor, KernelError> {
        let cap = self.capability(parent).ok_or(KernelError::NotFound)?;
        let child = Key::for_owner(child_owner, cap.key().item_type(), u64::from(child_sel));
        let desc = cap.derive(child).descriptor();
        let parent_key = cap.key();
        self.add_child(parent_key, child)?;
        Ok(desc)
    }

    /// Requester side of a cross-domain obtain.
    pub fn install_obtained(&mut self, desc: &CapDescriptor, parent: Key) -> Result<Key, KernelError> {
        let cap = Capability::from_descriptor(desc, Some(parent))?;
        self.insert(cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{Access, ItemImage};
    use assert_matches::assert_matches;

    fn state() -> KernelState {
        let mut membership = MembershipTable::new(DomainId(0));
        let pes: Vec<_> = (0..4).map(PeId).collect();
        membership.update(&pes, DomainId(0), PeId(0), MembershipFlags::Normal);
        membership.update(&[PeId(4)], DomainId(1), PeId(4), MembershipFlags::Normal);
        KernelState::new(DomainId(0), membership, 7)
    }

    #[test]
    fn test_derive_links_parent_and_child() {
        let mut state = state();
        let root = state.create_mem(OwnerId(1), 1, PeId(0), 0, 4096, 3).unwrap();
        let child = state.derive(root, OwnerId(2), 5).unwrap();

        assert_eq!(state.capability(root).unwrap().children(), &[child]);
        assert_eq!(state.capability(child).unwrap().parent(), Some(root));
        assert_eq!(child.item_type(), ItemType::MemCap);
    }

    #[test]
    fn test_lookup_accepts_generic_key() {
        let mut state = state();
        let key = state.create_vpe(OwnerId(1), 3, OwnerId(2)).unwrap();
        let generic = Key::for_owner(OwnerId(1), ItemType::GenericObjCap, 3);
        assert_eq!(state.capability(generic).map(Capability::key), Some(key));
        assert!(state.take_capability(generic).is_some());
        assert!(state.capability(key).is_none());
    }

    #[test]
    fn test_object_id_wider_than_selector_addresses_nothing() {
        let mut state = state();
        let key = state.create_vpe(OwnerId(1), 2, OwnerId(2)).unwrap();
        let wide = Key::for_owner(OwnerId(1), ItemType::VpeCap, u64::from(u32::MAX) + 3);

        assert!(state.capability(wide).is_none());
        assert!(state.capability_mut(wide).is_none());
        assert!(state.take_capability(wide).is_none());
        assert_eq!(state.add_child(wide, key), Err(KernelError::NotFound));
        assert_eq!(
            state
                .table_mut(OwnerId(1), TableKind::Object)
                .set(Capability::new(wide, CapKind::VirtPe { vpe: OwnerId(3) })),
            Err(KernelError::InvalidArgs)
        );
        assert!(state.capability(key).unwrap().children().is_empty());
    }

    #[test]
    fn test_reclaim_restores_membership_even_when_install_fails() {
        let mut state = state();
        let pes = [PeId(2), PeId(3)];
        state.store.put(Key::compose(PeId(2), OwnerId(2), ItemType::NoType, 1), vec![1], None).unwrap();
        state.membership.update(&pes, DomainId(1), PeId(4), MembershipFlags::Migrating);
        let (mut images, _) = state.store.take_partitions(&pes);
        images[1].items.push(ItemImage {
            key: Key::compose(PeId(1), OwnerId(1), ItemType::NoType, 9),
            data: vec![],
            lock: None,
            reservation: false,
        });

        assert_eq!(state.reclaim_partitions(&pes, PeId(0), images), Err(KernelError::InvalidArgs));
        for pe in pes {
            assert!(state.membership.is_populated(pe));
            assert_eq!(state.membership.owner_of(pe), Some(DomainId(0)));
            assert_eq!(state.membership.entry(pe).flags, MembershipFlags::Normal);
            assert!(state.store.partition(pe).is_some());
        }
        assert!(crate::invariants::check_all_invariants(&state).is_empty());
    }

    #[test]
    fn test_reclaim_reinstalls_items() {
        let mut state = state();
        let key = Key::compose(PeId(3), OwnerId(3), ItemType::NoType, 1);
        state.store.put(key, vec![7], None).unwrap();
        state.membership.update(&[PeId(3)], DomainId(1), PeId(4), MembershipFlags::Migrating);
        let (images, _) = state.store.take_partitions(&[PeId(3)]);

        state.reclaim_partitions(&[PeId(3)], PeId(0), images).unwrap();
        assert!(state.membership.is_local(key));
        assert_matches!(state.store.get(key, false), Access::Found(item) if item.data == [7]);
    }

    #[test]
    fn test_create_rejects_remote_owner() {
        let mut state = state();
        assert_eq!(
            state.create_vpe(OwnerId(4), 1, OwnerId(1)),
            Err(KernelError::InvalidArgs)
        );
    }

    #[test]
    fn test_duplicate_service_name() {
        let mut state = state();
        state.create_service(OwnerId(1), 1, "fs").unwrap();
        assert_eq!(state.create_service(OwnerId(2), 1, "fs"), Err(KernelError::InvalidArgs));
        assert_eq!(state.services.len(), 1);
    }

    #[test]
    fn test_obtain_round_trip_between_states() {
        let mut owner = state();
        let root = owner.create_msg(OwnerId(1), 2, OwnerId(3), 4, 0xbeef, 8).unwrap();

        let desc = owner.prepare_obtain(root, OwnerId(4), 9).unwrap();
        let child = desc.key();
        assert_eq!(owner.capability(root).unwrap().children(), &[child]);

        let mut membership = MembershipTable::new(DomainId(1));
        membership.update(&[PeId(4)], DomainId(1), PeId(4), MembershipFlags::Normal);
        let mut other = KernelState::new(DomainId(1), membership, 9);
        other.table_mut(OwnerId(4), TableKind::Object).reserve(9).unwrap();
        assert_eq!(other.install_obtained(&desc, root), Ok(child));
        assert_eq!(other.capability(child).unwrap().parent(), Some(root));
        assert!(!other.table(OwnerId(4), TableKind::Object).unwrap().is_reserved(9));
    }

    #[test]
    fn test_bootstrap_image_restores_partitions() {
        let mut source = state();
        let key = Key::compose(PeId(2), OwnerId(2), ItemType::NoType, 1);
        source.store.put(key, vec![1, 2], None).unwrap();

        let mut image = source.bootstrap_image(&[PeId(2)]);
        for entry in image.entries.iter_mut().filter(|e| e.pe == PeId(2)) {
            entry.domain = DomainId(1);
        }
        let joined = KernelState::from_bootstrap(DomainId(1), image, 3).unwrap();
        assert!(joined.store.contains(key));
        assert!(joined.membership.is_local(key));
    }

    #[test]
    fn test_bootstrap_rejects_foreign_partition() {
        let source = state();
        let image = source.bootstrap_image(&[PeId(1)]);
        assert_eq!(
            KernelState::from_bootstrap(DomainId(1), image, 3).err(),
            Some(KernelError::InvalidArgs)
        );
    }
}
