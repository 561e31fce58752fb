//! Capability tables
//!
//! Every VPE has two selector-indexed tables: one for object capabilities
//! and one for page mappings. A selector can also be reserved while an
//! exchange that will fill it is in flight; a reserved selector is never
//! used at the same time.

use std::collections::{BTreeMap, BTreeSet};

use crate::capability::Capability;
use crate::error::KernelError;
use crate::key::{ItemType, Key};
use crate::types::{OwnerId, Selector};

/// Which table of a VPE.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TableKind {
    /// Object capabilities
    Object,
    /// Page mappings
    Mapping,
}

impl TableKind {
    /// Table a capability key lives in.
    pub fn of(key: Key) -> Self {
        if key.item_type() == ItemType::MapCap {
            TableKind::Mapping
        } else {
            TableKind::Object
        }
    }

    /// Type tag used for keys synthesized for this table.
    pub fn generic_type(self) -> ItemType {
        match self {
            TableKind::Object => ItemType::GenericObjCap,
            TableKind::Mapping => ItemType::MapCap,
        }
    }
}

/// Selector → capability map of one VPE.
#[derive(Debug)]
pub struct CapTable {
    owner: OwnerId,
    kind: TableKind,
    caps: BTreeMap<Selector, Capability>,
    reserved: BTreeSet<Selector>,
}

impl CapTable {
    pub fn new(owner: OwnerId, kind: TableKind) -> Self {
        Self {
            owner,
            kind,
            caps: BTreeMap::new(),
            reserved: BTreeSet::new(),
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// Key a capability of type `ty` gets at `sel`.
    pub fn key_for(&self, ty: ItemType, sel: Selector) -> Key {
        Key::for_owner(self.owner, ty, u64::from(sel))
    }

    /// Generic key for `sel`, valid whether or not the slot is filled.
    pub fn generic_key(&self, sel: Selector) -> Key {
        self.key_for(self.kind.generic_type(), sel)
    }

    pub fn get(&self, sel: Selector) -> Option<&Capability> {
        self.caps.get(&sel)
    }

    pub fn get_mut(&mut self, sel: Selector) -> Option<&mut Capability> {
        self.caps.get_mut(&sel)
    }

    pub fn is_used(&self, sel: Selector) -> bool {
        self.caps.contains_key(&sel)
    }

    pub fn is_reserved(&self, sel: Selector) -> bool {
        self.reserved.contains(&sel)
    }

    /// Claim an empty selector for a capability that is about to arrive.
    pub fn reserve(&mut self, sel: Selector) -> Result<(), KernelError> {
        if self.is_used(sel) || !self.reserved.insert(sel) {
            return Err(KernelError::InvalidArgs);
        }
        Ok(())
    }

    /// Give up a reservation without filling it.
    pub fn unreserve(&mut self, sel: Selector) -> bool {
        self.reserved.remove(&sel)
    }

    /// Place a capability at its selector, consuming any reservation.
    pub fn set(&mut self, cap: Capability) -> Result<(), KernelError> {
        let sel = cap.selector().ok_or(KernelError::InvalidArgs)?;
        if cap.key().owner_id() != self.owner || TableKind::of(cap.key()) != self.kind {
            return Err(KernelError::InvalidArgs);
        }
        if self.is_used(sel) {
            return Err(KernelError::InvalidArgs);
        }
        self.reserved.remove(&sel);
        self.caps.insert(sel, cap);
        Ok(())
    }

    /// Remove the capability at `sel`.
    pub fn unset(&mut self, sel: Selector) -> Option<Capability> {
        self.caps.remove(&sel)
    }

    /// Capabilities in selector order.
    pub fn iter(&self) -> impl Iterator<Item = (Selector, &Capability)> {
        self.caps.iter().map(|(sel, cap)| (*sel, cap))
    }

    /// Reserved selectors.
    pub fn reserved(&self) -> impl Iterator<Item = Selector> + '_ {
        self.reserved.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapKind;

    fn vpe_cap(owner: u16, sel: u64) -> Capability {
        Capability::new(
            Key::for_owner(OwnerId(owner), ItemType::VpeCap, sel),
            CapKind::VirtPe { vpe: OwnerId(9) },
        )
    }

    #[test]
    fn test_set_consumes_reservation() {
        let mut table = CapTable::new(OwnerId(2), TableKind::Object);
        table.reserve(4).unwrap();
        assert!(table.is_reserved(4));
        table.set(vpe_cap(2, 4)).unwrap();
        assert!(table.is_used(4));
        assert!(!table.is_reserved(4));
    }

    #[test]
    fn test_used_selector_cannot_be_reserved() {
        let mut table = CapTable::new(OwnerId(2), TableKind::Object);
        table.set(vpe_cap(2, 1)).unwrap();
        assert_eq!(table.reserve(1), Err(KernelError::InvalidArgs));
        assert_eq!(table.set(vpe_cap(2, 1)), Err(KernelError::InvalidArgs));
    }

    #[test]
    fn test_set_rejects_foreign_key() {
        let mut table = CapTable::new(OwnerId(2), TableKind::Object);
        assert_eq!(table.set(vpe_cap(3, 1)), Err(KernelError::InvalidArgs));
        let map = Capability::new(
            Key::for_owner(OwnerId(2), ItemType::MapCap, 1),
            CapKind::Map { phys: 0, attr: 0 },
        );
        assert_eq!(table.set(map), Err(KernelError::InvalidArgs));
    }

    #[test]
    fn test_generic_key_matches_kind() {
        let objects = CapTable::new(OwnerId(2), TableKind::Object);
        let mappings = CapTable::new(OwnerId(2), TableKind::Mapping);
        assert_eq!(objects.generic_key(3).item_type(), ItemType::GenericObjCap);
        assert_eq!(mappings.generic_key(3).item_type(), ItemType::MapCap);
        assert_eq!(objects.generic_key(3), vpe_cap(2, 3).key().generic());
    }
}
