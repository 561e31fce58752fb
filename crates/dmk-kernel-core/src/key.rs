//! Structured keys
//!
//! Every object the kernel stores or names across domains is identified by
//! one 64-bit key with a fixed layout:
//!
//! ```text
//!  63        54 53          43 42     36 35                          0
//! ┌────────────┬──────────────┬─────────┬─────────────────────────────┐
//! │   PE id    │   owner id   │  type   │          object id          │
//! │  10 bits   │   11 bits    │ 7 bits  │           36 bits           │
//! └────────────┴──────────────┴─────────┴─────────────────────────────┘
//! ```
//!
//! The PE bits select the partition (and therefore the owning domain).
//! Composition and decomposition are pure; out-of-range inputs are a caller
//! bug and only checked with `debug_assert!`.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{OwnerId, PeId};

/// Width of the PE id field
pub const PE_BITS: u32 = 10;
/// Width of the owner (VPE) id field
pub const OWNER_BITS: u32 = 11;
/// Width of the type tag field
pub const TYPE_BITS: u32 = 7;
/// Width of the object id field
pub const OBJECT_BITS: u32 = 64 - PE_BITS - OWNER_BITS - TYPE_BITS;

/// Number of addressable PEs
pub const MAX_PES: u16 = 1 << PE_BITS;
/// Number of addressable owners
pub const MAX_OWNERS: u16 = 1 << OWNER_BITS;

const TYPE_SHIFT: u32 = OBJECT_BITS;
const OWNER_SHIFT: u32 = OBJECT_BITS + TYPE_BITS;
const PE_SHIFT: u32 = 64 - PE_BITS;

const OBJECT_MASK: u64 = (1 << OBJECT_BITS) - 1;
const TYPE_MASK: u64 = (1 << TYPE_BITS) - 1;
const OWNER_MASK: u64 = (1 << OWNER_BITS) - 1;

/// Type bit marking a mapping capability
const MAP_CAP_BITS: u64 = (ItemType::MapCap as u64) << TYPE_SHIFT;
/// Type bits shared by every object capability
const OBJ_CAP_BITS: u64 = (ItemType::GenericObjCap as u64) << TYPE_SHIFT;

/// Type tag stored in a key.
///
/// Capability tags are chosen so that every object capability tag is a
/// subset of `GenericObjCap`, which lets a generic key match any of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ItemType {
    /// Untyped blob
    NoType = 0,
    /// Mapping capability
    MapCap = 1,
    /// Message (send) capability
    MsgCap = 2,
    /// Service capability
    SrvCap = 4,
    /// Session capability
    SessCap = 6,
    /// VPE capability
    VpeCap = 8,
    /// Memory capability
    MemCap = 10,
    /// Any object capability
    GenericObjCap = 14,
    /// Service object
    Service = 16,
    /// Message gate object
    MsgObj = 32,
    /// Memory object
    MemObj = 64,
}

impl ItemType {
    /// Decode a raw type tag. Unknown tags decode as `NoType`.
    pub fn from_bits(bits: u8) -> Self {
        match bits {
            1 => ItemType::MapCap,
            2 => ItemType::MsgCap,
            4 => ItemType::SrvCap,
            6 => ItemType::SessCap,
            8 => ItemType::VpeCap,
            10 => ItemType::MemCap,
            14 => ItemType::GenericObjCap,
            16 => ItemType::Service,
            32 => ItemType::MsgObj,
            64 => ItemType::MemObj,
            _ => ItemType::NoType,
        }
    }

    /// Whether keys of this type name a capability in a capability table.
    pub fn is_capability(self) -> bool {
        self == ItemType::MapCap || (self as u8) & (ItemType::GenericObjCap as u8) != 0
    }
}

/// Global identity of a storable object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(u64);

impl Key {
    /// Compose a key from all four fields.
    ///
    /// Use this form when the object does not live on its owner's PE, e.g.
    /// objects on memory PEs.
    pub fn compose(pe: PeId, owner: OwnerId, ty: ItemType, object: u64) -> Self {
        debug_assert!(pe.0 < MAX_PES, "pe id {} out of range", pe.0);
        debug_assert!(owner.0 < MAX_OWNERS, "owner id {} out of range", owner.0);
        debug_assert!(object <= OBJECT_MASK, "object id {object:#x} out of range");
        Key(((pe.0 as u64) << PE_SHIFT)
            | ((owner.0 as u64 & OWNER_MASK) << OWNER_SHIFT)
            | ((ty as u64) << TYPE_SHIFT)
            | (object & OBJECT_MASK))
    }

    /// Compose a key whose PE is derived from the owner.
    pub fn for_owner(owner: OwnerId, ty: ItemType, object: u64) -> Self {
        Self::compose(pe_of_owner(owner), owner, ty, object)
    }

    /// Reinterpret a raw 64-bit value.
    pub const fn from_raw(raw: u64) -> Self {
        Key(raw)
    }

    /// Raw 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// PE id field (partition selector).
    pub fn pe_id(self) -> PeId {
        PeId((self.0 >> PE_SHIFT) as u16)
    }

    /// Owner id field.
    pub fn owner_id(self) -> OwnerId {
        OwnerId(((self.0 >> OWNER_SHIFT) & OWNER_MASK) as u16)
    }

    /// Type tag field.
    pub fn item_type(self) -> ItemType {
        ItemType::from_bits(((self.0 >> TYPE_SHIFT) & TYPE_MASK) as u8)
    }

    /// Object id field.
    pub fn object_id(self) -> u64 {
        self.0 & OBJECT_MASK
    }

    /// Normalize a capability key to its generic form.
    ///
    /// Object capabilities collapse to `GenericObjCap`; mapping capabilities
    /// keep `MapCap`. Revocation records and synthesized range-revoke keys are
    /// always generic, so the same slot is found whatever concrete type the
    /// caller knew about. Non-capability keys are returned unchanged.
    pub fn generic(self) -> Self {
        match self.item_type() {
            ItemType::MapCap => self,
            ty if ty.is_capability() => Key(self.0 | OBJ_CAP_BITS),
            _ => self,
        }
    }

    /// Equality ignoring the capability type bits.
    pub fn same_slot(self, other: Key) -> bool {
        let mask = !(MAP_CAP_BITS | OBJ_CAP_BITS);
        self.0 & mask == other.0 & mask
    }
}

/// PE hosting an owner under the regular owner-to-PE mapping.
pub fn pe_of_owner(owner: OwnerId) -> PeId {
    PeId(owner.0 % MAX_PES)
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{:?}:{:#x}",
            self.pe_id().0,
            self.owner_id().0,
            self.item_type(),
            self.object_id()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL_TYPES: [ItemType; 11] = [
        ItemType::NoType,
        ItemType::MapCap,
        ItemType::MsgCap,
        ItemType::SrvCap,
        ItemType::SessCap,
        ItemType::VpeCap,
        ItemType::MemCap,
        ItemType::GenericObjCap,
        ItemType::Service,
        ItemType::MsgObj,
        ItemType::MemObj,
    ];

    proptest! {
        #[test]
        fn test_compose_decompose_roundtrip(
            pe in 0..MAX_PES,
            owner in 0..MAX_OWNERS,
            ty in proptest::sample::select(ALL_TYPES.to_vec()),
            object in 0..=OBJECT_MASK,
        ) {
            let key = Key::compose(PeId(pe), OwnerId(owner), ty, object);
            prop_assert_eq!(key.pe_id(), PeId(pe));
            prop_assert_eq!(key.owner_id(), OwnerId(owner));
            prop_assert_eq!(key.item_type(), ty);
            prop_assert_eq!(key.object_id(), object);
        }
    }

    #[test]
    fn test_for_owner_derives_pe() {
        let key = Key::for_owner(OwnerId(MAX_PES + 3), ItemType::MemCap, 9);
        assert_eq!(key.pe_id(), PeId(3));
        assert_eq!(key.owner_id(), OwnerId(MAX_PES + 3));
    }

    #[test]
    fn test_capability_types() {
        assert!(ItemType::MapCap.is_capability());
        assert!(ItemType::SessCap.is_capability());
        assert!(ItemType::GenericObjCap.is_capability());
        assert!(!ItemType::Service.is_capability());
        assert!(!ItemType::MemObj.is_capability());
        assert!(!ItemType::NoType.is_capability());
    }

    #[test]
    fn test_generic_collapses_object_caps() {
        let owner = OwnerId(5);
        let generic = Key::for_owner(owner, ItemType::GenericObjCap, 12);
        for ty in [ItemType::MsgCap, ItemType::SrvCap, ItemType::MemCap, ItemType::VpeCap] {
            assert_eq!(Key::for_owner(owner, ty, 12).generic(), generic);
        }
        let map = Key::for_owner(owner, ItemType::MapCap, 12);
        assert_eq!(map.generic(), map);
        let blob = Key::for_owner(owner, ItemType::MsgObj, 12);
        assert_eq!(blob.generic(), blob);
    }

    #[test]
    fn test_same_slot_ignores_cap_type() {
        let a = Key::for_owner(OwnerId(1), ItemType::MemCap, 4);
        let b = Key::for_owner(OwnerId(1), ItemType::GenericObjCap, 4);
        let c = Key::for_owner(OwnerId(1), ItemType::MemCap, 5);
        assert!(a.same_slot(b));
        assert!(!a.same_slot(c));
    }
}
