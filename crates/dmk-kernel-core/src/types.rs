//! Core kernel types
//!
//! Identifier newtypes shared by every module of the core. All types here are
//! plain data and carry no behavior that depends on the HAL.

use core::fmt;
use core::num::NonZeroU32;

use serde::{Deserialize, Serialize};

/// Capability selector inside a capability table
pub type Selector = u32;

/// Endpoint index on a PE
pub type EpId = u8;

/// Kernel instance (domain) identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainId(pub u16);

/// Processing element identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeId(pub u16);

/// VPE identifier, the owner of a pair of capability tables
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub u16);

/// Correlation token of a parked cooperative task.
///
/// The same value travels on the wire as the request id of a call that
/// expects a reply, so the reply wakes exactly one waiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WaitToken(pub u64);

/// Nonce held by the current lock holder of a stored item.
///
/// Zero is reserved for "unlocked", so a live token is never zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken(NonZeroU32);

impl LockToken {
    /// Wrap a raw nonce, returning `None` for the unlocked sentinel.
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Raw nonce value.
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kernel#{}", self.0)
    }
}

impl fmt::Display for PeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pe#{}", self.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vpe#{}", self.0)
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.get())
    }
}
