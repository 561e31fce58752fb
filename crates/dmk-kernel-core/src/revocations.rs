//! Revocation tracker
//!
//! One record per capability whose revocation is waiting on something: a
//! remote subtree, or a local subtree that is itself waiting. Records are
//! keyed by the generic form of the capability key.
//!
//! ```text
//!   Revocation(M)  awaited=2
//!      ▲   ▲
//!      │   └── RevokeFinished from the domain owning a remote child
//!      └────── Revocation(M') completes and acknowledges its subscriber M
//! ```
//!
//! The tracker only does the bookkeeping. What happens when a record
//! completes (waking the origin, notifying subscribers, acknowledging a
//! remote parent) is decided by the walk in [`crate::revoke`].

use std::collections::BTreeMap;

use crate::error::RevocationError;
use crate::key::Key;
use crate::types::{DomainId, WaitToken};

/// Someone to notify when a revocation completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subscriber {
    /// Another local revocation counting this one as outstanding
    Revocation(Key),
    /// A local task parked until the capability is gone
    Waiter(WaitToken),
    /// A domain that asked for this capability to be revoked as the child
    /// of `parent` and is waiting for the acknowledgement
    Remote { domain: DomainId, parent: Key },
}

/// Progress record of one revocation node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Revocation {
    /// Generic key of the capability being revoked
    pub cap: Key,
    /// Parent of the capability, if it had one
    pub parent: Option<Key>,
    /// Root of the whole operation
    pub origin: Key,
    /// Responses still outstanding
    pub awaited: u32,
    /// Parked task, only set on the origin record
    pub waiter: Option<WaitToken>,
    /// Revocations and tasks waiting on this one
    pub subscribers: Vec<Subscriber>,
    /// The capability itself is kept until its children are gone
    pub deferred: bool,
}

impl Revocation {
    /// Whether this record belongs to the root of the operation.
    pub fn is_origin(&self) -> bool {
        self.cap == self.origin.generic()
    }
}

/// Result of acknowledging one response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acknowledged {
    /// Responses are still outstanding
    Pending(u32),
    /// Counter reached zero; the record is ready to be retired
    Completed,
    /// No record for this key
    Unknown,
}

/// All in-flight revocations of one domain.
#[derive(Debug, Default)]
pub struct RevocationTracker {
    live: BTreeMap<Key, Revocation>,
}

impl RevocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `cap`. A second record for the same capability is
    /// rejected.
    pub fn begin(&mut self, cap: Key, parent: Option<Key>, origin: Key) -> Result<&mut Revocation, RevocationError> {
        let cap = cap.generic();
        if self.live.contains_key(&cap) {
            return Err(RevocationError::AlreadyInFlight(cap));
        }
        Ok(self.live.entry(cap).or_insert(Revocation {
            cap,
            parent,
            origin,
            awaited: 0,
            waiter: None,
            subscribers: Vec::new(),
            deferred: false,
        }))
    }

    pub fn find(&self, cap: Key) -> Option<&Revocation> {
        self.live.get(&cap.generic())
    }

    pub fn find_mut(&mut self, cap: Key) -> Option<&mut Revocation> {
        self.live.get_mut(&cap.generic())
    }

    pub fn is_in_flight(&self, cap: Key) -> bool {
        self.live.contains_key(&cap.generic())
    }

    /// Count `n` more outstanding responses. Returns `false` for unknown keys.
    pub fn add_awaited(&mut self, cap: Key, n: u32) -> bool {
        match self.find_mut(cap) {
            Some(rec) => {
                rec.awaited += n;
                true
            }
            None => false,
        }
    }

    /// Register a dependent. Returns `false` for unknown keys.
    pub fn subscribe(&mut self, cap: Key, subscriber: Subscriber) -> bool {
        match self.find_mut(cap) {
            Some(rec) => {
                rec.subscribers.push(subscriber);
                true
            }
            None => false,
        }
    }

    /// Park the origin task on this record.
    pub fn set_waiter(&mut self, cap: Key, waiter: WaitToken) -> bool {
        match self.find_mut(cap) {
            Some(rec) => {
                rec.waiter = Some(waiter);
                true
            }
            None => false,
        }
    }

    /// Count one response in.
    pub fn acknowledge(&mut self, cap: Key) -> Acknowledged {
        let Some(rec) = self.find_mut(cap) else {
            return Acknowledged::Unknown;
        };
        debug_assert!(rec.awaited > 0, "revocation {} acknowledged past zero", rec.cap);
        rec.awaited = rec.awaited.saturating_sub(1);
        match rec.awaited {
            0 => Acknowledged::Completed,
            n => Acknowledged::Pending(n),
        }
    }

    /// Remove a record whose counter reached zero.
    pub fn retire(&mut self, cap: Key) -> Option<Revocation> {
        self.live.remove(&cap.generic())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Revocation> {
        self.live.values()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
