//! Membership table
//!
//! Maps every PE id to the domain responsible for it. This is the only
//! source of truth for "who owns this key": the store facade and the
//! revocation walk both route through it.
//!
//! While a PE is migrating, its entry already names the destination and a
//! migration record remembers where requests have to be redirected until
//! the transfer is acknowledged.

use serde::{Deserialize, Serialize};

use crate::key::{Key, MAX_PES};
use crate::types::{DomainId, PeId};

/// State of a membership entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipFlags {
    /// Owned and served by `domain`
    Normal,
    /// Being handed over to `domain`; the old owner forwards requests
    Migrating,
    /// No PE is attached to this id yet
    Unpopulated,
    /// Update marker: reassign the owner but keep the current flags
    NoChange,
}

/// Ownership record of one PE id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEntry {
    /// PE this entry describes
    pub pe: PeId,
    /// Domain responsible for the PE
    pub domain: DomainId,
    /// Free capacity advertised by the owner
    pub capacity: u16,
    /// Current state
    pub flags: MembershipFlags,
}

/// Redirect recorded while a PE is migrating.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct MigrationTarget {
    pe: PeId,
    domain: DomainId,
    kernel_pe: PeId,
}

/// PE → domain table of one domain.
#[derive(Clone, Debug)]
pub struct MembershipTable {
    local: DomainId,
    entries: Vec<MembershipEntry>,
    migrations: Vec<MigrationTarget>,
}

impl MembershipTable {
    /// Table in which the local domain nominally owns every PE, all of them
    /// unpopulated.
    pub fn new(local: DomainId) -> Self {
        let entries = (0..MAX_PES)
            .map(|pe| MembershipEntry {
                pe: PeId(pe),
                domain: local,
                capacity: 0,
                flags: MembershipFlags::Unpopulated,
            })
            .collect();
        Self {
            local,
            entries,
            migrations: Vec::new(),
        }
    }

    /// Table restored from a bootstrap snapshot.
    ///
    /// PEs missing from the snapshot stay unpopulated.
    pub fn from_entries(local: DomainId, snapshot: &[MembershipEntry]) -> Self {
        let mut table = Self::new(local);
        for entry in snapshot {
            if let Some(slot) = table.entries.get_mut(entry.pe.0 as usize) {
                *slot = *entry;
                if slot.flags == MembershipFlags::NoChange {
                    slot.flags = MembershipFlags::Normal;
                }
            }
        }
        table
    }

    /// Domain this table belongs to.
    pub fn local(&self) -> DomainId {
        self.local
    }

    /// Entry for a PE.
    pub fn entry(&self, pe: PeId) -> MembershipEntry {
        debug_assert!(pe.0 < MAX_PES);
        self.entries[pe.0 as usize % MAX_PES as usize]
    }

    /// Snapshot of every entry.
    pub fn entries(&self) -> &[MembershipEntry] {
        &self.entries
    }

    /// Domain currently named as owner of `pe`.
    pub fn responsible_domain(&self, pe: PeId) -> DomainId {
        self.entry(pe).domain
    }

    /// Destination of an in-progress migration of `pe`, if any.
    pub fn migration_destination(&self, pe: PeId) -> Option<DomainId> {
        self.migrations
            .iter()
            .find(|target| target.pe == pe)
            .map(|target| target.domain)
    }

    /// Domain a request for `pe` must be sent to.
    pub fn route_domain(&self, pe: PeId) -> DomainId {
        self.migration_destination(pe)
            .unwrap_or_else(|| self.responsible_domain(pe))
    }

    /// Domain serving `pe`, or `None` if no domain has the PE attached.
    pub fn owner_of(&self, pe: PeId) -> Option<DomainId> {
        self.is_populated(pe).then(|| self.route_domain(pe))
    }

    /// Whether some domain has `pe` attached.
    pub fn is_populated(&self, pe: PeId) -> bool {
        self.entry(pe).flags != MembershipFlags::Unpopulated
    }

    /// Whether `key` is served by this domain right now.
    ///
    /// Unpopulated PEs belong to nobody, the local domain included.
    pub fn is_local(&self, key: Key) -> bool {
        let entry = self.entry(key.pe_id());
        entry.domain == self.local && entry.flags == MembershipFlags::Normal
    }

    /// PEs this domain serves.
    pub fn local_pes(&self) -> Vec<PeId> {
        self.entries
            .iter()
            .filter(|e| e.domain == self.local && e.flags == MembershipFlags::Normal)
            .map(|e| e.pe)
            .collect()
    }

    /// Reassign `pes` to `owner`.
    ///
    /// `NoChange` only moves ownership. Entering `Migrating` records a
    /// redirect to `owner`; leaving it drops the redirect.
    pub fn update(&mut self, pes: &[PeId], owner: DomainId, kernel_pe: PeId, flags: MembershipFlags) {
        for &pe in pes {
            let Some(entry) = self.entries.get_mut(pe.0 as usize) else {
                tracing::warn!(target: "dmk::membership", %pe, "update for unknown PE ignored");
                continue;
            };
            entry.domain = owner;
            if flags == MembershipFlags::NoChange {
                continue;
            }
            if entry.flags == MembershipFlags::Migrating {
                self.migrations.retain(|target| target.pe != pe);
            }
            if flags == MembershipFlags::Migrating {
                self.migrations.push(MigrationTarget {
                    pe,
                    domain: owner,
                    kernel_pe,
                });
            }
            entry.flags = flags;
            tracing::trace!(target: "dmk::membership", %pe, %owner, ?flags, "membership updated");
        }
    }

    /// Kernel PE of the migration destination of `pe`.
    pub fn migration_kernel_pe(&self, pe: PeId) -> Option<PeId> {
        self.migrations
            .iter()
            .find(|target| target.pe == pe)
            .map(|target| target.kernel_pe)
    }

    /// PEs with a live migration redirect.
    pub fn migrating_pes(&self) -> Vec<PeId> {
        self.migrations.iter().map(|target| target.pe).collect()
    }
}
