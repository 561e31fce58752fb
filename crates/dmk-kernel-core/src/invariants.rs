//! Runtime-checkable invariants
//!
//! These should hold between any two handler invocations of a domain.
//! They are used for assertion checking in tests and by the runtime's
//! debug builds.
//!
//! # Invariants
//!
//! 1. **Partition Placement**: partitions exist only for PEs the domain
//!    serves, and only hold items whose key maps to their PE
//! 2. **Selector Exclusivity**: no selector is both used and reserved
//! 3. **Key Placement**: a capability sits at the selector and table its key
//!    names
//! 4. **Child Links**: a live local capability is listed by its live local
//!    parent, unless one of them is being revoked
//! 5. **Revocation Progress**: every live revocation still awaits something
//! 6. **Migration Redirects**: a PE has a redirect iff it is flagged
//!    migrating

use crate::cap_table::TableKind;
use crate::membership::MembershipFlags;
use crate::state::KernelState;

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all invariants.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_all_invariants(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    violations.extend(check_partition_placement(state));
    violations.extend(check_selector_exclusivity(state));
    violations.extend(check_key_placement(state));
    violations.extend(check_child_links(state));
    violations.extend(check_revocation_progress(state));
    violations.extend(check_migration_redirects(state));

    violations
}

/// Invariant 1: partition placement
fn check_partition_placement(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for pe in state.store.pes() {
        let Some(partition) = state.store.partition(pe) else {
            continue;
        };
        if state.membership.owner_of(pe) != Some(state.domain) {
            violations.push(InvariantViolation {
                invariant: "partition_placement",
                description: format!("partition {pe} is held by a domain that does not serve it"),
            });
        }
        for key in partition.keys().filter(|k| k.pe_id() != pe) {
            violations.push(InvariantViolation {
                invariant: "partition_placement",
                description: format!("partition {pe} holds foreign key {key}"),
            });
        }
    }
    violations
}

/// Invariant 2: selector exclusivity
fn check_selector_exclusivity(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (owner, vpe) in &state.tables {
        for kind in [TableKind::Object, TableKind::Mapping] {
            let table = vpe.table(kind);
            for sel in table.reserved().filter(|sel| table.is_used(*sel)) {
                violations.push(InvariantViolation {
                    invariant: "selector_exclusivity",
                    description: format!("{owner} {kind:?} selector {sel} is used and reserved"),
                });
            }
        }
    }
    violations
}

/// Invariant 3: key placement
fn check_key_placement(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for (owner, vpe) in &state.tables {
        for kind in [TableKind::Object, TableKind::Mapping] {
            for (sel, cap) in vpe.table(kind).iter() {
                let key = cap.key();
                if key.owner_id() != *owner || cap.selector() != Some(sel) || TableKind::of(key) != kind {
                    violations.push(InvariantViolation {
                        invariant: "key_placement",
                        description: format!("capability {key} stored at {owner} {kind:?} selector {sel}"),
                    });
                }
            }
        }
    }
    violations
}

/// Invariant 4: child links
fn check_child_links(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    for vpe in state.tables.values() {
        for kind in [TableKind::Object, TableKind::Mapping] {
            for (_, cap) in vpe.table(kind).iter() {
                let Some(parent) = cap.parent() else {
                    continue;
                };
                if !state.membership.is_local(parent)
                    || state.revocations.is_in_flight(parent)
                    || state.revocations.is_in_flight(cap.key())
                {
                    continue;
                }
                let Some(parent_cap) = state.capability(parent) else {
                    continue;
                };
                if !parent_cap.children().iter().any(|c| c.same_slot(cap.key())) {
                    violations.push(InvariantViolation {
                        invariant: "child_links",
                        description: format!("{} is not listed as child of {parent}", cap.key()),
                    });
                }
            }
        }
    }
    violations
}

/// Invariant 5: revocation progress
fn check_revocation_progress(state: &KernelState) -> Vec<InvariantViolation> {
    state
        .revocations
        .iter()
        .filter(|rec| rec.awaited == 0)
        .map(|rec| InvariantViolation {
            invariant: "revocation_progress",
            description: format!("revocation of {} is live with nothing outstanding", rec.cap),
        })
        .collect()
}

/// Invariant 6: migration redirects
fn check_migration_redirects(state: &KernelState) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let redirected = state.membership.migrating_pes();
    for entry in state.membership.entries() {
        let flagged = entry.flags == MembershipFlags::Migrating;
        if flagged != redirected.contains(&entry.pe) {
            violations.push(InvariantViolation {
                invariant: "migration_redirects",
                description: format!("{} flagged {:?} with redirect={}", entry.pe, entry.flags, !flagged),
            });
        }
    }
    violations
}
