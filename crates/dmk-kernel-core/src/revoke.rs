//! Distributed revocation walk
//!
//! Revoking a capability destroys it and everything derived from it, across
//! domains. The walk over the local part of the tree is synchronous; every
//! point where it would have to wait for another domain becomes an entry
//! in a [`Revocation`] record instead of a suspended stack frame:
//!
//! ```text
//!  revoke(M)                                   domain A
//!   ├─ detach children of M, side effect on M
//!   ├─ M' local   → recurse: side effect on M'
//!   │               └─ D on B → RevokeChild ──────────────▶ domain B
//!   │               Revocation(M') awaited=1                revoke D
//!   └─ Revocation(M) awaited=1, subscribed to M'            side effect on D
//!                                                          ◀── RevokeFinished(M')
//!   ack(M') → 0 → notify M → ack(M) → 0 → wake origin
//! ```
//!
//! Every function here is pure over [`KernelState`] and returns the
//! [`Effect`]s the runtime has to carry out, in order.

use tracing::{debug, warn};

use crate::capability::RevokeAction;
use crate::error::KernelError;
use crate::key::Key;
use crate::revocations::{Acknowledged, Revocation, Subscriber};
use crate::state::{lookup, KernelState};
use crate::types::{DomainId, WaitToken};

/// Work the runtime performs on behalf of the walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Ask `to` to revoke `child`, derived from our `parent`
    RevokeChild {
        to: DomainId,
        child: Key,
        parent: Key,
        origin: Key,
    },
    /// Tell `to` that the subtree below its `parent` is gone
    RevokeFinished { to: DomainId, parent: Key },
    /// Tell `to` to drop `child` from the child list of `parent`
    RemoveChildPointer { to: DomainId, parent: Key, child: Key },
    /// A capability was removed; carry out its platform actions
    Revoked { key: Key, actions: Vec<RevokeAction> },
    /// Resume a parked task
    Wake(WaitToken),
}

/// Outcome of starting a revocation locally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginRevoke {
    /// Effects to perform now
    pub effects: Vec<Effect>,
    /// The caller must wait on its token before calling [`finish_origin`]
    pub parked: bool,
    /// Parent of the revoked capability, needed by [`finish_origin`]
    pub parent: Option<Key>,
}

/// Start revoking `key` on behalf of a local caller parked on `waiter`.
///
/// If the capability is already being revoked the caller subscribes to
/// that revocation. If it does not exist there is nothing to do.
pub fn revoke_origin(state: &mut KernelState, key: Key, waiter: WaitToken) -> Result<OriginRevoke, KernelError> {
    if state.revocations.subscribe(key, Subscriber::Waiter(waiter)) {
        debug!(target: "dmk::revoke", %key, "joining in-flight revocation");
        return Ok(OriginRevoke {
            effects: Vec::new(),
            parked: true,
            parent: None,
        });
    }
    let Some(cap) = state.capability(key) else {
        debug!(target: "dmk::revoke", %key, "nothing to revoke");
        return Ok(OriginRevoke {
            effects: Vec::new(),
            parked: false,
            parent: None,
        });
    };
    let (key, parent) = (cap.key(), cap.parent());

    let mut effects = Vec::new();
    let awaited = revoke_node(state, key, key, &mut effects)?;
    let parked = awaited > 0;
    if parked {
        state.revocations.set_waiter(key, waiter);
    } else {
        effects.extend(finish_origin(state, key, parent));
    }
    debug!(target: "dmk::revoke", %key, awaited, "origin walk done");
    Ok(OriginRevoke {
        effects,
        parked,
        parent,
    })
}

/// Handle a revoke request from `sender` for `key`, derived from `parent`.
pub fn revoke_remote(
    state: &mut KernelState,
    key: Key,
    parent: Key,
    origin: Key,
    sender: DomainId,
) -> Result<Vec<Effect>, KernelError> {
    let mut effects = Vec::new();
    if state
        .revocations
        .subscribe(key, Subscriber::Remote { domain: sender, parent })
    {
        return Ok(effects);
    }
    let Some(cap) = state.capability(key) else {
        effects.push(Effect::RevokeFinished { to: sender, parent });
        return Ok(effects);
    };
    let key = cap.key();
    if revoke_node(state, key, origin, &mut effects)? == 0 {
        effects.push(Effect::RevokeFinished { to: sender, parent });
    } else if let Some(rec) = state.revocations.find_mut(key) {
        // Acknowledge the parent the requester named once the subtree is gone.
        rec.parent = Some(parent);
    }
    Ok(effects)
}

/// Count in one `RevokeFinished` for the revocation of `parent`.
pub fn acknowledge(state: &mut KernelState, parent: Key) -> Vec<Effect> {
    let mut effects = Vec::new();
    match state.revocations.acknowledge(parent) {
        Acknowledged::Completed => complete(state, parent, &mut effects),
        Acknowledged::Pending(left) => {
            debug!(target: "dmk::revoke", %parent, left, "acknowledgement counted");
        }
        Acknowledged::Unknown => {
            warn!(target: "dmk::revoke", %parent, "acknowledgement for unknown revocation");
        }
    }
    effects
}

/// Unlink a revoked origin from its parent.
pub fn finish_origin(state: &mut KernelState, key: Key, parent: Option<Key>) -> Vec<Effect> {
    let Some(parent) = parent else {
        return Vec::new();
    };
    if state.membership.is_local(parent) {
        state.remove_child_pointer(parent, key);
        Vec::new()
    } else {
        vec![Effect::RemoveChildPointer {
            to: state.membership.route_domain(parent.pe_id()),
            parent,
            child: key,
        }]
    }
}

/// Revoke one present capability and its local subtree.
///
/// Returns how many responses the node still waits for. A non-zero count
/// leaves a record for the node in the tracker.
fn revoke_node(state: &mut KernelState, key: Key, origin: Key, effects: &mut Vec<Effect>) -> Result<u32, KernelError> {
    let Some(cap) = state.capability_mut(key) else {
        return Ok(0);
    };
    let children = cap.take_children();
    let parent = cap.parent();

    let deferred = match revoke_capability(state, key, !children.is_empty(), effects) {
        Ok(()) => false,
        Err(KernelError::MessagesWaiting) => {
            debug!(target: "dmk::revoke", %key, "service deferred until its children are gone");
            true
        }
        Err(err) => return Err(err),
    };

    let mut awaited = 0;
    for child in children {
        if !state.membership.is_local(child) {
            effects.push(Effect::RevokeChild {
                to: state.membership.route_domain(child.pe_id()),
                child,
                parent: key,
                origin,
            });
            awaited += 1;
        } else if state.revocations.subscribe(child, Subscriber::Revocation(key)) {
            awaited += 1;
        } else if lookup(&state.tables, child).is_some() && revoke_node(state, child, origin, effects)? > 0 {
            state.revocations.subscribe(child, Subscriber::Revocation(key));
            awaited += 1;
        }
    }

    if awaited > 0 {
        if !state.revocations.is_in_flight(key) {
            state
                .revocations
                .begin(key, parent, origin)
                .map_err(|_| KernelError::InvalidArgs)?;
        }
        if let Some(rec) = state.revocations.find_mut(key) {
            rec.awaited += awaited;
            rec.deferred |= deferred;
        }
    } else if deferred {
        finalize_deferred(state, key, effects);
    }
    Ok(awaited)
}

/// Run the side effect of one capability and remove it on success.
fn revoke_capability(
    state: &mut KernelState,
    key: Key,
    had_children: bool,
    effects: &mut Vec<Effect>,
) -> Result<(), KernelError> {
    let Some(cap) = lookup(&state.tables, key) else {
        return Ok(());
    };
    let actions = cap.revoke(&state.membership, &mut state.services, had_children)?;
    if let Some(cap) = state.take_capability(key) {
        effects.push(Effect::Revoked {
            key: cap.key(),
            actions,
        });
    }
    Ok(())
}

/// Second and last attempt at a capability whose revoke was deferred.
fn finalize_deferred(state: &mut KernelState, key: Key, effects: &mut Vec<Effect>) {
    match revoke_capability(state, key, false, effects) {
        Ok(()) => {}
        Err(err) => {
            warn!(target: "dmk::revoke", %key, %err, "removing capability despite pending work");
            if let Some(cap) = state.take_capability(key) {
                if let crate::capability::CapKind::Service { service } = cap.kind() {
                    state.services.retire(*service);
                }
                effects.push(Effect::Revoked {
                    key: cap.key(),
                    actions: Vec::new(),
                });
            }
        }
    }
}

/// Retire a record whose counter reached zero, cascading to subscribers.
fn complete(state: &mut KernelState, cap: Key, effects: &mut Vec<Effect>) {
    let mut done = vec![cap];
    while let Some(id) = done.pop() {
        let Some(rec) = state.revocations.retire(id) else {
            continue;
        };
        debug!(target: "dmk::revoke", cap = %rec.cap, origin = %rec.origin, "revocation complete");
        let Revocation {
            cap,
            parent,
            waiter,
            subscribers,
            deferred,
            ..
        } = rec;
        if deferred {
            finalize_deferred(state, cap, effects);
        }
        for subscriber in subscribers {
            match subscriber {
                Subscriber::Revocation(dependent) => {
                    if state.revocations.acknowledge(dependent) == Acknowledged::Completed {
                        done.push(dependent);
                    }
                }
                Subscriber::Waiter(token) => effects.push(Effect::Wake(token)),
                Subscriber::Remote { domain, parent } => {
                    effects.push(Effect::RevokeFinished { to: domain, parent });
                }
            }
        }
        match (waiter, parent) {
            (Some(token), _) => effects.push(Effect::Wake(token)),
            (None, Some(parent)) if !state.membership.is_local(parent) => {
                effects.push(Effect::RevokeFinished {
                    to: state.membership.route_domain(parent.pe_id()),
                    parent,
                });
            }
            _ => {}
        }
    }
}
