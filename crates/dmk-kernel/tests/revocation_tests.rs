//! Distributed revocation across domains.

mod common;

use assert_matches::assert_matches;
use common::Cluster;
use dmk_hal_mock::PlatformCall;
use dmk_kernel::{
    AuditEventType, DomainId, Error, HalError, ItemType, Key, KernelError, Opcode, OwnerId, PeId, TableKind,
};
use futures::FutureExt;

const A: DomainId = DomainId(0);
const B: DomainId = DomainId(1);

// Owners living on domain A (PEs 0..8), B (8..16) and C (16..24).
const ON_A: OwnerId = OwnerId(1);
const ON_A2: OwnerId = OwnerId(2);
const ON_B: OwnerId = OwnerId(9);
const ON_C: OwnerId = OwnerId(17);

fn sent(cluster: &Cluster, domain: u16, opcode: Opcode) -> usize {
    cluster
        .kernel(domain)
        .audit()
        .events()
        .iter()
        .filter(|e| matches!(e.event_type, AuditEventType::MessageOut { opcode: op, .. } if op == opcode))
        .count()
}

#[test]
fn test_memory_capability_tree_across_two_domains() {
    let mut cluster = Cluster::new(2);
    let a = cluster.kernel(0);
    let b = cluster.kernel(1);

    // M on A, M' derived on A, D obtained by B from M'.
    let m = a.create_mem(ON_A, 1, PeId(0), 0x1000, 4096, 3).unwrap();
    a.bind_endpoint(m, 2).unwrap();
    let m2 = a.derive(m, ON_A2, 1).unwrap();
    a.bind_endpoint(m2, 3).unwrap();
    let d = {
        let b = b.clone();
        cluster.run(1, async move { b.obtain(m2, ON_B, 1).await }).unwrap()
    };
    b.bind_endpoint(d, 4).unwrap();
    assert_eq!(a.state().capability(m2).unwrap().children(), &[d]);
    assert_eq!(b.state().capability(d).unwrap().parent(), Some(m2));

    let revoke = cluster.start(0, {
        let a = a.clone();
        async move { a.revoke(m).await }
    });
    // Only A runs: the local part is done, the caller waits for B.
    cluster.loops[0].poll();
    assert_eq!(a.parked(), 1);
    assert!(a.state().capability(m).is_none());
    assert!(a.state().capability(m2).is_none());
    assert!(b.state().capability(d).is_some());
    assert_eq!(cluster.network.pending(B), 1);

    cluster.settle();
    assert_matches!(revoke.now_or_never(), Some(Ok(())));

    assert_eq!(
        cluster.network.calls(),
        vec![
            (A, PlatformCall::InvalidateEndpoint { owner: ON_A, ep: 2 }),
            (A, PlatformCall::InvalidateEndpoint { owner: ON_A2, ep: 3 }),
            (A, PlatformCall::FreeMemory { pe: PeId(0), addr: 0x1000, size: 4096 }),
            (B, PlatformCall::InvalidateEndpoint { owner: ON_B, ep: 4 }),
        ]
    );
    assert!(b.state().capability(d).is_none());
    assert!(a.state().revocations.is_empty());
    assert!(b.state().revocations.is_empty());
    assert_eq!(a.parked(), 0);
    assert_eq!(a.audit().revoked_keys(), vec![m, m2]);
    assert_eq!(b.audit().revoked_keys(), vec![d]);
    assert!(matches!(
        a.audit().events().last().map(|e| &e.event_type),
        Some(AuditEventType::RevocationCompleted { key }) if *key == m
    ));
    assert!(cluster.violations().is_empty());
}

#[test]
fn test_concurrent_revokes_share_one_walk() {
    let mut cluster = Cluster::new(2);
    let a = cluster.kernel(0);
    let b = cluster.kernel(1);
    let root = a.create_vpe(ON_A, 1, OwnerId(3)).unwrap();
    {
        let b = b.clone();
        cluster.run(1, async move { b.obtain(root, ON_B, 1).await }).unwrap();
    }

    let first = cluster.start(0, {
        let a = a.clone();
        async move { a.revoke(root).await }
    });
    let second = cluster.start(0, {
        let a = a.clone();
        async move { a.revoke(root).await }
    });
    cluster.settle();

    assert_matches!(first.now_or_never(), Some(Ok(())));
    assert_matches!(second.now_or_never(), Some(Ok(())));
    assert_eq!(sent(&cluster, 0, Opcode::Revoke), 1);
    assert_eq!(a.audit().revoked_keys(), vec![root]);
}

#[test]
fn test_tree_spanning_three_domains_is_torn_down() {
    let mut cluster = Cluster::new(3);
    let a = cluster.kernel(0);
    let b = cluster.kernel(1);
    let c = cluster.kernel(2);

    // A → B → C → A, plus a local sibling on every hop.
    let root = a.create_vpe(ON_A, 1, OwnerId(5)).unwrap();
    let on_b = {
        let b = b.clone();
        cluster.run(1, async move { b.obtain(root, ON_B, 1).await }).unwrap()
    };
    let sibling_b = b.derive(on_b, OwnerId(10), 1).unwrap();
    let on_c = {
        let c = c.clone();
        cluster.run(2, async move { c.obtain(on_b, ON_C, 1).await }).unwrap()
    };
    let back_on_a = {
        let a = a.clone();
        cluster.run(0, async move { a.obtain(on_c, ON_A2, 7).await }).unwrap()
    };
    let leaf = a.derive(back_on_a, OwnerId(3), 2).unwrap();

    let done = {
        let a = a.clone();
        cluster.run(0, async move { a.revoke(root).await })
    };
    assert_matches!(done, Ok(()));

    for key in [root, back_on_a, leaf] {
        assert!(a.state().capability(key).is_none(), "{key} survived on A");
    }
    assert!(b.state().capability(on_b).is_none());
    assert!(b.state().capability(sibling_b).is_none());
    assert!(c.state().capability(on_c).is_none());
    for i in 0..3 {
        let k = cluster.kernel(i);
        assert!(k.state().revocations.is_empty());
        assert_eq!(k.parked(), 0);
    }
    assert!(cluster.violations().is_empty());
}

#[test]
fn test_revoking_a_child_unlinks_it_from_the_remote_parent() {
    let mut cluster = Cluster::new(2);
    let a = cluster.kernel(0);
    let b = cluster.kernel(1);
    let root = a.create_msg(ON_A, 1, OwnerId(3), 1, 0xfeed, 4).unwrap();
    let child = {
        let b = b.clone();
        cluster.run(1, async move { b.obtain(root, ON_B, 2).await }).unwrap()
    };

    cluster.run(1, async move { b.revoke(child).await }).unwrap();
    assert!(a.state().capability(root).unwrap().children().is_empty());
    assert_eq!(sent(&cluster, 1, Opcode::RemoveChildPointer), 1);
}

#[test]
fn test_revoke_edge_cases() {
    let mut cluster = Cluster::new(2);
    let a = cluster.kernel(0);
    let remote = Key::for_owner(ON_B, ItemType::VpeCap, 1);
    let missing = Key::for_owner(ON_A, ItemType::VpeCap, 40);

    let results = cluster.run(0, async move { (a.revoke(remote).await, a.revoke(missing).await) });
    assert_matches!(results.0, Err(Error::Kernel(KernelError::InvalidArgs)));
    assert_matches!(results.1, Ok(()));
    assert_eq!(cluster.network.frames_sent(), 0);
}

#[test]
fn test_revoke_range() {
    let mut cluster = Cluster::new(2);
    let a = cluster.kernel(0);
    for sel in [1, 2, 5] {
        a.create_vpe(ON_A, sel, OwnerId(3)).unwrap();
    }
    a.create_map(ON_A, 2, 0x8000, 1).unwrap();

    let revoked = {
        let a = a.clone();
        cluster.run(0, async move { a.revoke_range(ON_A, TableKind::Object, 0, 4).await })
    };
    assert_eq!(revoked.unwrap(), 2);
    let table = a.state().table(ON_A, TableKind::Object).map(|t| t.len());
    assert_eq!(table, Some(1));
    assert_eq!(a.state().table(ON_A, TableKind::Mapping).map(|t| t.len()), Some(1));
}

#[test]
fn test_service_outlives_its_remote_copies() {
    let mut cluster = Cluster::new(2);
    let a = cluster.kernel(0);
    let b = cluster.kernel(1);
    let srv = a.create_service(ON_A, 1, "net").unwrap();
    let service = Key::for_owner(ON_A, ItemType::Service, 1);
    a.create_session(ON_A2, 3, service, 77, false).unwrap();
    let copy = {
        let b = b.clone();
        cluster.run(1, async move { b.obtain(srv, ON_B, 1).await }).unwrap()
    };

    let revoke = cluster.start(0, {
        let a = a.clone();
        async move { a.revoke(srv).await }
    });
    cluster.loops[0].poll();
    // Still registered, but closing, until B has dropped its copy.
    assert!(a.state().services.get(service).is_some_and(|s| s.closing));
    assert!(a.state().capability(srv).is_some());

    cluster.settle();
    assert_matches!(revoke.now_or_never(), Some(Ok(())));
    assert!(b.state().capability(copy).is_none());
    assert!(a.state().capability(srv).is_none());
    assert!(a.state().services.get(service).is_none());
    assert_eq!(a.audit().revoked_keys(), vec![srv]);
}

#[test]
fn test_obtain_from_capability_under_revocation_fails() {
    let mut cluster = Cluster::new(3);
    let a = cluster.kernel(0);
    let root = a.create_vpe(ON_A, 1, OwnerId(5)).unwrap();
    {
        let b = cluster.kernel(1);
        cluster.run(1, async move { b.obtain(root, ON_B, 1).await }).unwrap();
    }

    let revoke = cluster.start(0, {
        let a = a.clone();
        async move { a.revoke(root).await }
    });
    cluster.loops[0].poll();
    assert_eq!(a.parked(), 1);

    let c = cluster.kernel(2);
    let obtained = {
        let c = c.clone();
        cluster.run(2, async move { c.obtain(root, ON_C, 1).await })
    };
    assert_matches!(obtained, Err(Error::Kernel(KernelError::NotFound)));
    assert!(!c.state().table(ON_C, TableKind::Object).unwrap().is_reserved(1));
    assert_matches!(revoke.now_or_never(), Some(Ok(())));
}

#[test]
#[should_panic(expected = "halted")]
fn test_failed_side_effect_halts_the_domain() {
    let mut cluster = Cluster::new(1);
    let a = cluster.kernel(0);
    let m = a.create_mem(ON_A, 1, PeId(0), 0, 4096, 3).unwrap();
    a.hal().fail_next_call(HalError::IoError);
    let _ = cluster.run(0, async move { a.revoke(m).await });
}
