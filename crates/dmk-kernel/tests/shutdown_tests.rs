//! Coordinated shutdown.

mod common;

use assert_matches::assert_matches;
use common::{item_key, Cluster};
use dmk_kernel::Error;
use futures::FutureExt;

#[test]
fn test_domains_stop_once_every_domain_asked() {
    let mut cluster = Cluster::new(3);

    cluster.kernel(1).request_shutdown();
    cluster.kernel(2).request_shutdown();
    cluster.settle();
    assert!((0..3).all(|d| !cluster.kernel(d).is_stopped()));

    cluster.kernel(0).request_shutdown();
    cluster.settle();
    assert!((0..3).all(|d| cluster.kernel(d).is_stopped()));
    assert!(cluster.loops.iter_mut().all(|l| l.poll() == 0));
}

#[test]
fn test_parked_tasks_resolve_with_shutdown() {
    let mut cluster = Cluster::new(2);
    let a = cluster.kernel(0);
    let b = cluster.kernel(1);
    let key = item_key(2, 1);

    let token = {
        let a = a.clone();
        cluster.run(0, async move {
            a.put(key, b"busy".to_vec(), None).await?;
            a.get_locking(key).await
        })
    };
    assert!(token.unwrap().unwrap().lock.is_some());

    let waiting = cluster.start(1, {
        let b = b.clone();
        async move { b.get(key).await }
    });
    cluster.settle();
    assert_eq!(b.parked(), 1);

    b.request_shutdown();
    a.request_shutdown();
    cluster.settle();

    assert!(b.is_stopped());
    assert_eq!(b.parked(), 0);
    assert_matches!(waiting.now_or_never(), Some(Err(Error::Shutdown)));
}

#[test]
fn test_without_coordinator_a_domain_stops_alone() {
    let mut cluster = Cluster::with_config(2, |config| config.coordinator = None);
    cluster.kernel(1).request_shutdown();
    cluster.settle();
    assert!(cluster.kernel(1).is_stopped());
    assert!(!cluster.kernel(0).is_stopped());
}
