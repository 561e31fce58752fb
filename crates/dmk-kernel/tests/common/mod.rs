//! Multi-domain test harness over the mock HAL.

#![allow(dead_code)]

use std::future::Future;

use dmk_hal_mock::{MockHal, MockNetwork};
use dmk_kernel::{DomainId, DomainLoop, Kernel, KernelConfig};
use futures::FutureExt;

/// Upper bound on scheduling rounds before a test is considered hung
const MAX_ROUNDS: usize = 10_000;

/// PEs per domain in every cluster
pub const PES_PER_DOMAIN: u16 = 8;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Several domains sharing one mock network.
pub struct Cluster {
    pub network: MockNetwork,
    pub loops: Vec<DomainLoop<MockHal>>,
}

impl Cluster {
    /// `count` domains, domain 0 coordinating, deterministic lock seeds.
    pub fn new(count: u16) -> Self {
        Self::with_config(count, |_| {})
    }

    /// Like `new`, letting the caller adjust each domain's config.
    pub fn with_config(count: u16, adjust: impl Fn(&mut KernelConfig)) -> Self {
        init_tracing();
        let network = MockNetwork::new();
        let loops = (0..count)
            .map(|i| {
                let mut config = KernelConfig::uniform(DomainId(i), count, PES_PER_DOMAIN);
                config.lock_seed = Some(1000 + u64::from(i));
                adjust(&mut config);
                let hal = MockHal::new(DomainId(i), network.clone());
                DomainLoop::new(Kernel::new(hal, config).unwrap())
            })
            .collect();
        Self { network, loops }
    }

    pub fn kernel(&self, domain: u16) -> Kernel<MockHal> {
        self.loops[domain as usize].kernel().clone()
    }

    /// Poll every domain until no frame is in flight and no task moves.
    pub fn settle(&mut self) {
        for _ in 0..MAX_ROUNDS {
            let handled: usize = self.loops.iter_mut().map(DomainLoop::poll).sum();
            if handled == 0 && self.is_quiet() {
                return;
            }
        }
        panic!("cluster did not settle after {MAX_ROUNDS} rounds");
    }

    /// No frame waits for a domain that is still running.
    fn is_quiet(&self) -> bool {
        self.loops
            .iter()
            .all(|l| l.is_stopped() || self.network.pending(l.kernel().domain()) == 0)
    }

    /// Run `task` on `domain` to completion.
    pub fn run<F>(&mut self, domain: u16, task: F) -> F::Output
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let handle = self.loops[domain as usize].spawn_with_handle(task).unwrap();
        self.settle();
        handle.now_or_never().expect("task is still parked")
    }

    /// Start `task` on `domain` without driving the cluster.
    pub fn start<F>(&mut self, domain: u16, task: F) -> futures::future::RemoteHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.loops[domain as usize].spawn_with_handle(task).unwrap()
    }

    /// Invariant violations on every domain.
    pub fn violations(&self) -> Vec<String> {
        self.loops
            .iter()
            .flat_map(|l| l.kernel().check_invariants())
            .map(|v| format!("{}: {}", v.invariant, v.description))
            .collect()
    }
}

/// Key of a plain store item on `pe`.
pub fn item_key(pe: u16, object: u64) -> dmk_kernel::Key {
    dmk_kernel::Key::compose(
        dmk_kernel::PeId(pe),
        dmk_kernel::OwnerId(pe),
        dmk_kernel::ItemType::NoType,
        object,
    )
}

/// A valid token that is not `token`.
pub fn other_token(token: dmk_kernel::LockToken) -> dmk_kernel::LockToken {
    let raw = if token.get() == 1 { 2 } else { 1 };
    dmk_kernel::LockToken::new(raw).unwrap()
}
