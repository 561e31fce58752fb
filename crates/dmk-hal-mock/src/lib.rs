//! Mock HAL implementation for testing dmk
//!
//! This provides a mock implementation of the HAL trait that can be used
//! to run several kernel domains inside one test process. Domains share a
//! [`MockNetwork`] that keeps one FIFO inbox per domain, and every platform
//! side effect is recorded in one global log so tests can check the order
//! in which domains acted.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use dmk_hal::{HalError, HAL};
use dmk_kernel_core::{DomainId, EpId, Key, OwnerId, PeId};

/// A platform side effect observed by the mock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlatformCall {
    InvalidateEndpoint { owner: OwnerId, ep: EpId },
    FreeMemory { pe: PeId, addr: u64, size: u64 },
    UnmapPage { owner: OwnerId, virt: u64 },
    CloseSession { service: Key, ident: u64 },
}

#[derive(Default)]
struct NetworkInner {
    /// Inbox per attached domain: (sender, frame)
    inboxes: BTreeMap<DomainId, VecDeque<(DomainId, Vec<u8>)>>,
    /// Platform calls of all domains in the order they happened
    calls: Vec<(DomainId, PlatformCall)>,
    /// Frames sent so far
    sent: u64,
}

/// Simulated interconnect between domains
///
/// Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Rc<RefCell<NetworkInner>>,
}

impl MockNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `domain` an inbox. Frames to unattached domains fail.
    pub fn attach(&self, domain: DomainId) {
        self.inner.borrow_mut().inboxes.entry(domain).or_default();
    }

    /// Remove the inbox of `domain`, dropping anything queued for it
    pub fn detach(&self, domain: DomainId) {
        self.inner.borrow_mut().inboxes.remove(&domain);
    }

    /// Frames waiting for `domain`
    pub fn pending(&self, domain: DomainId) -> usize {
        self.inner
            .borrow()
            .inboxes
            .get(&domain)
            .map_or(0, VecDeque::len)
    }

    /// Whether no frame is in flight anywhere
    pub fn is_idle(&self) -> bool {
        self.inner.borrow().inboxes.values().all(VecDeque::is_empty)
    }

    /// Total number of frames sent over the network
    pub fn frames_sent(&self) -> u64 {
        self.inner.borrow().sent
    }

    /// Platform calls of every domain, in global order
    pub fn calls(&self) -> Vec<(DomainId, PlatformCall)> {
        self.inner.borrow().calls.clone()
    }

    fn deliver(&self, from: DomainId, to: DomainId, frame: &[u8]) -> Result<(), HalError> {
        let mut inner = self.inner.borrow_mut();
        let inbox = inner.inboxes.get_mut(&to).ok_or(HalError::DomainUnreachable)?;
        inbox.push_back((from, frame.to_vec()));
        inner.sent += 1;
        Ok(())
    }

    fn drain(&self, domain: DomainId) -> Vec<(DomainId, Vec<u8>)> {
        self.inner
            .borrow_mut()
            .inboxes
            .get_mut(&domain)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default()
    }

    fn record(&self, domain: DomainId, call: PlatformCall) {
        self.inner.borrow_mut().calls.push((domain, call));
    }
}

/// Mock HAL for one domain
///
/// Provides simulated time, entropy and messaging over a shared
/// [`MockNetwork`], and records revocation side effects instead of
/// touching hardware.
pub struct MockHal {
    /// Domain this HAL serves
    domain: DomainId,
    /// Shared interconnect
    network: MockNetwork,
    /// Simulated time in nanoseconds
    time: Cell<u64>,
    /// Random seed for deterministic testing
    random_seed: Cell<u64>,
    /// Error returned by the next platform call, if armed
    fail_next: Cell<Option<HalError>>,
}

impl MockHal {
    /// Create a mock HAL for `domain` and attach it to `network`
    pub fn new(domain: DomainId, network: MockNetwork) -> Self {
        network.attach(domain);
        Self {
            domain,
            network,
            time: Cell::new(0),
            random_seed: Cell::new(12345),
            fail_next: Cell::new(None),
        }
    }

    /// Network this HAL sends on
    pub fn network(&self) -> &MockNetwork {
        &self.network
    }

    /// Advance the simulated time by the given duration
    pub fn advance_time(&self, nanos: u64) {
        self.time.set(self.time.get() + nanos);
    }

    /// Set the seed of the entropy source
    pub fn set_random_seed(&self, seed: u64) {
        self.random_seed.set(seed);
    }

    /// Make the next platform call fail with `err`
    pub fn fail_next_call(&self, err: HalError) {
        self.fail_next.set(Some(err));
    }

    /// Platform calls made by this domain, in order
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.network
            .calls()
            .into_iter()
            .filter(|(domain, _)| *domain == self.domain)
            .map(|(_, call)| call)
            .collect()
    }

    /// Whether this domain made `call`
    pub fn has_call(&self, call: &PlatformCall) -> bool {
        self.calls().iter().any(|c| c == call)
    }

    /// Simulate a frame arriving from `from`
    pub fn inject(&self, from: DomainId, frame: Vec<u8>) -> Result<(), HalError> {
        self.network.deliver(from, self.domain, &frame)
    }

    fn platform(&self, call: PlatformCall) -> Result<(), HalError> {
        if let Some(err) = self.fail_next.take() {
            return Err(err);
        }
        self.network.record(self.domain, call);
        Ok(())
    }
}

impl HAL for MockHal {
    fn local_domain(&self) -> DomainId {
        self.domain
    }

    fn send_to_domain(&self, to: DomainId, frame: &[u8]) -> Result<(), HalError> {
        self.network.deliver(self.domain, to, frame)
    }

    fn poll_messages(&self) -> Vec<(DomainId, Vec<u8>)> {
        self.network.drain(self.domain)
    }

    fn now_nanos(&self) -> u64 {
        self.time.get()
    }

    fn random_bytes(&self, buf: &mut [u8]) -> Result<(), HalError> {
        // Simple LCG for deterministic "random" bytes in tests
        let mut seed = self.random_seed.get();
        for byte in buf.iter_mut() {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            *byte = (seed >> 33) as u8;
        }
        self.random_seed.set(seed);
        Ok(())
    }

    fn invalidate_endpoint(&self, owner: OwnerId, ep: EpId) -> Result<(), HalError> {
        self.platform(PlatformCall::InvalidateEndpoint { owner, ep })
    }

    fn free_memory(&self, pe: PeId, addr: u64, size: u64) -> Result<(), HalError> {
        self.platform(PlatformCall::FreeMemory { pe, addr, size })
    }

    fn unmap_page(&self, owner: OwnerId, virt: u64) -> Result<(), HalError> {
        self.platform(PlatformCall::UnmapPage { owner, virt })
    }

    fn close_session(&self, service: Key, ident: u64) -> Result<(), HalError> {
        self.platform(PlatformCall::CloseSession { service, ident })
    }

    fn halt(&self, reason: &str) -> ! {
        panic!("{} halted: {reason}", self.domain)
    }
}
