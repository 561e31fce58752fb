//! Kernel domain handle
//!
//! `Kernel` bundles the HAL, the domain state and the waiter registry of
//! one domain. It is cheap to clone; every clone refers to the same domain,
//! which is how handler tasks and callers share it on the single-threaded
//! event loop.
//!
//! State lives in `RefCell`s. Borrows are always scoped to synchronous
//! sections: nothing here holds a borrow across an `.await`.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeSet;
use std::rc::Rc;

use dmk_hal::HAL;
use dmk_ipc::{Message, Notice, Request, Response};
use dmk_kernel_core::{
    check_all_invariants, BootstrapImage, DomainId, Effect, InvariantViolation, Key, KernelError, KernelState,
    MembershipFlags, PeId, RevokeAction, Wakeup,
};
use futures::channel::oneshot;
use tracing::{debug, error, trace, warn};

use crate::audit::{AuditEventType, AuditLog};
use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::waiters::{Wake, WaiterRegistry};

/// Shutdown bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct ShutdownState {
    /// Domains that asked to shut down (coordinator only)
    pub requested: BTreeSet<DomainId>,
    pub stopped: bool,
}

struct Inner<H: HAL> {
    hal: H,
    config: KernelConfig,
    state: RefCell<KernelState>,
    waiters: RefCell<WaiterRegistry>,
    audit: RefCell<AuditLog>,
    shutdown: RefCell<ShutdownState>,
}

/// Handle to one kernel domain.
pub struct Kernel<H: HAL> {
    inner: Rc<Inner<H>>,
}

impl<H: HAL> Clone for Kernel<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<H: HAL> Kernel<H> {
    /// Boot a domain from its configuration.
    pub fn new(hal: H, config: KernelConfig) -> Result<Self> {
        config.validate()?;
        let seed = lock_seed(&hal, &config)?;
        let state = KernelState::new(config.domain, config.membership(), seed);
        Ok(Self::with_state(hal, config, state))
    }

    /// Start a domain that joins with a bootstrap image from a running one.
    pub fn join(hal: H, config: KernelConfig, image: BootstrapImage) -> Result<Self> {
        config.validate()?;
        let seed = lock_seed(&hal, &config)?;
        let state = KernelState::from_bootstrap(config.domain, image, seed)?;
        Ok(Self::with_state(hal, config, state))
    }

    fn with_state(hal: H, config: KernelConfig, state: KernelState) -> Self {
        debug!(target: "dmk::membership", domain = %config.domain, pes = state.membership.local_pes().len(), "domain booted");
        let audit = AuditLog::new(config.audit_capacity);
        Self {
            inner: Rc::new(Inner {
                hal,
                config,
                state: RefCell::new(state),
                waiters: RefCell::new(WaiterRegistry::new()),
                audit: RefCell::new(audit),
                shutdown: RefCell::new(ShutdownState::default()),
            }),
        }
    }

    pub fn domain(&self) -> DomainId {
        self.inner.config.domain
    }

    pub fn hal(&self) -> &H {
        &self.inner.hal
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    /// Shared view of the domain state.
    pub fn state(&self) -> Ref<'_, KernelState> {
        self.inner.state.borrow()
    }

    /// Exclusive view of the domain state. Must not be held across `.await`.
    pub fn state_mut(&self) -> RefMut<'_, KernelState> {
        self.inner.state.borrow_mut()
    }

    pub fn audit(&self) -> Ref<'_, AuditLog> {
        self.inner.audit.borrow()
    }

    pub(crate) fn shutdown_state(&self) -> RefMut<'_, ShutdownState> {
        self.inner.shutdown.borrow_mut()
    }

    /// Whether a `Shutdown` was received.
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.borrow().stopped
    }

    /// Number of parked tasks.
    pub fn parked(&self) -> usize {
        self.inner.waiters.borrow().len()
    }

    /// Bootstrap image for a domain that will take over `pes`.
    pub fn bootstrap_image(&self, pes: &[PeId]) -> BootstrapImage {
        self.state().bootstrap_image(pes)
    }

    /// Runtime-checkable invariants of the current state.
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        check_all_invariants(&self.state())
    }

    pub(crate) fn audit_event(&self, event: AuditEventType) {
        let now = self.inner.hal.now_nanos();
        self.inner.audit.borrow_mut().record(event, now);
    }

    // === Routing ===

    /// Domain a request for `key` has to go to.
    ///
    /// `InvalidArgs` for keys on a PE no domain has attached.
    pub fn route(&self, key: Key) -> Result<DomainId> {
        self.state()
            .membership
            .owner_of(key.pe_id())
            .ok_or_else(|| KernelError::InvalidArgs.into())
    }

    /// Whether `key` is served by this domain right now.
    pub fn is_local(&self, key: Key) -> bool {
        self.state().membership.is_local(key)
    }

    // === Messaging ===

    /// Encode and send one message.
    pub(crate) fn send(&self, to: DomainId, msg: &Message) -> Result<()> {
        let frame = msg.encode()?;
        let opcode = msg.opcode();
        trace!(target: "dmk::ipc", %to, opcode = opcode.name(), stage = ?msg.stage, bytes = frame.len(), "send");
        self.audit_event(AuditEventType::MessageOut { to, opcode });
        self.inner.hal.send_to_domain(to, &frame)?;
        Ok(())
    }

    /// Fire-and-forget notice. Delivery failures are logged.
    pub(crate) fn notify(&self, to: DomainId, notice: Notice) {
        let msg = Message::notice(self.domain(), notice);
        if let Err(err) = self.send(to, &msg) {
            warn!(target: "dmk::ipc", %to, opcode = msg.opcode().name(), %err, "notice dropped");
        }
    }

    /// Send `request` to `to` and wait for the reply.
    ///
    /// A reply served by a different domain than the one asked moves the
    /// key's PE to that domain in the local membership view.
    pub(crate) async fn call(&self, to: DomainId, request: Request) -> Result<Response> {
        let routing_key = request.routing_key();
        let (token, rx) = self.register();
        let msg = Message::request(self.domain(), token, request);
        if let Err(err) = self.send(to, &msg) {
            self.cancel(token);
            warn!(target: "dmk::ipc", %to, %err, "request not delivered");
            return Err(match err {
                Error::Hal(_) => KernelError::Unreachable.into(),
                other => other,
            });
        }
        match self.wait(rx).await? {
            Wake::Reply { served_by, result } => {
                if let Some(key) = routing_key.filter(|_| served_by != to) {
                    debug!(target: "dmk::membership", %key, asked = %to, %served_by, "owner moved");
                    let kernel_pe = self.config().kernel_pe(served_by).unwrap_or(key.pe_id());
                    self.state_mut()
                        .membership
                        .update(&[key.pe_id()], served_by, kernel_pe, MembershipFlags::NoChange);
                }
                Ok(result?)
            }
            _ => Err(Error::UnexpectedReply),
        }
    }

    // === Waiting ===

    pub(crate) fn register(&self) -> (dmk_kernel_core::WaitToken, oneshot::Receiver<Wake>) {
        self.inner.waiters.borrow_mut().register()
    }

    pub(crate) fn cancel(&self, token: dmk_kernel_core::WaitToken) {
        self.inner.waiters.borrow_mut().cancel(token);
    }

    pub(crate) async fn wait(&self, rx: oneshot::Receiver<Wake>) -> Result<Wake> {
        rx.await.map_err(|_| Error::Shutdown)
    }

    pub(crate) fn wake(&self, token: dmk_kernel_core::WaitToken, wake: Wake) {
        if !self.inner.waiters.borrow_mut().notify(token, wake) {
            trace!(target: "dmk::ipc", ?token, "wake-up for a task that is gone");
        }
    }

    /// Deliver item wake-ups produced by the store.
    pub(crate) fn wake_items(&self, wakeups: Vec<Wakeup>) {
        for wakeup in wakeups {
            self.wake(wakeup.token, Wake::Item(wakeup.outcome));
        }
    }

    /// Cancel every parked task.
    pub(crate) fn cancel_all(&self) -> usize {
        self.inner.waiters.borrow_mut().clear()
    }

    // === Effects ===

    /// Carry out what the revocation walk asked for, in order.
    pub(crate) fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::RevokeChild {
                    to,
                    child,
                    parent,
                    origin,
                } => self.notify(
                    to,
                    Notice::Revoke {
                        cap: child,
                        parent,
                        origin,
                    },
                ),
                Effect::RevokeFinished { to, parent } => self.notify(to, Notice::RevokeFinished { parent }),
                Effect::RemoveChildPointer { to, parent, child } => {
                    self.notify(to, Notice::RemoveChildPointer { parent, child })
                }
                Effect::Revoked { key, actions } => {
                    for action in actions {
                        self.perform(key, action);
                    }
                    debug!(target: "dmk::revoke", %key, "capability revoked");
                    self.audit_event(AuditEventType::CapabilityRevoked { key });
                }
                Effect::Wake(token) => self.wake(token, Wake::Revoked),
            }
        }
    }

    /// Platform side of one revoked capability. Failure leaves the machine
    /// in an unknown state, so the domain stops.
    fn perform(&self, key: Key, action: RevokeAction) {
        let hal = &self.inner.hal;
        let result = match action {
            RevokeAction::InvalidateEndpoint { owner, ep } => hal.invalidate_endpoint(owner, ep),
            RevokeAction::FreeMemory { pe, addr, size } => hal.free_memory(pe, addr, size),
            RevokeAction::Unmap { owner, virt } => hal.unmap_page(owner, virt),
            RevokeAction::CloseSession { service, ident } => hal.close_session(service, ident),
        };
        if let Err(err) = result {
            error!(target: "dmk::revoke", %key, ?action, %err, "revocation side effect failed");
            hal.halt("revocation side effect failed");
        }
    }

    /// Report a core failure the walk cannot recover from and stop.
    pub(crate) fn fatal(&self, key: Key, err: KernelError) -> ! {
        error!(target: "dmk::revoke", %key, %err, "revocation failed");
        self.inner.hal.halt("revocation failed")
    }
}

/// Lock nonce seed from the config, or from the platform entropy source.
fn lock_seed<H: HAL>(hal: &H, config: &KernelConfig) -> Result<u64> {
    if let Some(seed) = config.lock_seed {
        return Ok(seed);
    }
    let mut bytes = [0u8; 8];
    hal.random_bytes(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}
