//! Membership propagation and shutdown coordination

use dmk_hal::HAL;
use dmk_ipc::Notice;
use dmk_kernel_core::{DomainId, MembershipFlags, PeId};
use tracing::{debug, info};

use crate::audit::AuditEventType;
use crate::kernel::Kernel;

impl<H: HAL> Kernel<H> {
    /// Reassign `pes` to `owner` in the local view.
    ///
    /// With `propagate` every other known domain is told as well; the
    /// notices are fire-and-forget.
    pub fn update_membership(
        &self,
        pes: &[PeId],
        owner: DomainId,
        kernel_pe: PeId,
        flags: MembershipFlags,
        propagate: bool,
    ) {
        self.state_mut().membership.update(pes, owner, kernel_pe, flags);
        self.audit_event(AuditEventType::MembershipChanged {
            owner,
            flags,
            pes: pes.len(),
        });
        if !propagate {
            return;
        }
        debug!(target: "dmk::membership", ?pes, %owner, ?flags, "broadcasting membership update");
        for peer in self.config().peers() {
            self.notify(
                peer,
                Notice::MembershipUpdate {
                    pes: pes.to_vec(),
                    owner,
                    kernel_pe,
                    flags,
                },
            );
        }
    }

    /// Tell the coordinator this domain is ready to stop.
    ///
    /// The event loops stop once the coordinator has heard from every
    /// domain and broadcast `Shutdown`. Without a coordinator the domain
    /// stops on its own.
    pub fn request_shutdown(&self) {
        match self.config().coordinator {
            Some(coordinator) if coordinator == self.domain() => self.on_shutdown_request(coordinator),
            Some(coordinator) => self.notify(coordinator, Notice::ShutdownRequest),
            None => self.on_shutdown(),
        }
    }

    /// Coordinator side: count one request in, broadcast once all are in.
    pub(crate) fn on_shutdown_request(&self, from: DomainId) {
        let all_in = {
            let mut shutdown = self.shutdown_state();
            shutdown.requested.insert(from);
            self.config()
                .domains
                .iter()
                .all(|spec| shutdown.requested.contains(&spec.id))
        };
        debug!(target: "dmk::membership", %from, all_in, "shutdown requested");
        if !all_in {
            return;
        }
        info!(target: "dmk::membership", "all domains ready, shutting down");
        for peer in self.config().peers() {
            self.notify(peer, Notice::Shutdown);
        }
        self.on_shutdown();
    }

    /// Stop this domain. Parked tasks resolve with `Error::Shutdown`.
    pub(crate) fn on_shutdown(&self) {
        self.shutdown_state().stopped = true;
        let canceled = self.cancel_all();
        info!(target: "dmk::membership", domain = %self.domain(), canceled, "domain stopped");
    }
}
