//! Revocation entry points
//!
//! The walk itself is pure and lives in `dmk_kernel_core::revoke`; this
//! module feeds it, executes the effects it returns and parks the calling
//! task until every domain involved has acknowledged.

use dmk_hal::HAL;
use dmk_kernel_core::{revoke, DomainId, Key, KernelError, OwnerId, Selector, TableKind};
use tracing::{debug, info, warn};

use crate::audit::AuditEventType;
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::waiters::Wake;

impl<H: HAL> Kernel<H> {
    /// Revoke `key` and everything derived from it, on every domain.
    ///
    /// Returns once the whole tree is gone. Revoking a capability that is
    /// already being revoked waits for that revocation instead; revoking a
    /// capability that does not exist succeeds immediately.
    pub async fn revoke(&self, key: Key) -> Result<()> {
        if !self.is_local(key) {
            return Err(KernelError::InvalidArgs.into());
        }
        let (token, rx) = self.register();
        let started = revoke::revoke_origin(&mut self.state_mut(), key, token);
        let outcome = match started {
            Ok(outcome) => outcome,
            Err(err) => self.fatal(key, err),
        };
        self.apply(outcome.effects);

        if !outcome.parked {
            self.cancel(token);
            debug!(target: "dmk::revoke", %key, "revocation completed locally");
            self.audit_event(AuditEventType::RevocationCompleted { key });
            return Ok(());
        }

        debug!(target: "dmk::revoke", %key, ?token, "waiting for remote subtrees");
        match self.wait(rx).await? {
            Wake::Revoked => {}
            _ => return Err(Error::UnexpectedReply),
        }
        let effects = revoke::finish_origin(&mut self.state_mut(), key, outcome.parent);
        self.apply(effects);
        info!(target: "dmk::revoke", %key, "revocation completed");
        self.audit_event(AuditEventType::RevocationCompleted { key });
        Ok(())
    }

    /// Revoke `count` selectors of a table, starting at `start`.
    ///
    /// Empty selectors are revoked too, so a revoke racing an exchange that
    /// is about to fill the slot still joins its revocation. Returns how
    /// many selectors held a capability or a revocation in flight.
    pub async fn revoke_range(&self, owner: OwnerId, kind: TableKind, start: Selector, count: u32) -> Result<usize> {
        let mut revoked = 0;
        for sel in start..start.saturating_add(count) {
            let key = Key::for_owner(owner, kind.generic_type(), u64::from(sel));
            let live = {
                let state = self.state();
                state.capability(key).is_some() || state.revocations.is_in_flight(key)
            };
            self.revoke(key).await?;
            revoked += usize::from(live);
        }
        Ok(revoked)
    }

    /// `Revoke` notice: `sender` revokes our `cap`, its child of `parent`.
    pub(crate) fn on_revoke(&self, cap: Key, parent: Key, origin: Key, sender: DomainId) {
        let walked = revoke::revoke_remote(&mut self.state_mut(), cap, parent, origin, sender);
        match walked {
            Ok(effects) => self.apply(effects),
            Err(err) => self.fatal(cap, err),
        }
    }

    /// `RevokeFinished` notice: one subtree below `parent` is gone.
    pub(crate) fn on_revoke_finished(&self, parent: Key) {
        let effects = revoke::acknowledge(&mut self.state_mut(), parent);
        self.apply(effects);
    }

    /// `RemoveChildPointer` notice.
    pub(crate) fn on_remove_child_pointer(&self, parent: Key, child: Key) {
        if !self.state_mut().remove_child_pointer(parent, child) {
            warn!(target: "dmk::revoke", %parent, %child, "no child pointer to remove");
        }
    }
}
