//! Inbound message handling
//!
//! One handler task runs per received frame. Replies wake the task that
//! sent the request; notices are applied in place; requests are served
//! when the key is local and relayed towards the owner otherwise.

use dmk_hal::HAL;
use dmk_ipc::{Body, Message, Notice, Request, Response};
use dmk_kernel_core::{DomainId, KernelError};
use tracing::{debug, trace, warn};

use crate::audit::AuditEventType;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::store::{Served, Value};
use crate::waiters::Wake;

impl<H: HAL> Kernel<H> {
    /// Decode and handle one frame received from `from`.
    pub async fn handle_frame(&self, from: DomainId, frame: Vec<u8>) {
        let msg = match Message::decode(&frame) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(target: "dmk::ipc", %from, %err, "dropping undecodable frame");
                return;
            }
        };
        let opcode = msg.opcode();
        trace!(target: "dmk::ipc", %from, opcode = opcode.name(), stage = ?msg.stage, hops = msg.hops, "recv");
        self.audit_event(AuditEventType::MessageIn { from, opcode });

        match msg.body {
            Body::Reply { served_by, result } => match msg.token {
                Some(token) => self.wake(token, Wake::Reply { served_by, result }),
                None => warn!(target: "dmk::ipc", %from, "reply without token"),
            },
            Body::Notice(_) => self.handle_notice(msg),
            Body::Request(_) => self.handle_request(msg).await,
        }
    }

    fn handle_notice(&self, msg: Message) {
        let Body::Notice(notice) = &msg.body else {
            return;
        };
        let sender = msg.requester;
        match notice.clone() {
            Notice::MembershipUpdate {
                pes,
                owner,
                kernel_pe,
                flags,
            } => self.update_membership(&pes, owner, kernel_pe, flags, false),
            Notice::Revoke { cap, parent, origin } => {
                if self.is_local(cap) {
                    self.on_revoke(cap, parent, origin, sender);
                } else {
                    self.relay(msg, cap);
                }
            }
            Notice::RevokeFinished { parent } => self.on_revoke_finished(parent),
            Notice::RemoveChildPointer { parent, child } => {
                if self.is_local(parent) {
                    self.on_remove_child_pointer(parent, child);
                } else {
                    self.relay(msg, parent);
                }
            }
            Notice::ShutdownRequest => {
                if self.config().coordinator == Some(self.domain()) {
                    self.on_shutdown_request(sender);
                } else {
                    warn!(target: "dmk::ipc", %sender, "shutdown request sent to a non-coordinator");
                }
            }
            Notice::Shutdown => self.on_shutdown(),
        }
    }

    /// Pass a key-addressed message on to the owner we know of.
    ///
    /// Best effort: a message that bounced around too often, or whose key
    /// sits on a PE no domain serves, is answered with `InvalidArgs`
    /// (requests) or dropped (notices).
    fn relay(&self, msg: Message, key: dmk_kernel_core::Key) {
        let owner = self
            .route(key)
            .ok()
            .filter(|owner| *owner != self.domain() && msg.hops < self.config().forward_hop_limit);
        let Some(owner) = owner else {
            warn!(target: "dmk::ipc", %key, hops = msg.hops, "giving up on forwarding");
            if let Some(token) = msg.token {
                self.reply(msg.requester, token, Err(KernelError::InvalidArgs));
            }
            return;
        };
        debug!(target: "dmk::ipc", %key, %owner, hops = msg.hops + 1, "forwarding");
        let forwarded = msg.forwarded();
        if let Err(err) = self.send(owner, &forwarded) {
            warn!(target: "dmk::ipc", %owner, %err, "forward failed");
            if let Some(token) = forwarded.token {
                self.reply(forwarded.requester, token, Err(KernelError::Unreachable));
            }
        }
    }

    fn reply(&self, requester: DomainId, token: dmk_kernel_core::WaitToken, result: Result<Response, KernelError>) {
        let msg = Message::reply(requester, token, self.domain(), result);
        if let Err(err) = self.send(requester, &msg) {
            warn!(target: "dmk::ipc", %requester, %err, "reply dropped");
        }
    }

    async fn handle_request(&self, msg: Message) {
        let Body::Request(ref request) = msg.body else {
            return;
        };
        let Some(token) = msg.token else {
            warn!(target: "dmk::ipc", opcode = msg.opcode().name(), "request without token");
            return;
        };
        if let Some(key) = request.routing_key() {
            if !self.is_local(key) {
                self.relay(msg, key);
                return;
            }
        }
        let request = request.clone();
        match self.serve(request).await {
            Ok(Served::Done(response)) => self.reply(msg.requester, token, Ok(response)),
            Ok(Served::Moved) => {
                if let Some(key) = msg_key(&msg) {
                    self.relay(msg, key);
                }
            }
            Err(err) => self.reply(msg.requester, token, Err(err.to_wire())),
        }
    }

    /// Owner side of every request.
    async fn serve(&self, request: Request) -> Result<Served<Response>> {
        let response = match request {
            Request::Get { key, want_lock } => {
                return Ok(match self.serve_get(key, want_lock).await? {
                    Served::Done(value) => Served::Done(match value {
                        Some(Value::Item(item)) => Response::Item(Some(item)),
                        Some(Value::Capability(desc)) => Response::Capability(Some(desc)),
                        Some(Value::Service(desc)) => Response::Service(Some(desc)),
                        None => Response::Item(None),
                    }),
                    Served::Moved => Served::Moved,
                });
            }
            Request::Put { key, data, lock } => {
                self.state_mut().store.put(key, data, lock)?;
                Response::Done
            }
            Request::PutUnlocking { key, data, lock } => {
                let wakeups = self.state_mut().store.put_unlocking(key, data, lock)?;
                self.wake_items(wakeups);
                Response::Done
            }
            Request::Lock { key } => Response::Lock(self.state_mut().store.lock(key)?),
            Request::Unlock { key, lock } => {
                self.serve_unlock(key, lock)?;
                Response::Done
            }
            Request::Reserve { key } => Response::Reservation(self.state_mut().store.reserve(key)?),
            Request::Release { key, lock } => {
                self.serve_release(key, lock)?;
                Response::Done
            }
            Request::Remove { key } => {
                self.serve_remove(key);
                Response::Done
            }
            Request::PartitionMigrate { partitions } => {
                self.accept_partitions(partitions)?;
                Response::Done
            }
            Request::Obtain {
                parent,
                child_owner,
                child_sel,
            } => Response::Obtained(self.serve_obtain(parent, child_owner, child_sel)?),
        };
        Ok(Served::Done(response))
    }
}

fn msg_key(msg: &Message) -> Option<dmk_kernel_core::Key> {
    match &msg.body {
        Body::Request(request) => request.routing_key(),
        _ => None,
    }
}
