//! Inter-kernel protocol for dmk
//!
//! This crate defines:
//! - **Opcodes** for every message kernels exchange
//! - **Message bodies** for requests, replies and one-way notices
//! - **Wire codec** (postcard) used on top of the HAL's frame transport
//!
//! It is the **single source of truth** for the protocol: the runtime never
//! builds frames by hand.
//!
//! # Opcode Ranges
//!
//! | Range     | Category                                  |
//! |-----------|-------------------------------------------|
//! | 0x01-0x0F | Store (get, put, lock, reserve, remove)   |
//! | 0x10-0x1F | Partition migration and membership        |
//! | 0x20-0x2F | Capability exchange and revocation        |
//! | 0x30-0x3F | Shutdown coordination                     |
//!
//! `Reply` (0x0F) answers any request; the request it belongs to is
//! identified by the correlation token, not by the opcode.
//!
//! # Staging
//!
//! A key-addressed request starts as [`Stage::Request`]. A domain that does
//! not own the key relays it as [`Stage::Forward`] with `hops + 1`, keeping
//! the original requester and token. The owner answers the requester
//! directly with [`Stage::Reply`] and names itself in `served_by`.
//! Notices are one-way and carry no token.

use dmk_kernel_core::{
    CapDescriptor, DomainId, Item, Key, KernelError, LockToken, MembershipFlags, OwnerId, PartitionImage,
    PeId, Selector, ServiceDescriptor, WaitToken,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Opcodes
// =============================================================================

/// Catalogue entry of a message.
///
/// **CRITICAL**: values travel in traces and audit logs; do not renumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // Store
    Get = 0x01,
    Put = 0x02,
    PutUnlocking = 0x03,
    Lock = 0x04,
    Unlock = 0x05,
    Reserve = 0x06,
    Release = 0x07,
    Remove = 0x08,
    Reply = 0x0F,

    // Membership
    PartitionMigrate = 0x10,
    MembershipUpdate = 0x11,

    // Capabilities
    Obtain = 0x20,
    Revoke = 0x21,
    RevokeFinished = 0x22,
    RemoveChildPointer = 0x23,

    // Shutdown
    ShutdownRequest = 0x30,
    Shutdown = 0x31,
}

impl Opcode {
    /// Convert from u8 value.
    ///
    /// Returns `None` for invalid/unknown values.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Opcode::Get),
            0x02 => Some(Opcode::Put),
            0x03 => Some(Opcode::PutUnlocking),
            0x04 => Some(Opcode::Lock),
            0x05 => Some(Opcode::Unlock),
            0x06 => Some(Opcode::Reserve),
            0x07 => Some(Opcode::Release),
            0x08 => Some(Opcode::Remove),
            0x0F => Some(Opcode::Reply),
            0x10 => Some(Opcode::PartitionMigrate),
            0x11 => Some(Opcode::MembershipUpdate),
            0x20 => Some(Opcode::Obtain),
            0x21 => Some(Opcode::Revoke),
            0x22 => Some(Opcode::RevokeFinished),
            0x23 => Some(Opcode::RemoveChildPointer),
            0x30 => Some(Opcode::ShutdownRequest),
            0x31 => Some(Opcode::Shutdown),
            _ => None,
        }
    }

    /// Human-readable name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Get => "Get",
            Opcode::Put => "Put",
            Opcode::PutUnlocking => "PutUnlocking",
            Opcode::Lock => "Lock",
            Opcode::Unlock => "Unlock",
            Opcode::Reserve => "Reserve",
            Opcode::Release => "Release",
            Opcode::Remove => "Remove",
            Opcode::Reply => "Reply",
            Opcode::PartitionMigrate => "PartitionMigrate",
            Opcode::MembershipUpdate => "MembershipUpdate",
            Opcode::Obtain => "Obtain",
            Opcode::Revoke => "Revoke",
            Opcode::RevokeFinished => "RevokeFinished",
            Opcode::RemoveChildPointer => "RemoveChildPointer",
            Opcode::ShutdownRequest => "ShutdownRequest",
            Opcode::Shutdown => "Shutdown",
        }
    }
}

// =============================================================================
// Message envelope
// =============================================================================

/// Position of a message in a request/reply exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// First hop of a request, or a notice
    Request,
    /// Answer travelling back to the requester
    Reply,
    /// Request relayed by a domain that does not own the key
    Forward,
}

/// One protocol message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub stage: Stage,
    /// Domain waiting for the reply (the sender for notices)
    pub requester: DomainId,
    /// Correlation token; `None` for notices
    pub token: Option<WaitToken>,
    /// Number of times a request was relayed
    pub hops: u8,
    pub body: Body,
}

/// Payload of a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    Request(Request),
    Reply {
        /// Domain that actually served the request
        served_by: DomainId,
        result: Result<Response, KernelError>,
    },
    Notice(Notice),
}

/// Requests expecting a reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Get { key: Key, want_lock: bool },
    /// `lock` is needed to overwrite a locked item or fill a reservation
    Put { key: Key, data: Vec<u8>, lock: Option<LockToken> },
    PutUnlocking { key: Key, data: Vec<u8>, lock: LockToken },
    Lock { key: Key },
    Unlock { key: Key, lock: LockToken },
    Reserve { key: Key },
    Release { key: Key, lock: LockToken },
    Remove { key: Key },
    /// Hand over whole partitions; the receiver becomes their owner
    PartitionMigrate { partitions: Vec<PartitionImage> },
    /// Derive `parent` into `(child_owner, child_sel)` on the requesting domain
    Obtain {
        parent: Key,
        child_owner: OwnerId,
        child_sel: Selector,
    },
}

impl Request {
    /// Key that decides which domain serves the request.
    ///
    /// `None` for requests addressed to a domain rather than a key.
    pub fn routing_key(&self) -> Option<Key> {
        match self {
            Request::Get { key, .. }
            | Request::Put { key, .. }
            | Request::PutUnlocking { key, .. }
            | Request::Lock { key }
            | Request::Unlock { key, .. }
            | Request::Reserve { key }
            | Request::Release { key, .. }
            | Request::Remove { key } => Some(*key),
            Request::Obtain { parent, .. } => Some(*parent),
            Request::PartitionMigrate { .. } => None,
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Get { .. } => Opcode::Get,
            Request::Put { .. } => Opcode::Put,
            Request::PutUnlocking { .. } => Opcode::PutUnlocking,
            Request::Lock { .. } => Opcode::Lock,
            Request::Unlock { .. } => Opcode::Unlock,
            Request::Reserve { .. } => Opcode::Reserve,
            Request::Release { .. } => Opcode::Release,
            Request::Remove { .. } => Opcode::Remove,
            Request::PartitionMigrate { .. } => Opcode::PartitionMigrate,
            Request::Obtain { .. } => Opcode::Obtain,
        }
    }
}

/// Successful reply payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Partition lookup; `None` when the key is absent
    Item(Option<Item>),
    /// Capability lookup
    Capability(Option<CapDescriptor>),
    /// Service lookup
    Service(Option<ServiceDescriptor>),
    /// Lock acquired
    Lock(LockToken),
    /// Reservation outcome; `None` when the key already existed
    Reservation(Option<LockToken>),
    /// Capability derived for the requester
    Obtained(CapDescriptor),
    Done,
}

/// One-way messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notice {
    /// `pes` now belong to `owner`, whose kernel runs on `kernel_pe`
    MembershipUpdate {
        pes: Vec<PeId>,
        owner: DomainId,
        kernel_pe: PeId,
        flags: MembershipFlags,
    },
    /// Revoke `cap`, a child of the sender's `parent`
    Revoke { cap: Key, parent: Key, origin: Key },
    /// The subtree below the receiver's `parent` is gone
    RevokeFinished { parent: Key },
    /// Drop `child` from the child list of `parent`
    RemoveChildPointer { parent: Key, child: Key },
    /// Sender is ready to shut down
    ShutdownRequest,
    /// Stop now
    Shutdown,
}

impl Notice {
    pub fn opcode(&self) -> Opcode {
        match self {
            Notice::MembershipUpdate { .. } => Opcode::MembershipUpdate,
            Notice::Revoke { .. } => Opcode::Revoke,
            Notice::RevokeFinished { .. } => Opcode::RevokeFinished,
            Notice::RemoveChildPointer { .. } => Opcode::RemoveChildPointer,
            Notice::ShutdownRequest => Opcode::ShutdownRequest,
            Notice::Shutdown => Opcode::Shutdown,
        }
    }
}

impl Message {
    /// First-hop request from `requester`.
    pub fn request(requester: DomainId, token: WaitToken, request: Request) -> Self {
        Self {
            stage: Stage::Request,
            requester,
            token: Some(token),
            hops: 0,
            body: Body::Request(request),
        }
    }

    /// Reply to the request identified by `token`.
    pub fn reply(
        requester: DomainId,
        token: WaitToken,
        served_by: DomainId,
        result: Result<Response, KernelError>,
    ) -> Self {
        Self {
            stage: Stage::Reply,
            requester,
            token: Some(token),
            hops: 0,
            body: Body::Reply { served_by, result },
        }
    }

    /// One-way notice from `sender`.
    pub fn notice(sender: DomainId, notice: Notice) -> Self {
        Self {
            stage: Stage::Request,
            requester: sender,
            token: None,
            hops: 0,
            body: Body::Notice(notice),
        }
    }

    /// This request relayed one hop further.
    pub fn forwarded(mut self) -> Self {
        self.stage = Stage::Forward;
        self.hops = self.hops.saturating_add(1);
        self
    }

    pub fn opcode(&self) -> Opcode {
        match &self.body {
            Body::Request(request) => request.opcode(),
            Body::Reply { .. } => Opcode::Reply,
            Body::Notice(notice) => notice.opcode(),
        }
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        postcard::to_stdvec(self).map_err(CodecError::Encode)
    }

    /// Decode a frame received from the wire.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        postcard::from_bytes(frame).map_err(CodecError::Decode)
    }
}

// =============================================================================
// Codec errors
// =============================================================================

/// Wire encoding failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(postcard::Error),
    #[error("failed to decode message: {0}")]
    Decode(postcard::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use dmk_kernel_core::ItemType;

    #[test]
    fn test_opcode_canonical_values() {
        assert_eq!(Opcode::Get as u8, 0x01);
        assert_eq!(Opcode::Remove as u8, 0x08);
        assert_eq!(Opcode::PartitionMigrate as u8, 0x10);
        assert_eq!(Opcode::Revoke as u8, 0x21);
        assert_eq!(Opcode::Shutdown as u8, 0x31);
    }

    #[test]
    fn test_opcode_from_u8_round_trip() {
        for value in 0..=u8::MAX {
            if let Some(op) = Opcode::from_u8(value) {
                assert_eq!(op as u8, value, "{}", op.name());
            }
        }
        assert_eq!(Opcode::from_u8(0x00), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn test_opcode_ranges() {
        const { assert!((Opcode::Remove as u8) <= 0x0F) };
        const { assert!((Opcode::MembershipUpdate as u8) >= 0x10) };
        const { assert!((Opcode::RemoveChildPointer as u8) <= 0x2F) };
        const { assert!((Opcode::ShutdownRequest as u8) >= 0x30) };
    }

    #[test]
    fn test_forwarded_keeps_requester_and_token() {
        let key = Key::for_owner(OwnerId(3), ItemType::NoType, 9);
        let msg = Message::request(DomainId(1), WaitToken(44), Request::Lock { key });
        let relayed = msg.clone().forwarded().forwarded();

        assert_eq!(relayed.stage, Stage::Forward);
        assert_eq!(relayed.hops, 2);
        assert_eq!(relayed.requester, msg.requester);
        assert_eq!(relayed.token, msg.token);
        assert_eq!(relayed.opcode(), Opcode::Lock);
    }

    #[test]
    fn test_routing_key() {
        let key = Key::for_owner(OwnerId(3), ItemType::MsgCap, 2);
        let obtain = Request::Obtain {
            parent: key,
            child_owner: OwnerId(4),
            child_sel: 1,
        };
        assert_eq!(obtain.routing_key(), Some(key));
        let migrate = Request::PartitionMigrate { partitions: vec![] };
        assert_eq!(migrate.routing_key(), None);
    }

    #[test]
    fn test_reply_with_error_survives_the_wire() {
        let msg = Message::reply(DomainId(0), WaitToken(7), DomainId(2), Err(KernelError::NoPermission));
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_matches!(
            decoded.body,
            Body::Reply { served_by: DomainId(2), result: Err(KernelError::NoPermission) }
        );
    }

    #[test]
    fn test_truncated_frame_is_rejected() {
        let msg = Message::notice(
            DomainId(0),
            Notice::Revoke {
                cap: Key::for_owner(OwnerId(1), ItemType::MemCap, 1),
                parent: Key::for_owner(OwnerId(2), ItemType::MemCap, 1),
                origin: Key::for_owner(OwnerId(2), ItemType::MemCap, 1),
            },
        );
        let frame = msg.encode().unwrap();
        assert_matches!(Message::decode(&frame[..frame.len() / 2]), Err(CodecError::Decode(_)));
    }
}
