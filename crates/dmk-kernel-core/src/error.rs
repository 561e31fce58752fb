//! Error taxonomy of the core.
//!
//! `KernelError` is shared by the store, the capability tables and the
//! revocation walk. It is serializable because remote failures travel back
//! to the caller inside reply messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::key::Key;

/// Errors returned by core operations.
///
/// A lookup miss is not an error: getters return `Ok(None)` or
/// `Access::NotFound` instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum KernelError {
    /// Target does not exist where existence is required
    #[error("object not found")]
    NotFound,
    /// Item is locked by another holder
    #[error("item is locked")]
    Locked,
    /// Lock attempt would have to wait for the current holder
    #[error("operation would block")]
    WouldBlock,
    /// Wrong lock or reservation token
    #[error("token does not match the current holder")]
    NoPermission,
    /// Malformed key, range, or mismatched descriptor
    #[error("invalid arguments")]
    InvalidArgs,
    /// Allocation failure or selector space exhausted
    #[error("no space left")]
    NoSpace,
    /// A service still has pending requests or live children
    #[error("service has messages waiting")]
    MessagesWaiting,
    /// Request could not be delivered to the owning domain
    #[error("owning domain is unreachable")]
    Unreachable,
}

/// Misuse of the revocation tracker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RevocationError {
    /// A record for this capability is already live
    #[error("revocation for {0} is already in flight")]
    AlreadyInFlight(Key),
}
