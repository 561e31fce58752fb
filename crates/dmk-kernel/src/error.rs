//! Runtime errors

use dmk_hal::HalError;
use dmk_ipc::CodecError;
use dmk_kernel_core::KernelError;
use futures::task::SpawnError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors returned by `Kernel` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Failure reported by the core or by the remote owner of a key
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("platform error: {0}")]
    Hal(#[from] HalError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("event loop is gone: {0}")]
    Spawn(#[from] SpawnError),
    /// A reply did not match the request it answers
    #[error("unexpected reply")]
    UnexpectedReply,
    /// The domain stopped while the operation was waiting
    #[error("domain is shutting down")]
    Shutdown,
}

impl Error {
    /// Error to put into a reply for a remote requester.
    pub fn to_wire(&self) -> KernelError {
        match self {
            Error::Kernel(err) => *err,
            Error::Hal(HalError::DomainUnreachable) => KernelError::Unreachable,
            Error::Hal(HalError::OutOfMemory) => KernelError::NoSpace,
            _ => KernelError::InvalidArgs,
        }
    }
}

/// Result type of the runtime
pub type Result<T, E = Error> = core::result::Result<T, E>;
