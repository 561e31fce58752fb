//! Hardware Abstraction Layer trait for dmk
//!
//! This crate defines the HAL trait that lets one kernel domain run on
//! different platforms by abstracting the hardware it talks to.
//!
//! # Platform Implementations
//!
//! - **Hardware**: the DTU moves frames between kernel PEs; endpoint,
//!   memory and mapping operations program the PEs directly
//! - **Mock**: `dmk-hal-mock` keeps per-domain inboxes in memory and records
//!   every platform call for tests

use dmk_kernel_core::{DomainId, EpId, Key, OwnerId, PeId};
use thiserror::Error;

/// Hardware Abstraction Layer trait
///
/// Implementations provide platform-specific functionality for:
/// - Frame transport between kernel domains (reliable, FIFO per pair)
/// - Time measurement and entropy
/// - The platform side of capability revocation
/// - Halting the domain on a broken invariant
///
/// A domain is single-threaded, so implementations need not be `Send`.
pub trait HAL: 'static {
    // === Inter-domain messaging ===

    /// Domain this HAL instance belongs to
    fn local_domain(&self) -> DomainId;

    /// Send a frame to another domain
    ///
    /// # Returns
    /// * `Ok(())` - Frame queued for delivery
    /// * `Err(HalError::DomainUnreachable)` - No link to that domain
    /// * `Err(HalError::InvalidMessage)` - Frame too large
    fn send_to_domain(&self, to: DomainId, frame: &[u8]) -> Result<(), HalError>;

    /// Poll for incoming frames (non-blocking)
    ///
    /// Returns (sender, frame) pairs in arrival order.
    fn poll_messages(&self) -> Vec<(DomainId, Vec<u8>)>;

    // === Time & Entropy ===

    /// Get current time in nanoseconds (monotonic)
    fn now_nanos(&self) -> u64;

    /// Fill buffer with random bytes
    ///
    /// # Returns
    /// * `Ok(())` - Buffer filled successfully
    /// * `Err(HalError::NotSupported)` - Entropy source not available
    fn random_bytes(&self, buf: &mut [u8]) -> Result<(), HalError>;

    // === Revocation side effects ===

    /// Invalidate an endpoint that was configured from a capability
    fn invalidate_endpoint(&self, owner: OwnerId, ep: EpId) -> Result<(), HalError>;

    /// Return a memory region to the allocator of its memory PE
    fn free_memory(&self, pe: PeId, addr: u64, size: u64) -> Result<(), HalError>;

    /// Remove a page mapping of a VPE
    fn unmap_page(&self, owner: OwnerId, virt: u64) -> Result<(), HalError>;

    /// Tell the server behind `service` that session `ident` is closed
    fn close_session(&self, service: Key, ident: u64) -> Result<(), HalError>;

    // === Failure ===

    /// Stop this domain for good
    ///
    /// Called when an invariant is broken and continuing would leave the
    /// system inconsistent.
    fn halt(&self, reason: &str) -> !;
}

/// HAL error types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum HalError {
    /// Not enough memory available
    #[error("out of memory")]
    OutOfMemory,
    /// No link to the target domain
    #[error("domain unreachable")]
    DomainUnreachable,
    /// Invalid frame format or too large
    #[error("invalid message")]
    InvalidMessage,
    /// Operation not supported on this platform
    #[error("not supported")]
    NotSupported,
    /// Invalid argument
    #[error("invalid argument")]
    InvalidArgument,
    /// Device reported an error
    #[error("i/o error")]
    IoError,
}
