//! dmk Kernel - runtime of one kernel domain
//!
//! This crate turns the pure state in `dmk-kernel-core` into a running
//! domain of a multikernel:
//! - Store facade routing keys to local partitions or remote owners
//! - Capability creation, derivation and cross-domain obtain
//! - Distributed revocation with completion tracking
//! - Partition migration and membership propagation
//! - Shutdown coordination
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       DomainLoop                             │
//! │   HAL inbox ──▶ handle_frame ──▶ serve / relay / notice      │
//! │                                                             │
//! │   ┌───────────────────────────────────────────────────┐     │
//! │   │                     Kernel                         │     │
//! │   │   - KernelState (dmk-kernel-core)                  │     │
//! │   │   - WaiterRegistry (token → parked task)           │     │
//! │   │   - AuditLog                                       │     │
//! │   │   - executes Effects through the HAL               │     │
//! │   └───────────────────────────────────────────────────┘     │
//! │                              │                               │
//! │                              ▼                               │
//! │               dmk-ipc frames over HAL::send_to_domain        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Operations that need another domain are `async`: the calling task parks
//! on a `WaitToken` and the loop keeps serving other frames meanwhile.

pub mod audit;
mod caps;
pub mod config;
mod coordinator;
pub mod error;
pub mod event_loop;
mod handlers;
pub mod kernel;
mod revocation;
mod store;
pub mod waiters;

pub use audit::{AuditEvent, AuditEventType, AuditLog};
pub use config::{ConfigError, DomainSpec, KernelConfig};
pub use error::{Error, Result};
pub use event_loop::DomainLoop;
pub use kernel::Kernel;
pub use store::Value;
pub use waiters::{Wake, WaiterRegistry};

// Re-export the types callers need alongside the runtime
pub use dmk_hal::{HalError, HAL};
pub use dmk_ipc::{CodecError, Opcode};
pub use dmk_kernel_core::{
    CapDescriptor, DomainId, Item, ItemType, Key, KernelError, LockToken, MembershipFlags, OwnerId, PeId,
    Selector, TableKind,
};
