//! dmk Kernel Core - pure state of one kernel domain
//!
//! This crate contains the **HAL-free** state of a kernel domain in a
//! multikernel: the structured key space, the partitioned object store
//! (MHT), capability tables and the distributed revocation walk.
//!
//! # Design Principles
//!
//! 1. **No HAL dependency**: messaging and platform side effects live in
//!    `dmk-kernel`
//! 2. **No I/O, no suspension**: operations that would wait report it, and
//!    operations that cause remote work return it as data
//! 3. **Deterministic**: lock nonces come from a seeded source
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    dmk-kernel-core                          │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                    │
//! │   │  KernelState  │    │   revoke::*   │                    │
//! │   │  - membership │───▶│  walk → Vec<  │                    │
//! │   │  - store      │    │     Effect>   │                    │
//! │   │  - tables     │    └───────────────┘                    │
//! │   │  - services   │                                         │
//! │   │  - revocations│    ┌───────────────┐                    │
//! │   └───────────────┘    │  Invariants   │                    │
//! │                        └───────────────┘                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      dmk-kernel                             │
//! │   - event loop, waiter registry, protocol handlers          │
//! │   - executes Effects through the HAL                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - identifier newtypes (DomainId, PeId, OwnerId, tokens)
//! - `key` - structured key layout
//! - `membership` - PE → domain table
//! - `partition` / `store` - MHT partitions and the local store
//! - `capability` / `cap_table` / `services` - capability model
//! - `revocations` / `revoke` - revocation tracker and walk
//! - `state` - `KernelState` aggregate
//! - `invariants` - runtime-checkable invariants

pub mod cap_table;
pub mod capability;
pub mod error;
pub mod invariants;
pub mod key;
pub mod membership;
pub mod partition;
pub mod revocations;
pub mod revoke;
pub mod services;
pub mod state;
pub mod store;
pub mod types;

pub use cap_table::{CapTable, TableKind};
pub use capability::{CapDescriptor, CapKind, Capability, MemObject, MsgObject, RevokeAction, SessionObject};
pub use error::{KernelError, RevocationError};
pub use invariants::{check_all_invariants, InvariantViolation};
pub use key::{ItemType, Key, MAX_OWNERS, MAX_PES};
pub use membership::{MembershipEntry, MembershipFlags, MembershipTable};
pub use partition::{Access, Item, ItemImage, Partition, PartitionImage, Waiter, Wakeup, Woken};
pub use revocations::{Acknowledged, Revocation, RevocationTracker, Subscriber};
pub use revoke::{Effect, OriginRevoke};
pub use services::{ServiceDescriptor, ServiceObject, ServiceRegistry};
pub use state::{BootstrapImage, KernelState, VpeTables};
pub use store::LocalStore;
pub use types::{DomainId, EpId, LockToken, OwnerId, PeId, Selector, WaitToken};
