//! Audit log
//!
//! Records every protocol message in and out of the domain together with
//! capability teardown, for post-mortem inspection and for tests that need
//! to check what a domain did and in which order.

use dmk_ipc::Opcode;
use dmk_kernel_core::{DomainId, Key, MembershipFlags};
use serde::{Deserialize, Serialize};

/// Event sequence number
pub type EventId = u64;

/// One audited event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID (monotonic)
    pub id: EventId,
    /// Timestamp (HAL nanos)
    pub timestamp: u64,
    pub event_type: AuditEventType,
}

/// What happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    /// Frame decoded from `from`
    MessageIn { from: DomainId, opcode: Opcode },
    /// Frame sent to `to`
    MessageOut { to: DomainId, opcode: Opcode },
    /// A capability was removed by a revocation
    CapabilityRevoked { key: Key },
    /// A locally started revocation finished everywhere
    RevocationCompleted { key: Key },
    /// Membership of `pes` PEs changed
    MembershipChanged {
        owner: DomainId,
        flags: MembershipFlags,
        pes: usize,
    },
}

/// Bounded append-only event log.
///
/// Events get monotonic IDs; once `capacity` is exceeded the oldest events
/// are dropped.
pub struct AuditLog {
    /// Event entries (append-only)
    events: Vec<AuditEvent>,
    /// Next event ID to assign
    next_id: EventId,
    capacity: usize,
}

impl AuditLog {
    /// Create an empty log keeping at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::new(),
            next_id: 0,
            capacity,
        }
    }

    /// Append an event, returning its ID.
    pub fn record(&mut self, event_type: AuditEventType, timestamp: u64) -> EventId {
        let id = self.next_id;
        self.next_id += 1;

        self.events.push(AuditEvent {
            id,
            timestamp,
            event_type,
        });

        self.trim_if_needed();
        id
    }

    /// Get all retained events.
    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    /// Get the most recent N events, newest first.
    pub fn get_recent(&self, count: usize) -> Vec<&AuditEvent> {
        self.events.iter().rev().take(count).collect()
    }

    /// Keys of revoked capabilities in the order they were removed.
    pub fn revoked_keys(&self) -> Vec<Key> {
        self.events
            .iter()
            .filter_map(|e| match e.event_type {
                AuditEventType::CapabilityRevoked { key } => Some(key),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Get the next event ID.
    pub fn next_id(&self) -> EventId {
        self.next_id
    }

    /// Trim old events if exceeding max capacity.
    fn trim_if_needed(&mut self) {
        if self.events.len() > self.capacity {
            let drain_count = self.events.len() - self.capacity;
            self.events.drain(0..drain_count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmk_kernel_core::{ItemType, OwnerId};

    #[test]
    fn test_ids_are_monotonic() {
        let mut log = AuditLog::new(16);
        let a = log.record(AuditEventType::MessageIn { from: DomainId(1), opcode: Opcode::Get }, 5);
        let b = log.record(AuditEventType::MessageOut { to: DomainId(1), opcode: Opcode::Reply }, 6);
        assert_eq!((a, b), (0, 1));
        assert_eq!(log.next_id(), 2);
        assert_eq!(log.get_recent(1)[0].id, 1);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut log = AuditLog::new(3);
        for i in 0..5 {
            let key = Key::for_owner(OwnerId(1), ItemType::MemCap, i);
            log.record(AuditEventType::CapabilityRevoked { key }, i);
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.events()[0].id, 2);
        assert_eq!(log.revoked_keys().len(), 3);
    }
}
