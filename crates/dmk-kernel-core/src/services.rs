//! Service registry
//!
//! Services are shared between the service capability that names them and
//! every session opened on them, so sessions are kept as `Rc`s here and the
//! last-owner checks in capability revocation are plain strong counts.

use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::capability::SessionObject;
use crate::key::Key;

/// A registered service.
#[derive(Debug)]
pub struct ServiceObject {
    /// Key the service is registered under
    pub key: Key,
    /// Service name
    pub name: String,
    /// Set once revocation of the service has started
    pub closing: bool,
    /// Requests sent to the service that are not answered yet
    pub pending: u32,
    /// Open sessions
    pub sessions: Vec<Rc<SessionObject>>,
}

/// Wire view of a service returned by store lookups.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Service key
    pub key: Key,
    /// Service name
    pub name: String,
    /// Whether the service is shutting down
    pub closing: bool,
}

/// Services hosted by one domain.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<Key, ServiceObject>,
}

impl ServiceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service; returns `false` if the key is taken.
    pub fn register(&mut self, key: Key, name: impl Into<String>) -> bool {
        if self.services.contains_key(&key) {
            return false;
        }
        self.services.insert(
            key,
            ServiceObject {
                key,
                name: name.into(),
                closing: false,
                pending: 0,
                sessions: Vec::new(),
            },
        );
        true
    }

    pub fn get(&self, key: Key) -> Option<&ServiceObject> {
        self.services.get(&key)
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut ServiceObject> {
        self.services.get_mut(&key)
    }

    /// Look a service up by name.
    pub fn by_name(&self, name: &str) -> Option<&ServiceObject> {
        self.services.values().find(|s| s.name == name)
    }

    /// Remove a service for good.
    pub fn retire(&mut self, key: Key) -> Option<ServiceObject> {
        self.services.remove(&key)
    }

    /// Descriptor handed out by store lookups.
    pub fn descriptor(&self, key: Key) -> Option<ServiceDescriptor> {
        self.services.get(&key).map(|s| ServiceDescriptor {
            key: s.key,
            name: s.name.clone(),
            closing: s.closing,
        })
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
