//! Domain configuration
//!
//! Every domain is started from a `KernelConfig` describing itself and its
//! peers. All domains of one machine must be given the same peer list.

use std::collections::BTreeSet;

use dmk_kernel_core::{DomainId, MembershipFlags, MembershipTable, PeId, MAX_PES};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of relays before a request is rejected
pub const DEFAULT_FORWARD_HOP_LIMIT: u8 = 4;

/// Default number of audit events kept in memory
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// A domain and the PE range it boots with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub id: DomainId,
    /// PE the domain's kernel runs on
    pub kernel_pe: PeId,
    /// First PE of the contiguous range the domain owns
    pub first_pe: u16,
    pub pe_count: u16,
}

impl DomainSpec {
    /// PEs owned at boot.
    pub fn pes(&self) -> impl Iterator<Item = PeId> {
        (self.first_pe..self.first_pe + self.pe_count).map(PeId)
    }

    fn contains(&self, pe: PeId) -> bool {
        (self.first_pe..self.first_pe + self.pe_count).contains(&pe.0)
    }
}

/// Configuration of one kernel domain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// This domain
    pub domain: DomainId,
    /// Every domain of the machine, this one included
    pub domains: Vec<DomainSpec>,
    /// Size of the PE id space actually in use
    #[serde(default = "default_max_pes")]
    pub max_pes: u16,
    /// Seed for lock nonces; drawn from the HAL when absent
    #[serde(default)]
    pub lock_seed: Option<u64>,
    #[serde(default = "default_forward_hop_limit")]
    pub forward_hop_limit: u8,
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
    /// Domain that collects shutdown requests
    #[serde(default)]
    pub coordinator: Option<DomainId>,
}

fn default_max_pes() -> u16 {
    MAX_PES
}

fn default_forward_hop_limit() -> u8 {
    DEFAULT_FORWARD_HOP_LIMIT
}

fn default_audit_capacity() -> usize {
    DEFAULT_AUDIT_CAPACITY
}

/// Rejected configurations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("domain {0} is not listed in the domain table")]
    UnknownDomain(DomainId),
    #[error("domain {0} is listed twice")]
    DuplicateDomain(DomainId),
    #[error("domain {0} owns no PEs")]
    EmptyRange(DomainId),
    #[error("PE range of domain {0} exceeds max_pes")]
    RangeOutOfBounds(DomainId),
    #[error("{0} is owned by more than one domain")]
    OverlappingRange(PeId),
    #[error("kernel PE of domain {0} lies outside its range")]
    KernelPeOutside(DomainId),
    #[error("max_pes must be between 1 and 1024")]
    MaxPes,
    #[error("forward hop limit must be at least 1")]
    HopLimit,
}

impl KernelConfig {
    /// `count` domains with `pes_per_domain` PEs each, domain 0 coordinating.
    pub fn uniform(domain: DomainId, count: u16, pes_per_domain: u16) -> Self {
        let domains = (0..count)
            .map(|i| DomainSpec {
                id: DomainId(i),
                kernel_pe: PeId(i * pes_per_domain),
                first_pe: i * pes_per_domain,
                pe_count: pes_per_domain,
            })
            .collect();
        Self {
            domain,
            domains,
            max_pes: MAX_PES,
            lock_seed: None,
            forward_hop_limit: DEFAULT_FORWARD_HOP_LIMIT,
            audit_capacity: DEFAULT_AUDIT_CAPACITY,
            coordinator: Some(DomainId(0)),
        }
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pes == 0 || self.max_pes > MAX_PES {
            return Err(ConfigError::MaxPes);
        }
        if self.forward_hop_limit == 0 {
            return Err(ConfigError::HopLimit);
        }
        let mut ids = BTreeSet::new();
        let mut owned = BTreeSet::new();
        for spec in &self.domains {
            if !ids.insert(spec.id) {
                return Err(ConfigError::DuplicateDomain(spec.id));
            }
            if spec.pe_count == 0 {
                return Err(ConfigError::EmptyRange(spec.id));
            }
            if u32::from(spec.first_pe) + u32::from(spec.pe_count) > u32::from(self.max_pes) {
                return Err(ConfigError::RangeOutOfBounds(spec.id));
            }
            if !spec.contains(spec.kernel_pe) {
                return Err(ConfigError::KernelPeOutside(spec.id));
            }
            for pe in spec.pes() {
                if !owned.insert(pe) {
                    return Err(ConfigError::OverlappingRange(pe));
                }
            }
        }
        if !ids.contains(&self.domain) {
            return Err(ConfigError::UnknownDomain(self.domain));
        }
        if let Some(coordinator) = self.coordinator.filter(|c| !ids.contains(c)) {
            return Err(ConfigError::UnknownDomain(coordinator));
        }
        Ok(())
    }

    /// Spec of `domain`, if known.
    pub fn spec(&self, domain: DomainId) -> Option<&DomainSpec> {
        self.domains.iter().find(|spec| spec.id == domain)
    }

    /// Kernel PE of `domain`, if known.
    pub fn kernel_pe(&self, domain: DomainId) -> Option<PeId> {
        self.spec(domain).map(|spec| spec.kernel_pe)
    }

    /// Every domain other than this one.
    pub fn peers(&self) -> impl Iterator<Item = DomainId> + '_ {
        self.domains
            .iter()
            .map(|spec| spec.id)
            .filter(move |id| *id != self.domain)
    }

    /// Boot-time membership view.
    pub fn membership(&self) -> MembershipTable {
        let mut table = MembershipTable::new(self.domain);
        for spec in &self.domains {
            let pes: Vec<_> = spec.pes().collect();
            table.update(&pes, spec.id, spec.kernel_pe, MembershipFlags::Normal);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_uniform_config_is_valid() {
        let config = KernelConfig::uniform(DomainId(1), 3, 8);
        config.validate().unwrap();
        assert_eq!(config.peers().collect::<Vec<_>>(), vec![DomainId(0), DomainId(2)]);
        assert_eq!(config.kernel_pe(DomainId(2)), Some(PeId(16)));

        let membership = config.membership();
        assert_eq!(membership.responsible_domain(PeId(9)), DomainId(1));
        assert_eq!(membership.local_pes().len(), 8);
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let json = r#"{
            "domain": 0,
            "domains": [
                { "id": 0, "kernel_pe": 0, "first_pe": 0, "pe_count": 4 },
                { "id": 1, "kernel_pe": 4, "first_pe": 4, "pe_count": 4 }
            ],
            "lock_seed": 99
        }"#;
        let config = KernelConfig::from_json(json).unwrap();
        assert_eq!(config.lock_seed, Some(99));
        assert_eq!(config.forward_hop_limit, DEFAULT_FORWARD_HOP_LIMIT);
        assert_eq!(config.audit_capacity, DEFAULT_AUDIT_CAPACITY);
        assert_eq!(config.max_pes, MAX_PES);
        assert_eq!(config.coordinator, None);
    }

    #[test]
    fn test_rejects_inconsistent_configs() {
        let mut config = KernelConfig::uniform(DomainId(0), 2, 4);
        config.domains[1].first_pe = 2;
        config.domains[1].kernel_pe = PeId(2);
        assert_matches!(config.validate(), Err(ConfigError::OverlappingRange(PeId(2))));

        let mut config = KernelConfig::uniform(DomainId(5), 2, 4);
        assert_matches!(config.validate(), Err(ConfigError::UnknownDomain(DomainId(5))));
        config.domain = DomainId(0);
        config.domains[0].kernel_pe = PeId(7);
        assert_matches!(config.validate(), Err(ConfigError::KernelPeOutside(DomainId(0))));

        let mut config = KernelConfig::uniform(DomainId(0), 2, 4);
        config.forward_hop_limit = 0;
        assert_matches!(config.validate(), Err(ConfigError::HopLimit));

        let mut config = KernelConfig::uniform(DomainId(0), 2, 4);
        config.max_pes = 6;
        assert_matches!(config.validate(), Err(ConfigError::RangeOutOfBounds(DomainId(1))));
    }

    #[test]
    fn test_malformed_json() {
        assert_matches!(KernelConfig::from_json("{"), Err(ConfigError::Parse(_)));
    }
}
