//! Tracks the mappings the NAT manager believes are currently live.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::nat::{NatProtocolSource, Protocol};

/// A single active port mapping.
///
/// `expires_at = None` means permanent; otherwise `expires_at` is always
/// after `created_at`.
#[derive(Clone, Debug)]
pub struct PortMapping {
    pub internal_port: u16,
    pub external_port: u16,
    pub protocol: Protocol,
    pub source: NatProtocolSource,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
}

impl PortMapping {
    pub fn new(
        internal_port: u16,
        external_port: u16,
        protocol: Protocol,
        source: NatProtocolSource,
        lifetime: Option<Duration>,
    ) -> Self {
        let created_at = Instant::now();
        Self {
            internal_port,
            external_port,
            protocol,
            source,
            created_at,
            expires_at: lifetime.map(|l| created_at + l),
        }
    }

    /// The instant at which a renewal should be attempted: 80% of the
    /// lifetime, per §4.7. Permanent mappings never need renewal.
    pub fn renewal_due_at(&self) -> Option<Instant> {
        let expires_at = self.expires_at?;
        let total = expires_at.saturating_duration_since(self.created_at);
        Some(self.created_at + total.mul_f64(0.8))
    }
}

/// Keyed by `(protocol, external_port)`; duplicate keys are rejected by the
/// manager before insertion reaches this table.
#[derive(Default)]
pub struct PortMappingManager {
    mappings: HashMap<(Protocol, u16), PortMapping>,
}

impl PortMappingManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, mapping: PortMapping) -> Option<PortMapping> {
        self.mappings
            .insert((mapping.protocol, mapping.external_port), mapping)
    }

    pub fn remove(&mut self, protocol: Protocol, external_port: u16) -> Option<PortMapping> {
        self.mappings.remove(&(protocol, external_port))
    }

    pub fn contains(&self, protocol: Protocol, external_port: u16) -> bool {
        self.mappings.contains_key(&(protocol, external_port))
    }

    pub fn get(&self, protocol: Protocol, external_port: u16) -> Option<&PortMapping> {
        self.mappings.get(&(protocol, external_port))
    }

    pub fn external_port_for(&self, internal_port: u16, protocol: Protocol) -> Option<u16> {
        self.mappings
            .values()
            .find(|m| m.protocol == protocol && m.internal_port == internal_port)
            .map(|m| m.external_port)
    }

    pub fn all(&self) -> impl Iterator<Item = &PortMapping> {
        self.mappings.values()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_key_insert_replaces_and_returns_previous() {
        let mut mgr = PortMappingManager::new();
        let m1 = PortMapping::new(6881, 6881, Protocol::Tcp, NatProtocolSource::NatPmp, None);
        let m2 = PortMapping::new(6882, 6881, Protocol::Tcp, NatProtocolSource::Upnp, None);
        assert!(mgr.insert(m1).is_none());
        let replaced = mgr.insert(m2);
        assert!(replaced.is_some());
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn renewal_due_at_is_eighty_percent_of_lifetime() {
        let mapping = PortMapping::new(
            6881,
            6881,
            Protocol::Tcp,
            NatProtocolSource::NatPmp,
            Some(Duration::from_secs(100)),
        );
        let due = mapping.renewal_due_at().unwrap();
        let delta = due.saturating_duration_since(mapping.created_at);
        assert_eq!(delta, Duration::from_secs(80));
    }

    #[test]
    fn permanent_mapping_has_no_renewal() {
        let mapping = PortMapping::new(6881, 6881, Protocol::Tcp, NatProtocolSource::NatPmp, None);
        assert!(mapping.renewal_due_at().is_none());
    }

    #[test]
    fn external_port_for_looks_up_by_internal_port_and_protocol() {
        let mut mgr = PortMappingManager::new();
        mgr.insert(PortMapping::new(
            6881,
            51000,
            Protocol::Tcp,
            NatProtocolSource::Upnp,
            None,
        ));
        assert_eq!(mgr.external_port_for(6881, Protocol::Tcp), Some(51000));
        assert_eq!(mgr.external_port_for(6881, Protocol::Udp), None);
    }
}
