//! This module defines types used to configure the core and its parts.
//!
//! Configuration is read once at component construction into these plain,
//! immutable structs; nothing here is reloaded at runtime.

use std::time::Duration;

use crate::protocol::ProtocolVersion;

/// The global configuration for the core and all its subsystems.
#[derive(Clone, Debug)]
pub struct Conf {
    pub protocol: ProtocolConf,
    pub pex: PexConf,
    pub nat: NatConf,
    pub service: ServiceConf,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            protocol: ProtocolConf::default(),
            pex: PexConf::default(),
            nat: NatConf::default(),
            service: ServiceConf::default(),
        }
    }
}

/// Configuration for handshake negotiation and encrypted transport.
#[derive(Clone, Debug)]
pub struct ProtocolConf {
    /// Protocol versions we support, in descending priority
    /// (`HYBRID > V2 > V1` per the negotiation rule).
    pub supported_versions: Vec<ProtocolVersion>,
    pub encryption: EncryptionMode,
    pub handshake_timeout: Duration,
    pub v2_message_timeout: Duration,
}

impl Default for ProtocolConf {
    fn default() -> Self {
        Self {
            supported_versions: vec![
                ProtocolVersion::Hybrid,
                ProtocolVersion::V2,
                ProtocolVersion::V1,
            ],
            encryption: EncryptionMode::Disabled,
            handshake_timeout: Duration::from_secs(30),
            v2_message_timeout: Duration::from_secs(10),
        }
    }
}

/// Message Stream Encryption negotiation policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Never attempt MSE; connect in plaintext.
    Disabled,
    /// Attempt MSE; fall back to plaintext on failure.
    Preferred,
    /// Require MSE; close the connection on failure.
    Required,
}

/// Configuration for the PEX (ut_pex, BEP 11) engine.
#[derive(Clone, Debug)]
pub struct PexConf {
    /// How often the background gossip task wakes up.
    pub tick: Duration,
    /// Per-session minimum gap between sends to the same peer.
    pub pex_interval: Duration,
    /// Cap on added/dropped peers sent per session per interval.
    pub max_peers_per_interval: usize,
    /// How long a known peer may sit unrefreshed before cleanup evicts it.
    pub known_peer_ttl: Duration,
    /// How often the cleanup task runs.
    pub cleanup_interval: Duration,
}

impl Default for PexConf {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            pex_interval: Duration::from_secs(30),
            max_peers_per_interval: 50,
            known_peer_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Configuration for NAT-PMP / UPnP traversal.
#[derive(Clone, Debug)]
pub struct NatConf {
    pub enable_natpmp: bool,
    pub enable_upnp: bool,
    pub auto_map_ports: bool,
    pub map_tcp_port: bool,
    pub map_udp_port: bool,
    pub map_dht_port: bool,
    /// Authoritative lease time requested (and, for UPnP, the interval used
    /// to schedule renewal regardless of what the router claims to grant).
    pub port_mapping_lease_time: Duration,
    /// 0 disables periodic re-discovery.
    pub nat_discovery_interval: Duration,
    pub natpmp_socket_timeout: Duration,
    pub natpmp_max_retries: u32,
    pub upnp_ssdp_timeout: Duration,
    pub upnp_ssdp_retries: u32,
    pub upnp_http_timeout: Duration,
    pub discovery_max_attempts: u32,
    pub mapping_max_attempts: u32,
    pub renewal_max_retries: u32,
    pub description: String,
}

impl Default for NatConf {
    fn default() -> Self {
        Self {
            enable_natpmp: true,
            enable_upnp: true,
            auto_map_ports: true,
            map_tcp_port: true,
            map_udp_port: true,
            map_dht_port: false,
            port_mapping_lease_time: Duration::from_secs(3600),
            nat_discovery_interval: Duration::from_secs(0),
            natpmp_socket_timeout: Duration::from_secs(10),
            natpmp_max_retries: 3,
            upnp_ssdp_timeout: Duration::from_secs(5),
            upnp_ssdp_retries: 3,
            upnp_http_timeout: Duration::from_secs(10),
            discovery_max_attempts: 2,
            mapping_max_attempts: 3,
            renewal_max_retries: 3,
            description: "ccBitTorrent".to_string(),
        }
    }
}

/// Configuration for the service fabric (supervisor + individual services).
#[derive(Clone, Debug)]
pub struct ServiceConf {
    pub health_check_interval: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    pub peer: PeerServiceConf,
    pub storage: StorageServiceConf,
    pub tracker: TrackerServiceConf,
}

impl Default for ServiceConf {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            peer: PeerServiceConf::default(),
            storage: StorageServiceConf::default(),
            tracker: TrackerServiceConf::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PeerServiceConf {
    pub max_peers: usize,
    pub connection_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub monitor_interval: Duration,
}

impl Default for PeerServiceConf {
    fn default() -> Self {
        Self {
            max_peers: 200,
            connection_timeout: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StorageServiceConf {
    pub max_concurrent_operations: usize,
    pub max_file_size: u64,
    pub write_buffer_kib: u64,
}

impl Default for StorageServiceConf {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 4,
            max_file_size: 10 * 1024 * 1024 * 1024,
            write_buffer_kib: 1024,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackerServiceConf {
    pub max_trackers: usize,
    pub max_failure_count: u32,
    pub health_check_interval: Duration,
    pub default_announce_interval: Duration,
}

impl Default for TrackerServiceConf {
    fn default() -> Self {
        Self {
            max_trackers: 10,
            max_failure_count: 5,
            health_check_interval: Duration::from_secs(60),
            default_announce_interval: Duration::from_secs(30 * 60),
        }
    }
}
