//! NAT traversal: NAT-PMP and UPnP IGD clients behind a unified manager
//! facade.

pub mod manager;
pub mod natpmp;
pub mod port_mapping;
pub mod upnp;

pub use manager::{NatManager, NatStatus};
pub use port_mapping::{PortMapping, PortMappingManager};

use std::fmt;

/// A mapped transport protocol. The mapping key `(Protocol, external_port)`
/// must be unique across the whole NAT manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which backend satisfied NAT traversal for a given mapping or discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatProtocolSource {
    NatPmp,
    Upnp,
}

/// Well-known UPnP SOAP fault codes, per §4.6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpnpErrorCode {
    InvalidArgs,
    ActionFailed,
    ActionNotAuthorized,
    SpecifiedArrayIndexInvalid,
    NoSuchEntryInArray,
    ConflictInMappingEntry,
    OnlyPermanentLeasesSupported,
    Other(u32),
}

impl UpnpErrorCode {
    pub fn from_code(code: u32) -> Self {
        match code {
            402 => Self::InvalidArgs,
            501 => Self::ActionFailed,
            606 => Self::ActionNotAuthorized,
            713 => Self::SpecifiedArrayIndexInvalid,
            714 => Self::NoSuchEntryInArray,
            718 => Self::ConflictInMappingEntry,
            725 => Self::OnlyPermanentLeasesSupported,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::InvalidArgs => 402,
            Self::ActionFailed => 501,
            Self::ActionNotAuthorized => 606,
            Self::SpecifiedArrayIndexInvalid => 713,
            Self::NoSuchEntryInArray => 714,
            Self::ConflictInMappingEntry => 718,
            Self::OnlyPermanentLeasesSupported => 725,
            Self::Other(code) => code,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::InvalidArgs => "Invalid Args",
            Self::ActionFailed => "Action Failed",
            Self::ActionNotAuthorized => "Action Not Authorized",
            Self::SpecifiedArrayIndexInvalid => "SpecifiedArrayIndexInvalid",
            Self::NoSuchEntryInArray => "NoSuchEntryInArray",
            Self::ConflictInMappingEntry => "ConflictInMappingEntry",
            Self::OnlyPermanentLeasesSupported => "OnlyPermanentLeasesSupported",
            Self::Other(_) => "unknown UPnP error",
        }
    }

    /// 606 is authorization failure; the manager treats it as non-retryable
    /// after a single additional attempt.
    pub fn is_authorization_error(self) -> bool {
        matches!(self, Self::ActionNotAuthorized)
    }
}

impl fmt::Display for UpnpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.description())
    }
}

/// Determines the local IPv4 address used to reach the internet, by
/// connecting a UDP socket to a well-known external address and reading
/// back the assigned local endpoint. No packets are actually sent.
pub async fn detect_outbound_ipv4() -> Option<std::net::Ipv4Addr> {
    let socket = tokio::net::UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0))
        .await
        .ok()?;
    socket.connect(("8.8.8.8", 80)).await.ok()?;
    match socket.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) => Some(ip),
        std::net::IpAddr::V6(_) => None,
    }
}
