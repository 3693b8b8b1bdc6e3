//! Crate-wide error types.
//!
//! Every fallible operation in this crate returns [`Result`], whose error side
//! is this single [`Error`] enum. Each variant carries enough context (peer
//! address, mapping key, service name) to reproduce the user-visible log
//! message required of it without the caller having to re-derive it.

use crate::nat::{Protocol, UpnpErrorCode};

pub type Result<T> = std::result::Result<T, Error>;

/// A handshake could not be parsed, or failed validation once parsed.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake too short")]
    TooShort,
    #[error("invalid handshake size")]
    InvalidSize,
    #[error("invalid protocol string")]
    InvalidProtocol,
    #[error("info hash mismatch")]
    HashMismatch,
    #[error("no compatible protocol version")]
    NoCompatibleVersion,
}

/// A v2 extension message failed to decode or was rejected at construction.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid message id {0}")]
    InvalidMessageId(u8),
    #[error("declared message length {declared} does not match payload length {actual}")]
    LengthMismatch { declared: u32, actual: u32 },
    #[error("piece hash payload length {0} is not a multiple of 32")]
    InvalidHashListLength(usize),
    #[error("pieces_root must be exactly 32 bytes, got {0}")]
    InvalidPiecesRoot(usize),
    #[error("file tree response body must not be empty")]
    EmptyFileTree,
}

/// NAT-PMP result codes, per RFC 6886 §3.5.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatPmpResultCode {
    UnsupportedVersion,
    NotAuthorized,
    NetworkFailure,
    OutOfResources,
    UnsupportedOpcode,
    Unknown(u16),
}

impl From<u16> for NatPmpResultCode {
    fn from(code: u16) -> Self {
        match code {
            1 => Self::UnsupportedVersion,
            2 => Self::NotAuthorized,
            3 => Self::NetworkFailure,
            4 => Self::OutOfResources,
            5 => Self::UnsupportedOpcode,
            other => Self::Unknown(other),
        }
    }
}

impl std::fmt::Display for NatPmpResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedVersion => write!(f, "unsupported version"),
            Self::NotAuthorized => write!(f, "not authorized"),
            Self::NetworkFailure => write!(f, "network failure"),
            Self::OutOfResources => write!(f, "out of resources"),
            Self::UnsupportedOpcode => write!(f, "unsupported opcode"),
            Self::Unknown(code) => write!(f, "unknown result code {}", code),
        }
    }
}

/// NAT-PMP client failure.
#[derive(Clone, Debug, thiserror::Error)]
pub enum NatPmpError {
    #[error("no gateway discovered")]
    NoGateway,
    #[error("nat-pmp request timed out after {0} attempts")]
    Timeout(u32),
    #[error("nat-pmp error: {0}")]
    Result(NatPmpResultCode),
    #[error("malformed nat-pmp response")]
    MalformedResponse,
    #[error("io error: {0}")]
    Io(String),
}

/// UPnP IGD client failure.
#[derive(Clone, Debug, thiserror::Error)]
pub enum UpnpError {
    #[error("no IGD device discovered")]
    NoDevice,
    #[error("device description fetch failed: {0}")]
    DeviceDescription(String),
    #[error("soap fault {code}: {description}")]
    Soap {
        code: UpnpErrorCode,
        description: String,
    },
    #[error("http error: {0}")]
    Http(String),
    #[error("xml parse error: {0}")]
    Xml(String),
}

/// A service-fabric level failure.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("service '{0}' is not registered")]
    NotRegistered(String),
    #[error("service '{name}' is in state {state:?}, required {required:?}")]
    InvalidState {
        name: String,
        state: crate::service::ServiceState,
        required: crate::service::ServiceState,
    },
    #[error("circuit breaker open for '{0}'")]
    CircuitBreakerOpen(String),
    #[error("service '{name}' failed: {message}")]
    Failed { name: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    NatPmp(#[from] NatPmpError),
    #[error(transparent)]
    Upnp(#[from] UpnpError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("mapping {protocol:?}:{external_port} already exists")]
    DuplicateMapping { protocol: Protocol, external_port: u16 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel closed")]
    ChannelClosed,
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
