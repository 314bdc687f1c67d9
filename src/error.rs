//! Error families for the TCPROS/RPCROS engine (spec §6, §7).
//!
//! Four families, one enum each, unified by [`Error`]. Ordering of
//! [`Error::severity`] follows the source's packed-error-code convention:
//! I/O failures dominate a callback error, which dominates a handshake or
//! wire-parse error.

use std::io;

use thiserror::Error;

/// Frame/header parsing and serialization failures (spec §7 family 1).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Not enough bytes buffered yet; caller should retry once more data
    /// arrives. Never surfaced past a connection boundary.
    #[error("short frame")]
    ShortFrame,
    #[error("malformed field: {0}")]
    MalformedField(String),
    #[error("unknown header key: {0}")]
    UnknownKey(String),
    #[error("duplicate header key: {0}")]
    DuplicateKey(String),
}

/// Handshake mismatch failures (spec §7 family 2).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("handshake missing required field: {0}")]
    MissingField(&'static str),
    #[error("no publisher registered for topic {0:?} type {1:?} md5 {2:?}")]
    TopicMismatch(String, String, String),
    #[error("publication handshake does not match any subscriber (type {0:?} md5 {1:?})")]
    PublicationMismatch(String, String),
    #[error("no service provider registered for {0:?}")]
    ServiceUnknown(String),
    #[error("service {0:?} is registered with a different md5sum")]
    ServiceMd5Mismatch(String),
    #[error("service provision handshake disagrees with caller expectations: {0}")]
    ServiceProvisionMismatch(String),
}

/// I/O failures, including the inactivity timeout (spec §7 family 3).
#[derive(Error, Debug)]
pub enum ConnError {
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("no progress for longer than the inactivity timeout")]
    Timeout,
    #[error("buffer grew past the configured ceiling of {0} bytes")]
    BufferCeilingExceeded(usize),
    #[error("connection pool is at its configured capacity of {0}")]
    PoolAtCapacity(usize),
}

/// A non-zero return from a user callback (spec §7 family 4). The payload
/// is an opaque application-defined code, mirroring the source's packed
/// error codes crossing the callback boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackError(pub i32);

impl std::fmt::Display for CallbackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "callback returned error code {}", self.0)
    }
}

impl std::error::Error for CallbackError {}

/// Unified error type returned by fallible public operations and
/// aggregated by [`crate::node::Node::start`].
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error(transparent)]
    Callback(#[from] CallbackError),
    #[error("name already registered: {0}")]
    AlreadyRegistered(String),
    #[error("unknown registration index")]
    UnknownRegistration,
}

impl Error {
    /// Relative severity used to pick the single worst error observed
    /// across a poll cycle. Higher is worse.
    pub fn severity(&self) -> u8 {
        match self {
            Error::Callback(_) => 1,
            Error::Wire(_) | Error::Handshake(_) => 2,
            Error::AlreadyRegistered(_) | Error::UnknownRegistration => 2,
            Error::Conn(_) => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
