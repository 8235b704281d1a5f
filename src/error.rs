//! Main crate error

use std::net::SocketAddr;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
/// Errors raised by the DHT.
pub enum Error {
    /// A node id or key digest was not exactly [KEY_LENGTH](crate::KEY_LENGTH) bytes long.
    #[error("Invalid identity: expected 20 bytes, got {0}")]
    InvalidIdentity(usize),

    /// An inbound packet had an unknown type byte or was truncated.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// No response arrived before the call deadline.
    #[error("RPC timed out")]
    RpcTimeout,

    /// No neighbors are known for a lookup target.
    #[error("No known route to target")]
    NoKnownRoute,

    /// The underlying transport failed to send.
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Only IPv4 addresses fit the wire format.
    #[error("Unsupported address: {0:?}")]
    UnsupportedAddress(Option<SocketAddr>),

    /// A stored entry expired between the storage snapshot and its retrieval.
    #[error("Storage entry expired during iteration")]
    ExpiredEntry,

    #[error(transparent)]
    /// Transparent [std::io::Error]
    Io(#[from] std::io::Error),
}
