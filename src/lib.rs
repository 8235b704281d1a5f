//! A Kademlia distributed hash table.
//!
//! Peers locate each other and replicate key/value data using an XOR-metric routing table,
//! alpha-parallel iterative lookups ("spider crawls") and a compact binary RPC protocol. Reads and
//! writes feed an adaptive quorum controller, and values live in a pluggable storage engine.
//!
//! The entry point is [`Node`], which binds a [`transport::Transport`] and exposes `bootstrap`,
//! `get`, `set` and `delete`.

#[macro_use]
extern crate log;

mod config;
mod error;
mod key;
mod node;
mod protocol;
mod quorum;
mod routing;
pub mod storage;
pub mod transport;

pub use self::config::Config;
pub use self::error::{Error, Result};
pub use self::key::NodeId;
pub use self::node::node_data::NodeData;
pub use self::node::Node;
pub use self::protocol::codec;
pub use self::protocol::{
    FindValueResult, Message, MessageId, Request, RequestPayload, Response, ResponsePayload,
};
pub use self::quorum::DynamicQuorum;

/// The number of bytes in a key.
pub const KEY_LENGTH: usize = 20;

/// The number of bits in a key.
const KEY_BITS: usize = KEY_LENGTH * 8;

/// The number of bytes in a message id.
pub const MESSAGE_ID_LENGTH: usize = 4;

/// The maximum length of a datagram in bytes.
const MESSAGE_LENGTH: usize = 65507;

/// The maximum number of entries in a k-bucket.
const REPLICATION_PARAM: usize = 20;

/// The number of probes sent per round of a lookup.
const CONCURRENCY_PARAM: usize = 3;

/// The replacement cache of a k-bucket holds at most this many multiples of its capacity.
const REPLACEMENT_FACTOR: usize = 5;

/// Buckets away from the local id only split while their depth is not a multiple of this.
const SPLIT_GRANULARITY: usize = 5;

/// Hard ceiling on the number of rounds in one lookup.
const MAX_CRAWL_ROUNDS: usize = 50;

/// Request timeout time in milliseconds
const REQUEST_TIMEOUT: u64 = 5000;

/// Key-value pair expiration time in seconds
const KEY_EXPIRATION: u64 = 604_800;

/// Bucket refresh interval in seconds
const BUCKET_REFRESH_INTERVAL: u64 = 3600;

/// Minimum number of random lookups run by one refresh sweep.
const REFRESH_TARGETS: usize = 5;

/// Default UDP port.
const DEFAULT_PORT: u16 = 8468;
