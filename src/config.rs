use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::key::NodeId;
use crate::{
    BUCKET_REFRESH_INTERVAL, CONCURRENCY_PARAM, DEFAULT_PORT, KEY_EXPIRATION, REPLICATION_PARAM,
    REQUEST_TIMEOUT,
};

/// Settings of one running node.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interface the UDP transport binds to.
    pub interface: IpAddr,
    /// Port the UDP transport binds to. `0` picks an ephemeral port.
    pub port: u16,
    /// Identity of the node. A random id is generated if `None`.
    pub id: Option<NodeId>,
    /// Bucket capacity and width of every closest-nodes result.
    pub ksize: usize,
    /// Number of probes per lookup round.
    pub alpha: usize,
    pub request_timeout: Duration,
    pub refresh_interval: Duration,
    /// Lifetime of values in the default storage engine.
    pub storage_ttl: Duration,
    /// Minimum read quorum, minimum write quorum and replica count.
    pub quorum: (usize, usize, usize),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interface: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            id: None,
            ksize: REPLICATION_PARAM,
            alpha: CONCURRENCY_PARAM,
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT),
            refresh_interval: Duration::from_secs(BUCKET_REFRESH_INTERVAL),
            storage_ttl: Duration::from_secs(KEY_EXPIRATION),
            quorum: (1, 1, 3),
        }
    }
}
