mod crawl;
mod heap;
pub mod node_data;
mod rpc;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use self::crawl::{call_all, NodeCrawl, ValueCrawl};
use self::node_data::NodeData;
use self::rpc::Rpc;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::key::NodeId;
use crate::quorum::DynamicQuorum;
use crate::storage::{Storage, TtlStorage};
use crate::transport::{Transport, UdpTransport};
use crate::REFRESH_TARGETS;

/// A node in the Kademlia DHT.
#[derive(Clone)]
pub struct Node {
    rpc: Rpc,
    config: Arc<Config>,
    quorum: Arc<DynamicQuorum>,
    refresher: Arc<Mutex<Option<Sender<()>>>>,
    is_active: Arc<AtomicBool>,
}

impl Node {
    /// Constructs a `Node` listening on UDP at the configured interface and port, storing values
    /// in a [`TtlStorage`].
    pub fn new(config: Config) -> Result<Self> {
        let transport = UdpTransport::bind((config.interface, config.port))?;
        let storage = Arc::new(TtlStorage::new(config.storage_ttl));
        Ok(Node::with_transport(config, Arc::new(transport), storage))
    }

    /// Constructs a `Node` on top of an already bound transport and a storage engine.
    pub fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let id = config.id.unwrap_or_else(NodeId::rand);
        let node_data = NodeData::new(id, transport.local_addr());
        let (min_r, min_w, min_n) = config.quorum;
        let rpc = Rpc::new(
            node_data,
            storage,
            transport,
            config.ksize,
            config.request_timeout,
        );
        let node = Node {
            rpc,
            config: Arc::new(config),
            quorum: Arc::new(DynamicQuorum::new(min_r, min_w, min_n)),
            refresher: Arc::new(Mutex::new(None)),
            is_active: Arc::new(AtomicBool::new(true)),
        };
        info!("{} - Listening as {:?}", node.addr(), id);
        node.rpc.start();
        node.start_bucket_refresher();
        node
    }

    fn addr(&self) -> SocketAddr {
        self.rpc.addr()
    }

    /// Starts a thread that refreshes the routing table and re-replicates stored values every
    /// refresh interval until the node is killed.
    fn start_bucket_refresher(&self) {
        let (tx, rx) = channel::<()>();
        *self
            .refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        let node = self.clone();
        let interval = self.config.refresh_interval;
        thread::spawn(move || {
            while let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(interval) {
                node.refresh();
            }
            info!("{} - Killed bucket refresher", node.addr());
        });
    }

    /// Returns the closest known nodes to `target`, failing if none are known.
    fn nearest(&self, target: &NodeId, count: usize) -> Result<Vec<NodeData>> {
        let nearest = self.rpc.find_neighbors(target, count);
        if nearest.is_empty() {
            return Err(Error::NoKnownRoute);
        }
        Ok(nearest)
    }

    /// Joins the network through `seeds`. Every seed is pinged with a placeholder id, and the ids
    /// they report are used to look up the local id. Returns the closest nodes found, or nothing
    /// if no seed answered.
    pub fn bootstrap(&self, seeds: &[SocketAddr]) -> Vec<NodeData> {
        let placeholders = seeds
            .iter()
            .map(|addr| NodeData::new(NodeId::zero(), *addr))
            .collect();
        let peers: Vec<NodeData> = call_all(&self.rpc, placeholders, |rpc, node_data| {
            rpc.ping(node_data)
        })
        .into_iter()
        .filter_map(|(node_data, id)| {
            id.map(|id| NodeData {
                id,
                addr: node_data.addr,
            })
        })
        .collect();

        if peers.is_empty() {
            warn!("{} - No bootstrap node answered", self.addr());
            return Vec::new();
        }
        info!("{} - Bootstrapping from {} nodes", self.addr(), peers.len());
        let local_id = self.rpc.node_data().id;
        NodeCrawl::new(
            self.rpc.clone(),
            local_id,
            peers,
            self.config.ksize,
            self.config.alpha,
        )
        .find()
    }

    /// Gets the value stored under `key`. Returns `None` if the key is unknown or deleted.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let digest = NodeId::digest(key);
        if let Some(value) = self.rpc.storage().get(digest.as_bytes()) {
            return Some(value).filter(|value| !value.is_empty());
        }

        let start = Instant::now();
        let nearest = match self.nearest(&digest, self.config.ksize) {
            Ok(nearest) => nearest,
            Err(err) => {
                warn!("{} - Cannot get {:?}: {}", self.addr(), key, err);
                return None;
            },
        };
        let value = ValueCrawl::new(
            self.rpc.clone(),
            digest,
            nearest,
            self.config.ksize,
            self.config.alpha,
        )
        .find();
        self.quorum.record(
            start.elapsed(),
            value.as_ref().map_or(false, |value| !value.is_empty()),
        );
        value.filter(|value| !value.is_empty())
    }

    /// Stores `value` under `key` on the closest nodes to its digest. Returns `true` if at least
    /// one of them accepted it.
    pub fn set(&self, key: &str, value: &[u8]) -> bool {
        let start = Instant::now();
        let success = self.set_digest(NodeId::digest(key), value.to_vec());
        self.quorum.record(start.elapsed(), success);
        success
    }

    /// Deletes `key` by storing an empty value under it.
    pub fn delete(&self, key: &str) -> bool {
        self.set(key, &[])
    }

    fn set_digest(&self, digest: NodeId, value: Vec<u8>) -> bool {
        let nearest = match self.nearest(&digest, self.config.ksize) {
            Ok(nearest) => nearest,
            Err(err) => {
                warn!("{} - Cannot set {:?}: {}", self.addr(), digest, err);
                return false;
            },
        };
        let nodes = NodeCrawl::new(
            self.rpc.clone(),
            digest,
            nearest,
            self.config.ksize,
            self.config.alpha,
        )
        .find();
        debug!("{} - Setting {:?} on {:?}", self.addr(), digest, nodes);

        let farthest = nodes
            .iter()
            .map(|node_data| node_data.id.distance_rank(&digest))
            .max();
        let local_rank = self.rpc.node_data().id.distance_rank(&digest);
        if farthest.map_or(true, |farthest| local_rank <= farthest) {
            self.rpc
                .storage()
                .put(digest.as_bytes().to_vec(), value.clone());
        }

        let key = digest.as_bytes().to_vec();
        call_all(&self.rpc, nodes, move |rpc, node_data| {
            rpc.store(node_data, key.clone(), value.clone())
        })
        .into_iter()
        .any(|(_, stored)| stored)
    }

    /// Refreshes stale buckets with lookups for random ids in their ranges, then republishes every
    /// stored value. Failures are logged and otherwise ignored.
    pub fn refresh(&self) {
        if !self.is_active.load(Ordering::Acquire) {
            return;
        }
        debug!("{} - Refreshing routing table", self.addr());
        self.rpc.storage().cull();

        let mut targets = self.rpc.refresh_ids(self.config.refresh_interval);
        while targets.len() < REFRESH_TARGETS {
            targets.push(NodeId::rand());
        }
        let lookups: Vec<_> = targets
            .into_iter()
            .map(|target| {
                let node = self.clone();
                thread::spawn(move || {
                    let peers = node.rpc.find_neighbors(&target, node.config.alpha);
                    if !peers.is_empty() {
                        NodeCrawl::new(
                            node.rpc.clone(),
                            target,
                            peers,
                            node.config.ksize,
                            node.config.alpha,
                        )
                        .find();
                    }
                })
            })
            .collect();
        for lookup in lookups {
            if lookup.join().is_err() {
                warn!("{} - Refresh lookup panicked", self.addr());
            }
        }

        for entry in self.rpc.storage().iter() {
            let (key, value) = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("{} - Stopped republishing: {}", self.addr(), err);
                    break;
                },
            };
            match NodeId::from_bytes(&key) {
                Ok(digest) => {
                    if !self.set_digest(digest, value) {
                        debug!("{} - Could not republish {:?}", self.addr(), digest);
                    }
                },
                Err(err) => warn!("{} - Skipping stored key: {}", self.addr(), err),
            }
        }
    }

    /// Returns the `NodeData` associated with the node.
    pub fn node_data(&self) -> NodeData {
        self.rpc.node_data().clone()
    }

    /// Returns the number of live nodes in the routing table.
    pub fn contact_count(&self) -> usize {
        self.rpc.contact_count()
    }

    /// Returns the adaptive quorum controller fed by `get` and `set`.
    pub fn quorum(&self) -> &DynamicQuorum {
        &self.quorum
    }

    /// Kills the current node: stops the refresher and closes the transport.
    pub fn kill(&self) {
        if !self.is_active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.rpc.close();
        info!("{} - Killed node", self.addr());
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use super::Node;
    use crate::config::Config;
    use crate::key::NodeId;
    use crate::storage::{Storage, TtlStorage};
    use crate::transport::MemoryNetwork;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn config() -> Config {
        Config {
            request_timeout: Duration::from_millis(200),
            ..Config::default()
        }
    }

    fn node(network: &MemoryNetwork, port: u16) -> Node {
        Node::with_transport(
            config(),
            Arc::new(network.bind(addr(port))),
            Arc::new(TtlStorage::default()),
        )
    }

    #[test]
    fn test_configured_id_is_used() {
        let network = MemoryNetwork::new();
        let id = NodeId::rand();
        let node = Node::with_transport(
            Config {
                id: Some(id),
                ..config()
            },
            Arc::new(network.bind(addr(1))),
            Arc::new(TtlStorage::default()),
        );
        assert_eq!(node.node_data().id, id);
        assert_eq!(node.node_data().addr, Some(addr(1)));
        node.kill();
    }

    #[test]
    fn test_isolated_node_has_no_route() {
        let network = MemoryNetwork::new();
        let node = node(&network, 1);
        assert!(!node.set("key", b"value"));
        assert_eq!(node.get("key"), None);
        assert_eq!(node.quorum().failure_count(), 1);
        node.kill();
    }

    #[test]
    fn test_bootstrap_without_answer() {
        let network = MemoryNetwork::new();
        let node = node(&network, 1);
        assert!(node.bootstrap(&[addr(2)]).is_empty());
        assert_eq!(node.contact_count(), 0);
        node.kill();
    }

    #[test]
    fn test_get_prefers_local_copy() {
        let network = MemoryNetwork::new();
        let storage = Arc::new(TtlStorage::default());
        let node = Node::with_transport(config(), Arc::new(network.bind(addr(1))), storage.clone());
        storage.put(NodeId::digest("key").as_bytes().to_vec(), b"value".to_vec());
        assert_eq!(node.get("key"), Some(b"value".to_vec()));

        storage.put(NodeId::digest("key").as_bytes().to_vec(), Vec::new());
        assert_eq!(node.get("key"), None);
        node.kill();
    }

    #[test]
    fn test_remote_tombstone_counts_as_miss() {
        let network = MemoryNetwork::new();
        let storage = Arc::new(TtlStorage::default());
        let one = Node::with_transport(config(), Arc::new(network.bind(addr(1))), storage.clone());
        let two = node(&network, 2);
        storage.put(NodeId::digest("key").as_bytes().to_vec(), Vec::new());
        assert_eq!(two.bootstrap(&[addr(1)]), vec![one.node_data()]);

        assert_eq!(two.get("key"), None);
        assert_eq!(two.quorum().failure_count(), 1);

        one.kill();
        two.kill();
    }

    #[test]
    fn test_set_replicates_to_peer() {
        let network = MemoryNetwork::new();
        let one = node(&network, 1);
        let two = node(&network, 2);
        assert_eq!(two.bootstrap(&[addr(1)]), vec![one.node_data()]);

        assert!(one.set("key", b"value"));
        assert_eq!(two.get("key"), Some(b"value".to_vec()));
        assert!(one.delete("key"));
        assert_eq!(two.get("key"), None);
        assert_eq!(one.get("key"), None);

        one.kill();
        two.kill();
    }

    #[test]
    fn test_refresh_keeps_values() {
        let network = MemoryNetwork::new();
        let one = node(&network, 1);
        let two = node(&network, 2);
        two.bootstrap(&[addr(1)]);
        assert!(one.set("key", b"value"));

        one.refresh();
        assert_eq!(two.get("key"), Some(b"value".to_vec()));
        assert_eq!(one.contact_count(), 1);

        one.kill();
        two.kill();
        // a killed node no longer refreshes
        one.refresh();
    }
}
