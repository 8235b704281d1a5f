//! Iterative lookups.
//!
//! A crawl repeatedly probes the closest uncontacted candidates it knows of for a target, folding
//! the nodes they return into its heap, until the closest candidates have all been contacted. Each
//! round waits for all of its probes before the next one is chosen.

use std::sync::mpsc::channel;
use std::thread;

use crate::key::NodeId;
use crate::node::heap::NodeHeap;
use crate::node::node_data::NodeData;
use crate::node::rpc::Rpc;
use crate::protocol::FindValueResult;
use crate::MAX_CRAWL_ROUNDS;

/// Calls `call` against every node in `nodes` on its own thread and returns every outcome once
/// all calls have finished.
pub fn call_all<T, F>(rpc: &Rpc, nodes: Vec<NodeData>, call: F) -> Vec<(NodeData, T)>
where
    T: Send + 'static,
    F: Fn(&Rpc, &NodeData) -> T + Clone + Send + 'static,
{
    let (tx, rx) = channel();
    for node_data in nodes {
        let rpc = rpc.clone();
        let call = call.clone();
        let tx = tx.clone();
        thread::spawn(move || {
            let result = call(&rpc, &node_data);
            if tx.send((node_data, result)).is_err() {
                warn!("Receiver closed channel before rpc returned.");
            }
        });
    }
    drop(tx);
    rx.iter().collect()
}

/// State shared by both lookup variants.
struct SpiderCrawl {
    rpc: Rpc,
    target: NodeId,
    nearest: NodeHeap,
    alpha: usize,
    ksize: usize,
    last_ids_crawled: Vec<NodeId>,
}

impl SpiderCrawl {
    fn new(rpc: Rpc, target: NodeId, peers: Vec<NodeData>, ksize: usize, alpha: usize) -> Self {
        let nearest = NodeHeap::new(target, ksize);
        nearest.push(peers);
        SpiderCrawl {
            rpc,
            target,
            nearest,
            alpha,
            ksize,
            last_ids_crawled: Vec::new(),
        }
    }

    /// Picks and marks the probes of the next round. A frontier that did not change since the
    /// previous round is probed in full.
    fn next_probes(&mut self) -> Vec<NodeData> {
        let ids = self.nearest.closest_ids();
        let count = if ids == self.last_ids_crawled {
            self.ksize
        } else {
            self.alpha
        };
        self.last_ids_crawled = ids;

        let probes: Vec<NodeData> = self.nearest.uncontacted().into_iter().take(count).collect();
        for node_data in &probes {
            self.nearest.mark_contacted(&node_data.id);
        }
        probes
    }

    /// Adds returned nodes to `heap`, leaving out the local node.
    fn fold(&self, heap: &NodeHeap, nodes: Vec<NodeData>) {
        let local_id = self.rpc.node_data().id;
        heap.push(nodes.into_iter().filter(|node_data| node_data.id != local_id));
    }
}

/// Finds the closest live nodes to a target.
pub struct NodeCrawl {
    crawl: SpiderCrawl,
}

impl NodeCrawl {
    pub fn new(rpc: Rpc, target: NodeId, peers: Vec<NodeData>, ksize: usize, alpha: usize) -> Self {
        NodeCrawl {
            crawl: SpiderCrawl::new(rpc, target, peers, ksize, alpha),
        }
    }

    /// Runs the crawl and returns the closest nodes that answered, closest first.
    pub fn find(mut self) -> Vec<NodeData> {
        let target = self.crawl.target;
        for round in 0..MAX_CRAWL_ROUNDS {
            let probes = self.crawl.next_probes();
            if probes.is_empty() {
                break;
            }
            debug!("Crawling for {:?}, round {} with {} probes", target, round, probes.len());

            let results = call_all(&self.crawl.rpc, probes, move |rpc, node_data| {
                rpc.find_node(node_data, &target)
            });
            for (node_data, result) in results {
                match result {
                    Some(nodes) => self.crawl.fold(&self.crawl.nearest, nodes),
                    None => self.crawl.nearest.remove(&node_data.id),
                }
            }

            if self.crawl.nearest.have_contacted_all() {
                return self.crawl.nearest.closest();
            }
        }
        if !self.crawl.nearest.have_contacted_all() {
            warn!("Crawl for {:?} stopped after {} rounds", target, MAX_CRAWL_ROUNDS);
        }
        self.crawl.nearest.closest()
    }
}

/// Finds the value stored under a key.
pub struct ValueCrawl {
    crawl: SpiderCrawl,
    nearest_without_value: NodeHeap,
}

impl ValueCrawl {
    pub fn new(rpc: Rpc, key: NodeId, peers: Vec<NodeData>, ksize: usize, alpha: usize) -> Self {
        ValueCrawl {
            crawl: SpiderCrawl::new(rpc, key, peers, ksize, alpha),
            nearest_without_value: NodeHeap::new(key, 1),
        }
    }

    /// Runs the crawl and returns the value found, if any.
    pub fn find(mut self) -> Option<Vec<u8>> {
        let key = self.crawl.target;
        for round in 0..MAX_CRAWL_ROUNDS {
            let probes = self.crawl.next_probes();
            if probes.is_empty() {
                return None;
            }
            debug!("Crawling for value {:?}, round {} with {} probes", key, round, probes.len());

            let results = call_all(&self.crawl.rpc, probes, move |rpc, node_data| {
                rpc.find_value(node_data, &key)
            });
            let mut found = Vec::new();
            for (node_data, result) in results {
                match result {
                    Some(FindValueResult::Found(value)) => found.push(value),
                    Some(FindValueResult::Closest(nodes)) => {
                        self.nearest_without_value.push(Some(node_data));
                        self.crawl.fold(&self.crawl.nearest, nodes);
                    },
                    None => self.crawl.nearest.remove(&node_data.id),
                }
            }

            if !found.is_empty() {
                return Some(self.handle_found_values(found));
            }
            if self.crawl.nearest.have_contacted_all() {
                return None;
            }
        }
        warn!("Crawl for value {:?} stopped after {} rounds", key, MAX_CRAWL_ROUNDS);
        None
    }

    /// Picks the most common value, the first seen on ties, and stores it on the closest node
    /// that answered without it.
    fn handle_found_values(&self, found: Vec<Vec<u8>>) -> Vec<u8> {
        let mut counts: Vec<(Vec<u8>, usize)> = Vec::new();
        for value in found {
            match counts.iter_mut().find(|(seen, _)| *seen == value) {
                Some((_, count)) => *count += 1,
                None => counts.push((value, 1)),
            }
        }
        if counts.len() > 1 {
            warn!("Got multiple values for key {:?}", self.crawl.target);
        }

        let mut winner = 0;
        for (index, (_, count)) in counts.iter().enumerate() {
            if *count > counts[winner].1 {
                winner = index;
            }
        }
        let value = counts.swap_remove(winner).0;

        if let Some(peer) = self.nearest_without_value.closest().into_iter().next() {
            let rpc = self.crawl.rpc.clone();
            let key = self.crawl.target.as_bytes().to_vec();
            let repaired = value.clone();
            thread::spawn(move || {
                rpc.store(&peer, key, repaired);
            });
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::{call_all, NodeCrawl, ValueCrawl};
    use crate::error::Result;
    use crate::key::NodeId;
    use crate::node::node_data::NodeData;
    use crate::node::rpc::Rpc;
    use crate::protocol::{FindValueResult, Request, RequestPayload, Response, ResponsePayload};
    use crate::storage::TtlStorage;
    use crate::transport::{MemoryNetwork, RequestHandler, Transport};
    use crate::MAX_CRAWL_ROUNDS;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Answers every lookup with one node closer to the zero id than any handed out before.
    #[derive(Default)]
    struct EndlessTransport {
        lookups: AtomicU64,
    }

    impl EndlessTransport {
        fn closer_node(&self) -> NodeData {
            let count = self.lookups.fetch_add(1, Ordering::SeqCst);
            let mut bytes = [0u8; 20];
            bytes[12..].copy_from_slice(&(u64::MAX - count).to_be_bytes());
            NodeData::new(NodeId::from(bytes), addr(2))
        }
    }

    impl Transport for EndlessTransport {
        fn local_addr(&self) -> SocketAddr {
            addr(1)
        }

        fn send(&self, request: &Request, _: SocketAddr, _: Duration) -> Result<Response> {
            let payload = match request.payload {
                RequestPayload::Ping => ResponsePayload::Pong(NodeId::rand()),
                RequestPayload::Store(..) => ResponsePayload::Stored(true),
                RequestPayload::FindNode(_) => ResponsePayload::Nodes(vec![self.closer_node()]),
                RequestPayload::FindValue(_) => {
                    ResponsePayload::Value(FindValueResult::Closest(vec![self.closer_node()]))
                },
            };
            Ok(Response {
                id: request.id,
                payload,
            })
        }

        fn set_request_handler(&self, _: RequestHandler) {}

        fn send_response(&self, _: &Response, _: SocketAddr) -> Result<()> {
            Ok(())
        }

        fn close(&self) {}
    }

    fn endless() -> (Rpc, Arc<EndlessTransport>, Vec<NodeData>) {
        let transport = Arc::new(EndlessTransport::default());
        let rpc = Rpc::new(
            NodeData::new(NodeId::rand(), addr(1)),
            Arc::new(TtlStorage::default()),
            transport.clone(),
            20,
            Duration::from_millis(200),
        );
        let peers = vec![NodeData::new(NodeId::from([0xff; 20]), addr(3))];
        (rpc, transport, peers)
    }

    /// Starts `count` nodes where node `i` only knows node `i + 1`.
    fn chain(network: &MemoryNetwork, count: u16) -> Vec<Rpc> {
        let rpcs: Vec<Rpc> = (1..=count)
            .map(|port| {
                let transport: Arc<dyn Transport> = Arc::new(network.bind(addr(port)));
                let rpc = Rpc::new(
                    NodeData::new(NodeId::rand(), addr(port)),
                    Arc::new(TtlStorage::default()),
                    transport,
                    20,
                    Duration::from_millis(200),
                );
                rpc.start();
                rpc
            })
            .collect();
        for pair in rpcs.windows(2) {
            assert!(pair[0].ping(pair[1].node_data()).is_some());
        }
        rpcs
    }

    fn close(rpcs: &[Rpc]) {
        for rpc in rpcs {
            rpc.close();
        }
    }

    #[test]
    fn test_call_all_collects_every_outcome() {
        let network = MemoryNetwork::new();
        let rpcs = chain(&network, 3);
        let peers = vec![rpcs[1].node_data().clone(), rpcs[2].node_data().clone()];
        let results = call_all(&rpcs[0], peers, |rpc, node_data| rpc.ping(node_data));
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(node_data, id)| *id == Some(node_data.id)));
        close(&rpcs);
    }

    #[test]
    fn test_node_crawl_walks_the_chain() {
        let network = MemoryNetwork::new();
        let rpcs = chain(&network, 6);
        let target = NodeId::rand();
        let nodes = NodeCrawl::new(
            rpcs[0].clone(),
            target,
            vec![rpcs[1].node_data().clone()],
            20,
            3,
        )
        .find();

        assert_eq!(nodes.len(), 5);
        for rpc in &rpcs[1..] {
            assert!(nodes.contains(rpc.node_data()));
        }
        for pair in nodes.windows(2) {
            assert!(pair[0].id.xor_distance(&target) < pair[1].id.xor_distance(&target));
        }
        close(&rpcs);
    }

    #[test]
    fn test_node_crawl_drops_dead_nodes() {
        let network = MemoryNetwork::new();
        let rpcs = chain(&network, 4);
        rpcs[3].close();
        let target = NodeId::rand();
        let nodes = NodeCrawl::new(
            rpcs[0].clone(),
            target,
            vec![rpcs[1].node_data().clone()],
            20,
            3,
        )
        .find();

        assert_eq!(nodes.len(), 2);
        assert!(!nodes.contains(rpcs[3].node_data()));
        close(&rpcs);
    }

    #[test]
    fn test_value_crawl_finds_and_repairs() {
        let network = MemoryNetwork::new();
        let rpcs = chain(&network, 4);
        let key = NodeId::digest("key");
        rpcs[3].storage().put(key.as_bytes().to_vec(), b"value".to_vec());

        let value = ValueCrawl::new(
            rpcs[0].clone(),
            key,
            vec![rpcs[1].node_data().clone()],
            20,
            3,
        )
        .find();
        assert_eq!(value, Some(b"value".to_vec()));

        // the closest node that answered without the value gets a copy
        let mut repaired = false;
        for _ in 0..50 {
            repaired = rpcs[1..3]
                .iter()
                .any(|rpc| rpc.storage().get(key.as_bytes()).is_some());
            if repaired {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(repaired);
        close(&rpcs);
    }

    #[test]
    fn test_value_crawl_misses() {
        let network = MemoryNetwork::new();
        let rpcs = chain(&network, 3);
        let value = ValueCrawl::new(
            rpcs[0].clone(),
            NodeId::digest("missing"),
            vec![rpcs[1].node_data().clone()],
            20,
            3,
        )
        .find();
        assert_eq!(value, None);
        close(&rpcs);
    }

    #[test]
    fn test_node_crawl_stops_at_round_ceiling() {
        let (rpc, transport, peers) = endless();
        let nodes = NodeCrawl::new(rpc, NodeId::zero(), peers, 20, 1).find();

        // a single lookup per round since the frontier changes every round
        assert_eq!(transport.lookups.load(Ordering::SeqCst), MAX_CRAWL_ROUNDS as u64);
        assert_eq!(nodes.len(), 20);
    }

    #[test]
    fn test_value_crawl_stops_at_round_ceiling() {
        let (rpc, transport, peers) = endless();
        let value = ValueCrawl::new(rpc, NodeId::zero(), peers, 20, 1).find();

        assert_eq!(value, None);
        assert_eq!(transport.lookups.load(Ordering::SeqCst), MAX_CRAWL_ROUNDS as u64);
    }
}
