use std::cmp::Ordering;
use std::fmt::{Debug, Formatter, Result};
use std::net::SocketAddr;

use crate::key::NodeId;

/// A peer in the DHT. A `NodeData` without an address stands for a lookup target or key rather
/// than a reachable peer.
#[derive(PartialEq, Eq, Hash, Clone)]
pub struct NodeData {
    pub id: NodeId,
    pub addr: Option<SocketAddr>,
}

impl Debug for NodeData {
    fn fmt(&self, f: &mut Formatter) -> Result {
        match self.addr {
            Some(addr) => write!(f, "{} - {:?}", addr, self.id),
            None => write!(f, "?:? - {:?}", self.id),
        }
    }
}

impl NodeData {
    /// Constructs a reachable peer.
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        NodeData {
            id,
            addr: Some(addr),
        }
    }

    /// Constructs an address-less node standing for `id` as a lookup target.
    pub fn target(id: NodeId) -> Self {
        NodeData { id, addr: None }
    }

    /// Returns the distance rank between `self` and `other`.
    pub fn distance_rank(&self, other: &NodeData) -> usize {
        self.id.distance_rank(&other.id)
    }
}

/// A node paired with its distance to some target. Ordered by rank first and by the full XOR
/// value on ties, so that a smaller pair is a closer node.
#[derive(Eq, Clone, Debug)]
pub struct NodeDataDistancePair(pub NodeData, pub usize, pub NodeId);

impl NodeDataDistancePair {
    pub fn new(node_data: NodeData, target: &NodeId) -> Self {
        let rank = node_data.id.distance_rank(target);
        let xor = node_data.id.xor(target);
        NodeDataDistancePair(node_data, rank, xor)
    }
}

impl PartialEq for NodeDataDistancePair {
    fn eq(&self, other: &NodeDataDistancePair) -> bool {
        self.0.id.eq(&other.0.id)
    }
}

impl PartialOrd for NodeDataDistancePair {
    fn partial_cmp(&self, other: &NodeDataDistancePair) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeDataDistancePair {
    fn cmp(&self, other: &NodeDataDistancePair) -> Ordering {
        (self.1, &self.2).cmp(&(other.1, &other.2))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;

    use super::{NodeData, NodeDataDistancePair};
    use crate::key::NodeId;
    use crate::KEY_LENGTH;

    fn id(last: u8) -> NodeId {
        let mut bytes = [0u8; KEY_LENGTH];
        bytes[KEY_LENGTH - 1] = last;
        NodeId::from(bytes)
    }

    #[test]
    fn test_pairs_order_by_closeness() {
        let target = id(0);
        let mut heap = BinaryHeap::new();
        for last in &[7u8, 1, 4, 6] {
            heap.push(NodeDataDistancePair::new(NodeData::target(id(*last)), &target));
        }
        // 4, 6 and 7 share a rank; ties fall back to the XOR value.
        let order: Vec<NodeId> = heap.into_sorted_vec().into_iter().map(|pair| pair.0.id).collect();
        assert_eq!(order, vec![id(1), id(4), id(6), id(7)]);
    }

    #[test]
    fn test_debug_without_address() {
        let node = NodeData::target(NodeId::zero());
        assert!(format!("{:?}", node).starts_with("?:? - "));
    }
}
