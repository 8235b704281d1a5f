use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use crate::key::NodeId;
use crate::node::node_data::{NodeData, NodeDataDistancePair};

#[derive(Default)]
struct HeapState {
    /// Candidates sorted closest first.
    nodes: Vec<NodeDataDistancePair>,
    contacted: HashSet<NodeId>,
    removed: HashSet<NodeId>,
}

/// The closeness structure of one crawl: every candidate seen so far, ordered by distance to the
/// target, of which only the closest `max_size` are considered by the crawl.
pub struct NodeHeap {
    target: NodeId,
    max_size: usize,
    state: Mutex<HeapState>,
}

impl NodeHeap {
    pub fn new(target: NodeId, max_size: usize) -> Self {
        NodeHeap {
            target,
            max_size,
            state: Mutex::new(HeapState::default()),
        }
    }

    /// Adds candidates, ignoring nodes already present, nodes that were removed, and nodes
    /// without an address.
    pub fn push<I>(&self, nodes: I)
    where
        I: IntoIterator<Item = NodeData>,
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for node_data in nodes {
            if node_data.addr.is_none() || state.removed.contains(&node_data.id) {
                continue;
            }
            let pair = NodeDataDistancePair::new(node_data, &self.target);
            if state.nodes.contains(&pair) {
                continue;
            }
            let index = state.nodes.partition_point(|other| other < &pair);
            state.nodes.insert(index, pair);
        }
    }

    /// Drops a candidate for good.
    pub fn remove(&self, id: &NodeId) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.nodes.retain(|pair| pair.0.id != *id);
        state.removed.insert(*id);
    }

    pub fn mark_contacted(&self, id: &NodeId) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contacted
            .insert(*id);
    }

    /// Returns the closest `max_size` candidates, closest first.
    pub fn closest(&self) -> Vec<NodeData> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .nodes
            .iter()
            .take(self.max_size)
            .map(|pair| pair.0.clone())
            .collect()
    }

    pub fn closest_ids(&self) -> Vec<NodeId> {
        self.closest().into_iter().map(|node_data| node_data.id).collect()
    }

    /// Returns the closest `max_size` candidates that were not contacted yet, closest first.
    pub fn uncontacted(&self) -> Vec<NodeData> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .nodes
            .iter()
            .take(self.max_size)
            .filter(|pair| !state.contacted.contains(&pair.0.id))
            .map(|pair| pair.0.clone())
            .collect()
    }

    pub fn have_contacted_all(&self) -> bool {
        self.uncontacted().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::NodeHeap;
    use crate::key::NodeId;
    use crate::node::node_data::NodeData;

    fn node(last: u8) -> NodeData {
        let mut id = [0u8; 20];
        id[19] = last;
        NodeData::new(NodeId::from(id), SocketAddr::from(([127, 0, 0, 1], u16::from(last))))
    }

    #[test]
    fn test_closest_are_sorted_and_bounded() {
        let heap = NodeHeap::new(NodeId::zero(), 3);
        heap.push(vec![node(9), node(2), node(7), node(1), node(4)]);
        assert_eq!(heap.state.lock().unwrap().nodes.len(), 5);
        let ids: Vec<_> = heap.closest().into_iter().map(|node_data| node_data.id).collect();
        assert_eq!(ids, vec![node(1).id, node(2).id, node(4).id]);
    }

    #[test]
    fn test_duplicates_and_targets_are_ignored() {
        let heap = NodeHeap::new(NodeId::zero(), 5);
        heap.push(vec![node(1), node(1), NodeData::target(NodeId::rand())]);
        assert_eq!(heap.closest().len(), 1);
    }

    #[test]
    fn test_contacted_tracking() {
        let heap = NodeHeap::new(NodeId::zero(), 2);
        heap.push(vec![node(1), node(2), node(3)]);
        assert!(!heap.have_contacted_all());
        heap.mark_contacted(&node(1).id);
        assert_eq!(heap.uncontacted(), vec![node(2)]);
        heap.mark_contacted(&node(2).id);
        // node 3 is outside the closest two
        assert!(heap.have_contacted_all());
    }

    #[test]
    fn test_removed_node_stays_out() {
        let heap = NodeHeap::new(NodeId::zero(), 2);
        heap.push(vec![node(1), node(2), node(3)]);
        heap.remove(&node(1).id);
        assert_eq!(heap.closest(), vec![node(2), node(3)]);
        heap.push(vec![node(1)]);
        assert_eq!(heap.closest(), vec![node(2), node(3)]);
    }
}
