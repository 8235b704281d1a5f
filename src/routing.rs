use num_bigint::BigUint;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::key::NodeId;
use crate::node::node_data::{NodeData, NodeDataDistancePair};
use crate::{KEY_BITS, REPLACEMENT_FACTOR, SPLIT_GRANULARITY};

/// A k-bucket in a node's routing table, covering the ids in `[lower, upper]`.
///
/// The live nodes are sorted by the time of the most recent communication with those which have
/// been most recently communicated at the end of the list. Nodes that arrive while the bucket is
/// full wait in a bounded replacement cache, oldest first.
#[derive(Clone, Debug)]
struct KBucket {
    lower: BigUint,
    upper: BigUint,
    capacity: usize,
    nodes: Vec<NodeData>,
    replacements: Vec<NodeData>,
    last_update_time: Instant,
}

impl KBucket {
    /// Constructs a new, empty `KBucket` for the ids in `[lower, upper]`.
    fn new(lower: BigUint, upper: BigUint, capacity: usize) -> Self {
        KBucket {
            lower,
            upper,
            capacity,
            nodes: Vec::new(),
            replacements: Vec::new(),
            last_update_time: Instant::now(),
        }
    }

    /// Upserts a node in the bucket. A node already present is moved to the end of the list. A new
    /// node is appended if there is room, and otherwise pushed into the replacement cache, evicting
    /// the oldest replacement when the cache overflows. Returns `true` if the node is live.
    fn add_node(&mut self, node_data: NodeData) -> bool {
        if let Some(index) = self.nodes.iter().position(|data| data.id == node_data.id) {
            self.nodes.remove(index);
            self.nodes.push(node_data);
            self.last_update_time = Instant::now();
            return true;
        }

        if self.nodes.len() < self.capacity {
            self.replacements.retain(|data| data.id != node_data.id);
            self.nodes.push(node_data);
            self.last_update_time = Instant::now();
            return true;
        }

        self.replacements.retain(|data| data.id != node_data.id);
        self.replacements.push(node_data);
        if self.replacements.len() > self.capacity * REPLACEMENT_FACTOR {
            self.replacements.remove(0);
        }
        false
    }

    /// Removes the node with `id` from both the live set and the replacement cache.
    fn remove_node(&mut self, id: &NodeId) -> Option<NodeData> {
        self.replacements.retain(|data| data.id != *id);
        let index = self.nodes.iter().position(|data| data.id == *id)?;
        Some(self.nodes.remove(index))
    }

    /// Splits `self` at the midpoint of its range into a lower and an upper half.
    fn split(&self) -> (KBucket, KBucket) {
        let midpoint = (&self.lower + &self.upper) >> 1u32;
        let mut one = KBucket::new(self.lower.clone(), midpoint.clone(), self.capacity);
        let mut two = KBucket::new(midpoint.clone() + 1u32, self.upper.clone(), self.capacity);
        one.last_update_time = self.last_update_time;
        two.last_update_time = self.last_update_time;
        for node_data in self.nodes.iter().chain(self.replacements.iter()) {
            if node_data.id.to_biguint() <= midpoint {
                one.add_node(node_data.clone());
            } else {
                two.add_node(node_data.clone());
            }
        }
        (one, two)
    }

    /// Returns `true` if `id` falls within the range of the bucket.
    fn has_in_range(&self, id: &NodeId) -> bool {
        let value = id.to_biguint();
        self.lower <= value && value <= self.upper
    }

    /// Returns `log2` of the number of ids the bucket covers.
    fn depth(&self) -> usize {
        let range = &self.upper - &self.lower + 1u32;
        range.bits() as usize - 1
    }

    /// Returns `true` if `id` is a live node of the bucket.
    fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|data| data.id == *id)
    }

    /// Returns a slice of the live nodes contained by the bucket.
    fn get_nodes(&self) -> &[NodeData] {
        self.nodes.as_slice()
    }

    /// Returns `true` if the bucket has not been updated within `interval`.
    fn is_stale(&self, interval: Duration) -> bool {
        self.last_update_time.elapsed() >= interval
    }

    /// Returns the number of live nodes in the bucket.
    fn size(&self) -> usize {
        self.nodes.len()
    }
}

/// A node's routing table.
///
/// `RoutingTable` is an ordered vector of `KBucket`s whose ranges are contiguous and together
/// cover the whole id space. It starts as a single bucket and is refined by splitting: a full
/// bucket splits if it covers the local id, or if its depth is not a multiple of
/// `SPLIT_GRANULARITY`. Buckets never merge back.
#[derive(Clone, Debug)]
pub struct RoutingTable {
    buckets: Vec<KBucket>,
    local_id: NodeId,
    ksize: usize,
}

impl RoutingTable {
    /// Constructs a new `RoutingTable` with one bucket spanning the whole id space.
    pub fn new(local_id: NodeId, ksize: usize) -> Self {
        let upper = (BigUint::from(1u32) << KEY_BITS) - 1u32;
        RoutingTable {
            buckets: vec![KBucket::new(BigUint::from(0u32), upper, ksize)],
            local_id,
            ksize,
        }
    }

    /// Returns the index of the bucket whose range contains `id`.
    fn bucket_index(&self, id: &NodeId) -> usize {
        let value = id.to_biguint();
        let index = self.buckets.partition_point(|bucket| bucket.upper < value);
        index.min(self.buckets.len() - 1)
    }

    /// Upserts a node into the routing table, splitting the owning bucket as many times as needed
    /// and allowed. Returns `true` if the node ended up in a live set, and `false` if it was parked
    /// in a replacement cache.
    pub fn add_contact(&mut self, node_data: NodeData) -> bool {
        if node_data.id == self.local_id {
            return false;
        }

        loop {
            let index = self.bucket_index(&node_data.id);
            let bucket = &mut self.buckets[index];

            // bucket has room or already holds the node
            if bucket.contains(&node_data.id) || bucket.size() < self.ksize {
                return bucket.add_node(node_data);
            }

            let depth = bucket.depth();
            let can_split = depth > 0
                && (bucket.has_in_range(&self.local_id) || depth % SPLIT_GRANULARITY != 0);

            // bucket cannot be split
            if !can_split {
                return bucket.add_node(node_data);
            }

            let (one, two) = bucket.split();
            debug!("Splitting bucket {} at depth {}", index, depth);
            self.buckets[index] = one;
            self.buckets.insert(index + 1, two);
        }
    }

    /// Removes the node with `id` from the routing table.
    pub fn remove_contact(&mut self, id: &NodeId) -> Option<NodeData> {
        let index = self.bucket_index(id);
        self.buckets[index].remove_node(id)
    }

    /// Returns `true` if no live node of the owning bucket has `id`.
    pub fn is_new_node(&self, id: &NodeId) -> bool {
        !self.buckets[self.bucket_index(id)].contains(id)
    }

    /// Returns the closest `count` live nodes to `target`, closest first. `target` itself and
    /// `exclude` are never part of the result.
    pub fn find_neighbors(
        &self,
        target: &NodeId,
        count: usize,
        exclude: Option<&NodeId>,
    ) -> Vec<NodeData> {
        let mut heap = BinaryHeap::with_capacity(count + 1);
        for node_data in self.buckets.iter().flat_map(|bucket| bucket.get_nodes()) {
            if node_data.id == *target || Some(&node_data.id) == exclude {
                continue;
            }
            heap.push(NodeDataDistancePair::new(node_data.clone(), target));
            // drop the farthest node once over capacity
            if heap.len() > count {
                heap.pop();
            }
        }
        heap.into_sorted_vec().into_iter().map(|pair| pair.0).collect()
    }

    /// Returns lookup targets for a refresh sweep: one random id inside the range of every bucket
    /// that has not been updated within `interval`.
    pub fn refresh_ids(&self, interval: Duration) -> Vec<NodeId> {
        self.buckets
            .iter()
            .filter(|bucket| bucket.is_stale(interval))
            .map(|bucket| NodeId::rand_in_range(&bucket.lower, &bucket.upper))
            .collect()
    }

    /// Returns the total number of live nodes.
    pub fn contact_count(&self) -> usize {
        self.buckets.iter().map(KBucket::size).sum()
    }

    /// Returns the number of buckets in the routing table.
    pub fn size(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;
    use std::net::SocketAddr;
    use std::time::Duration;

    use super::{KBucket, RoutingTable};
    use crate::key::NodeId;
    use crate::node::node_data::NodeData;
    use crate::{KEY_BITS, KEY_LENGTH, REPLACEMENT_FACTOR};

    fn node(id: NodeId) -> NodeData {
        NodeData::new(id, SocketAddr::from(([127, 0, 0, 1], 8468)))
    }

    fn full_range() -> (BigUint, BigUint) {
        (BigUint::from(0u32), (BigUint::from(1u32) << KEY_BITS) - 1u32)
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let (lower, upper) = full_range();
        let mut bucket = KBucket::new(lower, upper, 4);
        for _ in 0..4 * 3 {
            bucket.add_node(node(NodeId::rand()));
            assert!(bucket.size() <= 4);
        }
        assert_eq!(bucket.size(), 4);
        assert_eq!(bucket.replacements.len(), 8);
    }

    #[test]
    fn test_bucket_replacement_cache_is_bounded() {
        let (lower, upper) = full_range();
        let mut bucket = KBucket::new(lower, upper, 2);
        for _ in 0..2 + 2 * REPLACEMENT_FACTOR + 3 {
            bucket.add_node(node(NodeId::rand()));
        }
        assert_eq!(bucket.replacements.len(), 2 * REPLACEMENT_FACTOR);
    }

    #[test]
    fn test_bucket_moves_seen_node_to_end() {
        let (lower, upper) = full_range();
        let mut bucket = KBucket::new(lower, upper, 4);
        let first = node(NodeId::rand());
        let second = node(NodeId::rand());
        bucket.add_node(first.clone());
        bucket.add_node(second.clone());
        assert!(bucket.add_node(first.clone()));
        assert_eq!(bucket.get_nodes(), &[second, first]);
    }

    #[test]
    fn test_bucket_remove_clears_live_and_cached() {
        let (lower, upper) = full_range();
        let mut bucket = KBucket::new(lower, upper, 1);
        let live = node(NodeId::rand());
        let waiting = node(NodeId::rand());
        bucket.add_node(live.clone());
        assert!(!bucket.add_node(waiting.clone()));

        assert_eq!(bucket.remove_node(&live.id), Some(live));
        assert!(bucket.get_nodes().is_empty());
        assert_eq!(bucket.replacements, vec![waiting.clone()]);

        assert_eq!(bucket.remove_node(&waiting.id), None);
        assert!(bucket.replacements.is_empty());
    }

    #[test]
    fn test_bucket_split_halves_range() {
        let (lower, upper) = full_range();
        let bucket = KBucket::new(lower, upper, 20);
        assert_eq!(bucket.depth(), KEY_BITS);
        let (one, two) = bucket.split();
        assert_eq!(one.depth(), KEY_BITS - 1);
        assert_eq!(two.depth(), KEY_BITS - 1);
        assert_eq!(one.upper.clone() + 1u32, two.lower);
    }

    #[test]
    fn test_table_starts_with_one_bucket() {
        let table = RoutingTable::new(NodeId::rand(), 20);
        assert_eq!(table.size(), 1);
        assert_eq!(table.contact_count(), 0);
    }

    #[test]
    fn test_table_ignores_local_node() {
        let local_id = NodeId::rand();
        let mut table = RoutingTable::new(local_id, 20);
        assert!(!table.add_contact(node(local_id)));
        assert_eq!(table.contact_count(), 0);
    }

    #[test]
    fn test_table_buckets_stay_contiguous() {
        let mut table = RoutingTable::new(NodeId::rand(), 3);
        for _ in 0..500 {
            table.add_contact(node(NodeId::rand()));
        }
        assert!(table.size() > 1);
        let (lower, upper) = full_range();
        assert_eq!(table.buckets[0].lower, lower);
        assert_eq!(table.buckets[table.size() - 1].upper, upper);
        for pair in table.buckets.windows(2) {
            assert_eq!(pair[0].upper.clone() + 1u32, pair[1].lower);
        }
        for bucket in &table.buckets {
            assert!(bucket.size() <= 3);
            for node_data in bucket.get_nodes().iter().chain(bucket.replacements.iter()) {
                assert!(bucket.has_in_range(&node_data.id));
            }
        }
    }

    #[test]
    fn test_table_splits_toward_local_id() {
        let mut table = RoutingTable::new(NodeId::zero(), 2);
        let mut bytes = [0u8; KEY_LENGTH];
        for last in 1..=4u8 {
            bytes[KEY_LENGTH - 1] = last;
            assert!(table.add_contact(node(NodeId::from(bytes))));
        }
        assert_eq!(table.contact_count(), 4);
    }

    #[test]
    fn test_table_remove_contact() {
        let mut table = RoutingTable::new(NodeId::rand(), 20);
        let node_data = node(NodeId::rand());
        assert!(table.is_new_node(&node_data.id));
        table.add_contact(node_data.clone());
        assert!(!table.is_new_node(&node_data.id));
        assert_eq!(table.remove_contact(&node_data.id), Some(node_data.clone()));
        assert!(table.is_new_node(&node_data.id));
        assert_eq!(table.remove_contact(&node_data.id), None);
    }

    #[test]
    fn test_find_neighbors_returns_closest() {
        let mut table = RoutingTable::new(NodeId::rand(), 20);
        let mut known = Vec::new();
        for _ in 0..300 {
            let node_data = node(NodeId::rand());
            if table.add_contact(node_data.clone()) {
                known.push(node_data);
            }
        }
        known.retain(|node_data| !table.is_new_node(&node_data.id));

        let target = known[0].id;
        let neighbors = table.find_neighbors(&target, 20, None);
        assert!(neighbors.len() <= 20);
        assert!(neighbors.iter().all(|node_data| node_data.id != target));

        let worst = neighbors
            .iter()
            .map(|node_data| node_data.id.distance_rank(&target))
            .max()
            .unwrap();
        for node_data in &known {
            if node_data.id != target && !neighbors.contains(node_data) {
                assert!(worst <= node_data.id.distance_rank(&target));
            }
        }
        for pair in neighbors.windows(2) {
            assert!(pair[0].id.xor(&target) < pair[1].id.xor(&target));
        }
    }

    #[test]
    fn test_find_neighbors_excludes() {
        let mut table = RoutingTable::new(NodeId::rand(), 20);
        let first = node(NodeId::rand());
        let second = node(NodeId::rand());
        table.add_contact(first.clone());
        table.add_contact(second.clone());
        let neighbors = table.find_neighbors(&NodeId::rand(), 20, Some(&first.id));
        assert_eq!(neighbors, vec![second]);
    }

    #[test]
    fn test_refresh_ids_fall_in_stale_buckets() {
        let mut table = RoutingTable::new(NodeId::rand(), 2);
        for _ in 0..50 {
            table.add_contact(node(NodeId::rand()));
        }
        assert!(table.refresh_ids(Duration::from_secs(3600)).is_empty());
        let ids = table.refresh_ids(Duration::from_secs(0));
        assert_eq!(ids.len(), table.size());
        for (bucket, id) in table.buckets.iter().zip(ids.iter()) {
            assert!(bucket.has_in_range(id));
        }
    }
}
