use lru::LruCache;
use std::sync::{Mutex, PoisonError};

use super::{Storage, StorageEntry, StorageIter};

/// Resident lists `t1` (seen once) and `t2` (seen at least twice), ghost lists `b1` and `b2`
/// recording keys recently evicted from them, and the target size `p` of `t1`.
struct Lists {
    p: usize,
    t1: LruCache<Vec<u8>, StorageEntry>,
    t2: LruCache<Vec<u8>, StorageEntry>,
    b1: LruCache<Vec<u8>, ()>,
    b2: LruCache<Vec<u8>, ()>,
}

/// An adaptive replacement cache holding at most `capacity` values.
///
/// The cache balances recency against frequency: hits on keys that were recently evicted from
/// the recency side grow the recency target `p`, and hits on keys evicted from the frequency side
/// shrink it.
pub struct ArcStorage {
    capacity: usize,
    lists: Mutex<Lists>,
}

impl ArcStorage {
    pub fn new(capacity: usize) -> Self {
        ArcStorage {
            capacity: capacity.max(1),
            lists: Mutex::new(Lists {
                p: 0,
                t1: LruCache::unbounded(),
                t2: LruCache::unbounded(),
                b1: LruCache::unbounded(),
                b2: LruCache::unbounded(),
            }),
        }
    }

    /// Returns the number of resident values.
    pub fn len(&self) -> usize {
        let lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        lists.t1.len() + lists.t2.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts one resident entry into the matching ghost list, then trims the ghost lists.
    fn replace(&self, lists: &mut Lists, in_b2: bool) {
        let t1_len = lists.t1.len();
        let from_t1 = t1_len > 0
            && (t1_len > lists.p || (in_b2 && t1_len == lists.p) || lists.t2.is_empty());
        if from_t1 {
            if let Some((key, _)) = lists.t1.pop_lru() {
                lists.b1.put(key, ());
            }
        } else if let Some((key, _)) = lists.t2.pop_lru() {
            lists.b2.put(key, ());
        }

        while lists.b1.len() + lists.b2.len() > self.capacity {
            if lists.b1.pop_lru().is_none() {
                lists.b2.pop_lru();
            }
        }
    }
}

impl Storage for ArcStorage {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        let mut lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = StorageEntry::new(value);

        if lists.t1.pop(&key).is_some() || lists.t2.contains(&key) {
            lists.t2.put(key, entry);
            return;
        }

        if lists.b1.contains(&key) {
            let delta = (lists.b2.len() / lists.b1.len().max(1)).max(1);
            lists.p = (lists.p + delta).min(self.capacity);
            lists.b1.pop(&key);
            if lists.t1.len() + lists.t2.len() >= self.capacity {
                self.replace(&mut lists, false);
            }
            lists.t2.put(key, entry);
        } else if lists.b2.contains(&key) {
            let delta = (lists.b1.len() / lists.b2.len().max(1)).max(1);
            lists.p = lists.p.saturating_sub(delta);
            if lists.t1.len() + lists.t2.len() >= self.capacity {
                self.replace(&mut lists, true);
            }
            lists.b2.pop(&key);
            lists.t2.put(key, entry);
        } else {
            if lists.t1.len() + lists.t2.len() >= self.capacity {
                self.replace(&mut lists, false);
            }
            lists.t1.put(key, entry);
        }
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = lists.t1.pop(key) {
            let value = entry.value.clone();
            lists.t2.put(key.to_vec(), entry);
            return Some(value);
        }
        lists.t2.get(key).map(|entry| entry.value.clone())
    }

    fn iter(&self) -> StorageIter {
        let lists = self.lists.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot: Vec<_> = lists
            .t1
            .iter()
            .chain(lists.t2.iter())
            .map(|(key, entry)| Ok((key.clone(), entry.value.clone())))
            .collect();
        Box::new(snapshot.into_iter())
    }

    fn cull(&self) {}
}
