use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::{Storage, StorageEntry, StorageIter};
use crate::error::Error;
use crate::KEY_EXPIRATION;

#[derive(Default)]
struct Inner {
    data: HashMap<Vec<u8>, StorageEntry>,
    publish_times: BTreeMap<Instant, Vec<Vec<u8>>>,
}

/// A store that forgets every entry `ttl` after it was last written.
pub struct TtlStorage {
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl Default for TtlStorage {
    fn default() -> Self {
        TtlStorage::new(Duration::from_secs(KEY_EXPIRATION))
    }
}

impl TtlStorage {
    pub fn new(ttl: Duration) -> Self {
        TtlStorage {
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn is_expired(&self, entry: &StorageEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.timestamp) > self.ttl
    }
}

impl Storage for TtlStorage {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = StorageEntry::new(value);
        inner
            .publish_times
            .entry(entry.timestamp)
            .or_insert_with(Vec::new)
            .push(key.clone());
        inner.data.insert(key, entry);
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = self.is_expired(inner.data.get(key)?, Instant::now());
        if expired {
            debug!("Evicting expired key {:02X?}", key);
            inner.data.remove(key);
            return None;
        }
        inner.data.get(key).map(|entry| entry.value.clone())
    }

    fn iter(&self) -> StorageIter {
        let now = Instant::now();
        let snapshot: Vec<(Vec<u8>, StorageEntry)> = {
            let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner
                .data
                .iter()
                .filter(|(_, entry)| !self.is_expired(entry, now))
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect()
        };
        let ttl = self.ttl;
        Box::new(snapshot.into_iter().map(move |(key, entry)| {
            if entry.timestamp.elapsed() > ttl {
                Err(Error::ExpiredEntry)
            } else {
                Ok((key, entry.value))
            }
        }))
    }

    fn cull(&self) {
        let now = Instant::now();
        let cutoff = match now.checked_sub(self.ttl) {
            Some(cutoff) => cutoff,
            None => return,
        };
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut expired_times_map = inner.publish_times.split_off(&cutoff);
        mem::swap(&mut inner.publish_times, &mut expired_times_map);

        for key in expired_times_map.into_values().flatten() {
            // the key may have been rewritten since this publish time
            let expired = match inner.data.get(&key) {
                Some(entry) => self.is_expired(entry, now),
                None => false,
            };
            if expired {
                debug!("Removed {:02X?}", key);
                inner.data.remove(&key);
            }
        }
    }
}
