//! Tables shared by every invocation of the tracking hook.
//!
//! Both are bounded [`BpfHashMap`]s: a failed operation is logged and turned
//! into "not found", the hook then skips the event.

use probe_common::maps::{BpfHashMap, Entry, MapError, MapValue, UpdateFlags};

/// Tracking metadata of a packet lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingInfo {
    /// First time the lineage was seen.
    pub timestamp: u64,
    /// Last time the lineage was seen, only used for garbage collection.
    pub last_seen: u64,
    /// Head of the buffer when the lineage was first seen.
    pub orig_head: u64,
}

impl TrackingInfo {
    pub fn new(orig_head: u64, now: u64) -> Self {
        Self {
            timestamp: now,
            last_seen: now,
            orig_head,
        }
    }
}

impl MapValue<3> for TrackingInfo {
    fn to_words(&self) -> [u64; 3] {
        [self.timestamp, self.last_seen, self.orig_head]
    }

    fn from_words(words: [u64; 3]) -> Self {
        Self {
            timestamp: words[0],
            last_seen: words[1],
            orig_head: words[2],
        }
    }
}

/// Buffer seen on a given kernel stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackEntry {
    /// Identity store key of the buffer.
    pub key: u64,
    /// Address of the `struct sk_buff`.
    pub skb: u64,
    pub last_seen: u64,
}

impl MapValue<3> for StackEntry {
    fn to_words(&self) -> [u64; 3] {
        [self.key, self.skb, self.last_seen]
    }

    fn from_words(words: [u64; 3]) -> Self {
        Self {
            key: words[0],
            skb: words[1],
            last_seen: words[2],
        }
    }
}

fn report<T>(map: &str, result: Result<T, MapError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err @ MapError::Full(_)) => {
            log::warn!("{map}: {err}");
            None
        }
        Err(err) => {
            log::trace!("{map}: {err}");
            None
        }
    }
}

/// Maps buffer references to their [`TrackingInfo`].
pub struct IdentityStore {
    map: BpfHashMap<TrackingInfo, 3>,
}

impl IdentityStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: BpfHashMap::new("tracking_map", capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.map.max_entries()
    }

    pub fn lookup(&self, key: u64) -> Option<TrackingInfo> {
        report(self.map.name(), self.map.lookup(key)).flatten()
    }

    /// Insert `info` unless `key` is already known. Either way the entry
    /// which ends up in the store is returned.
    pub fn get_or_create(&self, key: u64, info: TrackingInfo) -> Option<Entry<TrackingInfo>> {
        report(self.map.name(), self.map.get_or_insert(key, info))
    }

    /// Index `info` under an additional key, overwriting what was there.
    pub fn alias(&self, key: u64, info: TrackingInfo) -> bool {
        report(self.map.name(), self.map.update(key, info, UpdateFlags::Any)).is_some()
    }

    /// Refresh the last seen time of an entry, returning the updated entry.
    pub fn touch(&self, key: u64, now: u64) -> Option<TrackingInfo> {
        report(
            self.map.name(),
            self.map.update_with(key, |info| TrackingInfo {
                last_seen: info.last_seen.max(now),
                ..info
            }),
        )
        .flatten()
    }

    pub fn remove(&self, key: u64) -> Option<TrackingInfo> {
        report(self.map.name(), self.map.delete(key)).flatten()
    }

    /// Remove entries last seen before `limit`.
    pub fn evict_older_than(&self, limit: u64) -> usize {
        self.map.retain(|_, info| info.last_seen >= limit)
    }

    pub fn entries(&self) -> Vec<(u64, TrackingInfo)> {
        self.map.entries()
    }
}

/// Maps kernel stack bases to the last buffer seen on them.
pub struct StackStore {
    map: BpfHashMap<StackEntry, 3>,
}

impl StackStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: BpfHashMap::new("stack_map", capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, base: u64) -> Option<StackEntry> {
        report(self.map.name(), self.map.lookup(base)).flatten()
    }

    pub fn record(&self, base: u64, entry: StackEntry) -> bool {
        report(self.map.name(), self.map.update(base, entry, UpdateFlags::Any)).is_some()
    }

    pub fn evict_older_than(&self, limit: u64) -> usize {
        self.map.retain(|_, entry| entry.last_seen >= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_entry_is_kept() {
        let store = IdentityStore::new(16);
        let first = TrackingInfo::new(0x1000, 10);
        assert_eq!(
            store.get_or_create(0x1000, first),
            Some(Entry::Inserted(first))
        );
        assert_eq!(
            store.get_or_create(0x1000, TrackingInfo::new(0x2000, 20)),
            Some(Entry::Existing(first))
        );
        assert_eq!(store.lookup(0x1000), Some(first));
    }

    #[test]
    fn touch_only_moves_forward() {
        let store = IdentityStore::new(16);
        store.get_or_create(0x1000, TrackingInfo::new(0x1000, 10));
        assert_eq!(store.touch(0x1000, 50).map(|i| i.last_seen), Some(50));
        assert_eq!(store.touch(0x1000, 30).map(|i| i.last_seen), Some(50));
        assert_eq!(store.touch(0x2000, 30), None);
        assert_eq!(store.lookup(0x1000).map(|i| i.timestamp), Some(10));
    }

    #[test]
    fn full_store_is_not_found() {
        let store = IdentityStore::new(1);
        assert!(store.get_or_create(1, TrackingInfo::new(1, 1)).is_some());
        assert_eq!(store.get_or_create(2, TrackingInfo::new(2, 1)), None);
        assert_eq!(store.get_or_create(0, TrackingInfo::new(2, 1)), None);
    }

    #[test]
    fn eviction() {
        let store = IdentityStore::new(16);
        let stacks = StackStore::new(16);
        for key in 1..=4 {
            store.get_or_create(key, TrackingInfo::new(key, key * 10));
            stacks.record(
                key << 14,
                StackEntry {
                    key,
                    skb: key,
                    last_seen: key * 10,
                },
            );
        }
        assert_eq!(store.evict_older_than(25), 2);
        assert_eq!(stacks.evict_older_than(25), 2);
        assert_eq!(store.len(), 2);
        assert_eq!(stacks.len(), 2);
        assert!(stacks.get(1 << 14).is_none());
        assert!(stacks.get(3 << 14).is_some());
    }
}
