//! Fixed capacity, lock-free hash map modelled after `BPF_MAP_TYPE_HASH`.
//!
//! Probes may run on every CPU at once and can't block, so the map only uses
//! atomic operations:
//!
//! - a slot is owned by the key stored in it; keys are never reset to zero, so
//!   a slot with a zero key terminates every probe sequence;
//! - each slot carries a sequence word (`generation << 2 | status`). A writer
//!   moves the slot to `BUSY` with a compare-and-swap, writes the value words
//!   and publishes it as `LIVE` with release ordering. Readers validate the
//!   sequence word before and after reading the value words;
//! - deleted slots go back to `FREE` and can be reclaimed by any key. After
//!   claiming a slot an inserter announces the claim and checks the rest of
//!   the probe sequence for the same key, backing off if it finds a lower
//!   claim or a published one, so at most one live slot exists per key.
//!
//! Every loop is bounded: probing by [`PROBE_LIMIT`], waiting on busy slots by
//! [`SPIN_LIMIT`] and retrying by [`RETRY_LIMIT`]. Running out of attempts is
//! reported as [`MapError::Busy`] and callers are expected to give up.

use std::{
    hint,
    marker::PhantomData,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering, fence},
};

use thiserror::Error;

/// Maximum number of slots visited for a single key.
pub const PROBE_LIMIT: usize = 32;
/// Maximum number of polls on a slot being written by another CPU.
pub const SPIN_LIMIT: usize = 256;
/// Maximum number of restarts of an update losing races.
pub const RETRY_LIMIT: usize = 4;
/// Largest `max_entries` a map accepts.
pub const MAX_ENTRIES_LIMIT: usize = 1 << 20;

const FREE: u64 = 0;
const BUSY: u64 = 1;
const LIVE: u64 = 2;
const STATUS_MASK: u64 = 0b11;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    #[error("key 0 is reserved")]
    InvalidKey,
    #[error("key {0:#x} already exists")]
    KeyExists(u64),
    #[error("key {0:#x} not found")]
    KeyNotFound(u64),
    #[error("map {0} is full")]
    Full(&'static str),
    #[error("map {0} is contended")]
    Busy(&'static str),
}

/// Flags of `bpf_map_update_elem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFlags {
    /// Create a new entry or update an existing one.
    Any,
    /// Create a new entry only if it does not exist.
    NoExist,
    /// Update an existing entry.
    Exist,
}

/// Values are stored as a fixed number of 64-bit words so they can be
/// published atomically.
pub trait MapValue<const W: usize>: Copy {
    fn to_words(&self) -> [u64; W];
    fn from_words(words: [u64; W]) -> Self;
}

impl MapValue<1> for u64 {
    fn to_words(&self) -> [u64; 1] {
        [*self]
    }

    fn from_words(words: [u64; 1]) -> Self {
        words[0]
    }
}

/// Result of [`BpfHashMap::get_or_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry<V> {
    /// The value passed in was inserted.
    Inserted(V),
    /// Another writer got there first, this is its value.
    Existing(V),
}

impl<V> Entry<V> {
    pub fn into_value(self) -> V {
        match self {
            Entry::Inserted(v) | Entry::Existing(v) => v,
        }
    }
}

struct Slot<const W: usize> {
    key: AtomicU64,
    seq: AtomicU64,
    words: [AtomicU64; W],
}

impl<const W: usize> Slot<W> {
    fn new() -> Self {
        Self {
            key: AtomicU64::new(0),
            seq: AtomicU64::new(FREE),
            words: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Poll the sequence word until the slot is not being written.
    fn stable_seq(&self) -> Option<u64> {
        for _ in 0..SPIN_LIMIT {
            let seq = self.seq.load(Ordering::Acquire);
            if seq & STATUS_MASK != BUSY {
                return Some(seq);
            }
            hint::spin_loop();
        }
        None
    }

    /// Try to take ownership of the slot, moving it from `seq` to busy.
    fn acquire(&self, seq: u64) -> Option<u64> {
        let busy = next_generation(seq) | BUSY;
        self.seq
            .compare_exchange(seq, busy, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| busy)
    }

    fn release(&self, busy: u64, status: u64) {
        self.seq.store((busy & !STATUS_MASK) | status, Ordering::Release);
    }

    fn load_words(&self) -> [u64; W] {
        std::array::from_fn(|i| self.words[i].load(Ordering::Relaxed))
    }

    fn store_words(&self, words: [u64; W]) {
        for (slot, word) in self.words.iter().zip(words) {
            slot.store(word, Ordering::Relaxed);
        }
    }

    /// Consistent read of the value if the slot holds `key` and is live.
    fn read(&self, key: u64) -> Result<Option<[u64; W]>, ()> {
        for _ in 0..SPIN_LIMIT {
            let before = self.seq.load(Ordering::Acquire);
            if before & STATUS_MASK == BUSY {
                hint::spin_loop();
                continue;
            }
            if before & STATUS_MASK != LIVE || self.key.load(Ordering::Acquire) != key {
                return Ok(None);
            }
            let words = self.load_words();
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return Ok(Some(words));
            }
        }
        Err(())
    }
}

fn next_generation(seq: u64) -> u64 {
    ((seq >> 2).wrapping_add(1)) << 2
}

fn hash(key: u64) -> u64 {
    let mut h = key ^ (key >> 33);
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^ (h >> 33)
}

/// Hash map with `u64` keys and values of `W` words.
pub struct BpfHashMap<V, const W: usize> {
    name: &'static str,
    slots: Box<[Slot<W>]>,
    mask: usize,
    max_entries: usize,
    len: AtomicUsize,
    _value: PhantomData<V>,
}

impl<V: MapValue<W>, const W: usize> BpfHashMap<V, W> {
    /// Create a map holding up to `max_entries` entries, capped at
    /// [`MAX_ENTRIES_LIMIT`]. The backing table is allocated once, here.
    pub fn new(name: &'static str, max_entries: usize) -> Self {
        let max_entries = max_entries.clamp(1, MAX_ENTRIES_LIMIT);
        let size = (max_entries * 2).next_power_of_two();
        Self {
            name,
            slots: (0..size).map(|_| Slot::new()).collect(),
            mask: size - 1,
            max_entries,
            len: AtomicUsize::new(0),
            _value: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn probe_sequence(&self, key: u64) -> impl Iterator<Item = (usize, &Slot<W>)> {
        let start = hash(key) as usize;
        let limit = self.slots.len().min(PROBE_LIMIT);
        (0..limit).map(move |i| {
            let pos = start.wrapping_add(i) & self.mask;
            (i, &self.slots[pos])
        })
    }

    /// Look `key` up.
    pub fn lookup(&self, key: u64) -> Result<Option<V>, MapError> {
        if key == 0 {
            return Ok(None);
        }
        for (_, slot) in self.probe_sequence(key) {
            match slot.key.load(Ordering::Acquire) {
                0 => return Ok(None),
                k if k != key => continue,
                _ => match slot.read(key) {
                    Ok(Some(words)) => return Ok(Some(V::from_words(words))),
                    Ok(None) => continue,
                    Err(()) => return Err(MapError::Busy(self.name)),
                },
            }
        }
        Ok(None)
    }

    /// Insert the value if the key is absent, otherwise return the value
    /// already present. Concurrent callers inserting the same key all observe
    /// the value of the first one.
    pub fn get_or_insert(&self, key: u64, value: V) -> Result<Entry<V>, MapError> {
        match self.upsert(key, value, UpdateFlags::NoExist)? {
            Upsert::Inserted => Ok(Entry::Inserted(value)),
            Upsert::Present(existing) => Ok(Entry::Existing(existing)),
            Upsert::Updated => unreachable!("NoExist never updates"),
        }
    }

    /// Equivalent of `bpf_map_update_elem`.
    pub fn update(&self, key: u64, value: V, flags: UpdateFlags) -> Result<(), MapError> {
        match self.upsert(key, value, flags)? {
            Upsert::Present(_) => Err(MapError::KeyExists(key)),
            Upsert::Inserted | Upsert::Updated => Ok(()),
        }
    }

    /// Atomically replace the value of an existing entry with `f(value)`.
    /// Returns the new value, or `None` if the key is absent.
    pub fn update_with<F>(&self, key: u64, f: F) -> Result<Option<V>, MapError>
    where
        F: Fn(V) -> V,
    {
        if key == 0 {
            return Ok(None);
        }
        for _ in 0..RETRY_LIMIT {
            match self.find_live(key)? {
                None => return Ok(None),
                Some((slot, seq)) => {
                    let Some(busy) = slot.acquire(seq) else {
                        continue;
                    };
                    let value = f(V::from_words(slot.load_words()));
                    slot.store_words(value.to_words());
                    slot.release(busy, LIVE);
                    return Ok(Some(value));
                }
            }
        }
        Err(MapError::Busy(self.name))
    }

    /// Remove `key`, returning its last value.
    pub fn delete(&self, key: u64) -> Result<Option<V>, MapError> {
        if key == 0 {
            return Ok(None);
        }
        for _ in 0..RETRY_LIMIT {
            match self.find_live(key)? {
                None => return Ok(None),
                Some((slot, seq)) => {
                    if let Some(value) = self.remove_slot(slot, seq) {
                        return Ok(Some(value));
                    }
                }
            }
        }
        Err(MapError::Busy(self.name))
    }

    /// Remove every entry for which `keep` returns false. Returns the number
    /// of removed entries. Entries being written concurrently are skipped.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(u64, &V) -> bool,
    {
        let mut removed = 0;
        for slot in self.slots.iter() {
            let Some(seq) = slot.stable_seq() else {
                continue;
            };
            if seq & STATUS_MASK != LIVE {
                continue;
            }
            let key = slot.key.load(Ordering::Acquire);
            let Ok(Some(words)) = slot.read(key) else {
                continue;
            };
            if !keep(key, &V::from_words(words)) && self.remove_slot(slot, seq).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// Snapshot of all live entries.
    pub fn entries(&self) -> Vec<(u64, V)> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let key = slot.key.load(Ordering::Acquire);
                match slot.read(key) {
                    Ok(Some(words)) if key != 0 => Some((key, V::from_words(words))),
                    _ => None,
                }
            })
            .collect()
    }

    fn remove_slot(&self, slot: &Slot<W>, seq: u64) -> Option<V> {
        let busy = slot.acquire(seq)?;
        let value = V::from_words(slot.load_words());
        slot.release(busy, FREE);
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(value)
    }

    /// Find the live slot holding `key` and the sequence word it was read at.
    fn find_live(&self, key: u64) -> Result<Option<(&Slot<W>, u64)>, MapError> {
        for (_, slot) in self.probe_sequence(key) {
            // The sequence word is read before the key: a successful acquire
            // at `seq` then guarantees the key didn't change in between.
            let seq = slot.stable_seq().ok_or(MapError::Busy(self.name))?;
            match slot.key.load(Ordering::Acquire) {
                0 => return Ok(None),
                k if k == key && seq & STATUS_MASK == LIVE => return Ok(Some((slot, seq))),
                _ => continue,
            }
        }
        Ok(None)
    }

    fn upsert(&self, key: u64, value: V, flags: UpdateFlags) -> Result<Upsert<V>, MapError> {
        if key == 0 {
            return Err(MapError::InvalidKey);
        }

        for _ in 0..RETRY_LIMIT {
            let mut candidate = None;
            let mut found = None;

            for (pos, slot) in self.probe_sequence(key) {
                let seq = slot.stable_seq().ok_or(MapError::Busy(self.name))?;
                let k = slot.key.load(Ordering::Acquire);
                if k == key && seq & STATUS_MASK == LIVE {
                    found = Some((slot, seq));
                    break;
                }
                if seq & STATUS_MASK == FREE && candidate.is_none() {
                    candidate = Some((pos, slot, seq));
                }
                if k == 0 {
                    break;
                }
            }

            if let Some((slot, seq)) = found {
                match flags {
                    UpdateFlags::NoExist => match slot.read(key) {
                        Ok(Some(words)) => return Ok(Upsert::Present(V::from_words(words))),
                        Ok(None) => continue,
                        Err(()) => return Err(MapError::Busy(self.name)),
                    },
                    UpdateFlags::Any | UpdateFlags::Exist => {
                        let Some(busy) = slot.acquire(seq) else {
                            continue;
                        };
                        slot.store_words(value.to_words());
                        slot.release(busy, LIVE);
                        return Ok(Upsert::Updated);
                    }
                }
            }

            if flags == UpdateFlags::Exist {
                return Err(MapError::KeyNotFound(key));
            }
            let Some((pos, slot, seq)) = candidate else {
                return Err(MapError::Full(self.name));
            };
            if self.len.fetch_add(1, Ordering::Relaxed) >= self.max_entries {
                self.len.fetch_sub(1, Ordering::Relaxed);
                return Err(MapError::Full(self.name));
            }
            let Some(busy) = slot.acquire(seq) else {
                self.len.fetch_sub(1, Ordering::Relaxed);
                continue;
            };
            slot.key.store(key, Ordering::Relaxed);
            slot.store_words(value.to_words());
            // Announce the claim. Announces are totally ordered, so of two
            // concurrent claimants of the same key at least one sees the
            // other in `won_claim`.
            slot.seq.fetch_add(0, Ordering::SeqCst);

            if !self.won_claim(key, pos) {
                slot.release(busy, FREE);
                self.len.fetch_sub(1, Ordering::Relaxed);
                continue;
            }

            slot.release(busy, LIVE);
            return Ok(Upsert::Inserted);
        }

        Err(MapError::Busy(self.name))
    }

    /// Decide whether the claim of `key` at position `pos` of its probe
    /// sequence stands. A claim loses against any lower claim and against a
    /// higher one which got published. Lower claimants wait for higher ones
    /// to settle, never the opposite, so claimants can't wait on each other.
    fn won_claim(&self, key: u64, pos: usize) -> bool {
        for (i, other) in self.probe_sequence(key) {
            if i == pos {
                continue;
            }
            let seq = other.seq.load(Ordering::SeqCst);
            if other.key.load(Ordering::Acquire) != key || seq & STATUS_MASK == FREE {
                continue;
            }
            if i < pos {
                return false;
            }
            let settled = if seq & STATUS_MASK == BUSY {
                match other.stable_seq() {
                    Some(seq) => seq,
                    None => return false,
                }
            } else {
                seq
            };
            if settled & STATUS_MASK == LIVE && other.key.load(Ordering::Acquire) == key {
                return false;
            }
        }
        true
    }
}

enum Upsert<V> {
    Inserted,
    Updated,
    Present(V),
}
