use std::{
    collections::{HashMap, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use parking_lot::{Mutex, MutexGuard};
use redq_common::MAX_MAP_ENTRIES;

pub const TABLE_SHARDS: usize = 64;

const NIL: usize = usize::MAX;
const EMPTY_SHARD: u64 = u64::MAX;

/// Shared view of one entry's byte counter. Adds through a handle are atomic
/// and never lost, but once the entry is evicted they no longer reach the
/// table.
#[derive(Clone, Debug)]
pub struct CounterHandle {
    bytes: Arc<AtomicU64>,
}

impl CounterHandle {
    pub fn get(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Returns the value before the add.
    pub fn add(&self, delta: u64) -> u64 {
        self.bytes.fetch_add(delta, Ordering::Relaxed)
    }
}

struct Slot<K> {
    key: K,
    bytes: Arc<AtomicU64>,
    stamp: u64,
    prev: usize,
    next: usize,
}

/// One lock domain: a key index over a slot arena threaded into a recency
/// list, most recent at `head`.
struct Shard<K> {
    index: HashMap<K, usize>,
    slots: Vec<Slot<K>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K: Copy + Eq + Hash> Shard<K> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            head: NIL,
            tail: NIL,
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn tail_stamp(&self) -> u64 {
        match self.tail {
            NIL => EMPTY_SHARD,
            tail => self.slots[tail].stamp,
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            NIL => self.head = next,
            prev => self.slots[prev].next = next,
        }
        match next {
            NIL => self.tail = prev,
            next => self.slots[next].prev = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = NIL;
        self.slots[idx].next = self.head;
        match self.head {
            NIL => self.tail = idx,
            head => self.slots[head].prev = idx,
        }
        self.head = idx;
    }

    fn touch(&mut self, idx: usize, stamp: u64) {
        self.slots[idx].stamp = stamp;
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    /// Adds to an existing entry and marks it most recent.
    fn bump(&mut self, key: &K, delta: u64, stamp: u64) -> bool {
        let Some(&idx) = self.index.get(key) else {
            return false;
        };
        self.slots[idx].bytes.fetch_add(delta, Ordering::Relaxed);
        self.touch(idx, stamp);
        true
    }

    fn insert(&mut self, key: K, bytes: u64, stamp: u64) {
        let idx = match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx];
                slot.key = key;
                slot.stamp = stamp;
                // A handle may still point at the old counter.
                if Arc::strong_count(&slot.bytes) == 1 {
                    slot.bytes.store(bytes, Ordering::Relaxed);
                } else {
                    slot.bytes = Arc::new(AtomicU64::new(bytes));
                }
                idx
            }
            None => {
                self.slots.push(Slot {
                    key,
                    bytes: Arc::new(AtomicU64::new(bytes)),
                    stamp,
                    prev: NIL,
                    next: NIL,
                });
                self.slots.len() - 1
            }
        };
        self.push_front(idx);
        self.index.insert(key, idx);
    }

    fn release(&mut self, idx: usize) -> (K, u64) {
        self.unlink(idx);
        let slot = &self.slots[idx];
        let key = slot.key;
        self.index.remove(&key);
        self.free.push(idx);
        (key, slot.bytes.load(Ordering::Relaxed))
    }

    fn pop_lru(&mut self) -> Option<(K, u64)> {
        match self.tail {
            NIL => None,
            tail => Some(self.release(tail)),
        }
    }

    fn remove(&mut self, key: &K) -> Option<u64> {
        let idx = *self.index.get(key)?;
        Some(self.release(idx).1)
    }

    fn entries(&self) -> impl Iterator<Item = (K, u64)> + '_ {
        self.index
            .iter()
            .map(|(key, &idx)| (*key, self.slots[idx].bytes.load(Ordering::Relaxed)))
    }

    /// Empties the shard but keeps every slot, and its counter, for reuse.
    fn clear(&mut self) {
        self.index.clear();
        self.free.clear();
        self.free.extend(0..self.slots.len());
        self.head = NIL;
        self.tail = NIL;
    }
}

/// Fixed-capacity byte counter table with least-recently-used eviction.
///
/// Keys are spread over [`TABLE_SHARDS`] independently locked shards. Each
/// shard keeps an exact recency list and publishes the stamp of its oldest
/// entry, so the globally oldest entry is found by scanning one stamp per
/// shard rather than every entry. Occupancy is reserved atomically and never
/// exceeds the capacity; an insert into a full table swaps out the oldest
/// entry instead.
pub struct UsageTable<K> {
    shards: Vec<Mutex<Shard<K>>>,
    oldest: Vec<AtomicU64>,
    clock: AtomicU64,
    len: AtomicUsize,
    capacity: usize,
}

impl<K: Copy + Eq + Hash> UsageTable<K> {
    pub fn new() -> Self {
        Self::with_capacity(MAX_MAP_ENTRIES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_shards(capacity, TABLE_SHARDS)
    }

    pub fn with_shards(capacity: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let capacity = capacity.max(1);
        let per_shard = capacity.div_ceil(shards);
        Self {
            shards: (0..shards)
                .map(|_| Mutex::new(Shard::with_capacity(per_shard)))
                .collect(),
            oldest: (0..shards).map(|_| AtomicU64::new(EMPTY_SHARD)).collect(),
            clock: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard_index(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn publish(&self, idx: usize, shard: &Shard<K>) {
        self.oldest[idx].store(shard.tail_stamp(), Ordering::Release);
    }

    fn try_reserve(&self) -> bool {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < self.capacity).then_some(len + 1)
            })
            .is_ok()
    }

    /// Shard holding the least recently touched entry, if any shard is non-empty.
    fn oldest_shard(&self) -> Option<usize> {
        self.oldest
            .iter()
            .enumerate()
            .map(|(idx, stamp)| (stamp.load(Ordering::Acquire), idx))
            .filter(|(stamp, _)| *stamp != EMPTY_SHARD)
            .min()
            .map(|(_, idx)| idx)
    }

    /// Locks `own` and, when different, `other`, always in ascending index
    /// order so that two evicting writers can never deadlock.
    fn lock_pair(
        &self,
        own: usize,
        other: usize,
    ) -> (MutexGuard<'_, Shard<K>>, Option<MutexGuard<'_, Shard<K>>>) {
        if own == other {
            (self.shards[own].lock(), None)
        } else if own < other {
            let own_guard = self.shards[own].lock();
            let other_guard = self.shards[other].lock();
            (own_guard, Some(other_guard))
        } else {
            let other_guard = self.shards[other].lock();
            let own_guard = self.shards[own].lock();
            (own_guard, Some(other_guard))
        }
    }

    /// Returns a handle to the counter for `key` and marks it most recent.
    pub fn lookup(&self, key: &K) -> Option<CounterHandle> {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].lock();
        let slot = *shard.index.get(key)?;
        shard.touch(slot, self.tick());
        self.publish(idx, &shard);
        Some(CounterHandle {
            bytes: Arc::clone(&shard.slots[slot].bytes),
        })
    }

    /// Reads a counter without affecting recency.
    pub fn peek(&self, key: &K) -> Option<u64> {
        let shard = self.shards[self.shard_index(key)].lock();
        let idx = *shard.index.get(key)?;
        Some(shard.slots[idx].bytes.load(Ordering::Relaxed))
    }

    /// Adds `delta` to the counter for `key`, creating it with `delta` as its
    /// first value when absent and evicting the least recently used entry if
    /// the table is full.
    pub fn increment_or_insert(&self, key: K, delta: u64) {
        let idx = self.shard_index(&key);
        {
            let mut shard = self.shards[idx].lock();
            if !shard.bump(&key, delta, self.tick()) {
                if !self.try_reserve() {
                    drop(shard);
                    return self.insert_evicting(idx, key, delta);
                }
                shard.insert(key, delta, self.tick());
            }
            self.publish(idx, &shard);
        }
    }

    fn insert_evicting(&self, idx: usize, key: K, delta: u64) {
        for _ in 0..self.shards.len() {
            let victim = self.oldest_shard().unwrap_or(idx);
            let (mut own, mut other) = self.lock_pair(idx, victim);

            if own.bump(&key, delta, self.tick()) {
                self.publish(idx, &own);
                return;
            }

            let evicted = match other.as_mut() {
                Some(other) => {
                    let evicted = other.pop_lru();
                    self.publish(victim, other);
                    evicted
                }
                None => own.pop_lru(),
            };

            // An eviction frees the slot we fill, so occupancy is unchanged.
            if evicted.is_some() || self.try_reserve() {
                own.insert(key, delta, self.tick());
                self.publish(idx, &own);
                return;
            }
            tracing::trace!(victim, "eviction victim drained concurrently, retrying");
        }

        self.insert_evicting_exclusive(idx, key, delta);
    }

    /// Last resort under heavy churn: hold every shard so occupancy cannot
    /// move, then evict from the oldest non-empty one.
    fn insert_evicting_exclusive(&self, idx: usize, key: K, delta: u64) {
        let mut guards: Vec<_> = self.shards.iter().map(|shard| shard.lock()).collect();

        if guards[idx].bump(&key, delta, self.tick()) {
            self.publish(idx, &guards[idx]);
            return;
        }

        if !self.try_reserve() {
            let victim = (0..guards.len())
                .filter(|&i| guards[i].len() > 0)
                .min_by_key(|&i| guards[i].tail_stamp());
            if let Some(victim) = victim {
                guards[victim].pop_lru();
                self.publish(victim, &guards[victim]);
            }
        }

        guards[idx].insert(key, delta, self.tick());
        self.publish(idx, &guards[idx]);
    }

    pub fn remove(&self, key: &K) -> Option<u64> {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].lock();
        let removed = shard.remove(key)?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        self.publish(idx, &shard);
        Some(removed)
    }

    /// Copies every entry without resetting anything.
    pub fn snapshot(&self) -> Vec<(K, u64)> {
        let mut out = Vec::with_capacity(self.len());
        for shard in &self.shards {
            out.extend(shard.lock().entries());
        }
        out
    }

    /// Takes every entry out of the table, one shard at a time.
    pub fn drain(&self) -> Vec<(K, u64)> {
        let mut out = Vec::with_capacity(self.len());
        for (idx, shard) in self.shards.iter().enumerate() {
            let mut guard = shard.lock();
            let taken = guard.len();
            out.extend(guard.entries());
            guard.clear();
            self.len.fetch_sub(taken, Ordering::AcqRel);
            self.publish(idx, &guard);
        }
        out
    }
}

impl<K: Copy + Eq + Hash> Default for UsageTable<K> {
    fn default() -> Self {
        Self::new()
    }
}
