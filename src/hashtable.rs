//! The partitioned, striding hash table: content-addressed entries held
//! in per-partition bucket chains and LRU lists, grown by extensible
//! hashing and shrunk by LRU eviction.
//!
//! A table is split into `nparts` independent [`Partition`]s, selected by
//! `fnv1a(key) % nparts`. Each partition grows its own bucket array by
//! [`MC_TABLE_STRIDE`] buckets at a time rather than rehashing the whole
//! table: see [`Partition::grow_one_bucket`] for the extensible-hashing
//! split this implements. Growth is tracked per partition, not as one
//! shared stride counter over a single bucket array shared by all
//! partitions: each partition independently walks 128 -> 192 -> 256 -> 320
//! buckets as it fills, so with `nparts` partitions under identical load
//! the *aggregate* bucket count across the table is `nparts` times a
//! single partition's count. This is an intentional deviation from a
//! literal one-shared-array reading of the design note, made to keep
//! partition pinning (one thread ever touches a given partition) airtight;
//! see `SPEC_FULL.md`'s restatement of the growth scenario and `DESIGN.md`
//! C11 for the rationale.
//!
//! Entries are `Arc`-refcounted ([`Entry`]); a lookup clones the `Arc`
//! rather than handing out a reference, so the entry outlives a concurrent
//! `remove`/eviction exactly as long as the caller holds its clone -- an
//! entry is destroyed exactly when its last clone drops, without a manual
//! refcount field (see the design notes on arena+refcount vs `Arc`).
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::backoff::AtomicCounter;
use crate::error::{Error, Result};

/// Buckets added to a partition per stride.
pub const MC_TABLE_STRIDE: usize = 64;

/// FNV-1a over a key, exposed so callers can route through
/// [`HashTable::partition_index`] (and `crate::Runtime::thread_for`)
/// before the table itself is reachable -- e.g. to pick which thread's
/// fabric ring a request belongs on.
pub fn hash_key(key: &[u8]) -> u32 {
    fnv1a(key)
}

fn fnv1a(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &byte in bytes {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn floor_pow2(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let mut p = 1usize;
    while p.checked_mul(2).map_or(false, |doubled| doubled <= n) {
        p *= 2;
    }
    p
}

/// The "extensible hashing" bucket-selection formula: given `used` visible
/// buckets, folds a hash into `[0, used)`.
fn bucket_of(hash: u32, used: usize) -> usize {
    if used <= 1 {
        return 0;
    }
    let half = floor_pow2(used - 1);
    let mask = 2 * half - 1;
    let idx = (hash as usize) & mask;
    if idx >= used {
        idx - half
    } else {
        idx
    }
}

/// Fixed overhead charged against a partition's byte budget per entry, on
/// top of its key and value bytes, standing in for the entry header
/// fields (`next`, `lru_link`, lengths, refcount, flags, cas).
const ENTRY_OVERHEAD: usize = 48;

/// A single hash table entry: a key, a value, a flags word and a CAS
/// stamp. Held behind `Arc`; `flags`/`cas` are atomics purely so `Entry`
/// can cross a thread boundary (e.g. held by a caller on another core
/// while the owning partition's thread independently updates it) without
/// `unsafe` -- actual concurrent mutation never happens in practice, since
/// only the thread pinned to an entry's partition ever calls
/// [`Partition::insert`]/`remove`/`touch`/a `cas` replacement.
pub struct Entry {
    key: Box<[u8]>,
    value: Box<[u8]>,
    flags: AtomicU32,
    cas: AtomicU64,
}

impl Entry {
    fn new(key: Box<[u8]>, value: Box<[u8]>, flags: u32, cas: u64) -> Arc<Entry> {
        Arc::new(Entry {
            key,
            value,
            flags: AtomicU32::new(flags),
            cas: AtomicU64::new(cas),
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn cas(&self) -> u64 {
        self.cas.load(Ordering::Relaxed)
    }

    fn size(&self) -> usize {
        self.key.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

/// One shard of the table: its own bucket array, LRU list and byte
/// accounting. Bucket chains are LIFO (`insert` pushes to the front); LRU
/// order is insertion/touch order (`insert` and `touch` push to the back,
/// eviction pops the front).
struct Partition {
    buckets: Vec<VecDeque<Arc<Entry>>>,
    used: usize,
    lru: VecDeque<Arc<Entry>>,
    nbytes: usize,
    nentries: usize,
    evicting: bool,
    striding: bool,
}

impl Partition {
    fn new(initial_buckets: usize) -> Self {
        let mut partition = Partition {
            buckets: Vec::new(),
            used: 0,
            lru: VecDeque::new(),
            nbytes: 0,
            nentries: 0,
            evicting: false,
            striding: false,
        };
        for _ in 0..initial_buckets.max(1) {
            partition.grow_one_bucket();
        }
        partition
    }

    /// Adds exactly one bucket, splitting the one bucket whose entries may
    /// now resolve to the new index instead of their old one. Per the
    /// extensible-hashing formula, that source bucket is
    /// `new_bucket_index - half`, where `half` is the new power-of-two
    /// "fold" point -- every other bucket's entries are provably
    /// unaffected by the growth (`bucket_of` only changes its answer for
    /// raw indices that land exactly on the newly added bucket).
    fn grow_one_bucket(&mut self) {
        if self.used == 0 {
            self.buckets.push(VecDeque::new());
            self.used = 1;
            return;
        }
        let new_used = self.used + 1;
        let half = floor_pow2(new_used - 1);
        let new_bucket_index = self.used;
        let source_index = new_bucket_index - half;
        let mask = 2 * half - 1;

        self.buckets.push(VecDeque::new());
        self.used = new_used;

        let drained = std::mem::take(&mut self.buckets[source_index]);
        for entry in drained {
            let idx = (fnv1a(entry.key()) as usize) & mask;
            if idx == new_bucket_index {
                self.buckets[new_bucket_index].push_back(entry);
            } else {
                self.buckets[source_index].push_back(entry);
            }
        }
    }

    /// Grows by [`MC_TABLE_STRIDE`] buckets, setting the `striding` flag
    /// for the duration so only one stride proceeds at a time per
    /// partition.
    fn grow_stride(&mut self) {
        self.striding = true;
        for _ in 0..MC_TABLE_STRIDE {
            self.grow_one_bucket();
        }
        self.striding = false;
    }

    fn bucket_index(&self, hash: u32) -> usize {
        bucket_of(hash, self.used)
    }

    fn lookup(&self, hash: u32, key: &[u8]) -> Option<Arc<Entry>> {
        self.buckets
            .get(self.bucket_index(hash))?
            .iter()
            .find(|entry| entry.key() == key)
            .cloned()
    }

    fn insert(&mut self, entry: Arc<Entry>) {
        let idx = self.bucket_index(fnv1a(entry.key()));
        self.nbytes += entry.size();
        self.nentries += 1;
        self.buckets[idx].push_front(Arc::clone(&entry));
        self.lru.push_back(entry);
    }

    fn remove(&mut self, hash: u32, key: &[u8]) -> Option<Arc<Entry>> {
        let idx = self.bucket_index(hash);
        let bucket = self.buckets.get_mut(idx)?;
        let pos = bucket.iter().position(|entry| entry.key() == key)?;
        let entry = bucket.remove(pos)?;
        if let Some(lru_pos) = self.lru.iter().position(|e| Arc::ptr_eq(e, &entry)) {
            self.lru.remove(lru_pos);
        }
        self.nbytes -= entry.size();
        self.nentries -= 1;
        Some(entry)
    }

    /// Moves `entry` to the LRU tail, marking it most-recently-used.
    fn touch(&mut self, entry: &Arc<Entry>) {
        if let Some(pos) = self.lru.iter().position(|e| Arc::ptr_eq(e, entry)) {
            let entry = self.lru.remove(pos).expect("position just found");
            self.lru.push_back(entry);
        }
    }

    /// Removes and returns the LRU-head entry (least recently
    /// inserted/touched), or `None` if the partition is empty.
    fn evict_head(&mut self) -> Option<Arc<Entry>> {
        let entry = self.lru.pop_front()?;
        let idx = self.bucket_index(fnv1a(entry.key()));
        if let Some(bucket) = self.buckets.get_mut(idx) {
            if let Some(pos) = bucket.iter().position(|e| Arc::ptr_eq(e, &entry)) {
                bucket.remove(pos);
            }
        }
        self.nbytes -= entry.size();
        self.nentries -= 1;
        Some(entry)
    }
}

/// The partitioned hash table. Owns every partition directly: in a
/// single-threaded build that's the whole story; in an SMP build, the
/// [`crate::Runtime`] gives each pinned thread exclusive access to its own
/// partitions' methods (never shared across threads), enforcing partition
/// pinning without needing the table type itself to know about threads or
/// the fabric.
pub struct HashTable {
    partitions: Vec<Partition>,
    cas_counter: AtomicCounter,
    budget_per_partition: usize,
}

impl HashTable {
    /// Builds a table of `nparts` partitions, each starting with
    /// `initial_buckets_per_partition` buckets, with a total eviction
    /// budget of `volume` bytes split evenly across partitions.
    pub fn new(nparts: usize, initial_buckets_per_partition: usize, volume: usize) -> HashTable {
        let nparts = nparts.max(1);
        HashTable {
            partitions: (0..nparts)
                .map(|_| Partition::new(initial_buckets_per_partition))
                .collect(),
            cas_counter: AtomicCounter::new(),
            budget_per_partition: volume / nparts,
        }
    }

    pub fn nparts(&self) -> usize {
        self.partitions.len()
    }

    /// The partition a key with this hash is (and always will be) owned
    /// by; affinity helper for SMP callers routing through the fabric.
    pub fn partition_index(&self, hash: u32) -> usize {
        hash as usize % self.partitions.len()
    }

    pub fn lookup(&mut self, key: &[u8]) -> Option<Arc<Entry>> {
        let hash = fnv1a(key);
        let idx = self.partition_index(hash);
        let entry = self.partitions[idx].lookup(hash, key)?;
        self.partitions[idx].touch(&entry);
        Some(entry)
    }

    /// Inserts a fresh entry for `key`, stamping it with the next CAS
    /// token. Takes ownership of the entry; any existing entry for the
    /// same key is left in place (callers that want replace-or-insert
    /// semantics should `remove` first).
    pub fn insert(&mut self, key: impl Into<Box<[u8]>>, value: impl Into<Box<[u8]>>, flags: u32) -> Arc<Entry> {
        let key = key.into();
        let cas = self.cas_counter.next();
        let hash = fnv1a(&key);
        let entry = Entry::new(key, value.into(), flags, cas);
        let idx = self.partition_index(hash);
        self.partitions[idx].insert(Arc::clone(&entry));
        entry
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Arc<Entry>> {
        let hash = fnv1a(key);
        let idx = self.partition_index(hash);
        self.partitions[idx].remove(hash, key)
    }

    /// Check-and-set: replaces `key`'s value iff its current CAS token
    /// equals `expected`, stamping the replacement with a fresh token.
    pub fn cas(&mut self, key: &[u8], expected: u64, value: impl Into<Box<[u8]>>) -> Result<Arc<Entry>> {
        let hash = fnv1a(key);
        let idx = self.partition_index(hash);
        let existing = self.partitions[idx].lookup(hash, key).ok_or(Error::NotFound)?;
        if existing.cas() != expected {
            return Err(Error::CasMismatch {
                expected,
                found: existing.cas(),
            });
        }
        let flags = existing.flags();
        self.partitions[idx].remove(hash, key);
        let new_cas = self.cas_counter.next();
        let entry = Entry::new(key.to_vec().into_boxed_slice(), value.into(), flags, new_cas);
        self.partitions[idx].insert(Arc::clone(&entry));
        Ok(entry)
    }

    /// Grows partition `idx` by one stride (64 buckets). Callers drive
    /// this from whatever load-watching policy decides a partition is due
    /// to grow (e.g. a background fiber checking `load_factor`); the table
    /// itself makes no scheduling decisions.
    pub fn grow_stride(&mut self, idx: usize) {
        self.partitions[idx].grow_stride();
    }

    pub fn bucket_count(&self, idx: usize) -> usize {
        self.partitions[idx].used
    }

    pub fn len(&self, idx: usize) -> usize {
        self.partitions[idx].nentries
    }

    pub fn nbytes(&self, idx: usize) -> usize {
        self.partitions[idx].nbytes
    }

    pub fn budget(&self) -> usize {
        self.budget_per_partition
    }

    pub fn is_evicting(&self, idx: usize) -> bool {
        self.partitions[idx].evicting
    }

    /// Evicts LRU-head entries from partition `idx` until
    /// `nbytes + reserve < self.budget()`, synchronously. Returns the
    /// number of entries evicted.
    pub fn evict_to_threshold(&mut self, idx: usize, reserve: usize) -> usize {
        let threshold = self.budget_per_partition;
        let partition = &mut self.partitions[idx];
        partition.evicting = true;
        let mut removed = 0;
        while partition.nbytes + reserve >= threshold {
            if partition.evict_head().is_none() {
                break;
            }
            removed += 1;
        }
        partition.evicting = false;
        removed
    }

    /// As [`HashTable::evict_to_threshold`], but yields to the fiber
    /// scheduler every 32 removals, for use from an eviction fiber posted
    /// by [`crate::fiber::dealer`] machinery rather than run inline on an
    /// insert path.
    pub async fn evict_to_threshold_async(&mut self, idx: usize, reserve: usize) -> usize {
        let threshold = self.budget_per_partition;
        self.partitions[idx].evicting = true;
        let mut removed = 0;
        loop {
            if self.partitions[idx].nbytes + reserve < threshold {
                break;
            }
            if self.partitions[idx].evict_head().is_none() {
                break;
            }
            removed += 1;
            if removed % 32 == 0 {
                crate::fiber::scheduler::yield_now().await;
            }
        }
        self.partitions[idx].evicting = false;
        removed
    }
}
