//! A fixed-capacity MPMC ring of fixed-width records.
//!
//! This is the transport underneath [`crate::fabric`]: every post and every
//! two-way send ultimately becomes `enqueue_n`/`dequeue_n` (or their
//! non-blocking counterparts) on a `Ring<N>`. The implementation follows the
//! classic Vyukov bounded MPMC queue: each slot carries a sequence number
//! that tells producers/consumers whether it is currently produc-able or
//! consum-able, so no CAS loop ever needs to retry more than once per
//! contending thread.
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::backoff::Backoff;

/// A record is a fixed-size array of machine words, wide enough to hold a
/// 7-word request record (see [`crate::fabric`]).
pub type Record<const W: usize> = [usize; W];

struct Slot<const W: usize> {
    sequence: AtomicUsize,
    data: UnsafeCell<MaybeUninit<Record<W>>>,
}

/// A bounded multi-producer/multi-consumer ring buffer of `W`-word records.
///
/// Capacity is always rounded up to a power of two (minimum 16).
pub struct Ring<const W: usize> {
    mask: usize,
    slots: Box<[Slot<W>]>,
    // Padded so producers hammering `head` and consumers hammering `tail`
    // don't bounce the same cache line back and forth, same as
    // crossbeam-queue's ArrayQueue lays out its own head/tail.
    head: CachePadded<AtomicUsize>, // next slot to be claimed by a producer
    tail: CachePadded<AtomicUsize>, // next slot to be claimed by a consumer
}

unsafe impl<const W: usize> Send for Ring<W> {}
unsafe impl<const W: usize> Sync for Ring<W> {}

impl<const W: usize> Ring<W> {
    /// Creates a ring whose capacity is `capacity` rounded up to the next
    /// power of two, with a floor of 16.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(16).next_power_of_two();
        let slots: Vec<Slot<W>> = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Ring {
            mask: capacity - 1,
            slots: slots.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Non-blocking single-record enqueue. Returns `false` if the ring is
    /// full.
    pub fn put(&self, record: Record<W>) -> bool {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { *slot.data.get() = MaybeUninit::new(record) };
                        slot.sequence.store(pos + 1, Ordering::Release);
                        return true;
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return false; // full
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Non-blocking single-record dequeue. Returns `None` if the ring is
    /// empty.
    pub fn get(&self) -> Option<Record<W>> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos as isize + 1);
            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let record = unsafe { (*slot.data.get()).assume_init() };
                        slot.sequence.store(pos + self.capacity(), Ordering::Release);
                        return Some(record);
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                return None; // empty
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Single-consumer dequeue that skips the sequence CAS, assuming the
    /// caller has externally guaranteed it is the only consumer. Used by a
    /// thread draining its own private request ring.
    pub fn relaxed_get(&self) -> Option<Record<W>> {
        let pos = self.tail.load(Ordering::Relaxed);
        let slot = &self.slots[pos & self.mask];
        let seq = slot.sequence.load(Ordering::Acquire);
        if seq != pos + 1 {
            return None;
        }
        let record = unsafe { (*slot.data.get()).assume_init() };
        slot.sequence.store(pos + self.capacity(), Ordering::Release);
        self.tail.store(pos + 1, Ordering::Relaxed);
        Some(record)
    }

    /// Blocking enqueue with exponential-then-cooperative backoff.
    pub fn enqueue(&self, record: Record<W>) {
        let mut backoff = Backoff::new();
        let mut record = record;
        loop {
            if self.put(record) {
                return;
            }
            // `put` consumed nothing on failure; `record` is still valid to
            // retry since it was only ever read, never moved, on the full
            // path.
            let _ = &mut record;
            backoff.spin();
        }
    }

    /// Blocking dequeue with exponential-then-cooperative backoff.
    pub fn dequeue(&self) -> Record<W> {
        let mut backoff = Backoff::new();
        loop {
            if let Some(record) = self.get() {
                return record;
            }
            backoff.spin();
        }
    }

    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.saturating_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn capacity_rounds_up_to_power_of_two_with_floor() {
        assert_eq!(Ring::<1>::new(1).capacity(), 16);
        assert_eq!(Ring::<1>::new(17).capacity(), 32);
        assert_eq!(Ring::<1>::new(64).capacity(), 64);
    }

    #[test]
    fn spsc_preserves_fifo_order() {
        // capacity 16, producer enqueues 1..1000, consumer dequeues 1000
        // items in order.
        let ring: Ring<1> = Ring::new(16);
        let ring = Arc::new(ring);
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 1..=1000usize {
                    ring.enqueue([i]);
                }
            })
        };
        let mut seen = Vec::with_capacity(1000);
        for _ in 0..1000 {
            seen.push(ring.dequeue()[0]);
        }
        producer.join().unwrap();
        let expected: Vec<usize> = (1..=1000).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn put_fails_when_full_get_fails_when_empty() {
        let ring: Ring<1> = Ring::new(16);
        assert_eq!(ring.get(), None);
        for i in 0..16 {
            assert!(ring.put([i]));
        }
        assert!(!ring.put([999]));
        for i in 0..16 {
            assert_eq!(ring.get(), Some([i]));
        }
        assert_eq!(ring.get(), None);
    }

    #[test]
    fn mpmc_never_loses_or_duplicates() {
        // S3-style safety check: N producers, N consumers, total items
        // conserved, occupancy bounded by capacity throughout.
        let ring: Ring<1> = Ring::new(64);
        let ring = Arc::new(ring);
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 5000;
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let tag = p * PER_PRODUCER + i;
                        ring.enqueue([tag]);
                    }
                })
            })
            .collect();

        let total = PRODUCERS * PER_PRODUCER;
        let collected = Arc::new(std::sync::Mutex::new(Vec::with_capacity(total)));
        let consumers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let ring = Arc::clone(&ring);
                let collected = Arc::clone(&collected);
                thread::spawn(move || loop {
                    let mut local = Vec::new();
                    // Drain what's available; stop once the global count
                    // target is reached across all consumers.
                    for _ in 0..64 {
                        if let Some(r) = ring.get() {
                            local.push(r[0]);
                        }
                    }
                    let done = {
                        let mut c = collected.lock().unwrap();
                        c.extend(local);
                        c.len() >= total
                    };
                    if done {
                        break;
                    }
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        for c in consumers {
            c.join().unwrap();
        }

        let mut collected = collected.lock().unwrap().clone();
        collected.sort_unstable();
        let expected: Vec<usize> = (0..total).collect();
        assert_eq!(collected, expected);
    }
}
