//! MainMemory: a user-space runtime for high-throughput in-memory network
//! services, built around a cooperative per-core fiber scheduler, a
//! cross-core request fabric, a multi-segment I/O buffer and a partitioned,
//! evicting hash table.
//!
//! This crate root re-exports the pieces a downstream consumer (the
//! `mainmemory-cli` demonstration binary, or a protocol server built on top
//! of this crate) actually needs to wire together a service: [`Runtime`],
//! [`Domain`], [`Thread`], the fiber [`Scheduler`]/[`Role`]/[`Priority`],
//! [`Ring`], [`fabric::post`]/[`fabric::send`], [`Buffer`],
//! [`HashTable`]/[`Entry`], and [`TaskFuture`]/[`Waitset`]. Lower-level
//! building blocks (`list`, `sync`, `backoff`, the `alloc` arenas) stay
//! available as public modules for advanced callers but are not re-exported
//! at the root.
pub mod alloc;
pub mod backoff;
pub mod buffer;
pub mod domain;
pub mod error;
pub mod event;
pub mod fabric;
pub mod fiber;
pub mod future;
pub mod hashtable;
pub mod list;
pub mod ring;
pub mod sync;
pub mod thread;

pub use buffer::Buffer;
pub use domain::Domain;
pub use error::{Error, Result};
pub use fabric::{post, send, send_blocking};
pub use fiber::{Priority, Role, Scheduler};
pub use future::{TaskFuture, Waitset};
pub use hashtable::{hash_key, Entry, HashTable};
pub use ring::Ring;
pub use thread::Thread;

use std::sync::Arc;

/// A running instance of the table: a [`Domain`] of pinned worker threads
/// sharing one partitioned [`HashTable`] (one partition per thread in SMP
/// builds, a single partition otherwise) and a [`fiber::dealer::ShutdownFlag`]
/// every thread's dealer loop watches.
///
/// `Runtime` stands in for any process-wide static: every piece of shared
/// state it owns is threaded through explicitly rather than reached via a
/// global.
pub struct Runtime {
    domain: Domain,
    table: HashTable,
    shutdown: fiber::dealer::ShutdownFlag,
}

/// Tuning knobs for [`Runtime::new`].
pub struct RuntimeConfig {
    /// One worker thread per listed CPU; its length also determines the
    /// hash table's partition count.
    pub cpus: Vec<usize>,
    /// Capacity, in requests, of each thread's request ring.
    pub ring_capacity: usize,
    /// Initial bucket count per hash table partition.
    pub initial_buckets: usize,
    /// Total eviction budget across all partitions, in bytes.
    pub volume: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            cpus: vec![0],
            ring_capacity: 1024,
            initial_buckets: 128,
            volume: 64 * 1024 * 1024,
        }
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Runtime {
        let nparts = config.cpus.len();
        Runtime {
            domain: Domain::new(&config.cpus, config.ring_capacity),
            table: HashTable::new(nparts, config.initial_buckets, config.volume),
            shutdown: fiber::dealer::ShutdownFlag::new(),
        }
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Mutable access to the domain, for starting its member threads
    /// (see [`Domain::start`]). Separate from [`Runtime::domain`] since
    /// most callers (routing helpers, the demonstration service) only
    /// ever need read access to the thread vector.
    pub fn domain_mut(&mut self) -> &mut Domain {
        &mut self.domain
    }

    pub fn table(&mut self) -> &mut HashTable {
        &mut self.table
    }

    pub fn shutdown_flag(&self) -> fiber::dealer::ShutdownFlag {
        self.shutdown.clone()
    }

    /// Picks the thread pinned to the partition a key with this hash
    /// belongs to, for routing a mutation through [`fabric::send`]/`post`.
    pub fn thread_for(&self, hash: u32) -> Arc<Thread> {
        let idx = self.table.partition_index(hash);
        Arc::clone(&self.domain.threads()[idx])
    }

    /// Signals every member thread's dealer loop to stop once its ring next
    /// drains, then waits for them all to join.
    pub fn shutdown(&mut self) {
        self.shutdown.signal();
        self.domain.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_config_default_builds_a_single_partition_runtime() {
        let runtime = Runtime::new(RuntimeConfig::default());
        assert_eq!(runtime.domain().threads().len(), 1);
    }

    #[test]
    fn thread_for_routes_consistently_for_the_same_hash() {
        let runtime = Runtime::new(RuntimeConfig {
            cpus: vec![0, 1, 2],
            ..RuntimeConfig::default()
        });
        let a = runtime.thread_for(42);
        let b = runtime.thread_for(42);
        assert_eq!(a.id, b.id);
    }
}
