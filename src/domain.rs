//! A domain is a fixed-size group of [`Thread`]s that start and stop
//! together, synchronized by a sense-reversing barrier rather than any
//! blocking OS primitive.
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::sync::SenseBarrier;
use crate::thread::{pin_to_cpu, Thread};

/// A group of worker threads pinned one-per-CPU, started and stopped in
/// lockstep.
pub struct Domain {
    threads: Vec<Arc<Thread>>,
    barrier: Arc<SenseBarrier>,
    handles: Vec<JoinHandle<()>>,
}

impl Domain {
    /// Builds a domain of `cpus.len()` threads, one pinned to each listed
    /// CPU, each with its own request ring of `ring_capacity`.
    pub fn new(cpus: &[usize], ring_capacity: usize) -> Domain {
        let threads = cpus
            .iter()
            .enumerate()
            .map(|(id, &cpu)| Thread::new(id, cpu, ring_capacity))
            .collect();
        Domain {
            threads,
            barrier: Arc::new(SenseBarrier::new(cpus.len())),
            handles: Vec::new(),
        }
    }

    pub fn threads(&self) -> &[Arc<Thread>] {
        &self.threads
    }

    /// Spawns one OS thread per member, pins it, waits at the start
    /// barrier, then runs `body` with that member's [`Thread`] installed as
    /// current. All members cross the start barrier together before any of
    /// them runs `body`.
    pub fn start<F>(&mut self, body: F)
    where
        F: Fn(&Arc<Thread>) + Send + Sync + 'static,
    {
        let body = Arc::new(body);
        for thread in &self.threads {
            let thread = Arc::clone(thread);
            let barrier = Arc::clone(&self.barrier);
            let body = Arc::clone(&body);
            let handle = std::thread::Builder::new()
                .name(format!("mainmemory-worker-{}", thread.id))
                .spawn(move || {
                    if let Err(err) = pin_to_cpu(thread.cpu) {
                        log::warn!(
                            target: "mainmemory::domain",
                            "failed to pin worker {} to cpu {}: {err}",
                            thread.id,
                            thread.cpu
                        );
                    }
                    let mut local_sense = false;
                    barrier.wait(&mut local_sense);
                    thread.enter(|| body(&thread));
                })
                .expect("failed to spawn domain worker thread");
            self.handles.push(handle);
        }
    }

    /// Waits for every member thread to finish (they must return from
    /// `body` on their own, typically by observing a shutdown flag).
    pub fn join(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
