//! `mainmemory-server`: a thin binary demonstrating the `mainmemory`
//! runtime end to end. Parses CLI flags (optionally layered over a TOML
//! config file), builds a [`Runtime`], starts one dealer fiber per pinned
//! worker thread, and serves the `Get`/`Set`/`Delete`/`Stats` command set
//! over a loopback line protocol until interrupted.
//!
//! This binary implements no real wire protocol -- that, along with the
//! network acceptor/poller proper, stays an external collaborator. It
//! exists to exercise the core's public API the way a real protocol
//! server would: route a command to the partition-pinned thread via the
//! fabric, touch the hash table, write back a response.
mod command;
mod config;
mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use mainmemory::fiber::dealer::{dealer_loop, ShutdownFlag};
use mainmemory::fiber::{Role, Scheduler};
use mainmemory::Runtime;

use config::Config;

#[derive(Parser, Debug)]
#[clap(name = "mainmemory-server", about = "MainMemory runtime demonstration service")]
struct Args {
    /// Optional TOML file supplying the fields of `Config`; CLI flags below
    /// override whatever it sets.
    #[clap(long, value_parser)]
    config: Option<PathBuf>,

    /// Address the demonstration line-protocol service listens on.
    #[clap(long, value_parser)]
    listen: Option<String>,

    /// Comma-separated CPU indices to pin one worker thread to each of
    /// (e.g. `0,1,2`).
    #[clap(long, value_parser)]
    cpus: Option<String>,

    /// Capacity, in requests, of each worker's fabric ring.
    #[clap(long, value_parser)]
    ring_capacity: Option<usize>,

    /// Initial bucket count per partition.
    #[clap(long, value_parser)]
    initial_buckets: Option<usize>,

    /// Total eviction budget across all partitions, in bytes.
    #[clap(long, value_parser)]
    volume: Option<usize>,
}

impl Args {
    /// Layers CLI flags over an optional config file over the built-in
    /// defaults.
    fn resolve(self) -> Result<Config, String> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(cpus) = self.cpus {
            config.cpus = cpus
                .split(',')
                .map(|part| part.trim().parse::<usize>())
                .collect::<Result<Vec<usize>, _>>()
                .map_err(|err| format!("invalid --cpus list {cpus:?}: {err}"))?;
        }
        if let Some(ring_capacity) = self.ring_capacity {
            config.ring_capacity = ring_capacity;
        }
        if let Some(initial_buckets) = self.initial_buckets {
            config.initial_buckets = initial_buckets;
        }
        if let Some(volume) = self.volume {
            config.volume = volume;
        }
        // The legacy non-SMP path: one partition, inline mutation, no
        // thread pinning.
        #[cfg(feature = "single-threaded")]
        {
            config.cpus = vec![config.cpus.first().copied().unwrap_or(0)];
        }
        Ok(config)
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Release);
}

fn install_signal_handler() {
    unsafe {
        libc::signal(libc::SIGINT, on_interrupt as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_interrupt as libc::sighandler_t);
    }
}

/// One worker thread's body: runs a dealer fiber draining its request
/// ring until `shutdown` is signalled and the ring is empty. Between
/// drain cycles the dealer fiber itself halts on `thread.listener`
/// (woken by `Thread::post`), so this loop needs no backoff of its own.
fn worker_body(thread: &Arc<mainmemory::Thread>, shutdown: ShutdownFlag) {
    let scheduler = Scheduler::new();
    scheduler.spawn(Role::Dealer, dealer_loop(Arc::clone(thread), shutdown));
    while scheduler.run_once() {}
}

fn main() {
    let args = Args::parse();
    let config = match args.resolve() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("mainmemory-server: {err}");
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    install_signal_handler();

    let listen = config.listen.clone();
    let runtime = Runtime::new(config.into_runtime_config());
    let shutdown = runtime.shutdown_flag();
    let runtime = Arc::new(Mutex::new(runtime));

    {
        let mut guard = runtime.lock().unwrap_or_else(|e| e.into_inner());
        let shutdown = shutdown.clone();
        guard.domain_mut().start(move |thread| {
            worker_body(thread, shutdown.clone());
        });
    }

    log::info!(target: "mainmemory_cli", "runtime started, serving on {listen}");

    let serve_shutdown = Arc::new(AtomicBool::new(false));
    let server_handle = {
        let runtime = Arc::clone(&runtime);
        let serve_shutdown = Arc::clone(&serve_shutdown);
        std::thread::spawn(move || server::serve(&listen, runtime, serve_shutdown))
    };

    while !SHUTDOWN_REQUESTED.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(50));
    }

    log::info!(target: "mainmemory_cli", "shutdown requested, draining...");
    serve_shutdown.store(true, Ordering::Release);
    if let Err(err) = server_handle.join().expect("server thread panicked") {
        log::warn!(target: "mainmemory_cli::server", "server stopped with error: {err}");
    }

    let mut guard = runtime.lock().unwrap_or_else(|e| e.into_inner());
    guard.shutdown();
    log::info!(target: "mainmemory_cli", "shutdown complete");
}
