//! The loopback line-protocol listener: accepts TCP connections and runs
//! [`command::parse`]/[`command::execute`] against the shared [`Runtime`]
//! for each line received. One OS thread per connection -- this is
//! demonstration plumbing for exercising the core end to end, not a real
//! network acceptor/poller (which stays out of scope for this crate).
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mainmemory::Runtime;

use crate::command;

/// Accepts connections on `listen` until `shutdown` is signalled, spawning
/// one handler thread per connection. Polls for new connections with a
/// short accept timeout so it can notice shutdown promptly without a
/// dedicated wakeup mechanism.
pub fn serve(listen: &str, runtime: Arc<Mutex<Runtime>>, shutdown: Arc<std::sync::atomic::AtomicBool>) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen)?;
    listener.set_nonblocking(true)?;
    log::info!(target: "mainmemory_cli::server", "listening on {listen}");

    let mut handles = Vec::new();
    while !shutdown.load(std::sync::atomic::Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!(target: "mainmemory_cli::server", "accepted connection from {peer}");
                let runtime = Arc::clone(&runtime);
                handles.push(std::thread::spawn(move || handle_connection(stream, runtime)));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => {
                log::warn!(target: "mainmemory_cli::server", "accept failed: {err}");
            }
        }
    }
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

fn handle_connection(stream: TcpStream, runtime: Arc<Mutex<Runtime>>) {
    let peer = stream.peer_addr().ok();
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(err) => {
            log::warn!(target: "mainmemory_cli::server", "failed to clone connection: {err}");
            return;
        }
    };
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                log::warn!(target: "mainmemory_cli::server", "connection read error: {err}");
                break;
            }
        };
        let response = match command::parse(line.trim_end()) {
            Some(command) => command::execute(&runtime, command),
            None => "ERROR".to_string(),
        };
        if writeln!(writer, "{response}").is_err() {
            break;
        }
    }
    log::debug!(target: "mainmemory_cli::server", "connection from {peer:?} closed");
}
