//! The demonstration command set, reduced to the minimum that exercises
//! the whole data flow without a real memcache parser: `Get`, `Set`,
//! `Delete`, `Stats`, carried over a line-oriented loopback protocol
//! that is deliberately not memcache's wire syntax -- real protocol
//! parsing is out of scope for this demonstration binary.
use std::sync::{Arc, Mutex};

use mainmemory::{fabric, hash_key, Runtime};

/// One parsed request line.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Get { key: Vec<u8> },
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    Stats,
}

/// Parses one input line (already trimmed of its trailing newline).
/// Unrecognized input returns `None`; the caller responds `ERROR`.
pub fn parse(line: &str) -> Option<Command> {
    let mut parts = line.splitn(3, ' ');
    match parts.next()?.to_ascii_uppercase().as_str() {
        "GET" => Some(Command::Get {
            key: parts.next()?.as_bytes().to_vec(),
        }),
        "SET" => {
            let key = parts.next()?.as_bytes().to_vec();
            let value = parts.next()?.as_bytes().to_vec();
            Some(Command::Set { key, value })
        }
        "DELETE" => Some(Command::Delete {
            key: parts.next()?.as_bytes().to_vec(),
        }),
        "STATS" => Some(Command::Stats),
        _ => None,
    }
}

/// Runs `command` against `runtime`, routing key-addressed commands
/// through [`fabric::send_blocking`] to the thread pinned to that key's
/// partition, and returns the response text (without a trailing newline).
///
/// `runtime` is shared behind a `Mutex` purely so the closure posted onto
/// the target thread's ring can own a handle to it across the thread
/// boundary (`HashTable` itself has no internal locking -- partition
/// pinning is what guarantees exclusivity; the mutex here is the price of
/// modeling "the pinned thread is the only caller" inside a binary crate
/// that still needs `Runtime` reachable from the loopback listener's
/// accept loop as well).
pub fn execute(runtime: &Arc<Mutex<Runtime>>, command: Command) -> String {
    match command {
        Command::Get { key } => {
            let thread = {
                let guard = runtime.lock().unwrap_or_else(|e| e.into_inner());
                guard.thread_for(hash_key(&key))
            };
            let runtime = Arc::clone(runtime);
            fabric::send_blocking(&thread, move || {
                let mut guard = runtime.lock().unwrap_or_else(|e| e.into_inner());
                match guard.table().lookup(&key) {
                    Some(entry) => format!("FOUND {}", String::from_utf8_lossy(entry.value())),
                    None => "NOT_FOUND".to_string(),
                }
            })
        }
        Command::Set { key, value } => {
            let thread = {
                let guard = runtime.lock().unwrap_or_else(|e| e.into_inner());
                guard.thread_for(hash_key(&key))
            };
            let runtime = Arc::clone(runtime);
            fabric::send_blocking(&thread, move || {
                let mut guard = runtime.lock().unwrap_or_else(|e| e.into_inner());
                guard.table().remove(&key);
                guard.table().insert(key, value, 0);
                "STORED".to_string()
            })
        }
        Command::Delete { key } => {
            let thread = {
                let guard = runtime.lock().unwrap_or_else(|e| e.into_inner());
                guard.thread_for(hash_key(&key))
            };
            let runtime = Arc::clone(runtime);
            fabric::send_blocking(&thread, move || {
                let mut guard = runtime.lock().unwrap_or_else(|e| e.into_inner());
                match guard.table().remove(&key) {
                    Some(_) => "DELETED".to_string(),
                    None => "NOT_FOUND".to_string(),
                }
            })
        }
        Command::Stats => {
            let guard = runtime.lock().unwrap_or_else(|e| e.into_inner());
            let nparts = guard.table().nparts();
            drop(guard);
            let mut lines = Vec::with_capacity(nparts);
            for idx in 0..nparts {
                let runtime = Arc::clone(runtime);
                let thread = {
                    let guard = runtime.lock().unwrap_or_else(|e| e.into_inner());
                    Arc::clone(&guard.domain().threads()[idx])
                };
                let line = fabric::send_blocking(&thread, move || {
                    let mut guard = runtime.lock().unwrap_or_else(|e| e.into_inner());
                    format!(
                        "partition {idx}: entries={} bytes={} buckets={}",
                        guard.table().len(idx),
                        guard.table().nbytes(idx),
                        guard.table().bucket_count(idx),
                    )
                });
                lines.push(line);
            }
            lines.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_command_shape() {
        assert_eq!(parse("GET foo"), Some(Command::Get { key: b"foo".to_vec() }));
        assert_eq!(
            parse("SET foo bar"),
            Some(Command::Set {
                key: b"foo".to_vec(),
                value: b"bar".to_vec()
            })
        );
        assert_eq!(parse("DELETE foo"), Some(Command::Delete { key: b"foo".to_vec() }));
        assert_eq!(parse("STATS"), Some(Command::Stats));
        assert_eq!(parse("stats"), Some(Command::Stats));
        assert_eq!(parse("BOGUS"), None);
        assert_eq!(parse("GET"), None);
    }

    #[test]
    fn set_then_get_round_trips_through_the_fabric() {
        let runtime = Arc::new(Mutex::new(Runtime::new(mainmemory::RuntimeConfig::default())));
        let thread = {
            let guard = runtime.lock().unwrap();
            guard.thread_for(hash_key(b"k"))
        };

        let response = std::thread::spawn({
            let runtime = Arc::clone(&runtime);
            move || execute(&runtime, Command::Set { key: b"k".to_vec(), value: b"v".to_vec() })
        });
        // Drain the posted request on what stands in for the owning thread.
        loop {
            if let Some(request) = thread.poll_request() {
                request.dispatch();
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(response.join().unwrap(), "STORED");

        let response = std::thread::spawn({
            let runtime = Arc::clone(&runtime);
            move || execute(&runtime, Command::Get { key: b"k".to_vec() })
        });
        loop {
            if let Some(request) = thread.poll_request() {
                request.dispatch();
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(response.join().unwrap(), "FOUND v");
    }
}
