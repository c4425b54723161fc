//! Configuration: CLI flags, with an optional `--config <path.toml>` file
//! supplying the same fields. CLI flags always win over the file; the file
//! wins over the built-in defaults.
use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Everything `mainmemory-server` needs to build a [`mainmemory::Runtime`]
/// and bind its demonstration service, merged from (in increasing
/// priority) built-in defaults, an optional TOML file, and CLI flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// CPU indices to pin one worker thread to each of; its length is also
    /// the hash table's partition count.
    pub cpus: Vec<usize>,
    /// Capacity, in requests, of each worker's fabric ring.
    pub ring_capacity: usize,
    /// Initial bucket count per partition.
    pub initial_buckets: usize,
    /// Total eviction budget across all partitions, in bytes.
    pub volume: usize,
    /// Address the demonstration line-protocol service listens on.
    pub listen: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cpus: vec![0],
            ring_capacity: 1024,
            initial_buckets: 128,
            volume: 64 * 1024 * 1024,
            listen: "127.0.0.1:11311".to_string(),
        }
    }
}

impl Config {
    /// Loads a TOML file at `path`, falling back to [`Config::default`]
    /// for any field it does not set.
    pub fn from_file(path: &Path) -> Result<Config, String> {
        let text = fs::read_to_string(path)
            .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
        toml::from_str(&text).map_err(|err| format!("failed to parse {}: {err}", path.display()))
    }

    pub fn into_runtime_config(self) -> mainmemory::RuntimeConfig {
        mainmemory::RuntimeConfig {
            cpus: self.cpus,
            ring_capacity: self.ring_capacity,
            initial_buckets: self.initial_buckets,
            volume: self.volume,
        }
    }
}
