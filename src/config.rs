//! Process-wide configuration.
//!
//! A [`Config`] is built once at startup (JSON file, then command-line
//! overrides) and handed to each component by value.

use std::path::{Path, PathBuf};
use std::time::Duration;

use byte_unit::Byte;
use serde::{Deserialize, Deserializer, Serialize};

use crate::common::validate_address;
use crate::error::{PfsError, Result};

/// Largest single read or write a client may issue.
pub const MAX_IO_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `host:port` of the controller.
    pub controller_address: String,
    /// `host:port` under which a chunk server advertises itself.
    pub self_address: Option<String>,
    pub listen_port: u16,
    /// Chunk capacity in bytes; must match between client and controller.
    #[serde(deserialize_with = "deserialize_byte_size")]
    pub chunk_capacity: u64,
    /// Replica count used when a CreateBlob request asks for zero.
    pub default_replication_factor: u32,
    /// Deadline applied to every outgoing RPC.
    pub rpc_timeout_ms: u64,
    pub log_level: String,
    pub storage: StorageConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory holding chunk files for the file backend.
    pub data_dir: PathBuf,
    /// Upper bound on the sum of allocated chunk capacities.
    #[serde(deserialize_with = "deserialize_byte_size")]
    pub limit_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(deserialize_with = "deserialize_byte_size")]
    pub write_size: u64,
    #[serde(deserialize_with = "deserialize_byte_size")]
    pub read_size: u64,
    /// Number of chunks uploaded in parallel.
    pub concurrency: usize,
    /// Attempts per write, including the first.
    pub max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    /// Entries in the sealed-blob metadata cache.
    pub metadata_cache: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            controller_address: "127.0.0.1:4100".into(),
            self_address: None,
            listen_port: 4100,
            chunk_capacity: 64 * 1024 * 1024,
            default_replication_factor: 3,
            rpc_timeout_ms: 5_000,
            log_level: "info".into(),
            storage: StorageConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from("./data"),
            limit_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            write_size: 1024 * 1024,
            read_size: 1024 * 1024,
            concurrency: 4,
            max_attempts: 3,
            retry_initial_backoff_ms: 50,
            retry_max_backoff_ms: 2_000,
            metadata_cache: 128,
        }
    }
}

impl Config {
    /// Load a configuration file, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| PfsError::Config(format!("{}: {e}", path.display())))?;
                Config::from_json(&text)
            }
            None => Ok(Config::default()),
        }
    }

    pub fn from_json(text: &str) -> Result<Config> {
        serde_json::from_str(text).map_err(|e| PfsError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        validate_address(&self.controller_address)
            .map_err(|e| PfsError::Config(format!("controller_address: {e}")))?;
        if let Some(addr) = &self.self_address {
            validate_address(addr).map_err(|e| PfsError::Config(format!("self_address: {e}")))?;
        }
        if self.chunk_capacity == 0 {
            return Err(PfsError::Config("chunk_capacity must be at least 1 byte".into()));
        }
        if self.default_replication_factor == 0 {
            return Err(PfsError::Config("default_replication_factor must be at least 1".into()));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(PfsError::Config("rpc_timeout_ms must be positive".into()));
        }
        let client = &self.client;
        for (name, size) in [("write_size", client.write_size), ("read_size", client.read_size)] {
            if size == 0 || size > MAX_IO_SIZE {
                return Err(PfsError::Config(format!(
                    "client.{name} must be between 1 byte and {:#}",
                    Byte::from_u64(MAX_IO_SIZE)
                )));
            }
        }
        if client.concurrency == 0 || client.max_attempts == 0 {
            return Err(PfsError::Config(
                "client.concurrency and client.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// The address a chunk server registers under.
    pub fn advertised_address(&self) -> String {
        self.self_address
            .clone()
            .unwrap_or_else(|| format!("127.0.0.1:{}", self.listen_port))
    }
}

/// Parse a byte count such as `"64 MiB"` or `4096`.
pub fn parse_byte_size(text: &str) -> Result<u64> {
    Byte::parse_str(text, true)
        .map(|b| b.as_u64())
        .map_err(|e| PfsError::Config(format!("bad byte size {text:?}: {e}")))
}

fn deserialize_byte_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Text(s) => parse_byte_size(&s).map_err(serde::de::Error::custom),
    }
}
