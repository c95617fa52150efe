//! Runtime configuration for tensor-vault.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Chunk sizing, cache capacities, TTLs and retention ages all live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "tensor-vault", about = "Chunked tensor store with inference caches")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "vault.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Store a raw little-endian file as a finalized tensor.
    Put {
        /// File holding the raw element bytes.
        file: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "f32")]
        dtype: String,
        /// Comma-separated dimensions, e.g. `4096,4096`.
        #[arg(long, value_delimiter = ',')]
        shape: Vec<usize>,
    },
    /// Write a tensor's bytes to a file.
    Get {
        id: String,
        #[arg(short, long)]
        out: PathBuf,
        /// Re-verify the checksum before writing.
        #[arg(long)]
        verify: bool,
    },
    /// Recompute and compare a tensor's checksum.
    Verify { id: String },
    /// Delete a tensor and its chunks.
    Delete { id: String },
    /// List finalized tensors.
    List,
    /// Print metrics in Prometheus text format.
    Stats,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chunk storage settings.
    pub store: StoreConfig,

    /// Tensor catalog settings.
    pub catalog: CatalogConfig,

    /// Activation cache settings.
    pub activation: ActivationConfig,

    /// KV cache settings.
    pub kv: KvConfig,
}

/// Which chunk store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Disk,
}

/// Chunk store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,

    /// Root directory for the disk backend.
    pub root: PathBuf,

    /// Upper bound on a single chunk's payload when the vault does the chunking.
    pub max_chunk_bytes: usize,

    /// Apply zstd to chunk files on disk.
    pub compress_at_rest: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            root: PathBuf::from("/tmp/tensor-vault"),
            max_chunk_bytes: 4 * 1024 * 1024, // 4 MiB
            compress_at_rest: false,
            zstd_level: 3,
        }
    }
}

/// Tensor catalog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Recompute the checksum on every read.
    pub verify_on_read: bool,

    /// Pending tensors older than this are removed by the retention sweep.
    pub pending_max_age_secs: u64,

    /// Interval of the pending-tensor sweep (0 = disabled).
    pub sweep_interval_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            verify_on_read: false,
            pending_max_age_secs: 3600,
            sweep_interval_secs: 0,
        }
    }
}

/// Activation cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    /// Maximum number of live entries.
    pub capacity: usize,

    /// TTL applied when an insert does not give one (None = no expiry).
    pub default_ttl_secs: Option<u64>,

    /// Interval of the expiry sweep (0 = disabled, expiry is then lazy only).
    pub sweep_interval_secs: u64,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            default_ttl_secs: Some(600),
            sweep_interval_secs: 60,
        }
    }
}

/// KV cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Sessions idle longer than this are ended by the retention sweep.
    pub session_max_age_secs: u64,

    /// Interval of the session retention sweep (0 = disabled).
    pub sweep_interval_secs: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            session_max_age_secs: 1800,
            sweep_interval_secs: 120,
        }
    }
}

fn secs(s: u64) -> Option<Duration> {
    (s > 0).then(|| Duration::from_secs(s))
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the vault cannot run with.
    pub fn validate(&self) -> Result<(), VaultError> {
        if self.store.max_chunk_bytes == 0 {
            return Err(VaultError::InvalidConfig(
                "store.max_chunk_bytes must be positive".into(),
            ));
        }
        if self.activation.capacity == 0 {
            return Err(VaultError::InvalidConfig(
                "activation.capacity must be positive".into(),
            ));
        }
        if !(1..=22).contains(&self.store.zstd_level) {
            return Err(VaultError::InvalidConfig(format!(
                "store.zstd_level {} outside 1..=22",
                self.store.zstd_level
            )));
        }
        Ok(())
    }

    pub fn default_activation_ttl(&self) -> Option<Duration> {
        self.activation.default_ttl_secs.and_then(secs)
    }

    pub fn activation_sweep_interval(&self) -> Option<Duration> {
        secs(self.activation.sweep_interval_secs)
    }

    pub fn kv_sweep_interval(&self) -> Option<Duration> {
        secs(self.kv.sweep_interval_secs)
    }

    pub fn kv_session_max_age(&self) -> Duration {
        Duration::from_secs(self.kv.session_max_age_secs)
    }

    pub fn pending_sweep_interval(&self) -> Option<Duration> {
        secs(self.catalog.sweep_interval_secs)
    }

    pub fn pending_max_age(&self) -> Duration {
        Duration::from_secs(self.catalog.pending_max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.store.backend, Backend::Memory);
        assert_eq!(cfg.store.max_chunk_bytes, 4 * 1024 * 1024);
        assert_eq!(cfg.default_activation_ttl(), Some(Duration::from_secs(600)));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"activation": {"capacity": 2}, "store": {"backend": "disk"}}"#)
                .unwrap();
        assert_eq!(cfg.activation.capacity, 2);
        assert_eq!(cfg.activation.sweep_interval_secs, 60);
        assert_eq!(cfg.store.backend, Backend::Disk);
        assert_eq!(cfg.store.zstd_level, 3);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut cfg = Config::default();
        cfg.activation.capacity = 0;
        assert!(matches!(cfg.validate(), Err(VaultError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_interval_disables_sweep() {
        let mut cfg = Config::default();
        cfg.kv.sweep_interval_secs = 0;
        assert_eq!(cfg.kv_sweep_interval(), None);
    }
}
