//! On-disk chunk store.
//!
//! Each chunk is one file under a sharded directory tree:
//!
//! ```text
//! <root>/chunks/<first two hex chars of tensor id>/<tensor id>/<index>.chunk
//! ```
//!
//! A chunk file is a 16-byte header followed by the payload:
//!
//! | bytes | field                                   |
//! |-------|-----------------------------------------|
//! | 0..4  | magic `TVCK`                            |
//! | 4     | format version (1)                      |
//! | 5     | flags (bit 0: payload is zstd-compressed) |
//! | 6..8  | reserved, zero                          |
//! | 8..16 | element count, little-endian u64        |
//!
//! Files are written to a temporary name and hard-linked into place, so a
//! chunk becomes visible complete or not at all and an existing chunk is
//! never replaced.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{Result, VaultError};
use crate::store::chunk_store::{ChunkPayload, ChunkStore, IoCounters, StoreStats};
use crate::tensor::descriptor::TensorId;

const MAGIC: &[u8; 4] = b"TVCK";
const VERSION: u8 = 1;
const FLAG_ZSTD: u8 = 0b0000_0001;
const HEADER_LEN: usize = 16;
const CHUNK_EXT: &str = "chunk";

/// Chunk store backed by one file per chunk.
pub struct DiskChunkStore {
    /// Directory holding the chunk shards.
    chunk_root: PathBuf,

    /// Compress payloads with zstd before writing.
    compress: bool,

    zstd_level: i32,

    counters: IoCounters,
}

impl DiskChunkStore {
    /// Open (or create) a store rooted at `root`.
    pub async fn open(root: impl AsRef<Path>, compress: bool, zstd_level: i32) -> Result<Self> {
        let chunk_root = root.as_ref().join("chunks");
        fs::create_dir_all(&chunk_root).await?;

        Ok(Self {
            chunk_root,
            compress,
            zstd_level,
            counters: IoCounters::default(),
        })
    }

    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        Self::open(&config.root, config.compress_at_rest, config.zstd_level).await
    }

    fn tensor_dir(&self, tensor: TensorId) -> PathBuf {
        // Two-level layout keeps directory fan-out bounded.
        let simple = tensor.as_uuid().simple().to_string();
        self.chunk_root.join(&simple[..2]).join(simple)
    }

    fn chunk_path(&self, tensor: TensorId, index: u32) -> PathBuf {
        self.tensor_dir(tensor)
            .join(format!("{index:08}.{CHUNK_EXT}"))
    }

    fn encode(&self, data: &[u8], element_count: u64) -> Result<Vec<u8>> {
        let (flags, payload) = if self.compress {
            (FLAG_ZSTD, zstd::encode_all(data, self.zstd_level)?)
        } else {
            (0, data.to_vec())
        };

        let mut file = Vec::with_capacity(HEADER_LEN + payload.len());
        file.extend_from_slice(MAGIC);
        file.push(VERSION);
        file.push(flags);
        file.extend_from_slice(&[0, 0]);
        file.extend_from_slice(&element_count.to_le_bytes());
        file.extend_from_slice(&payload);
        Ok(file)
    }

    fn decode(tensor: TensorId, index: u32, raw: &[u8]) -> Result<ChunkPayload> {
        let corrupt = |actual: String| VaultError::CorruptTensor {
            tensor_id: tensor,
            chunks: index..index + 1,
            expected: "valid chunk header".to_string(),
            actual,
        };

        if raw.len() < HEADER_LEN || raw[..4] != MAGIC[..] {
            return Err(corrupt(format!("{} byte file without magic", raw.len())));
        }
        if raw[4] != VERSION {
            return Err(corrupt(format!("format version {}", raw[4])));
        }

        let mut count = [0u8; 8];
        count.copy_from_slice(&raw[8..HEADER_LEN]);
        let element_count = u64::from_le_bytes(count);

        let payload = &raw[HEADER_LEN..];
        let data = if raw[5] & FLAG_ZSTD != 0 {
            let decompressed =
                zstd::decode_all(payload).map_err(|e| corrupt(format!("zstd: {e}")))?;
            Bytes::from(decompressed)
        } else {
            Bytes::copy_from_slice(payload)
        };
        Ok(ChunkPayload {
            data,
            element_count,
        })
    }

    /// Bytes used by chunk files, headers included.
    pub async fn disk_usage(&self) -> Result<u64> {
        let mut total = 0u64;
        for dir in self.tensor_dirs().await? {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_file() {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }

    async fn tensor_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let mut shards = fs::read_dir(&self.chunk_root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut tensors = fs::read_dir(shard.path()).await?;
            while let Some(tensor) = tensors.next_entry().await? {
                if tensor.file_type().await?.is_dir() {
                    dirs.push(tensor.path());
                }
            }
        }
        Ok(dirs)
    }
}

#[async_trait]
impl ChunkStore for DiskChunkStore {
    async fn put(
        &self,
        tensor: TensorId,
        index: u32,
        data: Bytes,
        element_count: u64,
    ) -> Result<()> {
        let path = self.chunk_path(tensor, index);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = self.encode(&data, element_count)?;
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        // hard_link refuses to overwrite, which makes the slot write-once.
        let linked = match fs::write(&tmp, &file).await {
            Ok(()) => fs::hard_link(&tmp, &path).await,
            Err(e) => Err(e),
        };
        match fs::remove_file(&tmp).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %tmp.display(), error = %e, "Failed to remove temporary chunk file");
            }
        }
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(VaultError::DuplicateChunk {
                    tensor_id: tensor,
                    index,
                });
            }
            Err(e) => return Err(e.into()),
        }

        self.counters.record_write(data.len());
        debug!(
            tensor_id = %tensor,
            chunk = index,
            size = data.len(),
            stored = file.len(),
            path = %path.display(),
            "Wrote chunk to disk"
        );
        Ok(())
    }

    async fn fetch(&self, tensor: TensorId, index: u32) -> Result<ChunkPayload> {
        let path = self.chunk_path(tensor, index);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(VaultError::chunk_not_found(tensor, index));
            }
            Err(e) => return Err(e.into()),
        };

        let payload = Self::decode(tensor, index, &raw)?;
        self.counters.record_read(payload.data.len());
        debug!(
            tensor_id = %tensor,
            chunk = index,
            size = payload.data.len(),
            elements = payload.element_count,
            "Read chunk from disk"
        );
        Ok(payload)
    }

    async fn delete(&self, tensor: TensorId) -> Result<usize> {
        let dir = self.tensor_dir(tensor);
        let removed = self.indices(tensor).await?.len();
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(tensor_id = %tensor, removed, "Deleted chunk directory");
                Ok(removed)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn indices(&self, tensor: TensorId) -> Result<Vec<u32>> {
        let dir = self.tensor_dir(tensor);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CHUNK_EXT) {
                continue;
            }
            if let Some(index) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    async fn tensors(&self) -> Result<Vec<TensorId>> {
        let mut ids = Vec::new();
        for dir in self.tensor_dirs().await? {
            let parsed = dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<TensorId>().ok());
            match parsed {
                Some(id) => ids.push(id),
                None => warn!(path = %dir.display(), "Skipping unrecognised chunk directory"),
            }
        }
        Ok(ids)
    }

    fn stats(&self) -> StoreStats {
        self.counters.snapshot()
    }
}
