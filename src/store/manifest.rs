//! Persisted manifests of finalized tensors.
//!
//! The disk backend writes one JSON manifest per finalized tensor so a
//! reopened vault can rebuild its catalog. Pending tensors are never
//! persisted; their chunk directories are orphans after a restart.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::Result;
use crate::tensor::descriptor::{ChunkMeta, TensorDescriptor, TensorId};

/// What a manifest file holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub descriptor: TensorDescriptor,
    pub chunks: Vec<ChunkMeta>,
}

/// Directory of manifest files.
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let dir = root.as_ref().join("manifests");
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path(&self, id: TensorId) -> PathBuf {
        self.dir.join(format!("{}.json", id.as_uuid().simple()))
    }

    /// Write (or replace) the manifest for a tensor.
    pub async fn save(&self, manifest: &Manifest) -> Result<()> {
        let path = self.path(manifest.descriptor.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(manifest)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        debug!(tensor_id = %manifest.descriptor.id, "Saved manifest");
        Ok(())
    }

    pub async fn remove(&self, id: TensorId) -> Result<()> {
        match fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every readable manifest. Unparseable files are skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<Manifest>> {
        let mut manifests = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = fs::read(&path).await?;
            match serde_json::from_slice::<Manifest>(&data) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable manifest"),
            }
        }
        Ok(manifests)
    }
}
