//! The process-wide vault: chunk store, catalog and both caches.
//!
//! `TensorVault::open` wires the components from a [`Config`] and, for the
//! disk backend, restores finalized tensors from their manifests. Background
//! sweeps (activation expiry, stale KV sessions, abandoned pending tensors)
//! run only when started and stop on [`TensorVault::shutdown`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::activation::{ActivationCache, ActivationKey};
use crate::cache::kv::KvCache;
use crate::catalog::tensor_catalog::TensorCatalog;
use crate::config::{Backend, Config};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::store::chunk_store::{ChunkStore, MemoryChunkStore};
use crate::store::disk::DiskChunkStore;
use crate::store::manifest::ManifestStore;
use crate::tensor::descriptor::{TensorId, TensorSpec};

pub struct TensorVault {
    config: Config,
    store: Arc<dyn ChunkStore>,
    catalog: Arc<TensorCatalog>,
    activation: Arc<ActivationCache>,
    kv: Arc<KvCache>,
    metrics: Arc<Metrics>,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

impl TensorVault {
    /// Build a vault from `config`, restoring durable state if any.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new()?);

        let (store, catalog): (Arc<dyn ChunkStore>, TensorCatalog) = match config.store.backend {
            Backend::Memory => {
                let store: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());
                let catalog = TensorCatalog::new(store.clone(), &config, metrics.clone());
                (store, catalog)
            }
            Backend::Disk => {
                let store: Arc<dyn ChunkStore> =
                    Arc::new(DiskChunkStore::from_config(&config.store).await?);
                let manifests = ManifestStore::open(&config.store.root).await?;
                let catalog = TensorCatalog::new(store.clone(), &config, metrics.clone())
                    .with_manifests(manifests);
                (store, catalog)
            }
        };
        let catalog = Arc::new(catalog);
        let (restored, orphans) = catalog.restore().await?;

        let activation = Arc::new(ActivationCache::new(catalog.clone(), &config, metrics.clone()));
        let kv = Arc::new(KvCache::new(catalog.clone(), metrics.clone()));

        info!(
            backend = ?config.store.backend,
            max_chunk_bytes = config.store.max_chunk_bytes,
            activation_capacity = activation.capacity(),
            restored,
            orphans,
            "Tensor vault opened"
        );

        Ok(Self {
            config,
            store,
            catalog,
            activation,
            kv,
            metrics,
            sweepers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<TensorCatalog> {
        &self.catalog
    }

    pub fn activation(&self) -> &Arc<ActivationCache> {
        &self.activation
    }

    pub fn kv(&self) -> &Arc<KvCache> {
        &self.kv
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Store a whole buffer as a finalized tensor.
    pub async fn store_tensor(&self, spec: TensorSpec, data: impl Into<Bytes>) -> Result<TensorId> {
        self.catalog.write_tensor(spec, data).await
    }

    /// Cached activation for `key`, or run `compute` and cache its result.
    pub async fn get_or_compute_activation<F, Fut>(
        &self,
        key: ActivationKey,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<TensorId>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TensorId>>,
    {
        self.activation.get_or_compute(key, ttl, compute).await
    }

    /// Spawn the configured periodic sweeps. Intervals of 0 are skipped.
    pub async fn start_sweepers(&self) {
        let mut sweepers = self.sweepers.lock().await;
        if !sweepers.is_empty() {
            return;
        }

        if let Some(every) = self.config.activation_sweep_interval() {
            let activation = self.activation.clone();
            let catalog = self.catalog.clone();
            sweepers.push(spawn_periodic("activation_expiry", every, move || {
                let activation = activation.clone();
                let catalog = catalog.clone();
                async move {
                    activation.sweep_expired().await;
                    catalog.reap_unreferenced().await.map(|_| ())
                }
            }));
        }

        if let Some(every) = self.config.kv_sweep_interval() {
            let kv = self.kv.clone();
            let max_age = self.config.kv_session_max_age();
            sweepers.push(spawn_periodic("kv_retention", every, move || {
                let kv = kv.clone();
                async move { kv.sweep_stale_sessions(max_age).await.map(|_| ()) }
            }));
        }

        if let Some(every) = self.config.pending_sweep_interval() {
            let catalog = self.catalog.clone();
            let max_age = self.config.pending_max_age();
            sweepers.push(spawn_periodic("pending_retention", every, move || {
                let catalog = catalog.clone();
                async move { catalog.sweep_stale_pending(max_age).await.map(|_| ()) }
            }));
        }

        info!(sweepers = sweepers.len(), "Background sweeps started");
    }

    /// Stop background sweeps and drop every in-memory index.
    ///
    /// Durable chunk data and manifests are left as they are.
    pub async fn shutdown(&self) {
        for handle in self.sweepers.lock().await.drain(..) {
            handle.abort();
        }
        self.activation.clear().await;
        self.kv.clear().await;
        self.catalog.clear_index().await;
        info!("Tensor vault shut down");
    }
}

fn spawn_periodic<F, Fut>(name: &'static str, every: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            debug!(sweep = name, "Running sweep");
            if let Err(e) = tick().await {
                warn!(sweep = name, error = %e, "Sweep failed");
            }
        }
    })
}
