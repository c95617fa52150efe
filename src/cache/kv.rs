//! Per-session KV cache for autoregressive decoding.
//!
//! Entries are keyed by (session, layer, position) and written once. Each
//! session has its own lock, so decoding steps in different sessions never
//! contend. Every entry holds a catalog reference on both of its tensors;
//! ending a session drops those references and reaps cache-owned tensors
//! nothing else uses.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::tensor_catalog::TensorCatalog;
use crate::error::{Result, VaultError};
use crate::metrics::Metrics;
use crate::tensor::descriptor::TensorId;

/// Identifier of an inference session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Key and value tensors cached for one (layer, position).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvEntry {
    pub key: TensorId,
    pub value: TensorId,
}

struct KvSession {
    /// layer -> position -> entry
    layers: HashMap<u32, BTreeMap<u32, KvEntry>>,
    entries: usize,
    last_write: Instant,
    /// Set once the session is torn down; writers holding a stale handle retry.
    closed: bool,
}

impl KvSession {
    fn new() -> Self {
        Self {
            layers: HashMap::new(),
            entries: 0,
            last_write: Instant::now(),
            closed: false,
        }
    }
}

pub struct KvCache {
    catalog: Arc<TensorCatalog>,
    sessions: RwLock<HashMap<SessionId, Arc<RwLock<KvSession>>>>,
    metrics: Arc<Metrics>,
}

impl KvCache {
    pub fn new(catalog: Arc<TensorCatalog>, metrics: Arc<Metrics>) -> Self {
        Self {
            catalog,
            sessions: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    async fn session(&self, id: SessionId) -> Option<Arc<RwLock<KvSession>>> {
        self.sessions.read().await.get(&id).cloned()
    }

    async fn session_or_create(&self, id: SessionId) -> Arc<RwLock<KvSession>> {
        if let Some(session) = self.session(id).await {
            return session;
        }
        self.sessions
            .write()
            .await
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(KvSession::new())))
            .clone()
    }

    /// Record the key/value tensors for one position.
    ///
    /// Fails with `DuplicatePosition` if the triple already has an entry.
    /// Positions are expected to grow per layer; a position below the
    /// layer's highest is accepted but logged.
    pub async fn put(
        &self,
        session: SessionId,
        layer: u32,
        position: u32,
        key: TensorId,
        value: TensorId,
    ) -> Result<()> {
        loop {
            let handle = self.session_or_create(session).await;
            let mut state = handle.write().await;
            if state.closed {
                continue;
            }

            let positions = state.layers.entry(layer).or_default();
            if positions.contains_key(&position) {
                return Err(VaultError::DuplicatePosition {
                    session: session.to_string(),
                    layer,
                    position,
                });
            }
            if let Some((&last, _)) = positions.last_key_value() {
                if position < last {
                    warn!(%session, layer, position, last, "KV position written out of order");
                }
            }

            self.catalog.retain(key).await?;
            if let Err(e) = self.catalog.retain(value).await {
                self.catalog.release(key).await;
                return Err(e);
            }

            state
                .layers
                .entry(layer)
                .or_default()
                .insert(position, KvEntry { key, value });
            state.entries += 1;
            state.last_write = Instant::now();
            self.metrics.kv_entries.inc();
            return Ok(());
        }
    }

    /// Cached tensors for a position, or `None` for a cold position.
    pub async fn get(&self, session: SessionId, layer: u32, position: u32) -> Option<KvEntry> {
        let handle = self.session(session).await?;
        let state = handle.read().await;
        state.layers.get(&layer)?.get(&position).copied()
    }

    /// Next position to fill for a layer (0 for an empty layer).
    pub async fn next_position(&self, session: SessionId, layer: u32) -> u32 {
        let Some(handle) = self.session(session).await else {
            return 0;
        };
        let state = handle.read().await;
        state
            .layers
            .get(&layer)
            .and_then(|p| p.last_key_value())
            .map_or(0, |(&last, _)| last.saturating_add(1))
    }

    /// Number of entries held for a session across all layers.
    pub async fn session_len(&self, session: SessionId) -> usize {
        match self.session(session).await {
            Some(handle) => handle.read().await.entries,
            None => 0,
        }
    }

    pub async fn sessions(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Remove every entry of a session and reap the tensors it alone kept
    /// alive. Returns the number of entries removed.
    pub async fn end_session(&self, session: SessionId) -> Result<usize> {
        let Some(handle) = self.sessions.write().await.remove(&session) else {
            return Ok(0);
        };
        let entries = {
            let mut state = handle.write().await;
            state.closed = true;
            state.entries = 0;
            std::mem::take(&mut state.layers)
        };
        let entries: Vec<KvEntry> = entries
            .into_values()
            .flat_map(|positions| positions.into_values())
            .collect();

        self.metrics.kv_entries.sub(entries.len() as i64);
        self.metrics.kv_sessions_ended.inc();

        let mut first_error = None;
        let mut reaped = 0usize;
        for entry in &entries {
            for tensor in [entry.key, entry.value] {
                match self.catalog.release_and_reap(tensor).await {
                    Ok(true) => reaped += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(%session, tensor_id = %tensor, error = %e, "Failed to reap KV tensor");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        debug!(%session, entries = entries.len(), reaped, "Ended KV session");
        match first_error {
            Some(e) => Err(e),
            None => Ok(entries.len()),
        }
    }

    /// End every session idle for longer than `max_age`.
    pub async fn sweep_stale_sessions(&self, max_age: Duration) -> Result<usize> {
        let handles: Vec<(SessionId, Arc<RwLock<KvSession>>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();

        let mut stale = Vec::new();
        for (id, handle) in handles {
            if handle.read().await.last_write.elapsed() > max_age {
                stale.push(id);
            }
        }

        for id in &stale {
            self.end_session(*id).await?;
        }
        if !stale.is_empty() {
            info!(sessions = stale.len(), max_age_secs = max_age.as_secs(), "Swept stale KV sessions");
        }
        Ok(stale.len())
    }

    /// Drop every session and release its references without reaping.
    pub async fn clear(&self) {
        let handles: Vec<Arc<RwLock<KvSession>>> =
            self.sessions.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            let layers = {
                let mut state = handle.write().await;
                state.closed = true;
                state.entries = 0;
                std::mem::take(&mut state.layers)
            };
            for entry in layers.into_values().flat_map(|p| p.into_values()) {
                self.catalog.release(entry.key).await;
                self.catalog.release(entry.value).await;
            }
        }
        self.metrics.kv_entries.set(0);
    }
}
