//! Prometheus metrics for the vault.
//!
//! Each vault owns its own registry so several instances (and tests) do not
//! collide on the process-global default registry.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::error::Result;

pub struct Metrics {
    registry: Registry,

    pub chunks_written: IntCounter,
    pub chunk_bytes_written: IntCounter,
    pub tensors_finalized: IntCounter,
    pub tensors_deleted: IntCounter,
    pub corrupt_reads: IntCounter,

    pub activation_hits: IntCounter,
    pub activation_misses: IntCounter,
    pub activation_evictions: IntCounter,
    pub activation_expirations: IntCounter,
    pub activation_entries: IntGauge,

    pub kv_entries: IntGauge,
    pub kv_sessions_ended: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("tensor_vault".into()), None)?;

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        Ok(Self {
            chunks_written: counter("chunks_written_total", "Chunks appended to pending tensors")?,
            chunk_bytes_written: counter("chunk_bytes_written_total", "Payload bytes appended")?,
            tensors_finalized: counter("tensors_finalized_total", "Tensors sealed by finalize")?,
            tensors_deleted: counter("tensors_deleted_total", "Tensors deleted or reaped")?,
            corrupt_reads: counter("corrupt_reads_total", "Reads that failed verification")?,
            activation_hits: counter("activation_hits_total", "Activation cache hits")?,
            activation_misses: counter("activation_misses_total", "Activation cache misses")?,
            activation_evictions: counter(
                "activation_evictions_total",
                "Activation entries evicted for capacity",
            )?,
            activation_expirations: counter(
                "activation_expirations_total",
                "Activation entries dropped after their TTL",
            )?,
            activation_entries: gauge("activation_entries", "Live activation cache entries")?,
            kv_entries: gauge("kv_entries", "Live KV cache entries across sessions")?,
            kv_sessions_ended: counter("kv_sessions_ended_total", "KV sessions torn down")?,
            registry,
        })
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
