//! Global atomic counters for engine observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a batch of verifications ends).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    pipelines_started: AtomicU64,
    cache_hits: AtomicU64,
    inflight_attaches: AtomicU64,
    layers_degraded: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            pipelines_started: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            inflight_attaches: AtomicU64::new(0),
            layers_degraded: AtomicU64::new(0),
        }
    }

    /// A pipeline run acquired its permit and started.
    pub fn inc_pipelines_started(&self) {
        self.pipelines_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "pipelines_started", "counter incremented");
    }

    /// A request was answered from a cached report.
    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    /// A request attached to an in-flight run.
    pub fn inc_inflight_attaches(&self) {
        self.inflight_attaches.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "inflight_attaches", "counter incremented");
    }

    /// A layer ended on its fallback score.
    pub fn inc_layers_degraded(&self) {
        self.layers_degraded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "layers_degraded", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            pipelines_started = self.pipelines_started(),
            cache_hits = self.cache_hits(),
            inflight_attaches = self.inflight_attaches(),
            layers_degraded = self.layers_degraded(),
        );
    }

    pub fn pipelines_started(&self) -> u64 {
        self.pipelines_started.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn inflight_attaches(&self) -> u64 {
        self.inflight_attaches.load(Ordering::Relaxed)
    }

    pub fn layers_degraded(&self) -> u64 {
        self.layers_degraded.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.pipelines_started.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.inflight_attaches.store(0, Ordering::Relaxed);
        self.layers_degraded.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_pipelines_started();
        m.inc_cache_hits();
        m.inc_cache_hits();
        m.inc_inflight_attaches();
        m.inc_layers_degraded();
        m.inc_layers_degraded();
        m.inc_layers_degraded();
        assert_eq!(m.pipelines_started(), 1);
        assert_eq!(m.cache_hits(), 2);
        assert_eq!(m.inflight_attaches(), 1);
        assert_eq!(m.layers_degraded(), 3);
        m.flush();
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_pipelines_started();
        m.inc_layers_degraded();
        m.reset();
        assert_eq!(m.pipelines_started(), 0);
        assert_eq!(m.layers_degraded(), 0);
    }
}
