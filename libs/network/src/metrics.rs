//! Client Metrics
//!
//! Producers and consumers report through a [`MetricsCollector`]. The
//! default collector does nothing; [`CountingMetricsCollector`] keeps atomic
//! totals for tests and diagnostics, and the Prometheus collector (feature
//! `monitoring`) exports them to a registry.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Sink for client-side events
pub trait MetricsCollector: Send + Sync + fmt::Debug {
    /// Messages handed to a connection for publishing
    fn publish(&self, count: u64);

    /// Messages confirmed by the broker
    fn publish_confirm(&self, count: u64);

    /// Messages rejected by the broker or failed locally
    fn publish_error(&self, count: u64);

    /// Chunk received, with its entry count
    fn chunk(&self, entries: u64);

    /// Messages dispatched to a consumer handler
    fn consume(&self, count: u64);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsCollector;

impl MetricsCollector for NoopMetricsCollector {
    fn publish(&self, _count: u64) {}
    fn publish_confirm(&self, _count: u64) {}
    fn publish_error(&self, _count: u64) {}
    fn chunk(&self, _entries: u64) {}
    fn consume(&self, _count: u64) {}
}

/// Point-in-time copy of [`CountingMetricsCollector`] totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub confirmed: u64,
    pub errored: u64,
    pub chunks: u64,
    pub chunk_entries: u64,
    pub consumed: u64,
    /// Published but neither confirmed nor errored yet
    pub outstanding_confirms: i64,
}

/// Lock-free totals
#[derive(Debug, Default)]
pub struct CountingMetricsCollector {
    published: AtomicU64,
    confirmed: AtomicU64,
    errored: AtomicU64,
    chunks: AtomicU64,
    chunk_entries: AtomicU64,
    consumed: AtomicU64,
    outstanding_confirms: AtomicI64,
}

impl CountingMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Acquire),
            confirmed: self.confirmed.load(Ordering::Acquire),
            errored: self.errored.load(Ordering::Acquire),
            chunks: self.chunks.load(Ordering::Acquire),
            chunk_entries: self.chunk_entries.load(Ordering::Acquire),
            consumed: self.consumed.load(Ordering::Acquire),
            outstanding_confirms: self.outstanding_confirms.load(Ordering::Acquire),
        }
    }
}

impl MetricsCollector for CountingMetricsCollector {
    #[inline]
    fn publish(&self, count: u64) {
        self.published.fetch_add(count, Ordering::Release);
        self.outstanding_confirms
            .fetch_add(count as i64, Ordering::Release);
    }

    #[inline]
    fn publish_confirm(&self, count: u64) {
        self.confirmed.fetch_add(count, Ordering::Release);
        self.outstanding_confirms
            .fetch_sub(count as i64, Ordering::Release);
    }

    #[inline]
    fn publish_error(&self, count: u64) {
        self.errored.fetch_add(count, Ordering::Release);
        self.outstanding_confirms
            .fetch_sub(count as i64, Ordering::Release);
    }

    #[inline]
    fn chunk(&self, entries: u64) {
        self.chunks.fetch_add(1, Ordering::Release);
        self.chunk_entries.fetch_add(entries, Ordering::Release);
    }

    #[inline]
    fn consume(&self, count: u64) {
        self.consumed.fetch_add(count, Ordering::Release);
    }
}

#[cfg(feature = "monitoring")]
pub use self::prometheus_collector::PrometheusMetricsCollector;

#[cfg(feature = "monitoring")]
mod prometheus_collector {
    use super::MetricsCollector;
    use crate::{Result, TransportError};
    use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};

    /// Metric name prefix when none is given
    pub const DEFAULT_PREFIX: &str = "stream";

    /// Exports client events to a Prometheus registry
    #[derive(Debug, Clone)]
    pub struct PrometheusMetricsCollector {
        published: IntCounter,
        confirmed: IntCounter,
        errored: IntCounter,
        chunks: IntCounter,
        chunk_size: Histogram,
        consumed: IntCounter,
        outstanding_confirms: IntGauge,
    }

    fn monitoring(error: prometheus::Error) -> TransportError {
        TransportError::monitoring_with_source("failed to register stream client metric", error)
    }

    impl PrometheusMetricsCollector {
        pub fn new(registry: &Registry) -> Result<Self> {
            Self::with_prefix(registry, DEFAULT_PREFIX)
        }

        pub fn with_prefix(registry: &Registry, prefix: &str) -> Result<Self> {
            let counter = |name: &str, help: &str| -> Result<IntCounter> {
                let counter =
                    IntCounter::new(format!("{}_{}", prefix, name), help).map_err(monitoring)?;
                registry
                    .register(Box::new(counter.clone()))
                    .map_err(monitoring)?;
                Ok(counter)
            };

            let published = counter("published_total", "Messages published")?;
            let confirmed = counter("confirmed_total", "Messages confirmed")?;
            let errored = counter("errored_total", "Messages failed to publish")?;
            let chunks = counter("chunks_total", "Chunks received")?;
            let consumed = counter("consumed_total", "Messages consumed")?;

            let chunk_size = Histogram::with_opts(
                HistogramOpts::new(format!("{}_chunk_size", prefix), "Entries per chunk")
                    .buckets(vec![1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
            )
            .map_err(monitoring)?;
            registry
                .register(Box::new(chunk_size.clone()))
                .map_err(monitoring)?;

            let outstanding_confirms = IntGauge::new(
                format!("{}_outstanding_publish_confirm", prefix),
                "Messages awaiting confirmation",
            )
            .map_err(monitoring)?;
            registry
                .register(Box::new(outstanding_confirms.clone()))
                .map_err(monitoring)?;

            Ok(Self {
                published,
                confirmed,
                errored,
                chunks,
                chunk_size,
                consumed,
                outstanding_confirms,
            })
        }
    }

    impl MetricsCollector for PrometheusMetricsCollector {
        fn publish(&self, count: u64) {
            self.published.inc_by(count);
            self.outstanding_confirms.add(count as i64);
        }

        fn publish_confirm(&self, count: u64) {
            self.confirmed.inc_by(count);
            self.outstanding_confirms.sub(count as i64);
        }

        fn publish_error(&self, count: u64) {
            self.errored.inc_by(count);
            self.outstanding_confirms.sub(count as i64);
        }

        fn chunk(&self, entries: u64) {
            self.chunks.inc();
            self.chunk_size.observe(entries as f64);
        }

        fn consume(&self, count: u64) {
            self.consumed.inc_by(count);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_registers_and_counts() {
            let registry = Registry::new();
            let collector = PrometheusMetricsCollector::new(&registry).unwrap();
            collector.publish(3);
            collector.publish_confirm(2);
            collector.chunk(10);

            let families = registry.gather();
            let names: Vec<&str> = families.iter().map(|family| family.get_name()).collect();
            assert!(names.contains(&"stream_published_total"));
            assert!(names.contains(&"stream_chunk_size"));
            assert_eq!(collector.outstanding_confirms.get(), 1);

            // Same names twice in one registry is rejected
            assert!(PrometheusMetricsCollector::new(&registry).is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_collector_tracks_outstanding() {
        let metrics = CountingMetricsCollector::new();
        metrics.publish(5);
        metrics.publish_confirm(3);
        metrics.publish_error(1);
        metrics.chunk(4);
        metrics.chunk(6);
        metrics.consume(10);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.published, 5);
        assert_eq!(snapshot.confirmed, 3);
        assert_eq!(snapshot.errored, 1);
        assert_eq!(snapshot.outstanding_confirms, 1);
        assert_eq!(snapshot.chunks, 2);
        assert_eq!(snapshot.chunk_entries, 10);
        assert_eq!(snapshot.consumed, 10);
    }
}
