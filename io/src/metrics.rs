use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics shared by the [crate::ScanRange]s of a process (or of a single query).
#[derive(Debug)]
pub struct Metrics {
    pub reads: Counter,
    pub read_bytes: Counter,
    pub reads_in_flight: Gauge,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub blocked_on_buffer: Counter,
    pub cancelled: Counter,
}

impl Metrics {
    /// Initialize the `Metrics` struct and register the metrics in the provided registry.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            reads: Counter::default(),
            read_bytes: Counter::default(),
            reads_in_flight: Gauge::default(),
            cache_hits: Counter::default(),
            cache_misses: Counter::default(),
            blocked_on_buffer: Counter::default(),
            cancelled: Counter::default(),
        };

        registry.register(
            "scan_range_reads",
            "Total number of buffers filled from disk",
            metrics.reads.clone(),
        );
        registry.register(
            "scan_range_read_bytes",
            "Total amount of data read into scan range buffers",
            metrics.read_bytes.clone(),
        );
        registry.register(
            "scan_range_reads_in_flight",
            "Number of reads currently executing",
            metrics.reads_in_flight.clone(),
        );
        registry.register(
            "scan_range_cache_hits",
            "Total number of ranges served entirely from the cache",
            metrics.cache_hits.clone(),
        );
        registry.register(
            "scan_range_cache_misses",
            "Total number of cache lookups that fell back to disk",
            metrics.cache_misses.clone(),
        );
        registry.register(
            "scan_range_blocked_on_buffer",
            "Total number of reads that found no buffer available",
            metrics.blocked_on_buffer.clone(),
        );
        registry.register(
            "scan_range_cancelled",
            "Total number of ranges cancelled or failed",
            metrics.cancelled.clone(),
        );

        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_metrics_registered() {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        metrics.reads.inc();
        metrics.read_bytes.inc_by(42);

        let mut encoded = String::new();
        encode(&mut encoded, &registry).unwrap();
        assert!(encoded.contains("scan_range_reads_total 1"));
        assert!(encoded.contains("scan_range_read_bytes_total 42"));
        assert!(encoded.contains("scan_range_reads_in_flight 0"));
    }
}
