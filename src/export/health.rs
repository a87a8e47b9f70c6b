use anyhow::Result;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry,
};

const NAMESPACE: &str = "wattscope";

/// Prometheus metrics for agent health, registered on a long-lived registry
/// and served alongside the attribution families.
pub struct HealthMetrics {
    registry: Registry,

    /// Total collection ticks completed.
    pub ticks_total: Counter,
    /// Time spent in one collection tick.
    pub tick_duration: Histogram,
    /// Source read failures by source.
    pub source_errors: CounterVec,
    /// Container records currently tracked.
    pub containers_tracked: Gauge,
    /// Total scrape requests served.
    pub scrapes_total: Counter,
    /// Sequence number of the published snapshot.
    pub snapshot_sequence: Gauge,
}

impl HealthMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let ticks_total = Counter::with_opts(
            Opts::new("ticks_total", "Total collection ticks completed.").namespace(NAMESPACE),
        )?;
        let tick_duration = Histogram::with_opts(
            HistogramOpts::new("tick_duration_seconds", "Time spent in one collection tick.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 3.0]),
        )?;
        let source_errors = CounterVec::new(
            Opts::new("source_errors_total", "Source read failures by source.")
                .namespace(NAMESPACE),
            &["source"],
        )?;
        let containers_tracked = Gauge::with_opts(
            Opts::new("containers_tracked", "Container records currently tracked.")
                .namespace(NAMESPACE),
        )?;
        let scrapes_total = Counter::with_opts(
            Opts::new("scrapes_total", "Total scrape requests served.").namespace(NAMESPACE),
        )?;
        let snapshot_sequence = Gauge::with_opts(
            Opts::new(
                "snapshot_sequence",
                "Sequence number of the published snapshot.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(ticks_total.clone()))?;
        registry.register(Box::new(tick_duration.clone()))?;
        registry.register(Box::new(source_errors.clone()))?;
        registry.register(Box::new(containers_tracked.clone()))?;
        registry.register(Box::new(scrapes_total.clone()))?;
        registry.register(Box::new(snapshot_sequence.clone()))?;

        Ok(Self {
            registry,
            ticks_total,
            tick_duration,
            source_errors,
            containers_tracked,
            scrapes_total,
            snapshot_sequence,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_gather() {
        let health = HealthMetrics::new().expect("metrics build");
        health.ticks_total.inc();
        health.source_errors.with_label_values(&["tracing"]).inc();

        let families = health.registry().gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"wattscope_ticks_total"));
        assert!(names.contains(&"wattscope_source_errors_total"));
    }
}
