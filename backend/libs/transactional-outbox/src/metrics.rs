use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct OutboxMetrics {
    pub pending: IntGauge,
    pub oldest_pending_age_seconds: IntGauge,
    pub published: IntCounter,
    pub publish_failures: IntCounter,
    pub dead_lettered: IntCounter,
    pub batch_duration_seconds: Histogram,
}

impl OutboxMetrics {
    /// Build the relay metrics and register them with the default registry.
    ///
    /// Registration failures (e.g. a second relay in the same process) are
    /// logged; the returned handles still work, they are just not exported twice.
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();
        let gauge = |name: &str, help: &str| {
            IntGauge::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
        };
        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
        };

        let pending = gauge(
            "outbox_pending_count",
            "Number of unprocessed outbox events that are still eligible for publishing",
        )
        .expect("valid metric opts for outbox_pending_count");

        let oldest_pending_age_seconds = gauge(
            "outbox_oldest_pending_age_seconds",
            "Age in seconds of the oldest pending outbox event",
        )
        .expect("valid metric opts for outbox_oldest_pending_age_seconds");

        let published = counter(
            "outbox_published_total",
            "Total number of outbox events published and marked processed",
        )
        .expect("valid metric opts for outbox_published_total");

        let publish_failures = counter(
            "outbox_publish_failures_total",
            "Total number of failed publish attempts",
        )
        .expect("valid metric opts for outbox_publish_failures_total");

        let dead_lettered = counter(
            "outbox_dead_lettered_total",
            "Total number of outbox events flagged for dead-letter handling",
        )
        .expect("valid metric opts for outbox_dead_lettered_total");

        let batch_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "outbox_batch_duration_seconds",
                "Time spent claiming and publishing one outbox batch",
            )
            .const_label("service", service.to_string())
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .expect("valid metric opts for outbox_batch_duration_seconds");

        for metric in [
            Box::new(pending.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(oldest_pending_age_seconds.clone()),
            Box::new(published.clone()),
            Box::new(publish_failures.clone()),
            Box::new(dead_lettered.clone()),
            Box::new(batch_duration_seconds.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register outbox metric: {}", e);
            }
        }

        Self {
            pending,
            oldest_pending_age_seconds,
            published,
            publish_failures,
            dead_lettered,
            batch_duration_seconds,
        }
    }
}
