use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

/// Fan-out metrics for the real-time gateway.
#[derive(Clone)]
pub struct GatewayMetrics {
    pub active_connections: IntGauge,
    pub messages_delivered: IntCounter,
    pub messages_dropped: IntCounter,
    pub decode_failures: IntCounter,
}

impl GatewayMetrics {
    /// Build the gateway metrics and register them with the default registry.
    ///
    /// A failed registration is logged and the handles keep counting locally.
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();
        let opts = |name: &str, help: &str| {
            Opts::new(name, help).const_label("service", service.to_string())
        };

        let active_connections = IntGauge::with_opts(opts(
            "ws_active_connections",
            "Number of live WebSocket connections on this gateway",
        ))
        .expect("valid metric opts for ws_active_connections");

        let messages_delivered = IntCounter::with_opts(opts(
            "ws_messages_delivered_total",
            "Events enqueued onto a connection's outbound queue",
        ))
        .expect("valid metric opts for ws_messages_delivered_total");

        let messages_dropped = IntCounter::with_opts(opts(
            "ws_messages_dropped_total",
            "Events evicted from a full outbound queue",
        ))
        .expect("valid metric opts for ws_messages_dropped_total");

        let decode_failures = IntCounter::with_opts(opts(
            "ws_event_decode_failures_total",
            "Broadcast messages that could not be decoded and were skipped",
        ))
        .expect("valid metric opts for ws_event_decode_failures_total");

        for metric in [
            Box::new(active_connections.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(messages_delivered.clone()),
            Box::new(messages_dropped.clone()),
            Box::new(decode_failures.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register gateway metric: {}", e);
            }
        }

        Self {
            active_connections,
            messages_delivered,
            messages_dropped,
            decode_failures,
        }
    }
}
