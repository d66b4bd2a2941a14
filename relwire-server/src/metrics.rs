//! Prometheus metrics for the relwire server.
//!
//! The registry is rendered in the text exposition format on demand; serving
//! it is left to whoever embeds the server.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

/// Request duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0];

/// Prometheus metrics for the relwire server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total connections accepted, aux channels included.
    pub connections_total: Counter,
    /// Currently open main connections.
    pub connections_active: Gauge,
    /// Packets received by opcode.
    pub packets_total: CounterVec,
    /// Errors reported to clients by status code.
    pub errors_total: CounterVec,
    /// Handler duration by opcode.
    pub operation_duration: HistogramVec,
    /// Failed login attempts.
    pub auth_failures_total: Counter,
    /// Live worker threads.
    pub workers_live: Gauge,
    /// Workers currently running a port.
    pub workers_busy: Gauge,
    /// Ports waiting for a worker.
    pub queue_depth: Gauge,
    /// Event notifications delivered over aux channels.
    pub events_delivered_total: Counter,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "relwire_connections_total",
            "Total number of connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "relwire_connections_active",
            "Number of currently open connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        // Packets
        let packets_total = CounterVec::new(
            Opts::new("relwire_packets_total", "Packets received by opcode"),
            &["opcode"],
        )?;
        registry.register(Box::new(packets_total.clone()))?;

        // Errors
        let errors_total = CounterVec::new(
            Opts::new("relwire_errors_total", "Errors reported by status code"),
            &["code"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "relwire_operation_duration_seconds",
                "Handler duration in seconds by opcode",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["opcode"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let auth_failures_total = Counter::with_opts(Opts::new(
            "relwire_auth_failures_total",
            "Total failed login attempts",
        ))?;
        registry.register(Box::new(auth_failures_total.clone()))?;

        // Worker pool
        let workers_live = Gauge::with_opts(Opts::new(
            "relwire_workers_live",
            "Number of live worker threads",
        ))?;
        registry.register(Box::new(workers_live.clone()))?;

        let workers_busy = Gauge::with_opts(Opts::new(
            "relwire_workers_busy",
            "Number of workers running a connection",
        ))?;
        registry.register(Box::new(workers_busy.clone()))?;

        let queue_depth = Gauge::with_opts(Opts::new(
            "relwire_queue_depth",
            "Connections waiting for a worker",
        ))?;
        registry.register(Box::new(queue_depth.clone()))?;

        let events_delivered_total = Counter::with_opts(Opts::new(
            "relwire_events_delivered_total",
            "Event notifications sent to clients",
        ))?;
        registry.register(Box::new(events_delivered_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            packets_total,
            errors_total,
            operation_duration,
            auth_failures_total,
            workers_live,
            workers_busy,
            queue_depth,
            events_delivered_total,
        })
    }

    /// Renders all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.connections_total.inc();
        metrics.connections_active.set(3.0);
        metrics.packets_total.with_label_values(&["Attach"]).inc();
        metrics.errors_total.with_label_values(&["335544332"]).inc();
        metrics.auth_failures_total.inc();

        let output = metrics.render();
        assert!(output.contains("relwire_connections_total 1"));
        assert!(output.contains("relwire_connections_active 3"));
        assert!(output.contains("relwire_packets_total{opcode=\"Attach\"} 1"));
        assert!(output.contains("relwire_errors_total{code=\"335544332\"} 1"));
        assert!(output.contains("relwire_auth_failures_total 1"));
    }

    #[test]
    fn test_operation_duration() {
        let metrics = Metrics::new().unwrap();
        metrics
            .operation_duration
            .with_label_values(&["Fetch"])
            .observe(0.002);

        let output = metrics.render();
        assert!(output.contains("relwire_operation_duration_seconds_bucket"));
        assert!(output.contains("opcode=\"Fetch\""));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.workers_live.set(2.0);
        assert!(b.render().contains("relwire_workers_live 0"));
    }
}
