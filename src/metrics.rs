#![forbid(unsafe_code)]

// Server metrics: lock-free AtomicU64 counters and Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Fixed histogram bucket boundaries (in microseconds for internal storage).
const BUCKET_BOUNDS_US: [u64; 10] = [
    1_000,      // 1ms
    5_000,      // 5ms
    10_000,     // 10ms
    25_000,     // 25ms
    50_000,     // 50ms
    100_000,    // 100ms
    250_000,    // 250ms
    500_000,    // 500ms
    1_000_000,  // 1s
    5_000_000,  // 5s
];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    /// Cumulative bucket counters: bucket[i] counts observations <= BUCKET_BOUNDS_US[i]
    buckets: [AtomicU64; 10],
    /// +Inf bucket (total count)
    count: AtomicU64,
    /// Sum of all observations in microseconds
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    /// Record a duration observation.
    pub fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (i, &bound) in BUCKET_BOUNDS_US.iter().enumerate() {
            if us <= bound {
                self.buckets[i].fetch_add(1, Relaxed);
            }
        }
    }

    /// Render in Prometheus text exposition format.
    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");

        let labels = [
            "0.001", "0.005", "0.01", "0.025", "0.05",
            "0.1", "0.25", "0.5", "1", "5",
        ];
        for (i, label) in labels.iter().enumerate() {
            let val = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        // Convert microseconds to seconds with 6 decimal places
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    // Monotonic counters
    connections_total: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    joins_total: AtomicU64,
    disconnects_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,
    consumers_closed_total: AtomicU64,
    capability_mismatches_total: AtomicU64,
    reconciliations_total: AtomicU64,

    // Gauge
    connections_active: AtomicU64,

    // Histogram
    message_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connections_total: AtomicU64::new(0),
                messages_received_total: AtomicU64::new(0),
                messages_sent_total: AtomicU64::new(0),
                errors_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                disconnects_total: AtomicU64::new(0),
                producers_created_total: AtomicU64::new(0),
                consumers_created_total: AtomicU64::new(0),
                consumers_closed_total: AtomicU64::new(0),
                capability_mismatches_total: AtomicU64::new(0),
                reconciliations_total: AtomicU64::new(0),
                connections_active: AtomicU64::new(0),
                message_handling: Histogram::new(),
            }),
        }
    }

    // --- Counter increments ---

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_disconnects(&self) {
        self.inner.disconnects_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers_created(&self) {
        self.inner.consumers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers_closed(&self) {
        self.inner.consumers_closed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_capability_mismatches(&self) {
        self.inner.capability_mismatches_total.fetch_add(1, Relaxed);
    }

    pub fn inc_reconciliations(&self) {
        self.inner.reconciliations_total.fetch_add(1, Relaxed);
    }

    // --- Reads ---

    pub fn joins(&self) -> u64 {
        self.inner.joins_total.load(Relaxed)
    }

    pub fn disconnects(&self) -> u64 {
        self.inner.disconnects_total.load(Relaxed)
    }

    pub fn producers_created(&self) -> u64 {
        self.inner.producers_created_total.load(Relaxed)
    }

    pub fn consumers_closed(&self) -> u64 {
        self.inner.consumers_closed_total.load(Relaxed)
    }

    pub fn capability_mismatches(&self) -> u64 {
        self.inner.capability_mismatches_total.load(Relaxed)
    }

    pub fn reconciliations(&self) -> u64 {
        self.inner.reconciliations_total.load(Relaxed)
    }

    // --- Gauge ---

    /// Increments connections_active and returns an RAII guard that decrements on drop.
    /// This guarantees the gauge is decremented even if the caller panics.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard { inner: self.inner.clone() }
    }

    // --- Histogram ---

    pub fn observe_message_handling(&self, duration: Duration) {
        self.inner.message_handling.observe(duration);
    }

    // --- Prometheus rendering ---

    /// Render all metrics in Prometheus text exposition format.
    /// Entity gauges are passed in from the world registry (on-demand).
    pub fn render_prometheus(&self, participants: usize, producers: usize, consumers: usize) -> String {
        let mut out = String::with_capacity(4096);

        let i = &self.inner;

        // Counters
        render_counter(&mut out, "proximity_chat_connections_total", "Total WebSocket connections", i.connections_total.load(Relaxed));
        render_counter(&mut out, "proximity_chat_messages_received_total", "Total messages received from clients", i.messages_received_total.load(Relaxed));
        render_counter(&mut out, "proximity_chat_messages_sent_total", "Total messages sent to clients", i.messages_sent_total.load(Relaxed));
        render_counter(&mut out, "proximity_chat_errors_total", "Total errors", i.errors_total.load(Relaxed));
        render_counter(&mut out, "proximity_chat_joins_total", "Total world joins", i.joins_total.load(Relaxed));
        render_counter(&mut out, "proximity_chat_disconnects_total", "Total participant disconnects", i.disconnects_total.load(Relaxed));
        render_counter(&mut out, "proximity_chat_producers_created_total", "Total producers created", i.producers_created_total.load(Relaxed));
        render_counter(&mut out, "proximity_chat_consumers_created_total", "Total consumers created", i.consumers_created_total.load(Relaxed));
        render_counter(&mut out, "proximity_chat_consumers_closed_total", "Total consumers closed", i.consumers_closed_total.load(Relaxed));
        render_counter(&mut out, "proximity_chat_capability_mismatches_total", "Pairs skipped because canConsume was false", i.capability_mismatches_total.load(Relaxed));
        render_counter(&mut out, "proximity_chat_reconciliations_total", "Subscription reconcile passes", i.reconciliations_total.load(Relaxed));

        // Gauges
        render_gauge(&mut out, "proximity_chat_connections_active", "Currently active WebSocket connections", i.connections_active.load(Relaxed));
        render_gauge(&mut out, "proximity_chat_participants_active", "Currently joined participants", participants as u64);
        render_gauge(&mut out, "proximity_chat_producers_active", "Currently registered producers", producers as u64);
        render_gauge(&mut out, "proximity_chat_consumers_active", "Currently registered consumers", consumers as u64);

        // Histogram
        i.message_handling.render(
            "proximity_chat_message_handling_seconds",
            "Message handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// RAII guard that decrements `connections_active` on drop.
/// Prevents gauge underflow/drift if the connection handler panics.
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_prometheus() {
        let metrics = ServerMetrics::new();
        metrics.inc_joins();
        metrics.inc_consumers_closed();
        metrics.inc_consumers_closed();
        metrics.observe_message_handling(Duration::from_millis(3));

        let out = metrics.render_prometheus(4, 2, 6);
        assert!(out.contains("proximity_chat_joins_total 1\n"));
        assert!(out.contains("proximity_chat_consumers_closed_total 2\n"));
        assert!(out.contains("proximity_chat_consumers_active 6\n"));
        assert!(out.contains("proximity_chat_message_handling_seconds_bucket{le=\"0.001\"} 0\n"));
        assert!(out.contains("proximity_chat_message_handling_seconds_bucket{le=\"0.005\"} 1\n"));
        assert!(out.contains("proximity_chat_message_handling_seconds_sum 0.003000\n"));
    }

    #[test]
    fn test_connection_guard_restores_gauge() {
        let metrics = ServerMetrics::new();
        {
            let _a = metrics.connection_active_guard();
            let _b = metrics.connection_active_guard();
            assert!(metrics.render_prometheus(0, 0, 0).contains("proximity_chat_connections_active 2\n"));
        }
        assert!(metrics.render_prometheus(0, 0, 0).contains("proximity_chat_connections_active 0\n"));
    }
}
