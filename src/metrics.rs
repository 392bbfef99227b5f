//! Runtime metrics
//!
//! Counters and gauges with Prometheus text rendering. Exposition is
//! left to the embedding process; [`export_standard`] renders the
//! framework's own metric set.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
    help: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
            help,
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name,
            self.help,
            self.name,
            self.name,
            self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: &'static str,
    help: &'static str,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name,
            help,
        }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name,
            self.help,
            self.name,
            self.name,
            self.get()
        )
    }
}

/// Standard framework metrics
pub mod standard {
    use super::*;

    pub static CURRENT_EPOCH: Gauge =
        Gauge::new("cascade_current_epoch", "Epoch this node last entered");

    pub static SLOT_CLAIMS: Counter = Counter::new(
        "cascade_slot_claims_total",
        "Task slots claimed at bootstrap",
    );

    pub static SLOT_REJOINS: Counter = Counter::new(
        "cascade_slot_rejoins_total",
        "Lease losses followed by a rejoin attempt",
    );

    pub static DATA_REQUESTS_SENT: Counter = Counter::new(
        "cascade_data_requests_sent_total",
        "Neighbor data requests issued",
    );

    pub static DATA_REQUESTS_SERVED: Counter = Counter::new(
        "cascade_data_requests_served_total",
        "Neighbor data requests answered with a payload",
    );

    pub static EPOCH_MISMATCHES: Counter = Counter::new(
        "cascade_epoch_mismatches_total",
        "Data exchanges rejected for carrying the wrong epoch",
    );
}

/// Render every standard metric in Prometheus text format.
pub fn export_standard() -> String {
    let mut output = String::new();
    output.push_str(&standard::CURRENT_EPOCH.to_prometheus());
    output.push_str(&standard::SLOT_CLAIMS.to_prometheus());
    output.push_str(&standard::SLOT_REJOINS.to_prometheus());
    output.push_str(&standard::DATA_REQUESTS_SENT.to_prometheus());
    output.push_str(&standard::DATA_REQUESTS_SERVED.to_prometheus());
    output.push_str(&standard::EPOCH_MISMATCHES.to_prometheus());
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_renders_prometheus_text() {
        let c = Counter::new("test_total", "A test counter");
        c.inc();
        c.inc_by(2);
        assert_eq!(c.get(), 3);
        let text = c.to_prometheus();
        assert!(text.contains("# TYPE test_total counter"));
        assert!(text.contains("test_total 3"));
    }

    #[test]
    fn gauge_moves_both_ways() {
        let g = Gauge::new("test_gauge", "A test gauge");
        g.set(5);
        assert_eq!(g.get(), 5);
        g.set(-1);
        assert!(g.to_prometheus().contains("test_gauge -1"));
    }
}
