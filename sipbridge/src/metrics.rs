//! Process-wide counters and their Prometheus text exposition.
//!
//! Kept as plain atomics; the admin surface renders them on demand.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    concurrent_sessions: AtomicI64,
    caps: AtomicI64,
    calls_total: AtomicU64,
    parse_errors_total: AtomicU64,
    media_ports_in_use: AtomicI64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_sessions(&self) {
        self.concurrent_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_sessions(&self) {
        self.concurrent_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn sessions(&self) -> i64 {
        self.concurrent_sessions.load(Ordering::Relaxed)
    }

    pub fn set_caps(&self, caps: i64) {
        self.caps.store(caps, Ordering::Relaxed);
    }

    pub fn inc_calls(&self) {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_parse_errors(&self) {
        self.parse_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_media_ports_in_use(&self, used: i64) {
        self.media_ports_in_use.store(used, Ordering::Relaxed);
    }

    /// Prometheus text exposition of every gauge and counter.
    pub fn render(&self, namespace: &str) -> String {
        let mut out = String::with_capacity(512);
        let mut gauge = |name: &str, help: &str, value: i64| {
            let _ = writeln!(out, "# HELP {ns}_{name} {help}", ns = namespace);
            let _ = writeln!(out, "# TYPE {ns}_{name} gauge", ns = namespace);
            let _ = writeln!(out, "{ns}_{name} {value}", ns = namespace);
        };
        gauge(
            "concurrent_sessions",
            "Shows concurrent sessions active",
            self.concurrent_sessions.load(Ordering::Relaxed),
        );
        gauge(
            "call_attempts_per_second",
            "Shows current CAPS",
            self.caps.load(Ordering::Relaxed),
        );
        gauge(
            "media_ports_in_use",
            "Media relay ports currently allocated",
            self.media_ports_in_use.load(Ordering::Relaxed),
        );

        let mut counter = |name: &str, help: &str, value: u64| {
            let _ = writeln!(out, "# HELP {ns}_{name} {help}", ns = namespace);
            let _ = writeln!(out, "# TYPE {ns}_{name} counter", ns = namespace);
            let _ = writeln!(out, "{ns}_{name} {value}", ns = namespace);
        };
        counter(
            "calls_total",
            "Inbound calls admitted since startup",
            self.calls_total.load(Ordering::Relaxed),
        );
        counter(
            "parse_errors_total",
            "Datagrams dropped by the wire codec",
            self.parse_errors_total.load(Ordering::Relaxed),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_exposes_all_series() {
        let metrics = Metrics::new();
        metrics.inc_sessions();
        metrics.inc_calls();
        metrics.inc_parse_errors();
        let text = metrics.render("sipbridge");
        assert!(text.contains("sipbridge_concurrent_sessions 1"));
        assert!(text.contains("sipbridge_calls_total 1"));
        assert!(text.contains("sipbridge_parse_errors_total 1"));
        assert!(text.contains("# TYPE sipbridge_concurrent_sessions gauge"));
    }

    #[test]
    fn gauge_moves_both_ways() {
        let metrics = Metrics::new();
        metrics.inc_sessions();
        metrics.inc_sessions();
        metrics.dec_sessions();
        assert_eq!(metrics.sessions(), 1);
    }
}
