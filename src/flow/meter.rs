//! Flow meter (component B): active-connection count, cumulative byte
//! totals, and peak per-interval speed, sampled once a second and emitted
//! on a configurable interval.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default)]
pub struct FlowSnapshot {
    pub conn: i64,
    pub read_total: u64,
    pub written_total: u64,
    pub read_speed_peak: u64,
    pub written_speed_peak: u64,
}

/// Per-node connection and byte-rate accounting.
///
/// All counters are atomics so [`MeteredStream`](super::MeteredStream) can
/// report from any task without additional locking.
pub struct FlowMeter {
    conn_total: AtomicI64,
    read_total: AtomicU64,
    written_total: AtomicU64,
    read_speed_peak: AtomicU64,
    written_speed_peak: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl FlowMeter {
    pub fn new() -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            conn_total: AtomicI64::new(0),
            read_total: AtomicU64::new(0),
            written_total: AtomicU64::new(0),
            read_speed_peak: AtomicU64::new(0),
            written_speed_peak: AtomicU64::new(0),
            shutdown_tx,
        })
    }

    pub fn add_conn(&self, n: i64) {
        self.conn_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn del_conn(&self, n: i64) {
        self.conn_total.fetch_sub(n, Ordering::Relaxed);
    }

    pub fn report_read(&self, n: u64) {
        if n > 0 {
            self.read_total.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn report_written(&self, n: u64) {
        if n > 0 {
            self.written_total.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            conn: self.conn_total.load(Ordering::Relaxed),
            read_total: self.read_total.load(Ordering::Relaxed),
            written_total: self.written_total.load(Ordering::Relaxed),
            read_speed_peak: self.read_speed_peak.load(Ordering::Relaxed),
            written_speed_peak: self.written_speed_peak.load(Ordering::Relaxed),
        }
    }

    /// Start the 1 Hz sampler. Every `interval_seconds` ticks it calls
    /// `sink` with the accumulated snapshot and resets the peak fields.
    /// `sink` errors/panics are not possible by construction (it's a plain
    /// closure); this is deliberately best-effort per §4.B — a caller that
    /// wants resilience should make its own sink infallible.
    pub fn start(self: &Arc<Self>, interval_seconds: u32, mut sink: impl FnMut(FlowSnapshot) + Send + 'static) {
        let meter = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            let mut prev_read = 0u64;
            let mut prev_written = 0u64;
            let mut ticks = 0u32;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let read_total = meter.read_total.load(Ordering::Relaxed);
                        let written_total = meter.written_total.load(Ordering::Relaxed);
                        let delta_r = read_total.saturating_sub(prev_read);
                        let delta_w = written_total.saturating_sub(prev_written);
                        meter.read_speed_peak.fetch_max(delta_r, Ordering::Relaxed);
                        meter.written_speed_peak.fetch_max(delta_w, Ordering::Relaxed);
                        prev_read = read_total;
                        prev_written = written_total;

                        ticks += 1;
                        if ticks >= interval_seconds {
                            ticks = 0;
                            sink(meter.snapshot());
                            meter.read_speed_peak.store(0, Ordering::Relaxed);
                            meter.written_speed_peak.store(0, Ordering::Relaxed);
                        }
                    }
                    _ = shutdown.changed() => {
                        break;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_total_returns_to_baseline() {
        let meter = FlowMeter::new();
        meter.add_conn(1);
        assert_eq!(meter.snapshot().conn, 1);
        meter.del_conn(1);
        assert_eq!(meter.snapshot().conn, 0);
    }

    #[test]
    fn byte_totals_accumulate() {
        let meter = FlowMeter::new();
        meter.report_read(100);
        meter.report_written(50);
        meter.report_read(0); // zero reports must not corrupt totals
        let snap = meter.snapshot();
        assert_eq!(snap.read_total, 100);
        assert_eq!(snap.written_total, 50);
    }
}
