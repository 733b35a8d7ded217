use std::sync::atomic::{AtomicU64, Ordering};

use super::event::EventKind;

/// Lock-free ingest counters, monotonic increments only.
///
/// Named counters track degraded-input conditions; per-kind counters feed
/// the periodic event stats report. `snapshot_kinds()` atomically reads
/// and resets the per-kind counters so reporting stays contention-free.
pub struct IngestStats {
    /// Events successfully normalized and published.
    events_received: AtomicU64,
    /// Lines that failed JSON parsing or normalization.
    malformed_lines: AtomicU64,
    /// Events discarded because the ingest queue was full.
    backpressure_drops: AtomicU64,
    /// Events discarded for regressing past the reorder slack bound.
    out_of_order_drops: AtomicU64,
    /// Tracer subprocess restarts performed by the supervisor.
    tracer_restarts: AtomicU64,
    kinds: [AtomicU64; EventKind::all().len()],
}

impl IngestStats {
    /// Create a new zeroed IngestStats.
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            malformed_lines: AtomicU64::new(0),
            backpressure_drops: AtomicU64::new(0),
            out_of_order_drops: AtomicU64::new(0),
            tracer_restarts: AtomicU64::new(0),
            kinds: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Record one published event of the given kind.
    pub fn record(&self, kind: EventKind) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = self.kinds.get(kind_index(kind)) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_malformed(&self) {
        self.malformed_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure_drop(&self) {
        self.backpressure_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_of_order_drop(&self) {
        self.out_of_order_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tracer_restart(&self) {
        self.tracer_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    pub fn malformed_lines(&self) -> u64 {
        self.malformed_lines.load(Ordering::Relaxed)
    }

    pub fn backpressure_drops(&self) -> u64 {
        self.backpressure_drops.load(Ordering::Relaxed)
    }

    pub fn out_of_order_drops(&self) -> u64 {
        self.out_of_order_drops.load(Ordering::Relaxed)
    }

    pub fn tracer_restarts(&self) -> u64 {
        self.tracer_restarts.load(Ordering::Relaxed)
    }

    /// Atomically read and reset the per-kind counters, returning only
    /// non-zero entries.
    pub fn snapshot_kinds(&self) -> Vec<(EventKind, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.kinds.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                result.push((EventKind::all()[i], v));
            }
        }

        result
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_index(kind: EventKind) -> usize {
    EventKind::all()
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(EventKind::all().len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_read() {
        let stats = IngestStats::new();
        stats.record(EventKind::TcpSend);
        stats.record(EventKind::TcpSend);
        stats.record(EventKind::Gc);
        stats.record_malformed();
        stats.record_backpressure_drop();

        assert_eq!(stats.events_received(), 3);
        assert_eq!(stats.malformed_lines(), 1);
        assert_eq!(stats.backpressure_drops(), 1);
        assert_eq!(stats.out_of_order_drops(), 0);
    }

    #[test]
    fn test_snapshot_kinds_resets() {
        let stats = IngestStats::new();
        stats.record(EventKind::FileRead);
        stats.record(EventKind::FileRead);
        stats.record(EventKind::ContextSwitch);

        let snap = stats.snapshot_kinds();
        assert!(snap.contains(&(EventKind::FileRead, 2)));
        assert!(snap.contains(&(EventKind::ContextSwitch, 1)));

        // Per-kind counters are reset; totals are not.
        assert!(stats.snapshot_kinds().is_empty());
        assert_eq!(stats.events_received(), 3);
    }

    #[test]
    fn test_concurrent_record() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(IngestStats::new());
        let mut handles = Vec::new();

        for _ in 0..4 {
            let stats = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    stats.record(EventKind::CpuSample);
                }
            }));
        }

        for h in handles {
            h.join().expect("thread panicked");
        }

        assert_eq!(stats.events_received(), 4000);
    }
}
