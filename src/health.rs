use anyhow::Result;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "spikewatch" namespace. Ingest counters mirror the
/// tracer's atomic [`IngestStats`](crate::tracer::stats::IngestStats),
/// updated once per tick.
pub struct HealthMetrics {
    registry: Registry,

    /// Total events normalized and published by the reader.
    pub events_received: Counter,
    /// Total malformed tracer lines skipped.
    pub malformed_lines: Counter,
    /// Total events dropped by ingest queue overflow.
    pub backpressure_drops: Counter,
    /// Total events dropped for regressing past the reorder slack.
    pub out_of_order_drops: Counter,
    /// Total tracer subprocess restarts.
    pub tracer_restarts: Counter,

    /// Total telemetry ticks closed.
    pub ticks_total: Counter,
    /// Total ticks with at least one failed working-set lookup.
    pub ram_unavailable_ticks: Counter,
    /// Number of pids currently tracked.
    pub pids_tracked: Gauge,
    /// Latest host CPU utilization percent.
    pub host_cpu_pct: Gauge,
    /// Latest host RAM utilization percent.
    pub host_ram_pct: Gauge,
    /// Tick close duration.
    pub tick_duration: Histogram,

    /// Total confirmed spike incidents.
    pub spikes_confirmed: Counter,
    /// Incidents currently retained in the store.
    pub incidents_stored: Gauge,
    /// Ranker runtime per incident.
    pub rank_duration: Histogram,

    /// RCA outcomes by status (ok, unavailable, schema, backpressure,
    /// shutdown).
    pub rca_outcomes: CounterVec,
}

impl HealthMetrics {
    /// Creates the metrics instance with all collectors registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new("events_received_total", "Total events normalized and published.")
                .namespace("spikewatch"),
        )?;
        let malformed_lines = Counter::with_opts(
            Opts::new("malformed_lines_total", "Total malformed tracer lines skipped.")
                .namespace("spikewatch"),
        )?;
        let backpressure_drops = Counter::with_opts(
            Opts::new(
                "backpressure_drops_total",
                "Total events dropped by ingest queue overflow.",
            )
            .namespace("spikewatch"),
        )?;
        let out_of_order_drops = Counter::with_opts(
            Opts::new(
                "out_of_order_drops_total",
                "Total events dropped past the reorder slack bound.",
            )
            .namespace("spikewatch"),
        )?;
        let tracer_restarts = Counter::with_opts(
            Opts::new("tracer_restarts_total", "Total tracer subprocess restarts.")
                .namespace("spikewatch"),
        )?;

        let ticks_total = Counter::with_opts(
            Opts::new("ticks_total", "Total telemetry ticks closed.").namespace("spikewatch"),
        )?;
        let ram_unavailable_ticks = Counter::with_opts(
            Opts::new(
                "ram_unavailable_ticks_total",
                "Ticks with at least one failed working-set lookup.",
            )
            .namespace("spikewatch"),
        )?;
        let pids_tracked = Gauge::with_opts(
            Opts::new("pids_tracked", "Number of pids currently tracked.").namespace("spikewatch"),
        )?;
        let host_cpu_pct = Gauge::with_opts(
            Opts::new("host_cpu_pct", "Latest host CPU utilization percent.")
                .namespace("spikewatch"),
        )?;
        let host_ram_pct = Gauge::with_opts(
            Opts::new("host_ram_pct", "Latest host RAM utilization percent.")
                .namespace("spikewatch"),
        )?;
        let tick_duration = Histogram::with_opts(
            HistogramOpts::new("tick_duration_seconds", "Telemetry tick close duration.")
                .namespace("spikewatch")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;

        let spikes_confirmed = Counter::with_opts(
            Opts::new("spikes_confirmed_total", "Total confirmed spike incidents.")
                .namespace("spikewatch"),
        )?;
        let incidents_stored = Gauge::with_opts(
            Opts::new("incidents_stored", "Incidents currently retained.").namespace("spikewatch"),
        )?;
        let rank_duration = Histogram::with_opts(
            HistogramOpts::new("rank_duration_seconds", "Ranker runtime per incident.")
                .namespace("spikewatch")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.2, 0.5, 1.0]),
        )?;

        let rca_outcomes = CounterVec::new(
            Opts::new("rca_outcomes_total", "RCA attempts by outcome.").namespace("spikewatch"),
            &["outcome"],
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(malformed_lines.clone()))?;
        registry.register(Box::new(backpressure_drops.clone()))?;
        registry.register(Box::new(out_of_order_drops.clone()))?;
        registry.register(Box::new(tracer_restarts.clone()))?;
        registry.register(Box::new(ticks_total.clone()))?;
        registry.register(Box::new(ram_unavailable_ticks.clone()))?;
        registry.register(Box::new(pids_tracked.clone()))?;
        registry.register(Box::new(host_cpu_pct.clone()))?;
        registry.register(Box::new(host_ram_pct.clone()))?;
        registry.register(Box::new(tick_duration.clone()))?;
        registry.register(Box::new(spikes_confirmed.clone()))?;
        registry.register(Box::new(incidents_stored.clone()))?;
        registry.register(Box::new(rank_duration.clone()))?;
        registry.register(Box::new(rca_outcomes.clone()))?;

        Ok(Self {
            registry,
            events_received,
            malformed_lines,
            backpressure_drops,
            out_of_order_drops,
            tracer_restarts,
            ticks_total,
            ram_unavailable_ticks,
            pids_tracked,
            host_cpu_pct,
            host_ram_pct,
            tick_duration,
            spikes_confirmed,
            incidents_stored,
            rank_duration,
            rca_outcomes,
        })
    }

    /// Bring the mirrored ingest counters up to the tracer's atomics.
    pub fn sync_ingest(&self, stats: &crate::tracer::stats::IngestStats) {
        sync_counter(&self.events_received, stats.events_received());
        sync_counter(&self.malformed_lines, stats.malformed_lines());
        sync_counter(&self.backpressure_drops, stats.backpressure_drops());
        sync_counter(&self.out_of_order_drops, stats.out_of_order_drops());
        sync_counter(&self.tracer_restarts, stats.tracer_restarts());
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn gather(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

/// Advance a monotonically mirrored counter to an absolute value.
fn sync_counter(counter: &Counter, absolute: u64) {
    let current = counter.get();
    let target = absolute as f64;
    if target > current {
        counter.inc_by(target - current);
    }
}
