pub mod probe;
pub mod ring;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TelemetryConfig;
use crate::tracer::event::{EventKind, NormalizedEvent};

use self::probe::HostProbe;
use self::ring::Ring;

/// Tolerance on the per-tick CPU accounting invariant, as a fraction of
/// total capacity.
const CPU_SUM_TOLERANCE: f64 = 0.02;

/// Handle shared between the ticker task (writer) and readers. The lock
/// is held only to mutate one tick or to copy a window out.
pub type SharedAggregator = Arc<parking_lot::Mutex<Aggregator>>;

/// One host utilization sample at the tick cadence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostSample {
    pub ts: DateTime<Utc>,
    pub cpu_pct: f64,
    pub ram_pct: f64,
}

/// One per-process bucket closed at the tick cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub ts: DateTime<Utc>,
    pub cpu_pct: f64,
    pub ram_pct: f64,
    pub disk_bytes: u64,
    pub net_bytes: u64,
    pub event_count: u32,
}

/// Copy-out view of a process's snapshots over a time range, with its
/// static identity.
#[derive(Debug, Clone)]
pub struct ProcessWindow {
    pub pid: u32,
    pub name: String,
    pub cmdline: Option<String>,
    pub snapshots: Vec<ProcessSnapshot>,
}

/// Result of closing one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickReport {
    /// The host sample produced, unless the wall clock regressed.
    pub sample: Option<HostSample>,
    /// At least one per-pid working-set lookup failed this tick.
    pub ram_unavailable: bool,
    /// Rows currently occupied in the process table.
    pub pids_tracked: usize,
}

/// Arena row for one tracked process.
struct PidRow {
    pid: u32,
    name: String,
    cmdline: Option<String>,
    snapshots: Ring<ProcessSnapshot>,
    last_snapshot_at: DateTime<Utc>,
}

/// Per-tick accumulation for one pid, reset at every bucket close.
#[derive(Default)]
struct PidAcc {
    switches: u32,
    samples: u32,
    disk_bytes: u64,
    net_bytes: u64,
    event_count: u32,
}

/// Rolling telemetry owned by the ticker task.
///
/// Host samples and per-process snapshots live in fixed-capacity rings;
/// the process table is an arena of rows with a dense pid→row index and a
/// free list, so the steady tick path recycles slots instead of
/// allocating.
pub struct Aggregator {
    tick_secs: f64,
    host_window_secs: i64,
    pid_window_secs: i64,
    num_cores: usize,

    host: Ring<HostSample>,
    events: Ring<NormalizedEvent>,

    rows: Vec<Option<PidRow>>,
    index: HashMap<u32, usize>,
    free: Vec<usize>,

    acc: HashMap<u32, PidAcc>,
    total_switches: u64,
    total_samples: u64,
}

impl Aggregator {
    pub fn new(cfg: &TelemetryConfig, num_cores: usize) -> Self {
        let host_window_secs = cfg.host_window_seconds as i64;
        let pid_window_secs = cfg.pid_window_seconds as i64;

        Self {
            tick_secs: cfg.tick_interval.as_secs_f64().max(0.001),
            host_window_secs,
            pid_window_secs,
            num_cores: num_cores.max(1),
            host: Ring::new(cfg.host_window_seconds.max(1)),
            events: Ring::new(cfg.event_buffer_size.max(1)),
            rows: Vec::new(),
            index: HashMap::new(),
            free: Vec::new(),
            acc: HashMap::new(),
            total_switches: 0,
            total_samples: 0,
        }
    }

    /// Fold one normalized event into the open bucket.
    pub fn ingest(&mut self, event: NormalizedEvent) {
        match event.kind {
            EventKind::ContextSwitch => {
                if let Some(new_pid) = event.new_pid() {
                    self.acc.entry(new_pid).or_default().switches += 1;
                    self.total_switches += 1;
                }
            }
            EventKind::CpuSample => {
                if let Some(pid) = event.pid {
                    self.acc.entry(pid).or_default().samples += 1;
                    self.total_samples += 1;
                }
            }
            EventKind::FileRead | EventKind::FileWrite => {
                if let (Some(pid), Some(bytes)) = (event.pid, event.disk_bytes()) {
                    self.acc.entry(pid).or_default().disk_bytes += bytes;
                }
            }
            EventKind::TcpSend | EventKind::TcpRecv => {
                if let (Some(pid), Some(bytes)) = (event.pid, event.net_bytes()) {
                    self.acc.entry(pid).or_default().net_bytes += bytes;
                }
            }
            EventKind::ProcessStop => {
                if let Some(pid) = event.pid {
                    self.evict(pid);
                    self.acc.remove(&pid);
                }
            }
            _ => {}
        }

        if !matches!(event.kind, EventKind::ProcessStop) {
            if let Some(pid) = event.pid {
                self.acc.entry(pid).or_default().event_count += 1;
            }
        }

        self.events.push(event);
    }

    /// Close the current bucket: sample the host, flush per-pid
    /// accumulators into snapshots, and run evictions.
    pub fn tick(&mut self, now: DateTime<Utc>, probe: &mut dyn HostProbe) -> TickReport {
        // Host samples are strictly monotonic; a regressed tick is skipped
        // entirely so downstream windows never see time move backwards.
        if let Some(prev) = self.host.latest() {
            if now <= prev.ts {
                debug!(now = %now, prev = %prev.ts, "discarding non-monotonic host sample");
                self.reset_acc();
                return TickReport {
                    sample: None,
                    ram_unavailable: false,
                    pids_tracked: self.index.len(),
                };
            }
        }

        let cpu_pct = match probe.cpu_total_pct() {
            Some(v) => v.clamp(0.0, 100.0),
            None => {
                warn!("host cpu counter unavailable, sampling 0");
                0.0
            }
        };
        let ram_pct = match probe.ram_used_pct() {
            Some(v) => v.clamp(0.0, 100.0),
            None => {
                warn!("host ram counter unavailable, sampling 0");
                0.0
            }
        };

        let sample = HostSample { ts: now, cpu_pct, ram_pct };
        self.host.push(sample);

        let mut ram_unavailable = false;
        let mut cpu_sum = 0.0;

        let mut pids: Vec<u32> = self.acc.keys().copied().collect();
        pids.sort_unstable();

        for pid in pids {
            let acc = self.acc.get(&pid).expect("pid accumulated this tick");
            let (switches, samples) = (acc.switches, acc.samples);
            let (disk_bytes, net_bytes, event_count) =
                (acc.disk_bytes, acc.net_bytes, acc.event_count);

            // Each context switch credits tick/total_switches core-seconds
            // to the incoming pid; cpu_sample credits are reconciled the
            // same way. cpu_pct is the share of total core capacity.
            let mut core_seconds = 0.0;
            if self.total_switches > 0 {
                core_seconds +=
                    self.tick_secs * f64::from(switches) / self.total_switches as f64;
            }
            if self.total_samples > 0 {
                core_seconds +=
                    self.tick_secs * f64::from(samples) / self.total_samples as f64;
            }
            let pid_cpu_pct =
                100.0 * core_seconds / (self.num_cores as f64 * self.tick_secs);
            cpu_sum += pid_cpu_pct;

            let pid_ram_pct = match probe.working_set_pct(pid) {
                Some(v) => v.clamp(0.0, 100.0),
                None => {
                    ram_unavailable = true;
                    0.0
                }
            };

            let snapshot = ProcessSnapshot {
                ts: now,
                cpu_pct: pid_cpu_pct,
                ram_pct: pid_ram_pct,
                disk_bytes,
                net_bytes,
                event_count,
            };

            let row_id = self.row_for(pid, probe);
            let row = self.rows[row_id].as_mut().expect("row just ensured");
            row.snapshots.push(snapshot);
            row.last_snapshot_at = now;
        }

        let capacity = 100.0 * self.num_cores as f64;
        if cpu_sum > capacity * (1.0 + CPU_SUM_TOLERANCE) {
            warn!(
                cpu_sum,
                capacity,
                "per-pid cpu attribution exceeds core capacity",
            );
        }

        self.evict_idle(now);
        self.reset_acc();

        TickReport {
            sample: Some(sample),
            ram_unavailable,
            pids_tracked: self.index.len(),
        }
    }

    // --- queries (copy-out) ---

    /// The newest host sample, if any.
    pub fn latest_host_sample(&self) -> Option<HostSample> {
        self.host.latest().copied()
    }

    /// Host samples from the trailing `seconds` of the ring.
    pub fn host_window(&self, seconds: u64) -> Vec<HostSample> {
        let Some(latest) = self.host.latest() else {
            return Vec::new();
        };
        let cutoff = latest.ts - Duration::seconds(seconds as i64);
        self.host.iter().filter(|s| s.ts > cutoff).copied().collect()
    }

    /// Host samples with `start < ts <= end`.
    pub fn host_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<HostSample> {
        self.host
            .iter()
            .filter(|s| s.ts > start && s.ts <= end)
            .copied()
            .collect()
    }

    /// Snapshots for one pid from the trailing `seconds`.
    pub fn process_snapshots(&self, pid: u32, seconds: u64) -> Vec<ProcessSnapshot> {
        let Some(latest) = self.host.latest() else {
            return Vec::new();
        };
        let cutoff = latest.ts - Duration::seconds(seconds as i64);
        self.row(pid)
            .map(|row| {
                row.snapshots
                    .iter()
                    .filter(|s| s.ts > cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A pid's snapshots with `start < ts <= end`, plus its identity.
    pub fn process_window(
        &self,
        pid: u32,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<ProcessWindow> {
        let row = self.row(pid)?;
        let snapshots: Vec<ProcessSnapshot> = row
            .snapshots
            .iter()
            .filter(|s| s.ts > start && s.ts <= end)
            .cloned()
            .collect();

        Some(ProcessWindow {
            pid,
            name: row.name.clone(),
            cmdline: row.cmdline.clone(),
            snapshots,
        })
    }

    /// Pids with at least one snapshot in the trailing `seconds`, sorted.
    pub fn active_pids(&self, window_seconds: u64) -> Vec<u32> {
        let Some(latest) = self.host.latest() else {
            return Vec::new();
        };
        let cutoff = latest.ts - Duration::seconds(window_seconds as i64);

        let mut pids: Vec<u32> = self
            .index
            .iter()
            .filter_map(|(pid, row_id)| {
                let row = self.rows.get(*row_id)?.as_ref()?;
                (row.last_snapshot_at > cutoff).then_some(*pid)
            })
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Most recent events from the trailing `window_seconds`, capped at
    /// `max`, in chronological order.
    pub fn recent_events(&self, window_seconds: u64, max: usize) -> Vec<NormalizedEvent> {
        let Some(newest) = self.events.iter().next_back() else {
            return Vec::new();
        };
        let cutoff = newest.ts - Duration::seconds(window_seconds as i64);
        self.events_after(cutoff, newest.ts, max)
    }

    /// Most recent events with `start < ts <= end`, capped at `max`, in
    /// chronological order.
    pub fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max: usize,
    ) -> Vec<NormalizedEvent> {
        self.events_after(start, end, max)
    }

    /// Total events currently buffered with `start < ts <= end`.
    pub fn events_between_count(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> usize {
        self.events
            .iter()
            .filter(|e| e.ts > start && e.ts <= end)
            .count()
    }

    fn events_after(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max: usize,
    ) -> Vec<NormalizedEvent> {
        let mut out: Vec<NormalizedEvent> = self
            .events
            .iter()
            .rev()
            .filter(|e| e.ts > start && e.ts <= end)
            .take(max)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    // --- internals ---

    fn row(&self, pid: u32) -> Option<&PidRow> {
        let row_id = *self.index.get(&pid)?;
        self.rows.get(row_id)?.as_ref()
    }

    /// Row id for a pid, creating the row (reusing a free slot) on first
    /// sight. Identity lookup is best-effort and happens once per row.
    fn row_for(&mut self, pid: u32, probe: &mut dyn HostProbe) -> usize {
        if let Some(row_id) = self.index.get(&pid) {
            return *row_id;
        }

        let (name, cmdline) = match probe.identity(pid) {
            Some(identity) => (identity.name, identity.cmdline),
            None => (format!("pid-{pid}"), None),
        };

        let row = PidRow {
            pid,
            name,
            cmdline,
            snapshots: Ring::new(self.pid_window_secs.max(1) as usize),
            last_snapshot_at: DateTime::<Utc>::MIN_UTC,
        };

        let row_id = match self.free.pop() {
            Some(slot) => {
                self.rows[slot] = Some(row);
                slot
            }
            None => {
                self.rows.push(Some(row));
                self.rows.len() - 1
            }
        };

        self.index.insert(pid, row_id);
        row_id
    }

    /// Free a pid's row immediately.
    fn evict(&mut self, pid: u32) {
        if let Some(row_id) = self.index.remove(&pid) {
            if let Some(slot) = self.rows.get_mut(row_id) {
                *slot = None;
            }
            self.free.push(row_id);
        }
    }

    /// Free rows whose last snapshot is older than the pid window.
    fn evict_idle(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(self.pid_window_secs);
        let stale: Vec<u32> = self
            .index
            .iter()
            .filter_map(|(pid, row_id)| {
                let row = self.rows.get(*row_id)?.as_ref()?;
                (row.last_snapshot_at < cutoff).then_some(*pid)
            })
            .collect();

        for pid in stale {
            debug!(pid, "evicting idle process row");
            self.evict(pid);
        }
    }

    fn reset_acc(&mut self) {
        self.acc.clear();
        self.total_switches = 0;
        self.total_samples = 0;
    }
}
