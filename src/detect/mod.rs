//! Spike detection over the host sample stream.
//!
//! Maintains a robust (median/MAD) baseline of host CPU and RAM and runs
//! the Normal → Candidate → Confirmed → Cooling state machine. A
//! Candidate → Confirmed edge outside the incident debounce gap yields a
//! [`SpikeEdge`] from which the caller materializes an incident.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::DetectorConfig;
use crate::math;
use crate::telemetry::HostSample;

/// Minimum baseline size before any trigger fires (cold-start
/// suppression).
const MIN_BASELINE_SAMPLES: usize = 30;

/// Epsilon clamp for the MAD denominator, preventing division collapse on
/// quiet hosts.
const MAD_EPSILON: f64 = 0.5;

/// Samples considered by the falling-edge trend filter.
const TREND_SAMPLES: usize = 5;

/// Detector state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpikeState {
    Normal,
    Candidate,
    Confirmed,
    Cooling,
}

/// Which resource(s) breached their absolute floor at confirm time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpikeKind {
    Cpu,
    Ram,
    Mixed,
}

/// Emitted on a confirm edge that is allowed to create an incident.
#[derive(Debug, Clone)]
pub struct SpikeEdge {
    pub detected_at: DateTime<Utc>,
    pub cpu_at_confirm: f64,
    pub ram_at_confirm: f64,
    pub peak_cpu: f64,
    pub peak_ram: f64,
    pub kind: SpikeKind,
    /// When the candidate phase began.
    pub candidate_since: DateTime<Utc>,
    /// First floor crossings observed during this episode, if any.
    pub cpu_floor_crossed_at: Option<DateTime<Utc>>,
    pub ram_floor_crossed_at: Option<DateTime<Utc>>,
}

pub struct SpikeDetector {
    cfg: DetectorConfig,

    /// Rolling baseline of recent host samples, oldest first.
    window: std::collections::VecDeque<HostSample>,

    state: SpikeState,
    consecutive_triggers: u32,
    consecutive_quiet: u32,
    entered_at: Option<DateTime<Utc>>,
    cooling_since: Option<DateTime<Utc>>,
    peak_cpu: f64,
    peak_ram: f64,
    cpu_floor_crossed_at: Option<DateTime<Utc>>,
    ram_floor_crossed_at: Option<DateTime<Utc>>,
    last_incident_at: Option<DateTime<Utc>>,
}

impl SpikeDetector {
    pub fn new(cfg: DetectorConfig) -> Self {
        let capacity = cfg.baseline_seconds.max(TREND_SAMPLES as u64) as usize;
        Self {
            cfg,
            window: std::collections::VecDeque::with_capacity(capacity + 1),
            state: SpikeState::Normal,
            consecutive_triggers: 0,
            consecutive_quiet: 0,
            entered_at: None,
            cooling_since: None,
            peak_cpu: 0.0,
            peak_ram: 0.0,
            cpu_floor_crossed_at: None,
            ram_floor_crossed_at: None,
            last_incident_at: None,
        }
    }

    pub fn state(&self) -> SpikeState {
        self.state
    }

    /// Feed one host sample. Returns a [`SpikeEdge`] exactly when the
    /// machine confirms a spike that may create a new incident.
    pub fn observe(&mut self, sample: &HostSample) -> Option<SpikeEdge> {
        let triggered = self.is_trigger(sample);
        let edge = self.step(sample, triggered);
        self.push_baseline(*sample);
        edge
    }

    /// Trigger rule: robust-z breach on either metric AND an absolute
    /// floor breach on either. The floor gate keeps idle hosts with a
    /// tiny MAD from alerting on noise.
    fn is_trigger(&self, sample: &HostSample) -> bool {
        if self.window.len() < MIN_BASELINE_SAMPLES {
            return false;
        }

        let cpu: Vec<f64> = self.window.iter().map(|s| s.cpu_pct).collect();
        let ram: Vec<f64> = self.window.iter().map(|s| s.ram_pct).collect();

        let cpu_z = math::robust_z(
            sample.cpu_pct,
            math::median(&cpu),
            math::mad(&cpu),
            MAD_EPSILON,
        );
        let ram_z = math::robust_z(
            sample.ram_pct,
            math::median(&ram),
            math::mad(&ram),
            MAD_EPSILON,
        );

        let z_breach = cpu_z >= self.cfg.z_threshold || ram_z >= self.cfg.z_threshold;
        let floor_breach =
            sample.cpu_pct >= self.cfg.cpu_floor || sample.ram_pct >= self.cfg.ram_floor;

        z_breach && floor_breach
    }

    fn step(&mut self, sample: &HostSample, triggered: bool) -> Option<SpikeEdge> {
        match self.state {
            SpikeState::Normal => {
                if triggered && !self.is_falling_edge(sample) {
                    self.state = SpikeState::Candidate;
                    self.consecutive_triggers = 1;
                    self.entered_at = Some(sample.ts);
                    self.peak_cpu = sample.cpu_pct;
                    self.peak_ram = sample.ram_pct;
                    self.cpu_floor_crossed_at = None;
                    self.ram_floor_crossed_at = None;
                    self.note_floor_crossings(sample);
                    debug!(ts = %sample.ts, "spike candidate");
                    self.maybe_confirm(sample)
                } else {
                    None
                }
            }

            SpikeState::Candidate => {
                if triggered {
                    self.consecutive_triggers += 1;
                    self.track_peaks(sample);
                    self.maybe_confirm(sample)
                } else {
                    debug!(ts = %sample.ts, "spike candidate lapsed");
                    self.reset();
                    None
                }
            }

            SpikeState::Confirmed => {
                if triggered {
                    self.consecutive_quiet = 0;
                    self.track_peaks(sample);
                } else {
                    self.consecutive_quiet += 1;
                    if self.consecutive_quiet >= self.cfg.cooldown_samples {
                        self.state = SpikeState::Cooling;
                        self.cooling_since = Some(sample.ts);
                        debug!(ts = %sample.ts, "spike cooling");
                    }
                }
                None
            }

            SpikeState::Cooling => {
                if triggered {
                    // Re-entry: back to Confirmed. A fresh incident only
                    // materializes outside the debounce gap.
                    self.state = SpikeState::Confirmed;
                    self.consecutive_quiet = 0;
                    self.cooling_since = None;
                    self.track_peaks(sample);
                    return self.emit_edge(sample);
                }

                let quiet_for = self
                    .cooling_since
                    .map(|since| sample.ts - since)
                    .unwrap_or_else(Duration::zero);
                if quiet_for >= Duration::seconds(self.cfg.cooling_seconds as i64) {
                    debug!(ts = %sample.ts, "spike cleared");
                    self.reset();
                }
                None
            }
        }
    }

    fn maybe_confirm(&mut self, sample: &HostSample) -> Option<SpikeEdge> {
        if self.consecutive_triggers < self.cfg.persistence_samples {
            return None;
        }

        self.state = SpikeState::Confirmed;
        self.consecutive_quiet = 0;
        self.emit_edge(sample)
    }

    /// Produce an edge unless debounced by `min_incident_gap_seconds`.
    fn emit_edge(&mut self, sample: &HostSample) -> Option<SpikeEdge> {
        if let Some(last) = self.last_incident_at {
            let gap = Duration::seconds(self.cfg.min_incident_gap_seconds as i64);
            if sample.ts - last < gap {
                debug!(ts = %sample.ts, "spike confirmed inside debounce gap");
                return None;
            }
        }

        self.last_incident_at = Some(sample.ts);
        self.note_floor_crossings(sample);

        let kind = if sample.cpu_pct >= self.cfg.cpu_floor && sample.ram_pct >= self.cfg.ram_floor {
            SpikeKind::Mixed
        } else if sample.ram_pct >= self.cfg.ram_floor {
            SpikeKind::Ram
        } else {
            SpikeKind::Cpu
        };

        info!(
            ts = %sample.ts,
            cpu = sample.cpu_pct,
            ram = sample.ram_pct,
            "spike confirmed",
        );

        Some(SpikeEdge {
            detected_at: sample.ts,
            cpu_at_confirm: sample.cpu_pct,
            ram_at_confirm: sample.ram_pct,
            peak_cpu: self.peak_cpu.max(sample.cpu_pct),
            peak_ram: self.peak_ram.max(sample.ram_pct),
            kind,
            candidate_since: self.entered_at.unwrap_or(sample.ts),
            cpu_floor_crossed_at: self.cpu_floor_crossed_at,
            ram_floor_crossed_at: self.ram_floor_crossed_at,
        })
    }

    /// Falling-edge filter: reject a candidate when both cpu and ram
    /// first derivatives over the trailing samples are negative.
    fn is_falling_edge(&self, sample: &HostSample) -> bool {
        if self.window.len() < TREND_SAMPLES - 1 {
            return false;
        }

        let mut cpu: Vec<f64> = self
            .window
            .iter()
            .rev()
            .take(TREND_SAMPLES - 1)
            .map(|s| s.cpu_pct)
            .collect();
        cpu.reverse();
        cpu.push(sample.cpu_pct);

        let mut ram: Vec<f64> = self
            .window
            .iter()
            .rev()
            .take(TREND_SAMPLES - 1)
            .map(|s| s.ram_pct)
            .collect();
        ram.reverse();
        ram.push(sample.ram_pct);

        slope(&cpu) < 0.0 && slope(&ram) < 0.0
    }

    fn track_peaks(&mut self, sample: &HostSample) {
        self.peak_cpu = self.peak_cpu.max(sample.cpu_pct);
        self.peak_ram = self.peak_ram.max(sample.ram_pct);
        self.note_floor_crossings(sample);
    }

    fn note_floor_crossings(&mut self, sample: &HostSample) {
        if self.cpu_floor_crossed_at.is_none() && sample.cpu_pct >= self.cfg.cpu_floor {
            self.cpu_floor_crossed_at = Some(sample.ts);
        }
        if self.ram_floor_crossed_at.is_none() && sample.ram_pct >= self.cfg.ram_floor {
            self.ram_floor_crossed_at = Some(sample.ts);
        }
    }

    fn push_baseline(&mut self, sample: HostSample) {
        self.window.push_back(sample);
        let cap = self.cfg.baseline_seconds.max(TREND_SAMPLES as u64) as usize;
        while self.window.len() > cap {
            self.window.pop_front();
        }
    }

    fn reset(&mut self) {
        self.state = SpikeState::Normal;
        self.consecutive_triggers = 0;
        self.consecutive_quiet = 0;
        self.entered_at = None;
        self.cooling_since = None;
        self.peak_cpu = 0.0;
        self.peak_ram = 0.0;
        self.cpu_floor_crossed_at = None;
        self.ram_floor_crossed_at = None;
    }
}

/// Mean first difference of a series.
fn slope(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let diffs: f64 = values.windows(2).map(|w| w[1] - w[0]).sum();
    diffs / (values.len() - 1) as f64
}
