//! Incident and RCA record types.
//!
//! A [`SpikeIncident`] is created at the confirm edge and is immutable
//! afterwards except for the one-time assignment of its `rca` field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::SpikeKind;
use crate::tracer::event::NormalizedEvent;

/// Maximum events retained on an incident as evidence.
pub const MAX_EVIDENCE_EVENTS: usize = 500;

/// A confirmed spike with its attribution evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeIncident {
    pub id: u64,
    pub detected_at: DateTime<Utc>,
    pub cpu_at_confirm: f64,
    pub ram_at_confirm: f64,
    pub peak_cpu: f64,
    pub peak_ram: f64,
    pub spike_kind: SpikeKindTag,
    /// Attribution window, ending at `detected_at`.
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Events observed in the window before evidence truncation.
    pub attached_event_count: usize,
    /// Bounded evidence sample: the most recent events of the window.
    pub etw_events: Vec<NormalizedEvent>,
    /// Set exactly once by the RCA worker; readers see null-or-final.
    pub rca: Option<RcaReport>,
}

/// Serializable mirror of [`SpikeKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpikeKindTag {
    Cpu,
    Ram,
    Mixed,
}

impl From<SpikeKind> for SpikeKindTag {
    fn from(kind: SpikeKind) -> Self {
        match kind {
            SpikeKind::Cpu => Self::Cpu,
            SpikeKind::Ram => Self::Ram,
            SpikeKind::Mixed => Self::Mixed,
        }
    }
}

/// Root cause analysis attached to an incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RcaReport {
    pub cause_summary: String,
    /// Clamped to [0, 1] at validation.
    pub confidence: f64,
    pub culprit_process: Option<CulpritProcess>,
    pub resource_impact: ResourceImpact,
    pub ranked_suspects: Vec<RankedSuspect>,
    #[serde(default)]
    pub timeline: Vec<TimelineEntry>,
    #[serde(default)]
    pub recs: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CulpritProcess {
    pub pid: u32,
    pub name: String,
    pub cmdline: Option<String>,
    pub cpu_pct: f64,
    pub ram_pct: f64,
    pub disk_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceImpact {
    pub cpu_spike_percent: f64,
    pub ram_spike_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedSuspect {
    pub pid: u32,
    pub name: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub details: String,
}
