//! RCA evidence assembly and reply validation.
//!
//! The evidence payload is the deterministic input handed to the LLM
//! collaborator; validation turns its reply into an [`RcaReport`] with
//! clamped numeric ranges. The ranked suspect list in every report is
//! pinned to the locally derived ranking so reported scores stay
//! reproducible whether or not the collaborator responds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::incident::{
    CulpritProcess, RankedSuspect, RcaReport, ResourceImpact, SpikeIncident, TimelineEntry,
};
use crate::rank::RankOutcome;
use crate::telemetry::HostSample;
use crate::tracer::event::NormalizedEvent;

/// Incident metadata carried in the evidence payload.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentMeta {
    pub id: u64,
    pub detected_at: DateTime<Utc>,
    pub cpu_at_confirm: f64,
    pub ram_at_confirm: f64,
    pub peak_cpu: f64,
    pub peak_ram: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// One point of the host time-series snippet.
#[derive(Debug, Clone, Serialize)]
pub struct HostPoint {
    pub ts: DateTime<Utc>,
    pub cpu: f64,
    pub ram: f64,
}

/// The structured evidence document sent to the LLM collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct EvidencePayload {
    pub incident: IncidentMeta,
    pub suspects: Vec<crate::rank::SuspectScore>,
    pub events_sample: Vec<NormalizedEvent>,
    pub host_series: Vec<HostPoint>,
}

/// Assemble the evidence payload for one incident.
pub fn build_payload(
    incident: &SpikeIncident,
    outcome: &RankOutcome,
    host_series: &[HostSample],
) -> EvidencePayload {
    EvidencePayload {
        incident: IncidentMeta {
            id: incident.id,
            detected_at: incident.detected_at,
            cpu_at_confirm: incident.cpu_at_confirm,
            ram_at_confirm: incident.ram_at_confirm,
            peak_cpu: incident.peak_cpu,
            peak_ram: incident.peak_ram,
            window_start: incident.window_start,
            window_end: incident.window_end,
        },
        suspects: outcome.suspects.clone(),
        events_sample: incident.etw_events.clone(),
        host_series: host_series
            .iter()
            .map(|s| HostPoint {
                ts: s.ts,
                cpu: s.cpu_pct,
                ram: s.ram_pct,
            })
            .collect(),
    }
}

/// Shape expected from the collaborator. Suspect scores in the reply are
/// deliberately ignored; the local ranking is authoritative.
#[derive(Debug, Deserialize)]
struct RawReply {
    cause_summary: String,
    confidence: f64,
    #[serde(default)]
    culprit_process: Option<CulpritProcess>,
    #[serde(default)]
    resource_impact: Option<ResourceImpact>,
    #[serde(default)]
    timeline: Vec<TimelineEntry>,
    #[serde(default)]
    recs: Vec<String>,
}

/// Validate a collaborator reply against the report schema, clamping
/// numeric ranges and pinning the suspect list to the local ranking.
pub fn validate_reply(
    raw: serde_json::Value,
    payload: &EvidencePayload,
    outcome: &RankOutcome,
    generated_at: DateTime<Utc>,
) -> Result<RcaReport, String> {
    let reply: RawReply = serde_json::from_value(raw).map_err(|e| e.to_string())?;

    if reply.cause_summary.trim().is_empty() {
        return Err("cause_summary is empty".to_string());
    }

    let impact = reply.resource_impact.unwrap_or(ResourceImpact {
        cpu_spike_percent: payload.incident.cpu_at_confirm,
        ram_spike_percent: payload.incident.ram_at_confirm,
    });

    Ok(RcaReport {
        cause_summary: reply.cause_summary,
        confidence: clamp_unit(reply.confidence),
        culprit_process: reply.culprit_process.or_else(|| local_culprit(outcome)),
        resource_impact: ResourceImpact {
            cpu_spike_percent: clamp_pct(impact.cpu_spike_percent),
            ram_spike_percent: clamp_pct(impact.ram_spike_percent),
        },
        ranked_suspects: local_suspects(outcome),
        timeline: reply.timeline,
        recs: reply.recs,
        generated_at,
    })
}

/// Report used when the collaborator is unreachable: the summary is the
/// tagged unavailability reason, confidence is zeroed, and the locally
/// derived suspects are kept.
pub fn unavailable_report(
    reason: &str,
    payload: &EvidencePayload,
    outcome: &RankOutcome,
    generated_at: DateTime<Utc>,
) -> RcaReport {
    RcaReport {
        cause_summary: format!("<unavailable: {reason}>"),
        confidence: 0.0,
        culprit_process: local_culprit(outcome),
        resource_impact: ResourceImpact {
            cpu_spike_percent: clamp_pct(payload.incident.cpu_at_confirm),
            ram_spike_percent: clamp_pct(payload.incident.ram_at_confirm),
        },
        ranked_suspects: local_suspects(outcome),
        timeline: Vec::new(),
        recs: default_recs(),
        generated_at,
    }
}

/// Report used when the collaborator replied but its document failed
/// schema validation: keep the local ranking with its deterministic
/// confidence and a summary citing the top suspect.
pub fn schema_fallback_report(
    payload: &EvidencePayload,
    outcome: &RankOutcome,
    generated_at: DateTime<Utc>,
) -> RcaReport {
    let cause_summary = match outcome.suspects.first() {
        Some(top) => format!(
            "Analysis reply rejected; top local suspect is {} (pid {}, score {:.2}).",
            top.name, top.pid, top.score,
        ),
        None => "Analysis reply rejected; no local suspects in the window.".to_string(),
    };

    RcaReport {
        cause_summary,
        confidence: clamp_unit(outcome.confidence),
        culprit_process: local_culprit(outcome),
        resource_impact: ResourceImpact {
            cpu_spike_percent: clamp_pct(payload.incident.cpu_at_confirm),
            ram_spike_percent: clamp_pct(payload.incident.ram_at_confirm),
        },
        ranked_suspects: local_suspects(outcome),
        timeline: Vec::new(),
        recs: default_recs(),
        generated_at,
    }
}

fn local_suspects(outcome: &RankOutcome) -> Vec<RankedSuspect> {
    outcome
        .suspects
        .iter()
        .map(|s| RankedSuspect {
            pid: s.pid,
            name: s.name.clone(),
            score: s.score,
        })
        .collect()
}

fn local_culprit(outcome: &RankOutcome) -> Option<CulpritProcess> {
    outcome.suspects.first().map(|top| CulpritProcess {
        pid: top.pid,
        name: top.name.clone(),
        cmdline: top.cmdline.clone(),
        cpu_pct: top.mean_cpu_pct,
        ram_pct: top.mean_ram_pct,
        disk_bytes: top.disk_bytes,
    })
}

fn default_recs() -> Vec<String> {
    vec![
        "Inspect the top-ranked processes' recent deployments and workloads.".to_string(),
        "Apply CPU or working-set limits to the suspected process.".to_string(),
        "Re-run analysis once the collaborator endpoint is reachable.".to_string(),
    ]
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn clamp_pct(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 100.0)
    } else {
        0.0
    }
}
