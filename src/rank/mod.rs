//! PID ranking: attribute a confirmed spike to the processes most likely
//! responsible.
//!
//! Pure computation over copied-out telemetry windows so it can run on
//! the blocking pool without touching shared state. Re-running on the
//! same input yields identical scores.

use serde::Serialize;

use crate::math::{self, Baseline2};
use crate::telemetry::{HostSample, ProcessWindow};

/// Component weights of the fused score.
const W_ANOMALY: f64 = 0.4;
const W_ENERGY: f64 = 0.4;
const W_CORRELATION: f64 = 0.2;

/// Energy blend between cpu and ram share.
const ENERGY_CPU_WEIGHT: f64 = 0.7;
const ENERGY_RAM_WEIGHT: f64 = 0.3;

/// Minimum overlapping samples for the correlation component.
const MIN_CORRELATION_SAMPLES: usize = 10;

/// Epsilon clamp for the diagonal anomaly fallback.
const MAD_EPSILON: f64 = 0.5;

/// Maximum suspects reported.
pub const MAX_SUSPECTS: usize = 10;

/// One ranked suspect with its component breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuspectScore {
    pub pid: u32,
    pub name: String,
    pub cmdline: Option<String>,
    pub score: f64,
    pub anomaly: f64,
    pub energy: f64,
    pub correlation: f64,
    pub cpu_share: f64,
    pub ram_share: f64,
    pub mean_cpu_pct: f64,
    pub mean_ram_pct: f64,
    pub disk_bytes: u64,
    pub net_bytes: u64,
}

/// Ranker output: ordered suspects plus the derived confidence floor.
#[derive(Debug, Clone, PartialEq)]
pub struct RankOutcome {
    pub suspects: Vec<SuspectScore>,
    pub confidence: f64,
}

/// Everything the ranker needs, copied out of the aggregator under one
/// short lock hold.
#[derive(Debug, Clone)]
pub struct RankInput {
    /// Host samples inside the attribution window.
    pub host_window: Vec<HostSample>,
    /// Host samples over the baseline interval preceding the window.
    pub host_baseline: Vec<HostSample>,
    /// Per-pid snapshots inside the attribution window.
    pub processes: Vec<ProcessWindow>,
}

/// Rank every pid active in the attribution window.
pub fn rank(input: &RankInput) -> RankOutcome {
    let host_cpu_integral: f64 = input.host_window.iter().map(|s| s.cpu_pct).sum();
    let host_ram_integral: f64 = input.host_window.iter().map(|s| s.ram_pct).sum();
    let host_cpu_series: Vec<f64> = input.host_window.iter().map(|s| s.cpu_pct).collect();

    let baseline_points: Vec<[f64; 2]> = input
        .host_baseline
        .iter()
        .map(|s| [s.cpu_pct, s.ram_pct])
        .collect();
    let baseline = Baseline2::estimate(&baseline_points);

    let baseline_cpu: Vec<f64> = baseline_points.iter().map(|p| p[0]).collect();
    let baseline_ram: Vec<f64> = baseline_points.iter().map(|p| p[1]).collect();

    // Deterministic order: pid ascending before scoring.
    let mut processes: Vec<&ProcessWindow> = input.processes.iter().collect();
    processes.sort_by_key(|p| p.pid);

    let mut suspects: Vec<SuspectScore> = Vec::with_capacity(processes.len());

    for process in processes {
        if process.snapshots.is_empty() {
            continue;
        }

        let mean_cpu = sanitize(math::mean(
            &process.snapshots.iter().map(|s| s.cpu_pct).collect::<Vec<_>>(),
        ));
        let mean_ram = sanitize(math::mean(
            &process.snapshots.iter().map(|s| s.ram_pct).collect::<Vec<_>>(),
        ));

        let anomaly = sanitize(anomaly_component(
            [mean_cpu, mean_ram],
            baseline.as_ref(),
            &baseline_cpu,
            &baseline_ram,
        ));

        let pid_cpu_integral: f64 = process.snapshots.iter().map(|s| s.cpu_pct).sum();
        let pid_ram_integral: f64 = process.snapshots.iter().map(|s| s.ram_pct).sum();
        let cpu_share = sanitize(share(pid_cpu_integral, host_cpu_integral));
        let ram_share = sanitize(share(pid_ram_integral, host_ram_integral));
        let energy = sanitize(ENERGY_CPU_WEIGHT * cpu_share + ENERGY_RAM_WEIGHT * ram_share);

        let correlation = sanitize(correlation_component(process, &input.host_window, &host_cpu_series));

        if anomaly == 0.0 && energy == 0.0 && correlation == 0.0 {
            continue;
        }

        let score = W_ANOMALY * anomaly + W_ENERGY * energy + W_CORRELATION * correlation;

        suspects.push(SuspectScore {
            pid: process.pid,
            name: process.name.clone(),
            cmdline: process.cmdline.clone(),
            score,
            anomaly,
            energy,
            correlation,
            cpu_share,
            ram_share,
            mean_cpu_pct: mean_cpu,
            mean_ram_pct: mean_ram,
            disk_bytes: process.snapshots.iter().map(|s| s.disk_bytes).sum(),
            net_bytes: process.snapshots.iter().map(|s| s.net_bytes).sum(),
        });
    }

    // Score descending; ties break on cpu_share, then ram_share, then the
    // lower pid (long-lived system processes get lower pids).
    suspects.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.cpu_share
                    .partial_cmp(&a.cpu_share)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                b.ram_share
                    .partial_cmp(&a.ram_share)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.pid.cmp(&b.pid))
    });
    suspects.truncate(MAX_SUSPECTS);

    let confidence = match suspects.first() {
        Some(top) => {
            let strong_component =
                top.anomaly >= 0.5 || top.energy >= 0.5 || top.correlation >= 0.5;
            if strong_component {
                (top.score * 1.25).min(1.0)
            } else {
                top.score
            }
        }
        None => 0.0,
    };

    RankOutcome {
        suspects,
        confidence,
    }
}

/// Anomaly: Mahalanobis distance of the pid's mean feature vector from
/// the host baseline distribution, squashed into [0, 1]. A singular
/// covariance falls back to summed squared per-metric robust z-scores.
fn anomaly_component(
    point: [f64; 2],
    baseline: Option<&Baseline2>,
    baseline_cpu: &[f64],
    baseline_ram: &[f64],
) -> f64 {
    let dsq = baseline
        .and_then(|b| b.mahalanobis_sq(point))
        .unwrap_or_else(|| {
            let z_cpu = math::robust_z(
                point[0],
                math::median(baseline_cpu),
                math::mad(baseline_cpu),
                MAD_EPSILON,
            );
            let z_ram = math::robust_z(
                point[1],
                math::median(baseline_ram),
                math::mad(baseline_ram),
                MAD_EPSILON,
            );
            z_cpu * z_cpu + z_ram * z_ram
        });

    1.0 - (-dsq / 8.0).exp()
}

/// Correlation: cosine similarity of the pid's cpu series against the
/// host's, both mean-centered, aligned on matching sample timestamps.
fn correlation_component(
    process: &ProcessWindow,
    host_window: &[HostSample],
    host_cpu_series: &[f64],
) -> f64 {
    let mut pid_aligned = Vec::with_capacity(host_cpu_series.len());
    let mut host_aligned = Vec::with_capacity(host_cpu_series.len());

    let mut snapshots = process.snapshots.iter().peekable();
    for (host, host_cpu) in host_window.iter().zip(host_cpu_series.iter()) {
        while let Some(snap) = snapshots.peek() {
            if snap.ts < host.ts {
                snapshots.next();
            } else {
                break;
            }
        }
        if let Some(snap) = snapshots.peek() {
            if snap.ts == host.ts {
                pid_aligned.push(snap.cpu_pct);
                host_aligned.push(*host_cpu);
                snapshots.next();
            }
        }
    }

    if pid_aligned.len() < MIN_CORRELATION_SAMPLES {
        return 0.0;
    }

    math::centered_cosine(&pid_aligned, &host_aligned).max(0.0)
}

fn share(pid_integral: f64, host_integral: f64) -> f64 {
    if host_integral <= 0.0 {
        return 0.0;
    }
    (pid_integral / host_integral).clamp(0.0, 1.0)
}

/// NaN/Inf intermediate values collapse the component to 0.
fn sanitize(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::*;
    use crate::telemetry::ProcessSnapshot;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        let base: DateTime<Utc> = "2026-03-01T10:00:00Z".parse().expect("valid ts");
        base + Duration::seconds(offset_secs)
    }

    fn host_series(offset: i64, values: &[(f64, f64)]) -> Vec<HostSample> {
        values
            .iter()
            .enumerate()
            .map(|(i, (cpu, ram))| HostSample {
                ts: ts(offset + i as i64),
                cpu_pct: *cpu,
                ram_pct: *ram,
            })
            .collect()
    }

    fn process(pid: u32, offset: i64, cpu_ram: &[(f64, f64)]) -> ProcessWindow {
        ProcessWindow {
            pid,
            name: format!("proc-{pid}"),
            cmdline: None,
            snapshots: cpu_ram
                .iter()
                .enumerate()
                .map(|(i, (cpu, ram))| ProcessSnapshot {
                    ts: ts(offset + i as i64),
                    cpu_pct: *cpu,
                    ram_pct: *ram,
                    disk_bytes: 0,
                    net_bytes: 0,
                    event_count: 1,
                })
                .collect(),
        }
    }

    /// A noisy idle baseline followed by a 20-sample spike window where
    /// three pids split the host cpu 80/15/5.
    fn attribution_input() -> RankInput {
        let baseline: Vec<(f64, f64)> = (0..120)
            .map(|i| (5.0 + (i % 5) as f64, 30.0 + (i % 3) as f64))
            .collect();

        let window_len = 20usize;
        let host: Vec<(f64, f64)> = (0..window_len).map(|_| (95.0, 40.0)).collect();

        let p1: Vec<(f64, f64)> = (0..window_len).map(|_| (76.0, 20.0)).collect();
        let p2: Vec<(f64, f64)> = (0..window_len).map(|_| (14.25, 8.0)).collect();
        let p3: Vec<(f64, f64)> = (0..window_len).map(|_| (4.75, 4.0)).collect();

        RankInput {
            host_window: host_series(120, &host),
            host_baseline: host_series(0, &baseline),
            processes: vec![
                process(2000, 120, &p2),
                process(3000, 120, &p3),
                process(1000, 120, &p1),
            ],
        }
    }

    #[test]
    fn test_attribution_order_and_scores() {
        let outcome = rank(&attribution_input());

        let pids: Vec<u32> = outcome.suspects.iter().map(|s| s.pid).collect();
        assert_eq!(pids, vec![1000, 2000, 3000]);

        let top = &outcome.suspects[0];
        assert!(top.score >= 0.6, "dominant pid scores high, got {}", top.score);
        assert!((top.cpu_share - 0.8).abs() < 1e-9);
        assert!(outcome.confidence >= top.score);
    }

    #[test]
    fn test_score_is_exact_component_fusion() {
        let outcome = rank(&attribution_input());
        for s in &outcome.suspects {
            let fused = 0.4 * s.anomaly + 0.4 * s.energy + 0.2 * s.correlation;
            assert!((s.score - fused).abs() < 1e-9);
        }
    }

    #[test]
    fn test_rerun_is_identical() {
        let input = attribution_input();
        let a = rank(&input);
        let b = rank(&input);
        assert_eq!(a, b);
    }

    #[test]
    fn test_cpu_shares_sum_bounded() {
        let outcome = rank(&attribution_input());
        let sum: f64 = outcome.suspects.iter().map(|s| s.cpu_share).sum();
        assert!(sum <= 1.0 + 1e-9);
    }

    #[test]
    fn test_empty_window_pid_excluded() {
        let mut input = attribution_input();
        input.processes.push(ProcessWindow {
            pid: 9999,
            name: "ghost".to_string(),
            cmdline: None,
            snapshots: Vec::new(),
        });

        let outcome = rank(&input);
        assert!(outcome.suspects.iter().all(|s| s.pid != 9999));
    }

    #[test]
    fn test_all_zero_components_excluded() {
        let mut input = attribution_input();
        // A pid with zero cpu/ram everywhere: zero energy, zero anomaly
        // after the squash rounds to ~0? Anomaly won't be exactly zero, so
        // give it the baseline mean so the distance is 0.
        let idle: Vec<(f64, f64)> = (0..3).map(|_| (7.0, 31.0)).collect();
        input.processes.push(process(500, 120, &idle));

        let outcome = rank(&input);
        // pid 500 may appear with a tiny score, but never above the others.
        if let Some(pos) = outcome.suspects.iter().position(|s| s.pid == 500) {
            assert!(pos >= 3);
        }
    }

    #[test]
    fn test_short_overlap_zeroes_correlation() {
        let mut input = attribution_input();
        // 5 overlapping samples < MIN_CORRELATION_SAMPLES.
        let brief: Vec<(f64, f64)> = (0..5).map(|_| (50.0, 10.0)).collect();
        input.processes.push(process(700, 120, &brief));

        let outcome = rank(&input);
        let s = outcome
            .suspects
            .iter()
            .find(|s| s.pid == 700)
            .expect("brief pid still ranks on energy/anomaly");
        assert_eq!(s.correlation, 0.0);
    }

    #[test]
    fn test_singular_baseline_uses_diagonal_fallback() {
        let mut input = attribution_input();
        // Perfectly flat baseline: covariance is singular.
        input.host_baseline = host_series(0, &vec![(10.0, 30.0); 120]);

        let outcome = rank(&input);
        let top = &outcome.suspects[0];
        assert_eq!(top.pid, 1000);
        assert!(top.anomaly > 0.9, "fallback still flags the outlier");
    }

    #[test]
    fn test_tie_breaks_prefer_lower_pid() {
        let window: Vec<(f64, f64)> = (0..20).map(|_| (40.0, 10.0)).collect();
        let input = RankInput {
            host_window: host_series(120, &vec![(80.0, 40.0); 20]),
            host_baseline: host_series(0, &(0..120)
                .map(|i| (5.0 + (i % 5) as f64, 30.0 + (i % 3) as f64))
                .collect::<Vec<_>>()),
            processes: vec![process(4000, 120, &window), process(300, 120, &window)],
        };

        let outcome = rank(&input);
        assert_eq!(outcome.suspects[0].pid, 300);
        assert_eq!(outcome.suspects[1].pid, 4000);
        assert_eq!(outcome.suspects[0].score, outcome.suspects[1].score);
    }

    #[test]
    fn test_confidence_boost_requires_strong_component() {
        let outcome = rank(&attribution_input());
        let top = &outcome.suspects[0];
        if top.anomaly >= 0.5 || top.energy >= 0.5 || top.correlation >= 0.5 {
            assert!((outcome.confidence - (top.score * 1.25).min(1.0)).abs() < 1e-12);
        } else {
            assert!((outcome.confidence - top.score).abs() < 1e-12);
        }
    }

    #[test]
    fn test_empty_input_yields_no_suspects() {
        let input = RankInput {
            host_window: Vec::new(),
            host_baseline: Vec::new(),
            processes: Vec::new(),
        };
        let outcome = rank(&input);
        assert!(outcome.suspects.is_empty());
        assert_eq!(outcome.confidence, 0.0);
    }
}
