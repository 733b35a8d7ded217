use chrono::{DateTime, Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use spikewatch::config::DetectorConfig;
use spikewatch::detect::SpikeDetector;
use spikewatch::telemetry::ring::Ring;
use spikewatch::telemetry::HostSample;
use spikewatch::tracer::parse::parse_line;

fn base_ts() -> DateTime<Utc> {
    "2026-03-01T10:00:00Z".parse().expect("valid ts")
}

fn bench_parse_line(c: &mut Criterion) {
    let line = r#"{"ts":"2026-03-01T09:59:58+00:00","event_type":"tcp_send","pid":4312,"tid":11,"cpu":3,"provider":"Microsoft-Windows-Kernel-Network","net_bytes":1460,"payload":{"dport":443,"flags":"PSH"}}"#;
    let now = base_ts();

    c.bench_function("parse_line_tcp_send", |b| {
        b.iter(|| parse_line(black_box(line), black_box(7), now).expect("parses"))
    });

    let unknown = r#"{"ts":"2026-03-01T09:59:58Z","event_type":"registry_write","pid":4312,"provider":"kernel","payload":{"key":"HKLM\\Software"}}"#;
    c.bench_function("parse_line_unknown_kind", |b| {
        b.iter(|| parse_line(black_box(unknown), black_box(7), now).expect("parses"))
    });
}

fn bench_ring_push(c: &mut Criterion) {
    c.bench_function("ring_push_saturated", |b| {
        let mut ring: Ring<HostSample> = Ring::new(300);
        let sample = HostSample {
            ts: base_ts(),
            cpu_pct: 42.0,
            ram_pct: 55.0,
        };
        for _ in 0..300 {
            ring.push(sample);
        }
        b.iter(|| ring.push(black_box(sample)))
    });
}

fn bench_detector_observe(c: &mut Criterion) {
    c.bench_function("detector_observe_warm_baseline", |b| {
        let mut det = SpikeDetector::new(DetectorConfig::default());
        for i in 0..180 {
            det.observe(&HostSample {
                ts: base_ts() + Duration::seconds(i),
                cpu_pct: 5.0 + (i % 6) as f64,
                ram_pct: 30.0 + (i % 6) as f64,
            });
        }

        let mut offset = 180i64;
        b.iter(|| {
            offset += 1;
            det.observe(black_box(&HostSample {
                ts: base_ts() + Duration::seconds(offset),
                cpu_pct: 5.0 + (offset % 6) as f64,
                ram_pct: 30.0 + (offset % 6) as f64,
            }))
        })
    });
}

criterion_group!(
    benches,
    bench_parse_line,
    bench_ring_push,
    bench_detector_observe,
);
criterion_main!(benches);
