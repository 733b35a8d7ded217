use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// EventKind identifies the kind of kernel-trace event.
/// Names match the `event_type` strings emitted by the tracer subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProcessStart,
    ProcessStop,
    ThreadStart,
    ContextSwitch,
    TcpSend,
    TcpRecv,
    FileRead,
    FileWrite,
    CpuSample,
    MemSample,
    Gc,
    Exception,
    Other,
}

impl EventKind {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProcessStart => "process_start",
            Self::ProcessStop => "process_stop",
            Self::ThreadStart => "thread_start",
            Self::ContextSwitch => "context_switch",
            Self::TcpSend => "tcp_send",
            Self::TcpRecv => "tcp_recv",
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::CpuSample => "cpu_sample",
            Self::MemSample => "mem_sample",
            Self::Gc => "gc",
            Self::Exception => "exception",
            Self::Other => "other",
        }
    }

    /// Convert from the canonical label name.
    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "process_start" => Some(Self::ProcessStart),
            "process_stop" => Some(Self::ProcessStop),
            "thread_start" => Some(Self::ThreadStart),
            "context_switch" => Some(Self::ContextSwitch),
            "tcp_send" => Some(Self::TcpSend),
            "tcp_recv" => Some(Self::TcpRecv),
            "file_read" => Some(Self::FileRead),
            "file_write" => Some(Self::FileWrite),
            "cpu_sample" => Some(Self::CpuSample),
            "mem_sample" => Some(Self::MemSample),
            "gc" => Some(Self::Gc),
            "exception" => Some(Self::Exception),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Return all event kinds in declaration order.
    pub const fn all() -> &'static [Self] {
        &[
            Self::ProcessStart,
            Self::ProcessStop,
            Self::ThreadStart,
            Self::ContextSwitch,
            Self::TcpSend,
            Self::TcpRecv,
            Self::FileRead,
            Self::FileWrite,
            Self::CpuSample,
            Self::MemSample,
            Self::Gc,
            Self::Exception,
            Self::Other,
        ]
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar payload value decoded once at ingest.
///
/// The tracer's payload shape varies per provider; downstream code only
/// ever sees this tagged map, never raw JSON. Composite JSON values are
/// flattened to their string rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Null,
}

impl PayloadValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Non-negative integer view of the value, if it has one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(v) if *v >= 0 => Some(*v as u64),
            Self::Float(v) if *v >= 0.0 => Some(*v as u64),
            _ => None,
        }
    }
}

/// A normalized tracer event.
///
/// `recv_ns` is the monotonic receive timestamp (nanoseconds since agent
/// start); `ts` is the wall timestamp, monotonically non-decreasing per
/// source after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    #[serde(default)]
    pub recv_ns: u64,
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub pid: Option<u32>,
    pub tid: Option<u32>,
    pub core: Option<u16>,
    pub provider: String,
    #[serde(default)]
    pub payload: BTreeMap<String, PayloadValue>,
}

impl NormalizedEvent {
    /// Non-negative integer payload field, if present and numeric.
    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(PayloadValue::as_u64)
    }

    /// TCP payload size carried by this event, if any.
    pub fn net_bytes(&self) -> Option<u64> {
        self.payload_u64("net_bytes")
    }

    /// Disk payload size carried by this event, if any.
    pub fn disk_bytes(&self) -> Option<u64> {
        self.payload_u64("disk_bytes")
    }

    /// Incoming pid of a context switch, if any.
    pub fn new_pid(&self) -> Option<u32> {
        self.payload_u64("new_pid").and_then(|v| u32::try_from(v).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_roundtrip() {
        for kind in EventKind::all() {
            assert_eq!(EventKind::from_str(kind.as_str()), Some(*kind));
        }
        assert_eq!(EventKind::from_str("not_a_kind"), None);
    }

    #[test]
    fn test_event_kind_display() {
        assert_eq!(EventKind::ContextSwitch.to_string(), "context_switch");
        assert_eq!(EventKind::TcpRecv.to_string(), "tcp_recv");
        assert_eq!(EventKind::Other.to_string(), "other");
    }

    #[test]
    fn test_all_event_kinds_unique() {
        let all = EventKind::all();
        assert_eq!(all.len(), 13);
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_payload_value_numeric_views() {
        assert_eq!(PayloadValue::Int(42).as_f64(), Some(42.0));
        assert_eq!(PayloadValue::Float(1.5).as_u64(), Some(1));
        assert_eq!(PayloadValue::Int(-1).as_u64(), None);
        assert_eq!(PayloadValue::Str("x".into()).as_f64(), None);
        assert_eq!(PayloadValue::Null.as_u64(), None);
    }

    #[test]
    fn test_payload_accessors() {
        let mut payload = BTreeMap::new();
        payload.insert("net_bytes".to_string(), PayloadValue::Int(2048));
        payload.insert("new_pid".to_string(), PayloadValue::Int(4312));

        let ev = NormalizedEvent {
            recv_ns: 1,
            ts: Utc::now(),
            kind: EventKind::ContextSwitch,
            pid: Some(100),
            tid: None,
            core: Some(2),
            provider: "kernel".to_string(),
            payload,
        };

        assert_eq!(ev.net_bytes(), Some(2048));
        assert_eq!(ev.disk_bytes(), None);
        assert_eq!(ev.new_pid(), Some(4312));
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let mut payload = BTreeMap::new();
        payload.insert("reason".to_string(), PayloadValue::Str("wait".into()));
        payload.insert("disk_bytes".to_string(), PayloadValue::Int(512));

        let ev = NormalizedEvent {
            recv_ns: 99,
            ts: "2026-03-01T12:00:00Z".parse().expect("valid ts"),
            kind: EventKind::FileWrite,
            pid: Some(7),
            tid: Some(8),
            core: None,
            provider: "Microsoft-Windows-Kernel-File".to_string(),
            payload,
        };

        let json = serde_json::to_string(&ev).expect("serialize");
        let back: NormalizedEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.kind, EventKind::FileWrite);
        assert_eq!(back.pid, Some(7));
        assert_eq!(back.disk_bytes(), Some(512));
        assert_eq!(back.ts, ev.ts);
    }
}
