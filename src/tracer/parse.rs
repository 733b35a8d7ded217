//! Line parsing for the tracer's newline-delimited JSON stream.
//!
//! Decodes one JSON object per line into a [`NormalizedEvent`]. Decoding
//! happens exactly once at ingest: downstream consumers only ever see the
//! normalized event with its tagged-scalar payload map, never raw JSON.

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use super::event::{EventKind, NormalizedEvent, PayloadValue};

/// Errors that can occur while normalizing a tracer line.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("line is not a JSON object")]
    NotAnObject,

    #[error("missing or empty event_type")]
    MissingKind,
}

/// Parse one tracer line into a [`NormalizedEvent`].
///
/// `recv_ns` is the monotonic receive timestamp attached to the event;
/// `now` is the wall clock used when the tracer's `ts` field is absent or
/// unparsable. Unknown event kinds fold to [`EventKind::Other`] with the
/// original string preserved under the `original_kind` payload key.
/// Unknown top-level fields are preserved in the payload map.
pub fn parse_line(line: &str, recv_ns: u64, now: DateTime<Utc>) -> Result<NormalizedEvent, ParseError> {
    let value: Value = serde_json::from_str(line)?;
    let Value::Object(mut obj) = value else {
        return Err(ParseError::NotAnObject);
    };

    let kind_raw = match obj.remove("event_type") {
        Some(Value::String(s)) if !s.is_empty() => s,
        _ => return Err(ParseError::MissingKind),
    };

    let ts = obj
        .remove("ts")
        .and_then(|v| match v {
            Value::String(s) => DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            _ => None,
        })
        .unwrap_or(now);

    let pid = take_id(&mut obj, "pid");
    let tid = take_id(&mut obj, "tid");

    let core = obj
        .remove("cpu")
        .and_then(|v| v.as_i64())
        .and_then(|v| u16::try_from(v).ok());

    let provider = match obj.remove("provider") {
        Some(Value::String(s)) => s,
        _ => "unknown".to_string(),
    };

    let mut payload = std::collections::BTreeMap::new();

    // The declared payload object comes first, then remaining top-level
    // fields; top-level values win on key collision.
    if let Some(Value::Object(declared)) = obj.remove("payload") {
        for (k, v) in declared {
            payload.insert(k, scalar(v));
        }
    }
    for (k, v) in obj {
        payload.insert(k, scalar(v));
    }

    let kind = match EventKind::from_str(&kind_raw) {
        Some(kind) => kind,
        None => {
            payload.insert("original_kind".to_string(), PayloadValue::Str(kind_raw));
            EventKind::Other
        }
    };

    Ok(NormalizedEvent {
        recv_ns,
        ts,
        kind,
        pid,
        tid,
        core,
        provider,
        payload,
    })
}

/// Extract an optional process/thread id. The tracer uses -1 for "none".
fn take_id(obj: &mut serde_json::Map<String, Value>, key: &str) -> Option<u32> {
    obj.remove(key)
        .and_then(|v| v.as_i64())
        .and_then(|v| u32::try_from(v).ok())
}

/// Collapse a JSON value to a tagged scalar. Arrays and objects are kept
/// as their compact string rendering so no payload information is lost.
fn scalar(v: Value) -> PayloadValue {
    match v {
        Value::Null => PayloadValue::Null,
        Value::Bool(b) => PayloadValue::Bool(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                PayloadValue::Int(i)
            } else {
                PayloadValue::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => PayloadValue::Str(s),
        composite => PayloadValue::Str(composite.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        "2026-03-01T10:00:00Z".parse().expect("valid ts")
    }

    #[test]
    fn test_parse_full_line() {
        let line = r#"{"ts":"2026-03-01T09:59:58+00:00","event_type":"tcp_send","pid":4312,"tid":11,"cpu":3,"provider":"Microsoft-Windows-Kernel-Network","net_bytes":1460,"payload":{"dport":443}}"#;

        let ev = parse_line(line, 7, now()).expect("parses");
        assert_eq!(ev.kind, EventKind::TcpSend);
        assert_eq!(ev.pid, Some(4312));
        assert_eq!(ev.tid, Some(11));
        assert_eq!(ev.core, Some(3));
        assert_eq!(ev.provider, "Microsoft-Windows-Kernel-Network");
        assert_eq!(ev.recv_ns, 7);
        assert_eq!(ev.net_bytes(), Some(1460));
        assert_eq!(ev.payload_u64("dport"), Some(443));
        assert_eq!(ev.ts.to_rfc3339(), "2026-03-01T09:59:58+00:00");
    }

    #[test]
    fn test_parse_negative_pid_is_none() {
        let line = r#"{"event_type":"cpu_sample","pid":-1,"tid":-1,"provider":"kernel"}"#;
        let ev = parse_line(line, 0, now()).expect("parses");
        assert_eq!(ev.pid, None);
        assert_eq!(ev.tid, None);
    }

    #[test]
    fn test_parse_missing_ts_uses_now() {
        let line = r#"{"event_type":"gc","pid":10,"provider":"clr"}"#;
        let ev = parse_line(line, 0, now()).expect("parses");
        assert_eq!(ev.ts, now());
    }

    #[test]
    fn test_parse_garbage_ts_uses_now() {
        let line = r#"{"ts":"yesterday-ish","event_type":"gc","pid":10,"provider":"clr"}"#;
        let ev = parse_line(line, 0, now()).expect("parses");
        assert_eq!(ev.ts, now());
    }

    #[test]
    fn test_parse_unknown_kind_folds_to_other() {
        let line = r#"{"event_type":"registry_write","pid":10,"provider":"kernel"}"#;
        let ev = parse_line(line, 0, now()).expect("parses");
        assert_eq!(ev.kind, EventKind::Other);
        assert_eq!(
            ev.payload.get("original_kind"),
            Some(&PayloadValue::Str("registry_write".to_string())),
        );
    }

    #[test]
    fn test_parse_missing_kind_is_error() {
        let err = parse_line(r#"{"pid":10,"provider":"kernel"}"#, 0, now()).unwrap_err();
        assert!(matches!(err, ParseError::MissingKind));

        let err = parse_line(r#"{"event_type":"","pid":10}"#, 0, now()).unwrap_err();
        assert!(matches!(err, ParseError::MissingKind));
    }

    #[test]
    fn test_parse_invalid_json_is_error() {
        assert!(matches!(
            parse_line("not json at all", 0, now()),
            Err(ParseError::Json(_)),
        ));
        assert!(matches!(
            parse_line(r#"[1,2,3]"#, 0, now()),
            Err(ParseError::NotAnObject),
        ));
    }

    #[test]
    fn test_parse_unknown_fields_preserved_in_payload() {
        let line = r#"{"event_type":"context_switch","pid":1,"provider":"kernel","new_pid":77,"reason":"preempt","weird_field":true}"#;
        let ev = parse_line(line, 0, now()).expect("parses");
        assert_eq!(ev.new_pid(), Some(77));
        assert_eq!(
            ev.payload.get("reason"),
            Some(&PayloadValue::Str("preempt".to_string())),
        );
        assert_eq!(ev.payload.get("weird_field"), Some(&PayloadValue::Bool(true)));
    }

    #[test]
    fn test_parse_composite_payload_value_stringified() {
        let line = r#"{"event_type":"other","provider":"p","payload":{"stack":[1,2]}}"#;
        let ev = parse_line(line, 0, now()).expect("parses");
        assert_eq!(
            ev.payload.get("stack"),
            Some(&PayloadValue::Str("[1,2]".to_string())),
        );
    }

    #[test]
    fn test_parse_float_and_null_payload_values() {
        let line = r#"{"event_type":"mem_sample","pid":5,"provider":"kernel","payload":{"working_set_pct":12.5,"region":null}}"#;
        let ev = parse_line(line, 0, now()).expect("parses");
        assert_eq!(
            ev.payload.get("working_set_pct"),
            Some(&PayloadValue::Float(12.5)),
        );
        assert_eq!(ev.payload.get("region"), Some(&PayloadValue::Null));
    }
}
