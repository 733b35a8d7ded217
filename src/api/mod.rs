//! Read API adapter and HTTP server.
//!
//! Thin mapping from store and telemetry queries to the response shapes
//! consumed by the dashboard. All timestamps serialize as ISO-8601 UTC;
//! non-finite numbers serialize as null (serde_json renders them so).
//! The same listener serves /healthz and /metrics.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::health::HealthMetrics;
use crate::incident::{RcaReport, SpikeIncident};
use crate::store::IncidentStore;
use crate::telemetry::SharedAggregator;

/// Hard cap on `/api/events?limit=N`.
const MAX_EVENT_LIMIT: usize = 500;

/// Default event count when the query omits `limit`.
const DEFAULT_EVENT_LIMIT: usize = 200;

/// Default telemetry window when the query omits `seconds`.
const DEFAULT_WINDOW_SECONDS: u64 = 60;

/// Lookback used when serving the flat event list.
const EVENT_LOOKBACK_SECONDS: u64 = 86_400;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<IncidentStore>,
    pub telemetry: SharedAggregator,
    pub health: Arc<HealthMetrics>,
    /// Store retention cap; bounds the spike listing.
    pub retention: usize,
    /// Host ring size; bounds the telemetry window query.
    pub host_window_seconds: u64,
}

// --- Response shapes ---

#[derive(Debug, Serialize)]
pub struct SpikesResponse {
    pub spikes: Vec<SpikeIncident>,
}

#[derive(Debug, Serialize)]
pub struct LatestRcaResponse {
    pub latest_rca: Option<RcaReport>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<crate::tracer::event::NormalizedEvent>,
}

#[derive(Debug, Serialize)]
pub struct TelemetryPoint {
    pub ts: DateTime<Utc>,
    pub cpu: f64,
    pub ram: f64,
}

#[derive(Debug, Serialize)]
pub struct TelemetryWindowResponse {
    pub window_seconds: u64,
    pub samples: Vec<TelemetryPoint>,
}

#[derive(Debug, Serialize)]
pub struct TelemetryLatestResponse {
    pub telemetry: Option<TelemetryPoint>,
}

// --- Adapter queries (pure mapping, handlers stay thin) ---

/// All retained incidents, newest first.
pub fn list_spikes(state: &ApiState) -> SpikesResponse {
    SpikesResponse {
        spikes: state.store.list(state.retention, None),
    }
}

/// One incident by id.
pub fn get_spike(state: &ApiState, id: u64) -> Option<SpikeIncident> {
    state.store.get(id)
}

/// The most recent attached RCA, if any.
pub fn latest_rca(state: &ApiState) -> LatestRcaResponse {
    LatestRcaResponse {
        latest_rca: state.store.latest_rca(),
    }
}

/// The last `limit` normalized events, oldest first.
pub fn recent_events(state: &ApiState, limit: Option<usize>) -> EventsResponse {
    let limit = limit.unwrap_or(DEFAULT_EVENT_LIMIT).min(MAX_EVENT_LIMIT);
    EventsResponse {
        events: state
            .telemetry
            .lock()
            .recent_events(EVENT_LOOKBACK_SECONDS, limit),
    }
}

/// Host samples over the trailing window.
pub fn telemetry_window(state: &ApiState, seconds: Option<u64>) -> TelemetryWindowResponse {
    let seconds = seconds
        .unwrap_or(DEFAULT_WINDOW_SECONDS)
        .clamp(1, state.host_window_seconds);

    let samples = state
        .telemetry
        .lock()
        .host_window(seconds)
        .into_iter()
        .map(|s| TelemetryPoint {
            ts: s.ts,
            cpu: s.cpu_pct,
            ram: s.ram_pct,
        })
        .collect();

    TelemetryWindowResponse {
        window_seconds: seconds,
        samples,
    }
}

/// The newest host sample.
pub fn telemetry_latest(state: &ApiState) -> TelemetryLatestResponse {
    TelemetryLatestResponse {
        telemetry: state
            .telemetry
            .lock()
            .latest_host_sample()
            .map(|s| TelemetryPoint {
                ts: s.ts,
                cpu: s.cpu_pct,
                ram: s.ram_pct,
            }),
    }
}

// --- HTTP wiring ---

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    seconds: Option<u64>,
}

/// Build the full router over the adapter.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/spikes", get(spikes_handler))
        .route("/api/spikes/:id", get(spike_handler))
        .route("/api/latest-rca", get(latest_rca_handler))
        .route("/api/events", get(events_handler))
        .route("/api/telemetry/window", get(window_handler))
        .route("/api/telemetry/latest", get(latest_telemetry_handler))
        .with_state(state)
}

async fn healthz_handler() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<ApiState>) -> String {
    state.health.gather()
}

async fn spikes_handler(State(state): State<ApiState>) -> Json<SpikesResponse> {
    Json(list_spikes(&state))
}

async fn spike_handler(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    match get_spike(&state, id) {
        Some(incident) => Json(incident).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("spike {id} not found")})),
        )
            .into_response(),
    }
}

async fn latest_rca_handler(State(state): State<ApiState>) -> Json<LatestRcaResponse> {
    Json(latest_rca(&state))
}

async fn events_handler(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> Json<EventsResponse> {
    Json(recent_events(&state, query.limit))
}

async fn window_handler(
    State(state): State<ApiState>,
    Query(query): Query<WindowQuery>,
) -> Json<TelemetryWindowResponse> {
    Json(telemetry_window(&state, query.seconds))
}

async fn latest_telemetry_handler(State(state): State<ApiState>) -> Json<TelemetryLatestResponse> {
    Json(telemetry_latest(&state))
}

/// HTTP server owning the listener lifecycle.
pub struct ApiServer {
    addr: String,
    state: ApiState,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl ApiServer {
    pub fn new(addr: &str, state: ApiState) -> Self {
        Self {
            addr: addr.to_string(),
            state,
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Bind and serve in a background task.
    pub async fn start(&self) -> Result<()> {
        // ":port" shorthand binds all interfaces.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app = router(self.state.clone());

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "read api server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "read api server error");
            }
        });

        Ok(())
    }

    /// Gracefully shut the server down.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::config::TelemetryConfig;
    use crate::incident::SpikeKindTag;
    use crate::store::IncidentDraft;
    use crate::telemetry::probe::ScriptedProbe;
    use crate::telemetry::Aggregator;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        let base: DateTime<Utc> = "2026-03-01T10:00:00Z".parse().expect("valid ts");
        base + Duration::seconds(offset_secs)
    }

    fn state() -> ApiState {
        let store = Arc::new(IncidentStore::new(200));
        for i in 0..3 {
            store.insert(IncidentDraft {
                detected_at: ts(i * 100),
                cpu_at_confirm: 95.0,
                ram_at_confirm: 40.0,
                peak_cpu: 99.0,
                peak_ram: 44.0,
                spike_kind: SpikeKindTag::Cpu,
                window_start: ts(i * 100 - 60),
                window_end: ts(i * 100),
                attached_event_count: 0,
                etw_events: Vec::new(),
            });
        }

        let mut agg = Aggregator::new(&TelemetryConfig::default(), 4);
        let mut probe = ScriptedProbe::flat(30.0, 55.0, 4);
        for i in 0..10 {
            agg.tick(ts(i), &mut probe);
        }

        ApiState {
            store,
            telemetry: Arc::new(parking_lot::Mutex::new(agg)),
            health: Arc::new(HealthMetrics::new().expect("metrics")),
            retention: 200,
            host_window_seconds: 300,
        }
    }

    #[test]
    fn test_list_spikes_newest_first() {
        let response = list_spikes(&state());
        let ids: Vec<u64> = response.spikes.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_get_spike_by_id() {
        let state = state();
        assert_eq!(get_spike(&state, 2).expect("incident").id, 2);
        assert!(get_spike(&state, 99).is_none());
    }

    #[test]
    fn test_latest_rca_null_when_pending() {
        let response = latest_rca(&state());
        assert!(response.latest_rca.is_none());

        let json = serde_json::to_value(&response).expect("serialize");
        assert!(json["latest_rca"].is_null());
    }

    #[test]
    fn test_telemetry_window_clamps_seconds() {
        let state = state();

        let response = telemetry_window(&state, Some(5));
        assert_eq!(response.window_seconds, 5);
        assert_eq!(response.samples.len(), 5);

        // Oversized request clamps to the ring size.
        let response = telemetry_window(&state, Some(100_000));
        assert_eq!(response.window_seconds, 300);

        // Omitted defaults to 60.
        let response = telemetry_window(&state, None);
        assert_eq!(response.window_seconds, 60);
    }

    #[test]
    fn test_telemetry_latest() {
        let response = telemetry_latest(&state());
        let point = response.telemetry.expect("sample");
        assert_eq!(point.ts, ts(9));
        assert_eq!(point.cpu, 30.0);
    }

    #[test]
    fn test_events_limit_capped() {
        let state = state();
        {
            let mut agg = state.telemetry.lock();
            for i in 0..700 {
                agg.ingest(crate::tracer::event::NormalizedEvent {
                    recv_ns: i,
                    ts: ts(20 + i as i64 / 100),
                    kind: crate::tracer::event::EventKind::Gc,
                    pid: Some(1),
                    tid: None,
                    core: None,
                    provider: "clr".to_string(),
                    payload: Default::default(),
                });
            }
        }

        assert_eq!(recent_events(&state, None).events.len(), 200);
        assert_eq!(recent_events(&state, Some(50)).events.len(), 50);
        // The 500 cap holds even for larger requests.
        assert_eq!(recent_events(&state, Some(9_999)).events.len(), 500);
    }

    #[test]
    fn test_window_samples_serialize_iso8601() {
        let response = telemetry_window(&state(), Some(5));
        let json = serde_json::to_value(&response).expect("serialize");
        let first_ts = json["samples"][0]["ts"].as_str().expect("string ts");
        assert!(chrono::DateTime::parse_from_rfc3339(first_ts).is_ok());
    }
}
