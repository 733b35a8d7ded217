//! Agent orchestration: wires the tracer supervisor, telemetry ticker,
//! spike detector, ranker, RCA worker, and read API together.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{ApiServer, ApiState};
use crate::config::Config;
use crate::detect::{SpikeDetector, SpikeEdge};
use crate::health::HealthMetrics;
use crate::incident::MAX_EVIDENCE_EVENTS;
use crate::rank::{self, RankInput, RankOutcome};
use crate::rca::client::HttpLlmClient;
use crate::rca::{evidence, PendingRca, RcaWorker};
use crate::store::{IncidentDraft, IncidentStore};
use crate::telemetry::probe::{HostProbe, SystemProbe};
use crate::telemetry::{Aggregator, SharedAggregator};
use crate::tracer::queue::EventQueue;
use crate::tracer::stats::IngestStats;
use crate::tracer::Supervisor;

/// Tasks observe cancellation at their next suspension point and exit
/// within this deadline.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Events drained from the ingest queue per lock hold.
const INGEST_BATCH: usize = 256;

/// Event stats report cadence.
const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Agent owns every long-running component task.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    stats: Arc<IngestStats>,
    store: Arc<IncidentStore>,
    telemetry: SharedAggregator,
    rca_worker: Arc<RcaWorker<HttpLlmClient>>,
    api: Option<ApiServer>,
    cancel: CancellationToken,

    tracer_task: Option<JoinHandle<Result<()>>>,
    consumer_task: Option<JoinHandle<()>>,
    ticker_task: Option<JoinHandle<()>>,
    rca_task: Option<JoinHandle<()>>,
}

impl Agent {
    pub fn new(cfg: Config) -> Result<Self> {
        let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);
        let store = Arc::new(IncidentStore::new(cfg.store.incident_retention));

        let probe = SystemProbe::new();
        let num_cores = probe.num_cores();
        let telemetry: SharedAggregator = Arc::new(parking_lot::Mutex::new(Aggregator::new(
            &cfg.telemetry,
            num_cores,
        )));

        let llm = HttpLlmClient::new(&cfg.rca).context("creating llm client")?;
        let rca_worker = Arc::new(RcaWorker::new(llm, Arc::clone(&store), cfg.rca.queue_depth));

        Ok(Self {
            cfg,
            health,
            stats: Arc::new(IngestStats::new()),
            store,
            telemetry,
            rca_worker,
            api: None,
            cancel: CancellationToken::new(),
            tracer_task: None,
            consumer_task: None,
            ticker_task: None,
            rca_task: None,
        })
    }

    /// Start all component tasks.
    pub async fn start(&mut self) -> Result<()> {
        // Read API first so probes respond while the pipeline warms up.
        let api = ApiServer::new(
            &self.cfg.api.addr,
            ApiState {
                store: Arc::clone(&self.store),
                telemetry: Arc::clone(&self.telemetry),
                health: Arc::clone(&self.health),
                retention: self.cfg.store.incident_retention,
                host_window_seconds: self.cfg.telemetry.host_window_seconds as u64,
            },
        );
        api.start().await.context("starting read api server")?;
        self.api = Some(api);

        let queue = Arc::new(EventQueue::new(self.cfg.telemetry.queue_capacity));

        // T1: tracer supervisor.
        {
            let supervisor = Supervisor::new(
                self.cfg.tracer.clone(),
                Arc::clone(&queue),
                Arc::clone(&self.stats),
            );
            let cancel = self.cancel.child_token();
            self.tracer_task = Some(tokio::spawn(async move {
                supervisor.run(cancel).await
            }));
        }

        // Queue consumer: drains normalized events into the aggregator.
        {
            let queue = Arc::clone(&queue);
            let telemetry = Arc::clone(&self.telemetry);
            self.consumer_task = Some(tokio::spawn(async move {
                while let Some(event) = queue.recv().await {
                    let mut agg = telemetry.lock();
                    agg.ingest(event);
                    for _ in 0..INGEST_BATCH - 1 {
                        match queue.try_pop() {
                            Some(event) => agg.ingest(event),
                            None => break,
                        }
                    }
                }
                debug!("ingest queue drained, consumer exiting");
            }));
        }

        // T2 + T3: telemetry ticker and spike detector share one task.
        {
            let telemetry = Arc::clone(&self.telemetry);
            let store = Arc::clone(&self.store);
            let health = Arc::clone(&self.health);
            let stats = Arc::clone(&self.stats);
            let rca_worker = Arc::clone(&self.rca_worker);
            let cancel = self.cancel.child_token();
            let tick_interval = self.cfg.telemetry.tick_interval;
            let attribution_window =
                chrono::Duration::from_std(self.cfg.rca.attribution_window)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
            let baseline_window =
                chrono::Duration::seconds(self.cfg.detector.baseline_seconds as i64);
            let mut detector = SpikeDetector::new(self.cfg.detector.clone());
            let mut probe = SystemProbe::new();

            self.ticker_task = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(tick_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                let mut stats_ticker = tokio::time::interval(STATS_REPORT_INTERVAL);
                stats_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,

                        _ = ticker.tick() => {
                            let started = Instant::now();
                            let now = Utc::now();

                            let report = telemetry.lock().tick(now, &mut probe);

                            health.ticks_total.inc();
                            health.tick_duration.observe(started.elapsed().as_secs_f64());
                            health.pids_tracked.set(report.pids_tracked as f64);
                            health.incidents_stored.set(store.len() as f64);
                            health.sync_ingest(&stats);
                            if report.ram_unavailable {
                                health.ram_unavailable_ticks.inc();
                            }

                            let Some(sample) = report.sample else { continue };
                            health.host_cpu_pct.set(sample.cpu_pct);
                            health.host_ram_pct.set(sample.ram_pct);

                            if let Some(edge) = detector.observe(&sample) {
                                handle_confirmed_spike(
                                    edge,
                                    &telemetry,
                                    &store,
                                    &health,
                                    &rca_worker,
                                    attribution_window,
                                    baseline_window,
                                );
                            }
                        }

                        _ = stats_ticker.tick() => {
                            let snapshot = stats.snapshot_kinds();
                            let total: u64 = snapshot.iter().map(|(_, n)| n).sum();
                            if total > 0 {
                                info!(captured = total, "event stats (60s)");
                                for (kind, count) in &snapshot {
                                    debug!(kind = %kind, count, "  by kind (60s)");
                                }
                            }
                        }
                    }
                }
            }));
        }

        // T5: single-flight RCA worker.
        {
            let worker = Arc::clone(&self.rca_worker);
            let cancel = self.cancel.child_token();
            self.rca_task = Some(tokio::spawn(async move {
                worker.run(cancel).await;
            }));
        }

        info!("agent fully started");

        Ok(())
    }

    /// Resolve when the tracer supervisor exits. An `Err` means the
    /// tracer is unrecoverable (exit code 3 at the process boundary).
    pub async fn tracer_finished(&mut self) -> Result<()> {
        match self.tracer_task.as_mut() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("tracer task panicked: {e}")),
            },
            None => std::future::pending().await,
        }
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        join_with_deadline("tracer", self.tracer_task.take()).await;
        join_with_deadline("consumer", self.consumer_task.take()).await;
        join_with_deadline("ticker", self.ticker_task.take()).await;
        join_with_deadline("rca", self.rca_task.take()).await;

        if let Some(api) = &self.api {
            api.stop().await?;
        }

        info!("agent stopped");
        Ok(())
    }
}

/// Await a task's exit, bounded by the shutdown deadline.
async fn join_with_deadline<T>(name: &str, task: Option<JoinHandle<T>>) {
    let Some(task) = task else { return };
    if tokio::time::timeout(SHUTDOWN_DEADLINE, task).await.is_err() {
        warn!(task = name, "task missed the shutdown deadline");
    }
}

/// Materialize an incident from a confirm edge, then rank and queue its
/// RCA off the ticker's thread.
fn handle_confirmed_spike(
    edge: SpikeEdge,
    telemetry: &SharedAggregator,
    store: &Arc<IncidentStore>,
    health: &Arc<HealthMetrics>,
    rca_worker: &Arc<RcaWorker<HttpLlmClient>>,
    attribution_window: chrono::Duration,
    baseline_window: chrono::Duration,
) {
    let window_start = edge.detected_at - attribution_window;
    let window_end = edge.detected_at;

    // One short lock hold copies everything the ranker needs.
    let (draft, input, host_series) = {
        let agg = telemetry.lock();

        let etw_events = agg.events_between(window_start, window_end, MAX_EVIDENCE_EVENTS);
        let attached_event_count = agg.events_between_count(window_start, window_end);

        let host_window = agg.host_range(window_start, window_end);
        let host_baseline = agg.host_range(window_start - baseline_window, window_start);

        let processes = agg
            .active_pids(attribution_window.num_seconds().max(0) as u64)
            .into_iter()
            .filter_map(|pid| agg.process_window(pid, window_start, window_end))
            .collect();

        (
            IncidentDraft {
                detected_at: edge.detected_at,
                cpu_at_confirm: edge.cpu_at_confirm,
                ram_at_confirm: edge.ram_at_confirm,
                peak_cpu: edge.peak_cpu,
                peak_ram: edge.peak_ram,
                spike_kind: edge.kind.into(),
                window_start,
                window_end,
                attached_event_count,
                etw_events,
            },
            RankInput {
                host_window: host_window.clone(),
                host_baseline,
                processes,
            },
            host_window,
        )
    };

    let id = store.insert(draft);
    health.spikes_confirmed.inc();
    info!(
        id,
        cpu = edge.cpu_at_confirm,
        ram = edge.ram_at_confirm,
        "incident recorded",
    );

    // T4: the ranker is pure compute, so it runs on the blocking pool and
    // feeds the RCA queue when done.
    let store = Arc::clone(store);
    let health = Arc::clone(health);
    let rca_worker = Arc::clone(rca_worker);
    tokio::spawn(async move {
        let started = Instant::now();
        let outcome: RankOutcome =
            match tokio::task::spawn_blocking(move || rank::rank(&input)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(id, error = %e, "ranker task failed");
                    RankOutcome {
                        suspects: Vec::new(),
                        confidence: 0.0,
                    }
                }
            };
        health.rank_duration.observe(started.elapsed().as_secs_f64());

        let Some(incident) = store.get(id) else {
            warn!(id, "incident evicted before rca evidence assembly");
            return;
        };

        let payload = evidence::build_payload(&incident, &outcome, &host_series);
        rca_worker.enqueue(PendingRca { payload, outcome });
    });
}
