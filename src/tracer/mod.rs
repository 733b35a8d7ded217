pub mod event;
pub mod parse;
pub mod queue;
pub mod stats;

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TracerConfig;

use self::queue::{EventQueue, PushOutcome};
use self::stats::IngestStats;

/// Events whose wall timestamp regresses more than this behind the
/// per-source high-water mark are dropped; smaller regressions are
/// clamped forward to keep the stream monotonic.
const REORDER_SLACK: Duration = Duration::from_secs(5);

/// A tracer run shorter than this counts against the restart budget.
const HEALTHY_RUN: Duration = Duration::from_secs(60);

/// Consecutive failed restarts before the supervisor gives up.
const MAX_FAILED_RESTARTS: u32 = 10;

/// Restart backoff cap.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// The tracer subprocess could not be kept alive.
#[derive(Debug, Error)]
#[error("tracer stream lost after {restarts} consecutive failed restarts")]
pub struct TracerLost {
    pub restarts: u32,
}

/// Why a single reader pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderExit {
    Cancelled,
    StreamEnded,
}

/// Supervises the external tracer subprocess: spawns it, reads its
/// line-delimited JSON stdout, normalizes each line, and publishes events
/// onto the bounded ingest queue. A lost tracer is restarted with
/// exponential backoff; a tracer that cannot be kept alive surfaces
/// [`TracerLost`].
pub struct Supervisor {
    cfg: TracerConfig,
    queue: Arc<EventQueue>,
    stats: Arc<IngestStats>,
    started: Instant,
}

impl Supervisor {
    pub fn new(cfg: TracerConfig, queue: Arc<EventQueue>, stats: Arc<IngestStats>) -> Self {
        Self {
            cfg,
            queue,
            stats,
            started: Instant::now(),
        }
    }

    /// Run until cancellation or an unrecoverable tracer loss. The queue
    /// is closed on exit so the consumer observes the shutdown sentinel.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut backoff = Duration::from_secs(1);
        let mut failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let run_started = Instant::now();

            match self.run_once(&cancel).await {
                Ok(ReaderExit::Cancelled) => break,
                res => {
                    if let Err(e) = &res {
                        warn!(error = %e, "tracer run failed");
                    }
                    if cancel.is_cancelled() {
                        break;
                    }

                    if run_started.elapsed() >= HEALTHY_RUN {
                        failures = 0;
                        backoff = Duration::from_secs(1);
                    }

                    failures += 1;
                    if failures >= MAX_FAILED_RESTARTS {
                        self.queue.close();
                        return Err(TracerLost { restarts: failures }.into());
                    }

                    self.stats.record_tracer_restart();
                    warn!(
                        failures,
                        backoff_secs = backoff.as_secs(),
                        "tracer stream lost, restarting",
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        self.queue.close();
        Ok(())
    }

    /// Spawn the tracer once and read its stdout until EOF or cancellation.
    async fn run_once(&self, cancel: &CancellationToken) -> Result<ReaderExit> {
        info!(command = %self.cfg.command, "starting tracer");

        let mut child = Command::new(&self.cfg.command)
            .args(&self.cfg.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning tracer {:?}", self.cfg.command))?;

        let stdout = child.stdout.take().context("tracer stdout not captured")?;

        // Drain stderr so the subprocess never blocks on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!(line = %line.trim(), "tracer stderr");
                    }
                }
            });
        }

        let exit = self.read_stream(BufReader::new(stdout), cancel).await;

        if matches!(exit, Ok(ReaderExit::Cancelled)) {
            let _ = child.start_kill();
        }
        let _ = child.wait().await;

        exit.map_err(Into::into)
    }

    /// Read line-delimited events from any buffered byte stream. The
    /// current line is finished before a cancellation takes effect.
    async fn read_stream<R>(
        &self,
        reader: R,
        cancel: &CancellationToken,
    ) -> std::io::Result<ReaderExit>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut last_ts: Option<DateTime<Utc>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(ReaderExit::Cancelled),
                line = lines.next_line() => match line? {
                    None => return Ok(ReaderExit::StreamEnded),
                    Some(line) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            self.ingest_line(line, &mut last_ts);
                        }
                    }
                },
            }
        }
    }

    /// Normalize one line and publish it. Malformed and badly reordered
    /// lines are counted, never propagated.
    fn ingest_line(&self, line: &str, last_ts: &mut Option<DateTime<Utc>>) {
        let recv_ns = self.started.elapsed().as_nanos() as u64;

        let mut event = match parse::parse_line(line, recv_ns, Utc::now()) {
            Ok(event) => event,
            Err(e) => {
                self.stats.record_malformed();
                debug!(error = %e, "dropping malformed tracer line");
                return;
            }
        };

        if let Some(prev) = *last_ts {
            if event.ts < prev {
                let lag = (prev - event.ts).to_std().unwrap_or_default();
                if lag > REORDER_SLACK {
                    self.stats.record_out_of_order_drop();
                    return;
                }
                // Small regressions clamp forward to the high-water mark.
                event.ts = prev;
            }
        }
        *last_ts = Some(event.ts);

        let kind = event.kind;
        if self.queue.push(event) == PushOutcome::DroppedOldest {
            self.stats.record_backpressure_drop();
        }
        self.stats.record(kind);
    }
}
