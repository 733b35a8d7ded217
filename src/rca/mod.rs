pub mod client;
pub mod evidence;

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::rank::RankOutcome;
use crate::store::IncidentStore;

use self::client::{LlmError, RcaBackend};
use self::evidence::EvidencePayload;

/// One incident awaiting analysis.
pub struct PendingRca {
    pub payload: EvidencePayload,
    pub outcome: RankOutcome,
}

impl PendingRca {
    fn incident_id(&self) -> u64 {
        self.payload.incident.id
    }
}

/// Single-flight RCA worker.
///
/// Incidents queue FIFO with a bounded depth; at most one collaborator
/// request is outstanding. Every dequeued incident ends with exactly one
/// `update_rca`, whether from a validated reply or a fallback report.
pub struct RcaWorker<B: RcaBackend> {
    backend: B,
    store: Arc<IncidentStore>,
    queue: parking_lot::Mutex<VecDeque<PendingRca>>,
    notify: Notify,
    depth: usize,
}

impl<B: RcaBackend> RcaWorker<B> {
    pub fn new(backend: B, store: Arc<IncidentStore>, depth: usize) -> Self {
        Self {
            backend,
            store,
            queue: parking_lot::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            depth: depth.max(1),
        }
    }

    /// Queue an incident for analysis. On overflow the oldest unsent
    /// attempt is dropped and its incident recorded as backpressured.
    pub fn enqueue(&self, pending: PendingRca) {
        let overflow = {
            let mut queue = self.queue.lock();
            let overflow = if queue.len() >= self.depth {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(pending);
            overflow
        };

        if let Some(dropped) = overflow {
            warn!(
                incident_id = dropped.incident_id(),
                "rca queue full, dropping oldest unsent attempt",
            );
            self.store.update_rca(
                dropped.incident_id(),
                evidence::unavailable_report(
                    "backpressure",
                    &dropped.payload,
                    &dropped.outcome,
                    Utc::now(),
                ),
            );
        }

        self.notify.notify_one();
    }

    /// Run until cancellation. In-flight and still-queued incidents are
    /// recorded as shut down before returning.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            let pending = loop {
                let notified = self.notify.notified();
                if let Some(pending) = self.queue.lock().pop_front() {
                    break Some(pending);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break None,
                    _ = notified => {}
                }
            };

            let Some(pending) = pending else {
                break;
            };

            let incident_id = pending.incident_id();
            let result: Result<Result<_, LlmError>, ()> = tokio::select! {
                _ = cancel.cancelled() => Err(()),
                res = self.backend.analyze(&pending.payload, &pending.outcome, incident_id) => {
                    Ok(res)
                }
            };

            let report = match result {
                Ok(Ok(report)) => {
                    info!(incident_id, "rca analysis attached");
                    report
                }
                Ok(Err(LlmError::Schema(detail))) => {
                    warn!(incident_id, detail = %detail, "rca reply failed schema validation");
                    evidence::schema_fallback_report(
                        &pending.payload,
                        &pending.outcome,
                        Utc::now(),
                    )
                }
                Ok(Err(e)) => {
                    warn!(incident_id, error = %e, "rca analysis unavailable");
                    evidence::unavailable_report(
                        &e.reason(),
                        &pending.payload,
                        &pending.outcome,
                        Utc::now(),
                    )
                }
                Err(()) => evidence::unavailable_report(
                    "shutdown",
                    &pending.payload,
                    &pending.outcome,
                    Utc::now(),
                ),
            };

            self.store.update_rca(incident_id, report);

            if cancel.is_cancelled() {
                break;
            }
        }

        // Drain whatever is still queued as shut down.
        let remaining: Vec<PendingRca> = self.queue.lock().drain(..).collect();
        for pending in remaining {
            self.store.update_rca(
                pending.incident_id(),
                evidence::unavailable_report(
                    "shutdown",
                    &pending.payload,
                    &pending.outcome,
                    Utc::now(),
                ),
            );
        }
    }

    /// Currently queued attempts.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}
