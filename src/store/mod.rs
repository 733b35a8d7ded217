//! In-memory incident store.
//!
//! Single-writer/multi-reader: writers (incident insert, RCA update)
//! serialize on the write half of a RwLock; readers copy incidents out
//! and never observe a partially inserted record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::incident::{RcaReport, SpikeIncident};

/// A new incident before the store assigns its id.
#[derive(Debug, Clone)]
pub struct IncidentDraft {
    pub detected_at: DateTime<Utc>,
    pub cpu_at_confirm: f64,
    pub ram_at_confirm: f64,
    pub peak_cpu: f64,
    pub peak_ram: f64,
    pub spike_kind: crate::incident::SpikeKindTag,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub attached_event_count: usize,
    pub etw_events: Vec<crate::tracer::event::NormalizedEvent>,
}

struct Inner {
    by_id: BTreeMap<u64, SpikeIncident>,
    /// Secondary index: (detected_at, id) → id.
    by_time: BTreeMap<(DateTime<Utc>, u64), u64>,
    next_id: u64,
}

/// FIFO-bounded store of confirmed incidents.
pub struct IncidentStore {
    inner: RwLock<Inner>,
    retention: usize,
}

impl IncidentStore {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_id: BTreeMap::new(),
                by_time: BTreeMap::new(),
                next_id: 1,
            }),
            retention: retention.max(1),
        }
    }

    /// Insert a new incident, assigning the next id. Ids are strictly
    /// increasing and gap-free over the process lifetime.
    pub fn insert(&self, draft: IncidentDraft) -> u64 {
        let mut inner = self.inner.write();

        let id = inner.next_id;
        inner.next_id += 1;

        let incident = SpikeIncident {
            id,
            detected_at: draft.detected_at,
            cpu_at_confirm: draft.cpu_at_confirm,
            ram_at_confirm: draft.ram_at_confirm,
            peak_cpu: draft.peak_cpu,
            peak_ram: draft.peak_ram,
            spike_kind: draft.spike_kind,
            window_start: draft.window_start,
            window_end: draft.window_end,
            attached_event_count: draft.attached_event_count,
            etw_events: draft.etw_events,
            rca: None,
        };

        inner.by_time.insert((incident.detected_at, id), id);
        inner.by_id.insert(id, incident);

        // FIFO eviction beyond the retention cap.
        while inner.by_id.len() > self.retention {
            let oldest_id = match inner.by_id.keys().next().copied() {
                Some(id) => id,
                None => break,
            };
            if let Some(evicted) = inner.by_id.remove(&oldest_id) {
                inner.by_time.remove(&(evicted.detected_at, oldest_id));
                debug!(id = oldest_id, "incident evicted by retention cap");
            }
        }

        id
    }

    /// Attach an RCA report. The field is write-once: a second attempt is
    /// ignored with a warning.
    pub fn update_rca(&self, id: u64, report: RcaReport) -> bool {
        let mut inner = self.inner.write();
        match inner.by_id.get_mut(&id) {
            Some(incident) if incident.rca.is_none() => {
                incident.rca = Some(report);
                true
            }
            Some(_) => {
                warn!(id, "rca already set, ignoring update");
                false
            }
            None => {
                debug!(id, "rca update for evicted or unknown incident");
                false
            }
        }
    }

    /// Incidents newest-first, optionally only those detected after
    /// `since`, capped at `limit`.
    pub fn list(&self, limit: usize, since: Option<DateTime<Utc>>) -> Vec<SpikeIncident> {
        let inner = self.inner.read();

        let ids: Vec<u64> = match since {
            Some(since) => inner
                .by_time
                .range((since, u64::MIN)..)
                .rev()
                .map(|(_, id)| *id)
                .take(limit)
                .collect(),
            None => inner.by_time.iter().rev().map(|(_, id)| *id).take(limit).collect(),
        };

        ids.into_iter()
            .filter_map(|id| inner.by_id.get(&id).cloned())
            .collect()
    }

    pub fn get(&self, id: u64) -> Option<SpikeIncident> {
        self.inner.read().by_id.get(&id).cloned()
    }

    /// The RCA of the most recent incident that has one.
    pub fn latest_rca(&self) -> Option<RcaReport> {
        let inner = self.inner.read();
        inner
            .by_time
            .iter()
            .rev()
            .filter_map(|(_, id)| inner.by_id.get(id))
            .find_map(|incident| incident.rca.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::incident::{RcaReport, ResourceImpact, SpikeKindTag};

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        let base: DateTime<Utc> = "2026-03-01T10:00:00Z".parse().expect("valid ts");
        base + Duration::seconds(offset_secs)
    }

    fn draft(offset_secs: i64) -> IncidentDraft {
        IncidentDraft {
            detected_at: ts(offset_secs),
            cpu_at_confirm: 95.0,
            ram_at_confirm: 40.0,
            peak_cpu: 98.0,
            peak_ram: 42.0,
            spike_kind: SpikeKindTag::Cpu,
            window_start: ts(offset_secs - 60),
            window_end: ts(offset_secs),
            attached_event_count: 0,
            etw_events: Vec::new(),
        }
    }

    fn report(summary: &str) -> RcaReport {
        RcaReport {
            cause_summary: summary.to_string(),
            confidence: 0.5,
            culprit_process: None,
            resource_impact: ResourceImpact::default(),
            ranked_suspects: Vec::new(),
            timeline: Vec::new(),
            recs: Vec::new(),
            generated_at: ts(0),
        }
    }

    #[test]
    fn test_ids_strictly_increasing_gap_free() {
        let store = IncidentStore::new(100);
        let ids: Vec<u64> = (0..10).map(|i| store.insert(draft(i * 100))).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_fifo_eviction_at_cap() {
        let store = IncidentStore::new(3);
        for i in 0..5 {
            store.insert(draft(i * 100));
        }

        assert_eq!(store.len(), 3);
        assert!(store.get(1).is_none());
        assert!(store.get(2).is_none());
        assert!(store.get(3).is_some());
        assert!(store.get(5).is_some());

        // Ids keep increasing past evictions.
        assert_eq!(store.insert(draft(600)), 6);
    }

    #[test]
    fn test_list_newest_first_with_since() {
        let store = IncidentStore::new(100);
        for i in 0..5 {
            store.insert(draft(i * 100));
        }

        let all = store.list(10, None);
        let ids: Vec<u64> = all.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![5, 4, 3, 2, 1]);

        let limited = store.list(2, None);
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, 5);

        let recent = store.list(10, Some(ts(250)));
        let ids: Vec<u64> = recent.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![5, 4]);
    }

    #[test]
    fn test_update_rca_write_once() {
        let store = IncidentStore::new(100);
        let id = store.insert(draft(0));

        assert!(store.update_rca(id, report("first")));
        assert!(!store.update_rca(id, report("second")));

        let rca = store.get(id).expect("incident").rca.expect("rca");
        assert_eq!(rca.cause_summary, "first");
    }

    #[test]
    fn test_update_rca_unknown_id() {
        let store = IncidentStore::new(100);
        assert!(!store.update_rca(42, report("orphan")));
    }

    #[test]
    fn test_latest_rca_skips_pending() {
        let store = IncidentStore::new(100);
        let first = store.insert(draft(0));
        let _second = store.insert(draft(100));

        assert!(store.latest_rca().is_none());

        store.update_rca(first, report("older analysis"));
        // The newest incident has no RCA yet; the latest available one wins.
        assert_eq!(
            store.latest_rca().expect("rca").cause_summary,
            "older analysis",
        );
    }

    #[test]
    fn test_concurrent_readers_see_consistent_state() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(IncidentStore::new(50));
        let writer = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..100 {
                    store.insert(draft(i * 10));
                }
            })
        };

        let reader = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..100 {
                    let list = store.list(10, None);
                    // Ids within one read are strictly descending.
                    for pair in list.windows(2) {
                        assert!(pair[0].id > pair[1].id);
                    }
                }
            })
        };

        writer.join().expect("writer");
        reader.join().expect("reader");
    }
}
