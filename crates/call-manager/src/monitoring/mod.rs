//! In-process counters and latency histograms
//!
//! Nothing is exported from here; [`MetricsCollector::snapshot`] is what an
//! exporter or a status endpoint would read.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Upper bounds of the latency buckets (milliseconds); the last bucket is unbounded
pub const LATENCY_BUCKETS_MS: [u64; 9] = [1, 5, 10, 25, 50, 100, 250, 500, 1000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Ok,
    Error,
    Unhandled,
    Malformed,
}

#[derive(Debug, Default)]
struct Histogram {
    buckets: [u64; LATENCY_BUCKETS_MS.len() + 1],
    count: u64,
    sum_us: u64,
}

impl Histogram {
    fn observe(&mut self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx] += 1;
        self.count += 1;
        self.sum_us += elapsed.as_micros() as u64;
    }
}

/// Collector shared by every component
#[derive(Default)]
pub struct MetricsCollector {
    events: DashMap<(String, String, EventOutcome), AtomicU64>,
    event_latency: DashMap<String, Mutex<Histogram>>,
    commands: DashMap<String, AtomicU64>,
    actions: DashMap<(String, bool), AtomicU64>,
    requests: DashMap<u16, AtomicU64>,
    stale_timers: AtomicU64,
    health_check_exhausted: AtomicU64,
    race_won: AtomicU64,
    race_lost: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCount {
    pub node_id: String,
    pub event_type: String,
    pub outcome: EventOutcome,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_ms: f64,
    /// Cumulative counts per bucket bound; `None` is the unbounded bucket
    pub buckets: Vec<(Option<u64>, u64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events: Vec<EventCount>,
    pub event_latency: BTreeMap<String, LatencySummary>,
    pub commands: BTreeMap<String, u64>,
    pub actions_ok: BTreeMap<String, u64>,
    pub actions_failed: BTreeMap<String, u64>,
    pub requests: BTreeMap<u16, u64>,
    pub stale_timers: u64,
    pub health_check_exhausted: u64,
    pub race_won: u64,
    pub race_lost: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self, node_id: &str, event_type: &str, outcome: EventOutcome, elapsed: Duration) {
        self.events
            .entry((node_id.to_string(), event_type.to_string(), outcome))
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
        self.event_latency
            .entry(event_type.to_string())
            .or_default()
            .lock()
            .observe(elapsed);
    }

    pub fn record_command(&self, kind: &str) {
        self.commands.entry(kind.to_string()).or_default().fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_action(&self, action_type: &str, ok: bool) {
        self.actions
            .entry((action_type.to_string(), ok))
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self, status_code: u16) {
        self.requests.entry(status_code).or_default().fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_timer(&self) {
        self.stale_timers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check_exhausted(&self) {
        self.health_check_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_race(&self, won: bool) {
        if won {
            self.race_won.fetch_add(1, Ordering::Relaxed);
        } else {
            self.race_lost.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count of events for one node, type and outcome
    pub fn event_count(&self, node_id: &str, event_type: &str, outcome: EventOutcome) -> u64 {
        self.events
            .get(&(node_id.to_string(), event_type.to_string(), outcome))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut events: Vec<EventCount> = self
            .events
            .iter()
            .map(|entry| {
                let (node_id, event_type, outcome) = entry.key().clone();
                EventCount {
                    node_id,
                    event_type,
                    outcome,
                    count: entry.value().load(Ordering::Relaxed),
                }
            })
            .collect();
        events.sort_by(|a, b| (&a.node_id, &a.event_type).cmp(&(&b.node_id, &b.event_type)));

        let event_latency = self
            .event_latency
            .iter()
            .map(|entry| {
                let hist = entry.value().lock();
                let mut cumulative = 0;
                let buckets = hist
                    .buckets
                    .iter()
                    .enumerate()
                    .map(|(i, n)| {
                        cumulative += n;
                        (LATENCY_BUCKETS_MS.get(i).copied(), cumulative)
                    })
                    .collect();
                let mean_ms = if hist.count == 0 {
                    0.0
                } else {
                    hist.sum_us as f64 / hist.count as f64 / 1000.0
                };
                (
                    entry.key().clone(),
                    LatencySummary {
                        count: hist.count,
                        mean_ms,
                        buckets,
                    },
                )
            })
            .collect();

        let mut actions_ok = BTreeMap::new();
        let mut actions_failed = BTreeMap::new();
        for entry in self.actions.iter() {
            let (action_type, ok) = entry.key();
            let target = if *ok { &mut actions_ok } else { &mut actions_failed };
            target.insert(action_type.clone(), entry.value().load(Ordering::Relaxed));
        }

        MetricsSnapshot {
            events,
            event_latency,
            commands: self
                .commands
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            actions_ok,
            actions_failed,
            requests: self
                .requests
                .iter()
                .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
                .collect(),
            stale_timers: self.stale_timers.load(Ordering::Relaxed),
            health_check_exhausted: self.health_check_exhausted.load(Ordering::Relaxed),
            race_won: self.race_won.load(Ordering::Relaxed),
            race_lost: self.race_lost.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_counts_are_scoped_by_node_and_type() {
        let metrics = MetricsCollector::new();
        metrics.record_event("node-a", "ChannelCreated", EventOutcome::Ok, Duration::from_millis(3));
        metrics.record_event("node-a", "ChannelCreated", EventOutcome::Ok, Duration::from_millis(30));
        metrics.record_event("node-b", "ChannelCreated", EventOutcome::Error, Duration::from_millis(2000));

        assert_eq!(metrics.event_count("node-a", "ChannelCreated", EventOutcome::Ok), 2);
        assert_eq!(metrics.event_count("node-b", "ChannelCreated", EventOutcome::Ok), 0);

        let snapshot = metrics.snapshot();
        let latency = &snapshot.event_latency["ChannelCreated"];
        assert_eq!(latency.count, 3);
        // 3ms lands in the 5ms bucket, 30ms in the 50ms bucket, 2s in the unbounded one
        assert_eq!(latency.buckets[1], (Some(5), 1));
        assert_eq!(latency.buckets[4], (Some(50), 2));
        assert_eq!(latency.buckets.last().copied(), Some((None, 3)));
    }

    #[test]
    fn test_action_and_race_counters() {
        let metrics = MetricsCollector::new();
        metrics.record_action("play", true);
        metrics.record_action("play", false);
        metrics.record_race(true);
        metrics.record_race(false);
        metrics.record_race(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.actions_ok["play"], 1);
        assert_eq!(snapshot.actions_failed["play"], 1);
        assert_eq!(snapshot.race_won, 1);
        assert_eq!(snapshot.race_lost, 2);
    }
}
