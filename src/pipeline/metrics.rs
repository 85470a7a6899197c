// src/pipeline/metrics.rs
//
// Run-level counters shared by the trip workers. Observability only;
// evaluation results never flow through here.

use crate::detection::TrackerStats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub frames: Arc<AtomicU64>,
    pub frames_gated: Arc<AtomicU64>,
    pub candidates_discarded: Arc<AtomicU64>,
    pub short_events_discarded: Arc<AtomicU64>,
    pub events_finalized: Arc<AtomicU64>,
    pub artifact_requests: Arc<AtomicU64>,
    pub artifact_requests_dropped: Arc<AtomicU64>,
    pub trips_done: Arc<AtomicU64>,
    pub trips_failed: Arc<AtomicU64>,
    pub trips_cancelled: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            frames_gated: Arc::new(AtomicU64::new(0)),
            candidates_discarded: Arc::new(AtomicU64::new(0)),
            short_events_discarded: Arc::new(AtomicU64::new(0)),
            events_finalized: Arc::new(AtomicU64::new(0)),
            artifact_requests: Arc::new(AtomicU64::new(0)),
            artifact_requests_dropped: Arc::new(AtomicU64::new(0)),
            trips_done: Arc::new(AtomicU64::new(0)),
            trips_failed: Arc::new(AtomicU64::new(0)),
            trips_cancelled: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_trip(&self, stats: &TrackerStats) {
        self.add(&self.frames, stats.frames);
        self.add(&self.frames_gated, stats.frames_gated);
        self.add(&self.candidates_discarded, stats.candidates_discarded);
        self.add(&self.short_events_discarded, stats.short_events_discarded);
        self.add(&self.events_finalized, stats.events_finalized);
    }

    pub fn trips_per_sec(&self) -> f64 {
        let trips = self.trips_done.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            trips as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            frames: self.frames.load(Ordering::Relaxed),
            frames_gated: self.frames_gated.load(Ordering::Relaxed),
            candidates_discarded: self.candidates_discarded.load(Ordering::Relaxed),
            short_events_discarded: self.short_events_discarded.load(Ordering::Relaxed),
            events_finalized: self.events_finalized.load(Ordering::Relaxed),
            artifact_requests: self.artifact_requests.load(Ordering::Relaxed),
            artifact_requests_dropped: self.artifact_requests_dropped.load(Ordering::Relaxed),
            trips_done: self.trips_done.load(Ordering::Relaxed),
            trips_failed: self.trips_failed.load(Ordering::Relaxed),
            trips_cancelled: self.trips_cancelled.load(Ordering::Relaxed),
            trips_per_sec: self.trips_per_sec(),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub frames: u64,
    pub frames_gated: u64,
    pub candidates_discarded: u64,
    pub short_events_discarded: u64,
    pub events_finalized: u64,
    pub artifact_requests: u64,
    pub artifact_requests_dropped: u64,
    pub trips_done: u64,
    pub trips_failed: u64,
    pub trips_cancelled: u64,
    pub trips_per_sec: f64,
    pub elapsed_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = PipelineMetrics::new();
        let worker = metrics.clone();
        worker.record_trip(&TrackerStats {
            frames: 10,
            frames_gated: 2,
            candidates_discarded: 1,
            short_events_discarded: 1,
            events_finalized: 3,
        });
        worker.inc(&worker.trips_done);

        let summary = metrics.summary();
        assert_eq!(summary.frames, 10);
        assert_eq!(summary.frames_gated, 2);
        assert_eq!(summary.events_finalized, 3);
        assert_eq!(summary.trips_done, 1);
        assert_eq!(summary.trips_failed, 0);
    }
}
