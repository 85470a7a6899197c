// src/pipeline/trip_processor.rs
//
// One trip end to end: manifest → stream sync → merged timeline →
// aggregation → score → report. Finalization side effects go through
// the event bus and are handed off as a request log.

use super::event_bus::{ArtifactRequest, ClipWindow, EventBus};
use super::metrics::PipelineMetrics;
use crate::config::Config;
use crate::detection::{aggregate_trip, EventRules, TrackerStats, TripContext};
use crate::error::ConfigError;
use crate::ingest::TripManifest;
use crate::scoring::{score_trip, Score, ScoringConfig};
use crate::types::{Event, Trip, TripStatus};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub const REPORT_FILE: &str = "report.json";
pub const ARTIFACT_LOG: &str = "artifact_requests.jsonl";

/// Written to `<out>/<trip_id>/report.json`; the predictions loader reads
/// the same file back.
#[derive(Debug, Clone, Serialize)]
pub struct TripReport {
    pub trip_id: String,
    pub trip: Trip,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
    pub events: Vec<Event>,
    pub stats: TrackerStats,
}

pub struct TripProcessor {
    rules: EventRules,
    scoring: ScoringConfig,
    window: ClipWindow,
    queue_capacity: usize,
    out_dir: PathBuf,
    metrics: PipelineMetrics,
}

impl TripProcessor {
    pub fn new(
        config: &Config,
        out_dir: &Path,
        metrics: PipelineMetrics,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            rules: config.event_rules()?,
            scoring: config.scoring.clone(),
            window: ClipWindow {
                pre_event_ms: config.pipeline.clip_pre_event_ms,
                post_event_ms: config.pipeline.clip_post_event_ms,
            },
            queue_capacity: config.pipeline.artifact_queue_capacity,
            out_dir: out_dir.to_path_buf(),
            metrics,
        })
    }

    /// Loads, processes and writes one manifest. A trip that fails sync
    /// still gets a report carrying its failed status.
    pub fn process_path(&self, path: &Path) -> Result<TripReport> {
        let manifest = TripManifest::load(path)?;
        let report = self.process(&manifest);
        self.write(&report)?;

        match report.trip.status {
            TripStatus::Done => self.metrics.inc(&self.metrics.trips_done),
            _ => self.metrics.inc(&self.metrics.trips_failed),
        }
        Ok(report)
    }

    pub fn process(&self, manifest: &TripManifest) -> TripReport {
        let mut trip = Trip::new(&manifest.trip_id, manifest.created_at);
        trip.transition(TripStatus::Processing);

        let plan = match manifest.sync_plan() {
            Ok(plan) => plan,
            Err(e) => {
                error!("Trip {} failed: {}", manifest.trip_id, e);
                trip.fail(e.to_string());
                return TripReport {
                    trip_id: manifest.trip_id.clone(),
                    trip,
                    score: None,
                    events: Vec::new(),
                    stats: TrackerStats::default(),
                };
            }
        };
        trip.streams_present = plan.streams_present();
        trip.sync_offset_seconds = plan.offsets().clone();
        trip.duration_ms = plan.duration_ms();

        let timeline = manifest.timeline(&plan);
        let ctx = TripContext {
            trip_id: &manifest.trip_id,
            rules: &self.rules,
            sync: Some(&plan),
        };
        let output = aggregate_trip(&ctx, &timeline);
        self.metrics.record_trip(&output.stats);

        let score = score_trip(&manifest.trip_id, &output.events, trip.duration_ms, &self.scoring);
        trip.transition(TripStatus::Done);

        info!(
            "Trip {} done: {} frame(s), {} event(s), overall score {:.2} over {:.1}s",
            trip.id,
            output.stats.frames,
            output.events.len(),
            score.overall,
            trip.duration_seconds()
        );

        TripReport {
            trip_id: manifest.trip_id.clone(),
            trip,
            score: Some(score),
            events: output.events,
            stats: output.stats,
        }
    }

    pub fn trip_dir(&self, trip_id: &str) -> PathBuf {
        self.out_dir.join(trip_id.replace(['/', '\\'], "_"))
    }

    fn write(&self, report: &TripReport) -> Result<()> {
        let dir = self.trip_dir(&report.trip_id);
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        let json = serde_json::to_string_pretty(report)?;
        let report_path = dir.join(REPORT_FILE);
        fs::write(&report_path, json)
            .with_context(|| format!("writing {}", report_path.display()))?;

        let mut bus = EventBus::new(self.queue_capacity);
        let mut log = Vec::new();
        for (idx, event) in report.events.iter().enumerate() {
            let requests = ArtifactRequest::for_event(event, idx + 1, self.window);
            // Flush before the queue can overflow.
            if bus.pending_count() + requests.len() > self.queue_capacity {
                log.extend(bus.drain());
            }
            for request in requests {
                bus.publish(request);
                self.metrics.inc(&self.metrics.artifact_requests);
            }
        }
        log.extend(bus.drain());
        self.metrics
            .add(&self.metrics.artifact_requests_dropped, bus.dropped());

        let log_path = dir.join(ARTIFACT_LOG);
        let mut file = fs::File::create(&log_path)
            .with_context(|| format!("creating {}", log_path.display()))?;
        for request in &log {
            serde_json::to_writer(&mut file, request)?;
            file.write_all(b"\n")?;
        }
        Ok(())
    }
}
