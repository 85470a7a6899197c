// src/ingest/manifest.rs
//
// Aggregation input: one trip per JSON manifest, clips with their
// clip-local detections.

use super::clip_name::ClipName;
use super::stream_sync::{ClipInput, SyncPlan};
use crate::error::ConfigError;
use crate::types::{EventType, RawDetection, Stream};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripManifest {
    pub trip_id: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clips: Vec<ManifestClip>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestClip {
    /// Falls back to the `_rear` hint in the clip name.
    #[serde(default)]
    pub stream: Option<Stream>,
    pub name: String,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub detections: Vec<ClipDetection>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClipDetection {
    pub event_type: EventType,
    pub confidence: f32,
    /// Milliseconds from the start of the clip.
    pub frame_ts_ms: i64,
    #[serde(default = "full_quality")]
    pub scene_quality: f32,
}

fn full_quality() -> f32 {
    1.0
}

impl ManifestClip {
    pub fn stream(&self) -> Stream {
        self.stream
            .unwrap_or_else(|| ClipName::parse(&self.name).stream_hint)
    }

    /// Declared duration, or the last detection timestamp when absent.
    pub fn duration_ms(&self) -> Option<i64> {
        self.duration_ms
            .or_else(|| self.detections.iter().map(|d| d.frame_ts_ms).max())
    }
}

impl TripManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading trip manifest {}", path.display()))?;
        let manifest: TripManifest = serde_json::from_str(&contents)
            .with_context(|| format!("parsing trip manifest {}", path.display()))?;
        Ok(manifest)
    }

    pub fn clip_inputs(&self) -> Vec<ClipInput> {
        self.clips
            .iter()
            .map(|c| ClipInput {
                stream: c.stream(),
                name: c.name.clone(),
                duration_ms: c.duration_ms(),
            })
            .collect()
    }

    pub fn sync_plan(&self) -> Result<SyncPlan, ConfigError> {
        SyncPlan::build(&self.trip_id, &self.clip_inputs())
    }

    /// Every detection on the trip axis, in strict time order. Ties keep
    /// a fixed (stream, type) order so repeated runs agree.
    pub fn timeline(&self, plan: &SyncPlan) -> Vec<RawDetection> {
        let mut merged = Vec::new();
        for clip in &self.clips {
            let stream = clip.stream();
            for d in &clip.detections {
                let Some(ts) = plan.to_trip_ms(stream, &clip.name, d.frame_ts_ms) else {
                    continue;
                };
                merged.push(RawDetection {
                    stream,
                    event_type: d.event_type,
                    confidence: d.confidence.clamp(0.0, 1.0),
                    frame_ts_ms: ts,
                    scene_quality: d.scene_quality.clamp(0.0, 1.0),
                });
            }
        }
        merged.sort_by(|a, b| {
            a.frame_ts_ms
                .cmp(&b.frame_ts_ms)
                .then(a.stream.cmp(&b.stream))
                .then(a.event_type.cmp(&b.event_type))
        });
        merged
    }
}

/// A single manifest file, or every `*.json` below a directory.
pub fn discover_manifests(input: &Path) -> Result<Vec<PathBuf>> {
    if !input.exists() {
        anyhow::bail!("Input {} does not exist", input.display());
    }
    if input.is_file() {
        return Ok(vec![input.to_path_buf()]);
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(input).follow_links(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", input.display(), e);
                continue;
            }
        };
        let path = entry.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "json") {
            paths.push(path.to_path_buf());
        }
    }
    paths.sort();
    info!("Found {} trip manifest(s) under {}", paths.len(), input.display());
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MANIFEST: &str = r#"{
        "trip_id": "trip-1",
        "created_at": "2026-03-02T08:00:00Z",
        "clips": [
            {"stream": "front", "name": "080000_001_001_NF.mp4", "duration_ms": 60000,
             "detections": [
                {"event_type": "tailgating", "confidence": 0.9, "frame_ts_ms": 500},
                {"event_type": "lane_deviation", "confidence": 0.4, "frame_ts_ms": 100}
             ]},
            {"stream": "cabin", "name": "080002_001_001_IN.mp4",
             "detections": [
                {"event_type": "phone_use", "confidence": 1.4, "frame_ts_ms": 250, "scene_quality": 0.8}
             ]},
            {"name": "080000_001_002_NR_rear.mp4", "duration_ms": 60000}
        ]
    }"#;

    #[test]
    fn test_manifest_timeline_is_sorted_and_clamped() {
        let manifest: TripManifest = serde_json::from_str(MANIFEST).unwrap();
        let plan = manifest.sync_plan().unwrap();

        assert_eq!(plan.offset_seconds(Stream::Cabin), 2.0);
        assert_eq!(manifest.clips[2].stream(), Stream::Rear);
        assert_eq!(manifest.clips[1].duration_ms(), Some(250));

        let timeline = manifest.timeline(&plan);
        let ts: Vec<_> = timeline.iter().map(|d| d.frame_ts_ms).collect();
        assert_eq!(ts, vec![100, 250, 500]);
        assert_eq!(timeline[1].event_type, EventType::MobilePhoneUse);
        assert_eq!(timeline[1].confidence, 1.0);
        assert_eq!(timeline[0].scene_quality, 1.0);
    }

    #[test]
    fn test_discover_walks_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("2026").join("03");
        fs::create_dir_all(&nested).unwrap();
        for (i, path) in [dir.path().join("a.json"), nested.join("b.json")]
            .iter()
            .enumerate()
        {
            let mut f = fs::File::create(path).unwrap();
            write!(f, "{{\"trip_id\": \"t{i}\"}}").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover_manifests(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
        let loaded = TripManifest::load(&found[0]).unwrap();
        assert!(loaded.clips.is_empty());
    }
}
