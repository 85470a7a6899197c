// src/eval/io.rs
//
// Ground-truth and prediction loaders. A source that cannot be read at
// all is fatal; a single bad record is skipped and counted.

use super::records::EventRecord;
use crate::error::ConfigError;
use crate::types::{EventType, Scenario, Stream};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const REPORT_FILE: &str = "report.json";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedEvents {
    pub records: Vec<EventRecord>,
    /// Every trip seen in the source, with its creation time when known.
    pub trips: BTreeMap<String, Option<DateTime<Utc>>>,
    pub skipped: usize,
}

impl LoadedEvents {
    fn push_trip(&mut self, trip: &Value, trip_id: &str, predicted: bool) {
        self.trips
            .entry(trip_id.to_string())
            .or_insert_with(|| created_at(trip));

        let Some(events) = trip.get("events").and_then(Value::as_array) else {
            return;
        };
        for (idx, raw) in events.iter().enumerate() {
            match parse_record(raw, trip_id, idx + 1, predicted) {
                Ok(record) => self.records.push(record),
                Err(reason) => {
                    self.skipped += 1;
                    warn!("Skipping event {} of trip {}: {}", idx + 1, trip_id, reason);
                }
            }
        }
    }

    pub fn trip_ids(&self) -> BTreeSet<String> {
        self.trips.keys().cloned().collect()
    }

    pub fn retain_trips(&mut self, keep: &BTreeSet<String>) {
        self.records.retain(|r| keep.contains(&r.trip_id));
        self.trips.retain(|id, _| keep.contains(id));
    }
}

// ============================================================================
// SOURCES
// ============================================================================

/// `{"trips": [{trip_id, events}]}` or a bare list of trips.
pub fn load_ground_truth(path: &Path) -> Result<LoadedEvents, ConfigError> {
    let unavailable = |reason: String| ConfigError::GroundTruthUnavailable {
        path: path.to_path_buf(),
        reason,
    };
    let payload = read_json(path).map_err(unavailable)?;
    let trips = trip_list(&payload)
        .ok_or_else(|| unavailable("expected a list of trips".to_string()))?;

    let mut loaded = LoadedEvents::default();
    for trip in trips {
        let trip_id = trip_id_of(trip).unwrap_or_else(|| "unknown".to_string());
        loaded.push_trip(trip, &trip_id, false);
    }
    info!(
        "Loaded {} ground-truth event(s) across {} trip(s) from {} ({} skipped)",
        loaded.records.len(),
        loaded.trips.len(),
        path.display(),
        loaded.skipped
    );
    Ok(loaded)
}

/// A single file (list of trips, or one trip), or a directory searched
/// recursively for per-trip `report.json` files.
pub fn load_predictions(path: &Path) -> Result<LoadedEvents, ConfigError> {
    if path.is_dir() {
        return load_report_dir(path);
    }

    let unavailable = |reason: String| ConfigError::PredictionsUnavailable {
        path: path.to_path_buf(),
        reason,
    };
    let payload = read_json(path).map_err(unavailable)?;

    let mut loaded = LoadedEvents::default();
    match trip_list(&payload) {
        Some(trips) => {
            for trip in trips {
                let trip_id = trip_id_of(trip).unwrap_or_else(|| "unknown".to_string());
                loaded.push_trip(trip, &trip_id, true);
            }
        }
        None if payload.is_object() => {
            let trip_id = trip_id_of(&payload).unwrap_or_else(|| "unknown".to_string());
            loaded.push_trip(&payload, &trip_id, true);
        }
        None => return Err(unavailable("expected a trip or a list of trips".to_string())),
    }
    info!(
        "Loaded {} predicted event(s) across {} trip(s) from {} ({} skipped)",
        loaded.records.len(),
        loaded.trips.len(),
        path.display(),
        loaded.skipped
    );
    Ok(loaded)
}

fn load_report_dir(dir: &Path) -> Result<LoadedEvents, ConfigError> {
    let mut reports: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", dir.display(), e);
                None
            }
        })
        .filter(|e| e.file_type().is_file() && e.file_name() == REPORT_FILE)
        .map(|e| e.into_path())
        .collect();
    reports.sort();

    let mut loaded = LoadedEvents::default();
    for report in &reports {
        let payload = match read_json(report) {
            Ok(p) => p,
            Err(reason) => {
                loaded.skipped += 1;
                warn!("Skipping report {}: {}", report.display(), reason);
                continue;
            }
        };
        // Reports live in `<trip_id>/report.json`.
        let trip_id = trip_id_of(&payload)
            .or_else(|| {
                report
                    .parent()
                    .and_then(Path::file_name)
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "unknown".to_string());
        debug!("Reading predictions for trip {} from {}", trip_id, report.display());
        loaded.push_trip(&payload, &trip_id, true);
    }
    info!(
        "Loaded {} predicted event(s) from {} report(s) under {} ({} skipped)",
        loaded.records.len(),
        reports.len(),
        dir.display(),
        loaded.skipped
    );
    Ok(loaded)
}

fn read_json(path: &Path) -> Result<Value, String> {
    let contents = fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&contents).map_err(|e| format!("invalid JSON: {}", e))
}

fn trip_list(payload: &Value) -> Option<&Vec<Value>> {
    match payload {
        Value::Array(trips) => Some(trips),
        Value::Object(map) => map.get("trips").and_then(Value::as_array),
        _ => None,
    }
}

fn trip_id_of(trip: &Value) -> Option<String> {
    let raw = trip
        .get("trip_id")
        .or_else(|| trip.get("trip").and_then(|t| t.get("id")))?;
    match raw {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn created_at(trip: &Value) -> Option<DateTime<Utc>> {
    trip.get("trip")
        .and_then(|t| t.get("created_at"))
        .or_else(|| trip.get("created_at"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// RECORDS
// ============================================================================

fn parse_record(
    raw: &Value,
    trip_id: &str,
    index: usize,
    predicted: bool,
) -> Result<EventRecord, String> {
    if !raw.is_object() {
        return Err("record is not an object".to_string());
    }

    let type_name = raw
        .get("type")
        .or_else(|| raw.get("event_type"))
        .and_then(Value::as_str)
        .ok_or("missing type")?;
    let event_type =
        EventType::parse(type_name).ok_or_else(|| format!("unknown event type '{}'", type_name))?;

    let ts_start_ms = timestamp(raw, &["ts_start_ms", "ts_ms_start"]).ok_or("missing ts_start_ms")?;
    let ts_end_ms = timestamp(raw, &["ts_end_ms", "ts_ms_end"]).ok_or("missing ts_end_ms")?;
    if ts_start_ms > ts_end_ms {
        return Err(format!("ts_start_ms {} after ts_end_ms {}", ts_start_ms, ts_end_ms));
    }

    let metadata = raw.get("metadata");
    let scenario_hint = metadata
        .and_then(|m| m.get("lighting").or_else(|| m.get("scenario")))
        .or_else(|| raw.get("scenario"))
        .and_then(Value::as_str);

    let confidence = if predicted {
        let value = ["confidence", "confidence_raw", "severity"]
            .iter()
            .find_map(|key| raw.get(*key).and_then(Value::as_f64))
            .unwrap_or(1.0);
        Some(value.clamp(0.0, 1.0) as f32)
    } else {
        None
    };

    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}:{}", trip_id, index));

    Ok(EventRecord {
        id,
        trip_id: trip_id.to_string(),
        event_type,
        stream: Stream::normalize(raw.get("stream").and_then(Value::as_str)),
        scenario: Scenario::normalize(scenario_hint),
        ts_start_ms,
        ts_end_ms,
        confidence,
        confidence_calibrated: None,
    })
}

fn timestamp(raw: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| {
        let v = raw.get(*key)?;
        v.as_i64().or_else(|| v.as_f64().map(|f| f.round() as i64))
    })
}

// ============================================================================
// DATE RANGE
// ============================================================================

/// Inclusive calendar-day range on trip creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl DateRange {
    pub fn is_active(&self) -> bool {
        self.from.is_some() || self.to.is_some()
    }

    pub fn contains(&self, created_at: Option<DateTime<Utc>>) -> bool {
        if !self.is_active() {
            return true;
        }
        let Some(day) = created_at.map(|dt| dt.date_naive()) else {
            return false;
        };
        self.from.map_or(true, |from| day >= from) && self.to.map_or(true, |to| day <= to)
    }
}

pub fn parse_date(field: &str, value: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| ConfigError::invalid(field, format!("'{}' is not a YYYY-MM-DD date", value)))
}

/// Keeps the prediction trips inside `range` and restricts ground truth
/// to the same trips. Returns the selected trip ids.
pub fn apply_date_range(
    ground_truth: &mut LoadedEvents,
    predictions: &mut LoadedEvents,
    range: &DateRange,
) -> BTreeSet<String> {
    if !range.is_active() {
        return predictions
            .trip_ids()
            .union(&ground_truth.trip_ids())
            .cloned()
            .collect();
    }

    let selected: BTreeSet<String> = predictions
        .trips
        .iter()
        .filter(|(_, created)| range.contains(**created))
        .map(|(id, _)| id.clone())
        .collect();
    predictions.retain_trips(&selected);
    ground_truth.retain_trips(&selected);
    info!(
        "Date filter {:?}..{:?} selected {} trip(s)",
        range.from,
        range.to,
        selected.len()
    );
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, rel: &str, body: &str) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_ground_truth_normalization_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "gt.json",
            r#"{"trips": [{"trip_id": "t1", "events": [
                {"type": "phone_use", "stream": "FRONT", "ts_start_ms": 1000, "ts_end_ms": 3000, "scenario": "night"},
                {"type": "tailgating", "stream": "roof", "ts_ms_start": 10, "ts_ms_end": 20,
                 "metadata": {"lighting": "dusk"}},
                {"type": "tailgating", "ts_start_ms": 50},
                {"type": "juggling", "ts_start_ms": 1, "ts_end_ms": 2},
                {"type": "tailgating", "ts_start_ms": 9, "ts_end_ms": 2}
            ]}]}"#,
        );

        let loaded = load_ground_truth(&path).unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.skipped, 3);

        let first = &loaded.records[0];
        assert_eq!(first.id, "t1:1");
        assert_eq!(first.event_type, EventType::MobilePhoneUse);
        assert_eq!(first.stream, Stream::Front);
        assert_eq!(first.scenario, Scenario::Night);
        assert_eq!(first.confidence, None);

        let second = &loaded.records[1];
        assert_eq!(second.stream, Stream::Unknown);
        assert_eq!(second.scenario, Scenario::Dusk);
        assert_eq!(second.ts_start_ms, 10);
    }

    #[test]
    fn test_missing_sources_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_ground_truth(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::GroundTruthUnavailable { .. }));

        let bad = write(dir.path(), "bad.json", "{not json");
        let err = load_predictions(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::PredictionsUnavailable { .. }));
    }

    #[test]
    fn test_prediction_confidence_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "pred.json",
            r#"{"trip_id": "t9", "events": [
                {"type": "microsleep", "ts_start_ms": 0, "ts_end_ms": 10, "confidence": 0.7, "severity": 0.2},
                {"type": "microsleep", "ts_start_ms": 20, "ts_end_ms": 30, "severity": 1.8},
                {"type": "microsleep", "ts_start_ms": 40, "ts_end_ms": 50}
            ]}"#,
        );
        let loaded = load_predictions(&path).unwrap();
        let confs: Vec<_> = loaded.records.iter().map(|r| r.confidence).collect();
        assert_eq!(confs, vec![Some(0.7), Some(1.0), Some(1.0)]);
        assert_eq!(loaded.records[2].id, "t9:3");
    }

    #[test]
    fn test_report_directory_with_date_filter() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "trip-a/report.json",
            r#"{"trip": {"id": "trip-a", "created_at": "2026-03-01T10:00:00Z"},
                "events": [{"type": "lane_deviation", "stream": "front", "ts_start_ms": 0, "ts_end_ms": 900, "confidence_raw": 0.6}]}"#,
        );
        write(
            dir.path(),
            "trip-b/report.json",
            r#"{"trip_id": "trip-b", "created_at": "2026-04-10T10:00:00Z",
                "events": [{"type": "lane_deviation", "ts_start_ms": 0, "ts_end_ms": 900}]}"#,
        );
        write(dir.path(), "trip-c/report.json", r#"{"events": []}"#);
        write(dir.path(), "trip-a/notes.json", r#"{"ignored": true}"#);

        let mut preds = load_predictions(dir.path()).unwrap();
        assert_eq!(preds.trips.len(), 3);
        assert!(preds.trips.contains_key("trip-c"));
        assert_eq!(preds.records[0].confidence, Some(0.6));

        let gt_path = write(
            dir.path(),
            "gt.json",
            r#"[{"trip_id": "trip-a", "events": []}, {"trip_id": "trip-b", "events": [
                {"type": "lane_deviation", "ts_start_ms": 0, "ts_end_ms": 900}]}]"#,
        );
        let mut gt = load_ground_truth(&gt_path).unwrap();

        let range = DateRange {
            from: Some(parse_date("date_from", "2026-03-01").unwrap()),
            to: Some(parse_date("date_to", "2026-03-31").unwrap()),
        };
        let selected = apply_date_range(&mut gt, &mut preds, &range);
        assert_eq!(selected.into_iter().collect::<Vec<_>>(), vec!["trip-a"]);
        assert_eq!(preds.records.len(), 1);
        assert!(gt.records.is_empty());
    }

    #[test]
    fn test_bad_date_rejected() {
        assert!(parse_date("date_from", "03/01/2026").is_err());
    }
}
