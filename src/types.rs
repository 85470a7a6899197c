// src/types.rs
//
// Shared data model for the online path (detections → events → scores)
// and the offline evaluation path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

// ============================================================================
// STREAMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Front,
    Rear,
    Cabin,
    Unknown,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Front => "front",
            Stream::Rear => "rear",
            Stream::Cabin => "cabin",
            Stream::Unknown => "unknown",
        }
    }

    /// Lenient parse for evaluation inputs. Anything unrecognised is `Unknown`.
    pub fn normalize(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("front") => Stream::Front,
            Some("rear") => Stream::Rear,
            Some("cabin") => Stream::Cabin,
            _ => Stream::Unknown,
        }
    }

    /// `Unknown` on either side matches any camera.
    pub fn is_compatible(self, other: Stream) -> bool {
        self == Stream::Unknown || other == Stream::Unknown || self == other
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Day,
    Dusk,
    Night,
    Unknown,
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Day => "day",
            Scenario::Dusk => "dusk",
            Scenario::Night => "night",
            Scenario::Unknown => "unknown",
        }
    }

    pub fn normalize(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("day") => Scenario::Day,
            Some("dusk") => Scenario::Dusk,
            Some("night") => Scenario::Night,
            _ => Scenario::Unknown,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// EVENT TYPES
// ============================================================================

/// Closed set of safety event types. Adding a type means adding a variant
/// here and a row in `detection::rules::default_rule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[serde(alias = "fatigue")]
    DriverFatigue,
    Microsleep,
    #[serde(alias = "distraction")]
    DistractedDriving,
    #[serde(alias = "phone_use")]
    MobilePhoneUse,
    SeatbeltNotWorn,
    LaneDeviation,
    ObstructionAhead,
    Tailgating,
}

impl EventType {
    pub const ALL: [EventType; 8] = [
        EventType::DriverFatigue,
        EventType::Microsleep,
        EventType::DistractedDriving,
        EventType::MobilePhoneUse,
        EventType::SeatbeltNotWorn,
        EventType::LaneDeviation,
        EventType::ObstructionAhead,
        EventType::Tailgating,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::DriverFatigue => "driver_fatigue",
            EventType::Microsleep => "microsleep",
            EventType::DistractedDriving => "distracted_driving",
            EventType::MobilePhoneUse => "mobile_phone_use",
            EventType::SeatbeltNotWorn => "seatbelt_not_worn",
            EventType::LaneDeviation => "lane_deviation",
            EventType::ObstructionAhead => "obstruction_ahead",
            EventType::Tailgating => "tailgating",
        }
    }

    /// Parses canonical names and the short aliases used by older label files.
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "fatigue" => Some(EventType::DriverFatigue),
            "phone_use" => Some(EventType::MobilePhoneUse),
            "distraction" => Some(EventType::DistractedDriving),
            other => EventType::ALL.iter().copied().find(|t| t.as_str() == other),
        }
    }

    /// Uppercase label burned into snapshots and clips.
    pub fn label(&self) -> String {
        self.as_str().replace('_', " ").to_uppercase()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// DETECTIONS AND EVENTS
// ============================================================================

/// One per-frame output of the perception component. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub stream: Stream,
    pub event_type: EventType,
    pub confidence: f32,
    pub frame_ts_ms: i64,
    pub scene_quality: f32,
}

/// A finalized safety event. Immutable once created by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub trip_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub stream: Stream,
    pub ts_start_ms: i64,
    pub ts_end_ms: i64,
    pub severity: f32,
    pub confidence_raw: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_calibrated: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip_offset_ms: Option<i64>,
}

impl Event {
    pub fn duration_ms(&self) -> i64 {
        self.ts_end_ms - self.ts_start_ms
    }
}

// ============================================================================
// TRIPS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripStatus {
    Uploaded,
    Processing,
    Done,
    Failed,
}

impl TripStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TripStatus::Done | TripStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    pub status: TripStatus,
    pub streams_present: Vec<Stream>,
    pub sync_offset_seconds: BTreeMap<Stream, f64>,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Trip {
    pub fn new(id: impl Into<String>, created_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: id.into(),
            created_at,
            status: TripStatus::Uploaded,
            streams_present: Vec::new(),
            sync_offset_seconds: BTreeMap::new(),
            duration_ms: 0,
            error: None,
        }
    }

    /// Moves the trip to `next`. Terminal trips are frozen; returns false
    /// when the transition was refused.
    pub fn transition(&mut self, next: TripStatus) -> bool {
        if self.status.is_terminal() {
            warn!(
                "Trip {} is already {:?}, refusing transition to {:?}",
                self.id, self.status, next
            );
            return false;
        }
        self.status = next;
        true
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.transition(TripStatus::Failed) {
            self.error = Some(reason.into());
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration_ms as f64 / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_aliases() {
        assert_eq!(EventType::parse("phone_use"), Some(EventType::MobilePhoneUse));
        assert_eq!(EventType::parse(" Fatigue "), Some(EventType::DriverFatigue));
        assert_eq!(EventType::parse("tailgating"), Some(EventType::Tailgating));
        assert_eq!(EventType::parse("juggling"), None);

        let parsed: EventType = serde_json::from_str("\"phone_use\"").unwrap();
        assert_eq!(parsed, EventType::MobilePhoneUse);
        assert_eq!(
            serde_json::to_string(&EventType::MobilePhoneUse).unwrap(),
            "\"mobile_phone_use\""
        );
    }

    #[test]
    fn test_stream_normalize_and_compat() {
        assert_eq!(Stream::normalize(Some("CABIN")), Stream::Cabin);
        assert_eq!(Stream::normalize(Some("left")), Stream::Unknown);
        assert_eq!(Stream::normalize(None), Stream::Unknown);
        assert!(Stream::Unknown.is_compatible(Stream::Rear));
        assert!(!Stream::Front.is_compatible(Stream::Cabin));
    }

    #[test]
    fn test_terminal_trip_is_frozen() {
        let mut trip = Trip::new("t1", None);
        assert!(trip.transition(TripStatus::Processing));
        assert!(trip.transition(TripStatus::Done));
        assert!(!trip.transition(TripStatus::Processing));
        trip.fail("late failure");
        assert_eq!(trip.status, TripStatus::Done);
        assert!(trip.error.is_none());
    }
}
