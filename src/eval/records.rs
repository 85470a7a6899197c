// src/eval/records.rs
//
// Normalized evaluation records. Ground truth and predictions share one
// shape; only predictions carry a confidence.

use crate::types::{EventType, Scenario, Stream};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub trip_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub stream: Stream,
    pub scenario: Scenario,
    pub ts_start_ms: i64,
    pub ts_end_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_calibrated: Option<f32>,
}

impl EventRecord {
    pub fn confidence_or_one(&self) -> f32 {
        self.confidence.unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Tp,
    Fp,
    Fn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub trip_id: String,
    pub event_type: EventType,
    pub stream: Stream,
    pub scenario: Scenario,
    pub gt_id: Option<String>,
    pub pred_id: Option<String>,
    pub matched: bool,
    pub outcome: Outcome,
    pub overlap_ratio: f64,
    /// Prediction start minus ground-truth start; matched pairs only.
    pub time_delta_ms: Option<i64>,
    pub ts_start_ms: i64,
    pub ts_end_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_calibrated: Option<f32>,
}

impl MatchResult {
    pub fn is_prediction(&self) -> bool {
        self.pred_id.is_some()
    }
}
