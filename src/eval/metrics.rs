// src/eval/metrics.rs
//
// Precision / recall / F1 per slice and calibration error. Counts are
// built per worker and combined with `merge`; nothing is shared mutably.

use super::records::{MatchResult, Outcome};
use crate::types::{EventType, Scenario, Stream};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// METRIC VALUES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Insufficient {
    InsufficientData,
}

/// A number, or the explicit marker for a zero denominator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Value(f64),
    Insufficient(Insufficient),
}

impl MetricValue {
    pub const INSUFFICIENT: MetricValue = MetricValue::Insufficient(Insufficient::InsufficientData);

    pub fn ratio(numerator: f64, denominator: f64) -> Self {
        if denominator <= 0.0 {
            Self::INSUFFICIENT
        } else {
            MetricValue::Value(round4(numerator / denominator))
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            MetricValue::Value(v) => Some(*v),
            MetricValue::Insufficient(_) => None,
        }
    }

    pub fn is_insufficient(&self) -> bool {
        self.value().is_none()
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Value(v) => write!(f, "{}", v),
            MetricValue::Insufficient(_) => f.write_str("insufficient_data"),
        }
    }
}

// ============================================================================
// SLICE COUNTS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceCounts {
    pub tp: u64,
    pub fp: u64,
    #[serde(rename = "fn")]
    pub fn_: u64,
}

impl SliceCounts {
    pub fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Tp => self.tp += 1,
            Outcome::Fp => self.fp += 1,
            Outcome::Fn => self.fn_ += 1,
        }
    }

    pub fn merge(mut self, other: SliceCounts) -> SliceCounts {
        self.tp += other.tp;
        self.fp += other.fp;
        self.fn_ += other.fn_;
        self
    }

    pub fn precision(&self) -> MetricValue {
        MetricValue::ratio(self.tp as f64, (self.tp + self.fp) as f64)
    }

    pub fn recall(&self) -> MetricValue {
        MetricValue::ratio(self.tp as f64, (self.tp + self.fn_) as f64)
    }

    /// Harmonic mean of precision and recall, written as 2TP/(2TP+FP+FN)
    /// so it stays defined whenever any count is non-zero.
    pub fn f1(&self) -> MetricValue {
        MetricValue::ratio(
            2.0 * self.tp as f64,
            (2 * self.tp + self.fp + self.fn_) as f64,
        )
    }

    pub fn metrics(&self) -> SliceMetrics {
        SliceMetrics {
            tp: self.tp,
            fp: self.fp,
            fn_: self.fn_,
            precision: self.precision(),
            recall: self.recall(),
            f1: self.f1(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SliceMetrics {
    pub tp: u64,
    pub fp: u64,
    #[serde(rename = "fn")]
    pub fn_: u64,
    pub precision: MetricValue,
    pub recall: MetricValue,
    pub f1: MetricValue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SliceTable {
    pub overall: SliceCounts,
    pub by_event: BTreeMap<EventType, SliceCounts>,
    pub by_stream: BTreeMap<Stream, SliceCounts>,
    pub by_scenario: BTreeMap<Scenario, SliceCounts>,
}

impl SliceTable {
    pub fn add(mut self, m: &MatchResult) -> Self {
        self.overall.add(m.outcome);
        self.by_event.entry(m.event_type).or_default().add(m.outcome);
        self.by_stream.entry(m.stream).or_default().add(m.outcome);
        self.by_scenario.entry(m.scenario).or_default().add(m.outcome);
        self
    }

    pub fn merge(mut self, other: SliceTable) -> Self {
        self.overall = self.overall.merge(other.overall);
        merge_map(&mut self.by_event, other.by_event);
        merge_map(&mut self.by_stream, other.by_stream);
        merge_map(&mut self.by_scenario, other.by_scenario);
        self
    }

    pub fn from_matches(matches: &[MatchResult]) -> Self {
        matches
            .par_iter()
            .fold(SliceTable::default, SliceTable::add)
            .reduce(SliceTable::default, SliceTable::merge)
    }

    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            overall: self.overall.metrics(),
            by_event: self.by_event.iter().map(|(k, c)| (*k, c.metrics())).collect(),
            by_stream: self.by_stream.iter().map(|(k, c)| (*k, c.metrics())).collect(),
            by_scenario: self.by_scenario.iter().map(|(k, c)| (*k, c.metrics())).collect(),
        }
    }
}

fn merge_map<K: Ord>(into: &mut BTreeMap<K, SliceCounts>, from: BTreeMap<K, SliceCounts>) {
    for (key, counts) in from {
        let slot = into.entry(key).or_default();
        *slot = slot.merge(counts);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub overall: SliceMetrics,
    pub by_event: BTreeMap<EventType, SliceMetrics>,
    pub by_stream: BTreeMap<Stream, SliceMetrics>,
    pub by_scenario: BTreeMap<Scenario, SliceMetrics>,
}

pub fn compute_metrics(matches: &[MatchResult]) -> MetricsReport {
    SliceTable::from_matches(matches).report()
}

// ============================================================================
// CALIBRATION ERROR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityBin {
    pub bin: usize,
    pub low: f64,
    pub high: f64,
    pub count: usize,
    pub avg_confidence: MetricValue,
    pub accuracy: MetricValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMetrics {
    pub samples: usize,
    pub ece: MetricValue,
    pub brier: MetricValue,
    pub bins: Vec<ReliabilityBin>,
}

/// ECE and Brier over every prediction row. `calibrated` picks the
/// calibrated confidence (falling back to raw) or the raw one.
pub fn calibration_metrics(
    matches: &[MatchResult],
    bins: usize,
    calibrated: bool,
) -> CalibrationMetrics {
    let bins = bins.max(1);
    let pairs: Vec<(f64, f64)> = matches
        .iter()
        .filter(|m| m.is_prediction())
        .map(|m| {
            let raw = m.confidence.unwrap_or(1.0);
            let p = if calibrated {
                m.confidence_calibrated.unwrap_or(raw)
            } else {
                raw
            };
            let label = if m.outcome == Outcome::Tp { 1.0 } else { 0.0 };
            ((p as f64).clamp(0.0, 1.0), label)
        })
        .collect();

    let mut sums = vec![(0.0_f64, 0.0_f64, 0_usize); bins];
    for &(p, label) in &pairs {
        // Bin in the confidence's own f32 precision so 0.7 lands in [0.7, 0.8).
        let idx = ((p as f32 * bins as f32) as usize).min(bins - 1);
        sums[idx].0 += p;
        sums[idx].1 += label;
        sums[idx].2 += 1;
    }

    let n = pairs.len();
    let mut ece = 0.0;
    let table = sums
        .iter()
        .enumerate()
        .map(|(i, &(conf_sum, correct, count))| {
            if count > 0 {
                let avg = conf_sum / count as f64;
                let acc = correct / count as f64;
                ece += (count as f64 / n as f64) * (avg - acc).abs();
            }
            ReliabilityBin {
                bin: i,
                low: round4(i as f64 / bins as f64),
                high: round4((i + 1) as f64 / bins as f64),
                count,
                avg_confidence: MetricValue::ratio(conf_sum, count as f64),
                accuracy: MetricValue::ratio(correct, count as f64),
            }
        })
        .collect();

    let (ece, brier) = if n == 0 {
        (MetricValue::INSUFFICIENT, MetricValue::INSUFFICIENT)
    } else {
        let sq: f64 = pairs.iter().map(|(p, y)| (p - y).powi(2)).sum();
        (
            MetricValue::Value(round5(ece)),
            MetricValue::Value(round5(sq / n as f64)),
        )
    };

    CalibrationMetrics {
        samples: n,
        ece,
        brier,
        bins: table,
    }
}

pub(crate) fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn round5(v: f64) -> f64 {
    (v * 100_000.0).round() / 100_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn row(
        event_type: EventType,
        stream: Stream,
        outcome: Outcome,
        confidence: f32,
    ) -> MatchResult {
        MatchResult {
            trip_id: "t".into(),
            event_type,
            stream,
            scenario: Scenario::Night,
            gt_id: (outcome != Outcome::Fp).then(|| "g".to_string()),
            pred_id: (outcome != Outcome::Fn).then(|| "p".to_string()),
            matched: outcome == Outcome::Tp,
            outcome,
            overlap_ratio: 0.0,
            time_delta_ms: None,
            ts_start_ms: 0,
            ts_end_ms: 0,
            confidence: (outcome != Outcome::Fn).then_some(confidence),
            confidence_calibrated: None,
        }
    }

    #[test]
    fn test_counts_and_ratios() {
        let rows = vec![
            row(EventType::Tailgating, Stream::Front, Outcome::Tp, 0.9),
            row(EventType::Tailgating, Stream::Front, Outcome::Tp, 0.8),
            row(EventType::Tailgating, Stream::Front, Outcome::Fp, 0.6),
            row(EventType::Microsleep, Stream::Cabin, Outcome::Fn, 0.0),
        ];
        let report = compute_metrics(&rows);

        assert_eq!(report.overall.tp, 2);
        assert_eq!(report.overall.precision, MetricValue::Value(0.6667));
        assert_eq!(report.overall.recall, MetricValue::Value(0.6667));
        assert_eq!(report.overall.f1, MetricValue::Value(0.6667));

        let micro = &report.by_event[&EventType::Microsleep];
        assert_eq!(micro.precision, MetricValue::INSUFFICIENT);
        assert_eq!(micro.recall, MetricValue::Value(0.0));
        assert_eq!(micro.f1, MetricValue::Value(0.0));
        assert_eq!(report.by_stream[&Stream::Front].recall, MetricValue::Value(1.0));
    }

    #[test]
    fn test_empty_slices_report_insufficient() {
        let report = compute_metrics(&[]);
        assert!(report.overall.precision.is_insufficient());
        assert!(report.overall.recall.is_insufficient());
        assert!(report.overall.f1.is_insufficient());
        assert!(report.by_event.is_empty());

        let json = serde_json::to_string(&report.overall).unwrap();
        assert!(json.contains("\"precision\":\"insufficient_data\""));
        assert!(json.contains("\"fn\":0"));
    }

    #[test]
    fn test_parallel_reduction_matches_sequential() {
        let cameras = [Stream::Front, Stream::Rear, Stream::Cabin];
        let rows: Vec<_> = (0..1000)
            .map(|i| {
                let outcome = match i % 3 {
                    0 => Outcome::Tp,
                    1 => Outcome::Fp,
                    _ => Outcome::Fn,
                };
                let t = EventType::ALL[i % EventType::ALL.len()];
                row(t, cameras[i % 3], outcome, 0.5)
            })
            .collect();
        let parallel = SliceTable::from_matches(&rows);
        let sequential = rows.iter().fold(SliceTable::default(), SliceTable::add);
        assert_eq!(parallel, sequential);
    }

    #[test]
    fn test_ece_and_brier() {
        let rows = vec![
            row(EventType::Tailgating, Stream::Front, Outcome::Tp, 0.95),
            row(EventType::Tailgating, Stream::Front, Outcome::Fp, 0.95),
            row(EventType::Tailgating, Stream::Front, Outcome::Tp, 0.25),
            row(EventType::Tailgating, Stream::Front, Outcome::Fn, 0.0),
        ];
        let cal = calibration_metrics(&rows, 10, true);
        assert_eq!(cal.samples, 3);
        // bin 9: conf 0.95, acc 0.5 → 0.45 * 2/3; bin 2: conf 0.25, acc 1 → 0.75 * 1/3
        assert_relative_eq!(cal.ece.value().unwrap(), 0.55, epsilon = 1e-5);
        // (0.0025 + 0.9025 + 0.5625) / 3
        assert_relative_eq!(cal.brier.value().unwrap(), 0.48917, epsilon = 1e-5);
        assert_eq!(cal.bins.len(), 10);
        assert_eq!(cal.bins[9].count, 2);
        assert!(cal.bins[0].accuracy.is_insufficient());
    }

    #[test]
    fn test_boundary_confidences_land_in_upper_bin() {
        let rows = vec![
            row(EventType::Tailgating, Stream::Front, Outcome::Tp, 0.7),
            row(EventType::Tailgating, Stream::Front, Outcome::Tp, 0.9),
            row(EventType::Tailgating, Stream::Front, Outcome::Fp, 0.3),
        ];
        let cal = calibration_metrics(&rows, 10, false);
        assert_eq!(cal.bins[3].count, 1);
        assert_eq!(cal.bins[6].count, 0);
        assert_eq!(cal.bins[7].count, 1);
        assert_eq!(cal.bins[8].count, 0);
        assert_eq!(cal.bins[9].count, 1);
        assert_relative_eq!(cal.bins[7].low, 0.7);
    }

    #[test]
    fn test_calibration_without_predictions() {
        let rows = vec![row(EventType::Tailgating, Stream::Front, Outcome::Fn, 0.0)];
        let cal = calibration_metrics(&rows, 10, true);
        assert!(cal.ece.is_insufficient());
        assert!(cal.brier.is_insufficient());
    }

    #[test]
    fn test_marker_round_trips() {
        let v: MetricValue = serde_json::from_str("\"insufficient_data\"").unwrap();
        assert_eq!(v, MetricValue::INSUFFICIENT);
        let v: MetricValue = serde_json::from_str("0.25").unwrap();
        assert_eq!(v, MetricValue::Value(0.25));
    }
}
