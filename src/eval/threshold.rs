// src/eval/threshold.rs
//
// Confidence cutoff sweep. Each grid point re-runs matching on the
// predictions that survive the cutoff; grid points are independent and
// evaluated in parallel.

use super::matcher::{match_events, MatchConfig};
use super::metrics::{MetricValue, SliceCounts, SliceTable};
use super::records::EventRecord;
use crate::types::EventType;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    F1,
    Precision,
    Recall,
}

impl Objective {
    pub fn of(&self, counts: &SliceCounts) -> MetricValue {
        match self {
            Objective::F1 => counts.f1(),
            Objective::Precision => counts.precision(),
            Objective::Recall => counts.recall(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRow {
    pub threshold: f64,
    pub tp: u64,
    pub fp: u64,
    #[serde(rename = "fn")]
    pub fn_: u64,
    pub precision: MetricValue,
    pub recall: MetricValue,
    pub f1: MetricValue,
    pub per_event_f1: BTreeMap<EventType, MetricValue>,
    #[serde(skip)]
    per_event_counts: BTreeMap<EventType, SliceCounts>,
    #[serde(skip)]
    overall_counts: SliceCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BestThreshold {
    pub threshold: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSweep {
    pub objective: Objective,
    pub rows: Vec<SweepRow>,
    /// `None` when every grid point was insufficient.
    pub global_best: Option<BestThreshold>,
    pub per_event_best: BTreeMap<EventType, Option<BestThreshold>>,
}

impl ThresholdSweep {
    pub fn event_types(&self) -> Vec<EventType> {
        self.per_event_best.keys().copied().collect()
    }
}

pub fn sweep_thresholds(
    ground_truth: &[EventRecord],
    predictions: &[EventRecord],
    grid: &[f64],
    config: &MatchConfig,
    objective: Objective,
) -> ThresholdSweep {
    let event_types: BTreeSet<EventType> = ground_truth
        .iter()
        .chain(predictions)
        .map(|r| r.event_type)
        .collect();

    let rows: Vec<SweepRow> = grid
        .par_iter()
        .map(|&cutoff| {
            let kept: Vec<EventRecord> = predictions
                .iter()
                .filter(|p| p.confidence_or_one() >= cutoff as f32)
                .cloned()
                .collect();
            let matches = match_events(ground_truth, &kept, config);
            let table = SliceTable::from_matches(&matches);
            debug!(
                "Cutoff {:.2}: {} prediction(s) kept, tp={} fp={} fn={}",
                cutoff,
                kept.len(),
                table.overall.tp,
                table.overall.fp,
                table.overall.fn_
            );
            build_row(cutoff, &table, &event_types)
        })
        .collect();

    let global_best = pick_best(
        rows.iter()
            .map(|r| (r.threshold, objective.of(&r.overall_counts))),
    );
    let per_event_best = event_types
        .iter()
        .map(|&t| {
            let best = pick_best(rows.iter().map(|r| {
                let counts = r.per_event_counts.get(&t).copied().unwrap_or_default();
                (r.threshold, objective.of(&counts))
            }));
            (t, best)
        })
        .collect();

    ThresholdSweep {
        objective,
        rows,
        global_best,
        per_event_best,
    }
}

fn build_row(threshold: f64, table: &SliceTable, event_types: &BTreeSet<EventType>) -> SweepRow {
    let overall = table.overall.metrics();
    let per_event_counts: BTreeMap<EventType, SliceCounts> = event_types
        .iter()
        .map(|&t| (t, table.by_event.get(&t).copied().unwrap_or_default()))
        .collect();
    SweepRow {
        threshold,
        tp: overall.tp,
        fp: overall.fp,
        fn_: overall.fn_,
        precision: overall.precision,
        recall: overall.recall,
        f1: overall.f1,
        per_event_f1: per_event_counts.iter().map(|(t, c)| (*t, c.f1())).collect(),
        per_event_counts,
        overall_counts: table.overall,
    }
}

/// Highest objective wins; ties keep the lowest threshold. Points with
/// insufficient data are never picked.
fn pick_best(points: impl Iterator<Item = (f64, MetricValue)>) -> Option<BestThreshold> {
    let mut best: Option<BestThreshold> = None;
    for (threshold, value) in points {
        let Some(value) = value.value() else {
            continue;
        };
        if best.map_or(true, |b| value > b.value) {
            best = Some(BestThreshold { threshold, value });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SweepConfig;
    use crate::types::{Scenario, Stream};

    fn record(id: &str, event_type: EventType, start: i64, confidence: Option<f32>) -> EventRecord {
        EventRecord {
            id: id.to_string(),
            trip_id: "t".into(),
            event_type,
            stream: Stream::Front,
            scenario: Scenario::Day,
            ts_start_ms: start,
            ts_end_ms: start + 1_000,
            confidence,
            confidence_calibrated: None,
        }
    }

    fn fixture() -> (Vec<EventRecord>, Vec<EventRecord>) {
        let gt = vec![
            record("g1", EventType::Tailgating, 0, None),
            record("g2", EventType::Tailgating, 10_000, None),
            record("g3", EventType::LaneDeviation, 20_000, None),
        ];
        let preds = vec![
            record("p1", EventType::Tailgating, 0, Some(0.9)),
            record("p2", EventType::Tailgating, 10_000, Some(0.35)),
            record("p3", EventType::Tailgating, 30_000, Some(0.3)),
            record("p4", EventType::LaneDeviation, 20_000, Some(0.6)),
            record("p5", EventType::LaneDeviation, 40_000, Some(0.55)),
        ];
        (gt, preds)
    }

    #[test]
    fn test_sweep_rows_follow_grid() {
        let (gt, preds) = fixture();
        let grid = SweepConfig::default().grid();
        let sweep = sweep_thresholds(&gt, &preds, &grid, &MatchConfig::default(), Objective::F1);

        assert_eq!(sweep.rows.len(), 21);
        assert!(sweep.rows.windows(2).all(|w| w[0].threshold < w[1].threshold));
        assert_eq!(sweep.rows[0].tp, 3);
        assert_eq!(sweep.rows[0].fp, 2);
        let last = sweep.rows.last().unwrap();
        assert_eq!(last.tp + last.fp, 0);
        assert_eq!(last.fn_, 3);
        assert!(last.precision.is_insufficient());
    }

    #[test]
    fn test_best_thresholds() {
        let (gt, preds) = fixture();
        let grid = SweepConfig::default().grid();
        let sweep = sweep_thresholds(&gt, &preds, &grid, &MatchConfig::default(), Objective::F1);

        // Cutoffs in (0.30, 0.35] drop only p3: tp=3 fp=1 fn=0 → f1 0.8571.
        let best = sweep.global_best.unwrap();
        assert_eq!(best.threshold, 0.35);
        assert_eq!(best.value, 0.8571);

        let tail = sweep.per_event_best[&EventType::Tailgating].unwrap();
        assert_eq!(tail.threshold, 0.35);
        assert_eq!(tail.value, 1.0);
        // p5 (0.55) is the only lane deviation false positive.
        let lane = sweep.per_event_best[&EventType::LaneDeviation].unwrap();
        assert_eq!(lane.threshold, 0.6);
        assert_eq!(sweep.event_types(), vec![EventType::LaneDeviation, EventType::Tailgating]);
    }

    #[test]
    fn test_no_data_means_no_best() {
        let sweep = sweep_thresholds(
            &[],
            &[],
            &[0.0, 0.5, 1.0],
            &MatchConfig::default(),
            Objective::F1,
        );
        assert_eq!(sweep.rows.len(), 3);
        assert!(sweep.global_best.is_none());
        assert!(sweep.per_event_best.is_empty());
    }

    #[test]
    fn test_recall_objective_prefers_low_cutoff() {
        let (gt, preds) = fixture();
        let grid = SweepConfig::default().grid();
        // Recall is 1.0 for every cutoff up to 0.35; the lowest one wins.
        let sweep =
            sweep_thresholds(&gt, &preds, &grid, &MatchConfig::default(), Objective::Recall);
        let best = sweep.global_best.unwrap();
        assert_eq!(best.threshold, 0.0);
        assert_eq!(best.value, 1.0);
    }
}
