// src/eval/matcher.rs
//
// One-to-one matching of predicted events against ground truth, per trip
// and event type. "IoU" here is the overlap ratio of two time intervals.

use super::records::{EventRecord, MatchResult, Outcome};
use crate::types::{EventType, Stream};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    pub iou_threshold: f64,
    pub tolerance_ms: i64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.30,
            tolerance_ms: 1200,
        }
    }
}

/// Intersection over union of `[start, end]` intervals. Zero-length
/// intervals count as 1ms so identical instants still overlap fully.
pub fn temporal_overlap(a: (i64, i64), b: (i64, i64)) -> f64 {
    let a_end = a.1.max(a.0 + 1);
    let b_end = b.1.max(b.0 + 1);
    let intersection = (a_end.min(b_end) - a.0.max(b.0)).max(0);
    let union = (a_end - a.0) + (b_end - b.0) - intersection;
    if union <= 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

struct Candidate {
    gt: usize,
    pred: usize,
    overlap: f64,
}

/// Matches every trip independently and concatenates in trip order.
pub fn match_events(
    ground_truth: &[EventRecord],
    predictions: &[EventRecord],
    config: &MatchConfig,
) -> Vec<MatchResult> {
    let mut trips: BTreeMap<&str, (Vec<&EventRecord>, Vec<&EventRecord>)> = BTreeMap::new();
    for gt in ground_truth {
        trips.entry(gt.trip_id.as_str()).or_default().0.push(gt);
    }
    for pred in predictions {
        trips.entry(pred.trip_id.as_str()).or_default().1.push(pred);
    }

    trips
        .into_iter()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|(trip_id, (gts, preds))| match_trip(trip_id, &gts, &preds, config))
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect()
}

pub fn match_trip(
    trip_id: &str,
    ground_truth: &[&EventRecord],
    predictions: &[&EventRecord],
    config: &MatchConfig,
) -> Vec<MatchResult> {
    let mut by_type: BTreeMap<EventType, (Vec<&EventRecord>, Vec<&EventRecord>)> = BTreeMap::new();
    for gt in ground_truth {
        by_type.entry(gt.event_type).or_default().0.push(gt);
    }
    for pred in predictions {
        by_type.entry(pred.event_type).or_default().1.push(pred);
    }

    let mut results = Vec::with_capacity(ground_truth.len() + predictions.len());
    for (event_type, (mut gts, mut preds)) in by_type {
        gts.sort_by(|a, b| record_order(a, b));
        preds.sort_by(|a, b| record_order(a, b));
        let before = results.len();
        match_group(&gts, &preds, config, &mut results);
        debug!(
            "Trip {} {}: {} gt, {} pred → {} result rows",
            trip_id,
            event_type,
            gts.len(),
            preds.len(),
            results.len() - before
        );
    }
    results
}

fn record_order(a: &EventRecord, b: &EventRecord) -> Ordering {
    a.ts_start_ms
        .cmp(&b.ts_start_ms)
        .then(a.ts_end_ms.cmp(&b.ts_end_ms))
        .then_with(|| a.id.cmp(&b.id))
}

fn match_group(
    gts: &[&EventRecord],
    preds: &[&EventRecord],
    config: &MatchConfig,
    out: &mut Vec<MatchResult>,
) {
    let mut candidates = Vec::new();
    for (gi, gt) in gts.iter().enumerate() {
        for (pi, pred) in preds.iter().enumerate() {
            if !gt.stream.is_compatible(pred.stream) {
                continue;
            }
            if (pred.ts_start_ms - gt.ts_start_ms).abs() > config.tolerance_ms {
                continue;
            }
            let overlap = temporal_overlap(
                (gt.ts_start_ms, gt.ts_end_ms),
                (pred.ts_start_ms, pred.ts_end_ms),
            );
            if overlap >= config.iou_threshold {
                candidates.push(Candidate {
                    gt: gi,
                    pred: pi,
                    overlap,
                });
            }
        }
    }

    // Highest overlap first; ties go to the earliest ground truth. Both
    // slices are already in (start, end, id) order, so the indices make
    // the rest of the tie-break total.
    candidates.sort_by(|a, b| {
        b.overlap
            .total_cmp(&a.overlap)
            .then(a.gt.cmp(&b.gt))
            .then(a.pred.cmp(&b.pred))
    });

    let mut gt_used = vec![false; gts.len()];
    let mut pred_used = vec![false; preds.len()];
    let mut pairs = Vec::new();
    for c in candidates {
        if gt_used[c.gt] || pred_used[c.pred] {
            continue;
        }
        gt_used[c.gt] = true;
        pred_used[c.pred] = true;
        pairs.push(c);
    }
    pairs.sort_by_key(|c| c.gt);

    for c in pairs {
        let gt = gts[c.gt];
        let pred = preds[c.pred];
        out.push(MatchResult {
            trip_id: gt.trip_id.clone(),
            event_type: gt.event_type,
            stream: if gt.stream == Stream::Unknown {
                pred.stream
            } else {
                gt.stream
            },
            scenario: gt.scenario,
            gt_id: Some(gt.id.clone()),
            pred_id: Some(pred.id.clone()),
            matched: true,
            outcome: Outcome::Tp,
            overlap_ratio: round4(c.overlap),
            time_delta_ms: Some(pred.ts_start_ms - gt.ts_start_ms),
            ts_start_ms: gt.ts_start_ms,
            ts_end_ms: gt.ts_end_ms,
            confidence: pred.confidence,
            confidence_calibrated: pred.confidence_calibrated,
        });
    }

    for (pred, _) in preds.iter().zip(&pred_used).filter(|(_, used)| !**used) {
        out.push(unmatched(pred, Outcome::Fp));
    }
    for (gt, _) in gts.iter().zip(&gt_used).filter(|(_, used)| !**used) {
        out.push(unmatched(gt, Outcome::Fn));
    }
}

fn unmatched(record: &EventRecord, outcome: Outcome) -> MatchResult {
    let (gt_id, pred_id) = match outcome {
        Outcome::Fn => (Some(record.id.clone()), None),
        _ => (None, Some(record.id.clone())),
    };
    MatchResult {
        trip_id: record.trip_id.clone(),
        event_type: record.event_type,
        stream: record.stream,
        scenario: record.scenario,
        gt_id,
        pred_id,
        matched: false,
        outcome,
        overlap_ratio: 0.0,
        time_delta_ms: None,
        ts_start_ms: record.ts_start_ms,
        ts_end_ms: record.ts_end_ms,
        confidence: record.confidence,
        confidence_calibrated: record.confidence_calibrated,
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
