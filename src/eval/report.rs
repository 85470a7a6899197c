// src/eval/report.rs
//
// Assembles one evaluation run and writes its artifact bundle. The report
// carries no wall-clock data, so identical inputs give identical files.

use super::calibration::{Calibration, CalibrationMethod};
use super::gates::{evaluate_gates, GateInputs, GateReport, GatesConfig};
use super::io::{DateRange, LoadedEvents};
use super::matcher::match_events;
use super::metrics::{
    calibration_metrics, compute_metrics, CalibrationMetrics, MetricValue, MetricsReport,
    SliceMetrics,
};
use super::plots;
use super::records::{EventRecord, MatchResult, Outcome};
use super::threshold::{sweep_thresholds, BestThreshold, Objective, ThresholdSweep};
use crate::config::{EvaluationConfig, SweepConfig};
use crate::types::EventType;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub iou_threshold: f64,
    pub tolerance_ms: i64,
    pub bins: usize,
    pub objective: Objective,
    pub sweep: SweepConfig,
    pub top_k: usize,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub ground_truth_events: usize,
    pub predicted_events: usize,
    pub trips_ground_truth: usize,
    pub trips_predicted: usize,
    pub skipped_ground_truth: usize,
    pub skipped_predictions: usize,
    pub selected_trips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSection {
    /// `None` when no artifact was supplied.
    pub method: Option<CalibrationMethod>,
    pub calibrated: CalibrationMetrics,
    pub raw: CalibrationMetrics,
    pub uncalibrated_types: BTreeMap<EventType, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureExamples {
    /// Most confident first.
    pub false_positives: Vec<MatchResult>,
    pub false_negatives: Vec<MatchResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub config: RunConfig,
    pub dataset: DatasetSummary,
    pub metrics: MetricsReport,
    pub calibration: CalibrationSection,
    pub threshold_sweep: ThresholdSweep,
    pub failure_examples: FailureExamples,
    pub matches: Vec<MatchResult>,
}

impl EvaluationReport {
    pub fn gate_inputs(&self) -> GateInputs<'_> {
        GateInputs {
            metrics: Some(&self.metrics),
            calibration: Some(&self.calibration.calibrated),
        }
    }

    pub fn gates(&self, config: &GatesConfig) -> GateReport {
        evaluate_gates(self.gate_inputs(), config)
    }
}

/// Gates over a stored `evaluation.json`. Sections that are missing or do
/// not parse are treated as absent, so their gates fail with a reason.
pub fn gates_from_stored(evaluation: &Value, config: &GatesConfig) -> GateReport {
    let metrics: Option<MetricsReport> = evaluation
        .get("metrics")
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    let calibration: Option<CalibrationMetrics> = evaluation
        .pointer("/calibration/calibrated")
        .and_then(|v| serde_json::from_value(v.clone()).ok());
    evaluate_gates(
        GateInputs {
            metrics: metrics.as_ref(),
            calibration: calibration.as_ref(),
        },
        config,
    )
}

// ============================================================================
// RUN
// ============================================================================

pub struct EvaluationInputs<'a> {
    pub ground_truth: &'a LoadedEvents,
    pub predictions: &'a LoadedEvents,
    pub calibration: Option<Calibration>,
    pub date_range: DateRange,
    pub selected_trips: BTreeSet<String>,
}

pub fn run_evaluation(inputs: EvaluationInputs<'_>, config: &EvaluationConfig) -> EvaluationReport {
    let gt = &inputs.ground_truth.records;
    let event_types: BTreeSet<EventType> = inputs
        .predictions
        .records
        .iter()
        .chain(gt)
        .map(|r| r.event_type)
        .collect();

    let (method, calibration) = match inputs.calibration {
        Some(mut c) => {
            c.cover(event_types.iter().copied());
            (Some(c.method), c)
        }
        None => (
            None,
            Calibration::uncalibrated(
                event_types.iter().copied(),
                "no calibration artifact supplied",
            ),
        ),
    };
    let mut preds: Vec<EventRecord> = inputs.predictions.records.clone();
    calibration.apply(&mut preds);

    let match_config = config.match_config();
    let matches = match_events(gt, &preds, &match_config);
    let metrics = compute_metrics(&matches);
    let calibrated = calibration_metrics(&matches, config.bins, true);
    let raw = calibration_metrics(&matches, config.bins, false);
    let threshold_sweep = sweep_thresholds(
        gt,
        &preds,
        &config.sweep.grid(),
        &match_config,
        config.objective,
    );
    let failure_examples = failure_examples(&matches, config.top_k);

    info!(
        "Evaluated {} trip(s): tp={} fp={} fn={} precision={} recall={} f1={} ece={}",
        inputs.selected_trips.len(),
        metrics.overall.tp,
        metrics.overall.fp,
        metrics.overall.fn_,
        metrics.overall.precision,
        metrics.overall.recall,
        metrics.overall.f1,
        calibrated.ece
    );

    EvaluationReport {
        config: RunConfig {
            iou_threshold: config.iou_threshold,
            tolerance_ms: config.tolerance_ms,
            bins: config.bins,
            objective: config.objective,
            sweep: config.sweep,
            top_k: config.top_k,
            date_from: inputs.date_range.from,
            date_to: inputs.date_range.to,
        },
        dataset: DatasetSummary {
            ground_truth_events: gt.len(),
            predicted_events: preds.len(),
            trips_ground_truth: distinct_trips(gt),
            trips_predicted: distinct_trips(&preds),
            skipped_ground_truth: inputs.ground_truth.skipped,
            skipped_predictions: inputs.predictions.skipped,
            selected_trips: inputs.selected_trips.into_iter().collect(),
        },
        metrics,
        calibration: CalibrationSection {
            method,
            calibrated,
            raw,
            uncalibrated_types: calibration.uncalibrated_types(),
        },
        threshold_sweep,
        failure_examples,
        matches,
    }
}

fn distinct_trips(records: &[EventRecord]) -> usize {
    records
        .iter()
        .map(|r| r.trip_id.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

fn failure_examples(matches: &[MatchResult], top_k: usize) -> FailureExamples {
    let mut false_positives: Vec<MatchResult> = matches
        .iter()
        .filter(|m| m.outcome == Outcome::Fp)
        .cloned()
        .collect();
    // Stable: equal confidences keep match order.
    false_positives.sort_by(|a, b| {
        b.confidence
            .unwrap_or(1.0)
            .total_cmp(&a.confidence.unwrap_or(1.0))
    });
    false_positives.truncate(top_k);

    let false_negatives = matches
        .iter()
        .filter(|m| m.outcome == Outcome::Fn)
        .take(top_k)
        .cloned()
        .collect();

    FailureExamples {
        false_positives,
        false_negatives,
    }
}

// ============================================================================
// BUNDLE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationSummary {
    pub ece: MetricValue,
    pub brier: MetricValue,
    pub raw_ece: MetricValue,
    pub raw_brier: MetricValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub overall: SliceMetrics,
    pub global_best_threshold: Option<BestThreshold>,
    pub calibration: CalibrationSummary,
    pub selected_trips: usize,
    pub gates_passed: bool,
    pub output_dir: PathBuf,
}

pub const EVALUATION_FILE: &str = "evaluation.json";

/// Writes every artifact of the run into `outdir`.
pub fn write_bundle(
    report: &EvaluationReport,
    gates: &GateReport,
    outdir: &Path,
) -> Result<RunSummary> {
    fs::create_dir_all(outdir).with_context(|| format!("creating {}", outdir.display()))?;

    write_json(&outdir.join(EVALUATION_FILE), report)?;

    let m = &report.metrics;
    write_slice_csv(&outdir.join("metrics_by_event.csv"), "event_type", &m.by_event)?;
    write_slice_csv(&outdir.join("metrics_by_stream.csv"), "stream", &m.by_stream)?;
    write_slice_csv(&outdir.join("metrics_by_scenario.csv"), "scenario", &m.by_scenario)?;
    write_sweep_csv(&outdir.join("threshold_sweep.csv"), &report.threshold_sweep)?;

    write_text(
        &outdir.join("reliability_diagram.svg"),
        &plots::reliability_diagram(&report.calibration.calibrated),
    )?;
    write_text(
        &outdir.join("threshold_curve.svg"),
        &plots::threshold_curve(&report.threshold_sweep),
    )?;
    write_json(&outdir.join("gates.json"), gates)?;

    let summary = RunSummary {
        overall: m.overall,
        global_best_threshold: report.threshold_sweep.global_best,
        calibration: CalibrationSummary {
            ece: report.calibration.calibrated.ece,
            brier: report.calibration.calibrated.brier,
            raw_ece: report.calibration.raw.ece,
            raw_brier: report.calibration.raw.brier,
        },
        selected_trips: report.dataset.selected_trips.len(),
        gates_passed: gates.passed,
        output_dir: outdir.to_path_buf(),
    };
    write_json(&outdir.join("summary.json"), &summary)?;

    info!("Evaluation bundle written to {}", outdir.display());
    Ok(summary)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_text(path, &json)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
}

fn write_slice_csv<K: Display>(
    path: &Path,
    key: &str,
    rows: &BTreeMap<K, SliceMetrics>,
) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    writer.write_record([key, "tp", "fp", "fn", "precision", "recall", "f1"])?;
    for (k, m) in rows {
        writer.write_record([
            k.to_string(),
            m.tp.to_string(),
            m.fp.to_string(),
            m.fn_.to_string(),
            m.precision.to_string(),
            m.recall.to_string(),
            m.f1.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_sweep_csv(path: &Path, sweep: &ThresholdSweep) -> Result<()> {
    let types = sweep.event_types();
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;

    let mut header: Vec<String> = ["threshold", "tp", "fp", "fn", "precision", "recall", "f1"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    header.extend(types.iter().map(|t| format!("{}_f1", t)));
    writer.write_record(&header)?;

    for row in &sweep.rows {
        let mut record = vec![
            row.threshold.to_string(),
            row.tp.to_string(),
            row.fp.to_string(),
            row.fn_.to_string(),
            row.precision.to_string(),
            row.recall.to_string(),
            row.f1.to_string(),
        ];
        record.extend(types.iter().map(|t| {
            row.per_event_f1
                .get(t)
                .copied()
                .unwrap_or(MetricValue::INSUFFICIENT)
                .to_string()
        }));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
