// src/eval/calibration.rs
//
// Per event type confidence calibration fitted on matched
// (confidence, is_true_positive) pairs. Types with too little data keep
// the identity mapping and are flagged.

use super::records::{EventRecord, MatchResult, Outcome};
use crate::error::ConfigError;
use crate::types::EventType;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

const LOOKUP_POINTS: usize = 101;
const NEWTON_MAX_ITER: usize = 100;
// L2 penalty on the slope, same strength as an unscaled C=1 logistic fit.
const LOGISTIC_L2: f64 = 1.0;

static IDENTITY: CalibrationModel = CalibrationModel::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationMethod {
    #[default]
    Isotonic,
    #[serde(alias = "platt")]
    Logistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LookupPoint {
    pub raw: f64,
    pub calibrated: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationModel {
    Identity,
    Isotonic {
        breakpoints: Vec<f64>,
        values: Vec<f64>,
        lookup: Vec<LookupPoint>,
    },
    Logistic {
        coef: f64,
        intercept: f64,
    },
}

impl CalibrationModel {
    /// Monotonic non-decreasing map into [0, 1].
    pub fn apply(&self, raw: f32) -> f32 {
        let x = if raw.is_finite() { raw.clamp(0.0, 1.0) as f64 } else { 0.0 };
        let y = match self {
            CalibrationModel::Identity => x,
            CalibrationModel::Isotonic { lookup, .. } => interpolate(lookup, x),
            CalibrationModel::Logistic { coef, intercept } => sigmoid(coef * x + intercept),
        };
        y.clamp(0.0, 1.0) as f32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeCalibration {
    #[serde(flatten)]
    pub model: CalibrationModel,
    pub samples: usize,
    pub calibrated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TypeCalibration {
    fn identity(samples: usize, reason: impl Into<String>) -> Self {
        Self {
            model: CalibrationModel::Identity,
            samples,
            calibrated: false,
            reason: Some(reason.into()),
        }
    }
}

/// The persisted artifact: one model per event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub method: CalibrationMethod,
    pub models: BTreeMap<EventType, TypeCalibration>,
}

impl Calibration {
    /// Identity for every type, all flagged as uncalibrated.
    pub fn uncalibrated(event_types: impl IntoIterator<Item = EventType>, reason: &str) -> Self {
        Self {
            method: CalibrationMethod::Isotonic,
            models: event_types
                .into_iter()
                .map(|t| (t, TypeCalibration::identity(0, reason)))
                .collect(),
        }
    }

    pub fn fit(matches: &[MatchResult], method: CalibrationMethod, min_samples: usize) -> Self {
        let mut samples: BTreeMap<EventType, (Vec<f64>, Vec<f64>)> = BTreeMap::new();
        for m in matches.iter().filter(|m| m.is_prediction()) {
            let entry = samples.entry(m.event_type).or_default();
            entry.0.push(m.confidence.unwrap_or(1.0).clamp(0.0, 1.0) as f64);
            entry.1.push(if m.outcome == Outcome::Tp { 1.0 } else { 0.0 });
        }

        let models = samples
            .into_iter()
            .map(|(event_type, (xs, ys))| {
                let fitted = fit_type(&xs, &ys, method, min_samples);
                match &fitted.reason {
                    Some(reason) => warn!("Calibration for {} not fitted: {}", event_type, reason),
                    None => info!(
                        "Calibrated {} with {:?} on {} samples",
                        event_type, method, fitted.samples
                    ),
                }
                (event_type, fitted)
            })
            .collect();

        Self { method, models }
    }

    pub fn model(&self, event_type: EventType) -> &CalibrationModel {
        self.models
            .get(&event_type)
            .map(|m| &m.model)
            .unwrap_or(&IDENTITY)
    }

    pub fn calibrate(&self, event_type: EventType, raw: f32) -> f32 {
        self.model(event_type).apply(raw)
    }

    /// Fills `confidence_calibrated` on every prediction.
    pub fn apply(&self, records: &mut [EventRecord]) {
        for record in records.iter_mut() {
            if let Some(raw) = record.confidence {
                record.confidence_calibrated = Some(self.calibrate(record.event_type, raw));
            }
        }
    }

    /// Marks types seen in the data but absent from the artifact.
    pub fn cover(&mut self, event_types: impl IntoIterator<Item = EventType>) {
        for t in event_types {
            self.models
                .entry(t)
                .or_insert_with(|| {
                    TypeCalibration::identity(0, "no model in calibration artifact")
                });
        }
    }

    pub fn uncalibrated_types(&self) -> BTreeMap<EventType, String> {
        self.models
            .iter()
            .filter(|(_, m)| !m.calibrated)
            .map(|(t, m)| (*t, m.reason.clone().unwrap_or_default()))
            .collect()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        info!("Calibration artifact written to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let unreadable = |reason: String| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason,
        };
        let contents = fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| unreadable(e.to_string()))
    }
}

// ============================================================================
// FITTING
// ============================================================================

fn fit_type(
    xs: &[f64],
    ys: &[f64],
    method: CalibrationMethod,
    min_samples: usize,
) -> TypeCalibration {
    let samples = xs.len();
    if samples < min_samples {
        return TypeCalibration::identity(
            samples,
            format!("only {} samples, need {}", samples, min_samples),
        );
    }

    let model = match method {
        CalibrationMethod::Isotonic => fit_isotonic(xs, ys),
        CalibrationMethod::Logistic => match fit_logistic(xs, ys) {
            Ok(model) => model,
            Err(reason) => return TypeCalibration::identity(samples, reason),
        },
    };

    TypeCalibration {
        model,
        samples,
        calibrated: true,
        reason: None,
    }
}

/// Pool-adjacent-violators over (x, y) sorted by x. Samples sharing an
/// exact x are grouped before pooling, so the fit does not depend on the
/// input order of ties and breakpoints are strictly increasing.
fn fit_isotonic(xs: &[f64], ys: &[f64]) -> CalibrationModel {
    let mut pairs: Vec<(f64, f64)> = xs.iter().copied().zip(ys.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    // (x, sum_y, count) per distinct x
    let mut groups: Vec<(f64, f64, f64)> = Vec::with_capacity(pairs.len());
    for (x, y) in pairs {
        match groups.last_mut() {
            Some(last) if last.0 == x => {
                last.1 += y;
                last.2 += 1.0;
            }
            _ => groups.push((x, y, 1.0)),
        }
    }

    // (sum_x, sum_y, count)
    let mut blocks: Vec<(f64, f64, f64)> = Vec::with_capacity(groups.len());
    for (x, sum_y, count) in groups {
        blocks.push((x * count, sum_y, count));
        while blocks.len() > 1 {
            let n = blocks.len();
            let (prev, cur) = (blocks[n - 2], blocks[n - 1]);
            if prev.1 / prev.2 <= cur.1 / cur.2 {
                break;
            }
            blocks[n - 2] = (prev.0 + cur.0, prev.1 + cur.1, prev.2 + cur.2);
            blocks.pop();
        }
    }

    let breakpoints: Vec<f64> = blocks.iter().map(|b| b.0 / b.2).collect();
    let values: Vec<f64> = blocks.iter().map(|b| (b.1 / b.2).clamp(0.0, 1.0)).collect();
    let knots: Vec<LookupPoint> = breakpoints
        .iter()
        .zip(&values)
        .map(|(&raw, &calibrated)| LookupPoint { raw, calibrated })
        .collect();

    let lookup = (0..LOOKUP_POINTS)
        .map(|i| {
            let raw = i as f64 / (LOOKUP_POINTS - 1) as f64;
            LookupPoint {
                raw: round4(raw),
                calibrated: round4(interpolate(&knots, raw)),
            }
        })
        .collect();

    CalibrationModel::Isotonic {
        breakpoints,
        values,
        lookup,
    }
}

/// Two-parameter logistic fit by Newton's method.
fn fit_logistic(xs: &[f64], ys: &[f64]) -> Result<CalibrationModel, String> {
    let positives = ys.iter().filter(|y| **y > 0.5).count();
    if positives == 0 || positives == ys.len() {
        return Err("labels contain a single class".to_string());
    }

    let (mut a, mut b) = (0.0_f64, 0.0_f64);
    for _ in 0..NEWTON_MAX_ITER {
        let (mut g_a, mut g_b) = (LOGISTIC_L2 * a, 0.0);
        let (mut h_aa, mut h_ab, mut h_bb) = (LOGISTIC_L2, 0.0, 0.0);
        for (&x, &y) in xs.iter().zip(ys) {
            let p = sigmoid(a * x + b);
            let w = p * (1.0 - p);
            g_a += (p - y) * x;
            g_b += p - y;
            h_aa += w * x * x;
            h_ab += w * x;
            h_bb += w;
        }
        let det = h_aa * h_bb - h_ab * h_ab;
        if det.abs() < 1e-12 {
            break;
        }
        let step_a = (h_bb * g_a - h_ab * g_b) / det;
        let step_b = (h_aa * g_b - h_ab * g_a) / det;
        a -= step_a;
        b -= step_b;
        if step_a.abs() < 1e-10 && step_b.abs() < 1e-10 {
            break;
        }
    }

    if !a.is_finite() || !b.is_finite() {
        return Err("logistic fit did not converge".to_string());
    }
    if a < 0.0 {
        return Err("confidence is anti-correlated with correctness".to_string());
    }
    Ok(CalibrationModel::Logistic {
        coef: a,
        intercept: b,
    })
}

/// Piecewise-linear through `points` (sorted by raw), flat outside.
fn interpolate(points: &[LookupPoint], x: f64) -> f64 {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return x;
    };
    if x <= first.raw {
        return first.calibrated;
    }
    if x >= last.raw {
        return last.calibrated;
    }
    let idx = points.partition_point(|p| p.raw <= x);
    let (lo, hi) = (points[idx - 1], points[idx]);
    let span = hi.raw - lo.raw;
    if span <= 0.0 {
        return hi.calibrated;
    }
    lo.calibrated + (hi.calibrated - lo.calibrated) * (x - lo.raw) / span
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
