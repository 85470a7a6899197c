// src/eval/gates.rs
//
// Acceptance gates. Evaluation always yields one verdict per configured
// gate; a metric that is absent or insufficient fails its gate with a
// reason instead of aborting.

use super::metrics::{CalibrationMetrics, MetricValue, MetricsReport, SliceMetrics};
use crate::error::ConfigError;
use crate::types::{EventType, Scenario, Stream};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use tracing::{info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Minimum required values for one slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricGate {
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
}

impl MetricGate {
    fn requirements(&self) -> impl Iterator<Item = (&'static str, f64)> {
        [
            ("precision", self.precision),
            ("recall", self.recall),
            ("f1", self.f1),
        ]
        .into_iter()
        .filter_map(|(name, v)| v.map(|v| (name, v)))
    }
}

/// Upper bounds on calibration error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationGate {
    pub max_ece: Option<f64>,
    pub max_brier: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatesConfig {
    pub overall: MetricGate,
    pub per_event: BTreeMap<EventType, MetricGate>,
    pub per_stream: BTreeMap<Stream, MetricGate>,
    pub per_scenario: BTreeMap<Scenario, MetricGate>,
    pub calibration: CalibrationGate,
}

impl GatesConfig {
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn count(&self) -> usize {
        let slices = self.overall.requirements().count()
            + self.per_event.values().map(|g| g.requirements().count()).sum::<usize>()
            + self.per_stream.values().map(|g| g.requirements().count()).sum::<usize>()
            + self.per_scenario.values().map(|g| g.requirements().count()).sum::<usize>();
        slices
            + self.calibration.max_ece.is_some() as usize
            + self.calibration.max_brier.is_some() as usize
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_gate("gates.overall", &self.overall)?;
        for (t, g) in &self.per_event {
            check_gate(&format!("gates.per_event.{}", t), g)?;
        }
        for (s, g) in &self.per_stream {
            check_gate(&format!("gates.per_stream.{}", s), g)?;
        }
        for (s, g) in &self.per_scenario {
            check_gate(&format!("gates.per_scenario.{}", s), g)?;
        }
        for (name, v) in [
            ("gates.calibration.max_ece", self.calibration.max_ece),
            ("gates.calibration.max_brier", self.calibration.max_brier),
        ] {
            if let Some(v) = v {
                check_unit(name, v)?;
            }
        }
        Ok(())
    }
}

fn check_gate(prefix: &str, gate: &MetricGate) -> Result<(), ConfigError> {
    for (metric, v) in gate.requirements() {
        check_unit(&format!("{}.{}", prefix, metric), v)?;
    }
    Ok(())
}

fn check_unit(field: &str, v: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{} is outside [0, 1]", v)))
    }
}

// ============================================================================
// VERDICTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    /// actual >= required
    Min,
    /// actual <= required
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub gate: String,
    pub bound: Bound,
    pub passed: bool,
    pub required: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub passed: bool,
    pub total: usize,
    pub failed: usize,
    pub verdicts: Vec<GateVerdict>,
}

impl GateReport {
    pub fn failures(&self) -> impl Iterator<Item = &GateVerdict> {
        self.verdicts.iter().filter(|v| !v.passed)
    }
}

/// What the gates look at. Either half may be missing when the
/// evaluation result is partial.
#[derive(Debug, Clone, Copy, Default)]
pub struct GateInputs<'a> {
    pub metrics: Option<&'a MetricsReport>,
    pub calibration: Option<&'a CalibrationMetrics>,
}

pub fn evaluate_gates(inputs: GateInputs<'_>, config: &GatesConfig) -> GateReport {
    let mut verdicts = Vec::with_capacity(config.count());

    slice_verdicts(
        &mut verdicts,
        "overall".to_string(),
        &config.overall,
        inputs.metrics.map(|m| &m.overall),
    );
    for (t, gate) in &config.per_event {
        let slice = inputs.metrics.and_then(|m| m.by_event.get(t));
        slice_verdicts(&mut verdicts, label("per_event", t), gate, slice);
    }
    for (s, gate) in &config.per_stream {
        let slice = inputs.metrics.and_then(|m| m.by_stream.get(s));
        slice_verdicts(&mut verdicts, label("per_stream", s), gate, slice);
    }
    for (s, gate) in &config.per_scenario {
        let slice = inputs.metrics.and_then(|m| m.by_scenario.get(s));
        slice_verdicts(&mut verdicts, label("per_scenario", s), gate, slice);
    }

    let cal = inputs.calibration;
    if let Some(required) = config.calibration.max_ece {
        verdicts.push(verdict(
            "calibration.ece".into(),
            Bound::Max,
            required,
            cal.map(|c| c.ece),
        ));
    }
    if let Some(required) = config.calibration.max_brier {
        verdicts.push(verdict(
            "calibration.brier".into(),
            Bound::Max,
            required,
            cal.map(|c| c.brier),
        ));
    }

    let failed = verdicts.iter().filter(|v| !v.passed).count();
    for v in verdicts.iter().filter(|v| !v.passed) {
        warn!(
            "Gate {} failed: {}",
            v.gate,
            v.reason.as_deref().unwrap_or("below requirement")
        );
    }
    info!("{}/{} gates passed", verdicts.len() - failed, verdicts.len());

    GateReport {
        passed: failed == 0,
        total: verdicts.len(),
        failed,
        verdicts,
    }
}

fn label(group: &str, key: &impl Display) -> String {
    format!("{}.{}", group, key)
}

fn slice_verdicts(
    out: &mut Vec<GateVerdict>,
    prefix: String,
    gate: &MetricGate,
    slice: Option<&SliceMetrics>,
) {
    for (metric, required) in gate.requirements() {
        let actual = slice.map(|s| match metric {
            "precision" => s.precision,
            "recall" => s.recall,
            _ => s.f1,
        });
        out.push(verdict(
            format!("{}.{}", prefix, metric),
            Bound::Min,
            required,
            actual,
        ));
    }
}

fn verdict(gate: String, bound: Bound, required: f64, actual: Option<MetricValue>) -> GateVerdict {
    let (passed, actual, reason) = match actual {
        None => (false, None, Some("metric missing from evaluation".to_string())),
        Some(MetricValue::Insufficient(_)) => (false, None, Some("insufficient_data".to_string())),
        Some(MetricValue::Value(v)) if v.is_nan() => {
            (false, None, Some("metric is not a number".to_string()))
        }
        Some(MetricValue::Value(v)) => {
            let passed = match bound {
                Bound::Min => v >= required,
                Bound::Max => v <= required,
            };
            let reason = (!passed).then(|| match bound {
                Bound::Min => format!("{} is below the minimum {}", v, required),
                Bound::Max => format!("{} exceeds the maximum {}", v, required),
            });
            (passed, Some(v), reason)
        }
    };
    GateVerdict {
        gate,
        bound,
        passed,
        required,
        actual,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::metrics::SliceCounts;

    fn metrics() -> MetricsReport {
        let mut by_event = BTreeMap::new();
        by_event.insert(
            EventType::MobilePhoneUse,
            SliceCounts { tp: 8, fp: 2, fn_: 2 }.metrics(),
        );
        by_event.insert(
            EventType::Microsleep,
            SliceCounts { tp: 0, fp: 0, fn_: 3 }.metrics(),
        );
        let mut by_stream = BTreeMap::new();
        by_stream.insert(Stream::Cabin, SliceCounts { tp: 8, fp: 2, fn_: 5 }.metrics());
        MetricsReport {
            overall: SliceCounts { tp: 8, fp: 2, fn_: 5 }.metrics(),
            by_event,
            by_stream,
            by_scenario: BTreeMap::new(),
        }
    }

    #[test]
    fn test_passing_and_failing_gates() {
        let m = metrics();
        let mut config = GatesConfig {
            overall: MetricGate {
                precision: Some(0.8),
                recall: Some(0.7),
                f1: None,
            },
            ..Default::default()
        };
        config.per_event.insert(
            EventType::MobilePhoneUse,
            MetricGate {
                precision: Some(0.75),
                ..Default::default()
            },
        );

        let report = evaluate_gates(
            GateInputs {
                metrics: Some(&m),
                calibration: None,
            },
            &config,
        );
        assert_eq!(report.total, 3);
        assert_eq!(report.failed, 1);
        assert!(!report.passed);

        let failed: Vec<_> = report.failures().map(|v| v.gate.as_str()).collect();
        assert_eq!(failed, vec!["overall.recall"]);
        let phone = &report.verdicts[2];
        assert_eq!(phone.gate, "per_event.mobile_phone_use.precision");
        assert!(phone.passed);
        assert_eq!(phone.actual, Some(0.8));
    }

    #[test]
    fn test_missing_and_insufficient_metrics_fail_with_reason() {
        let m = metrics();
        let mut config = GatesConfig::default();
        config.per_event.insert(
            EventType::Microsleep,
            MetricGate {
                precision: Some(0.5),
                ..Default::default()
            },
        );
        config.per_scenario.insert(
            Scenario::Night,
            MetricGate {
                recall: Some(0.6),
                ..Default::default()
            },
        );
        config.calibration.max_ece = Some(0.1);

        let report = evaluate_gates(
            GateInputs {
                metrics: Some(&m),
                calibration: None,
            },
            &config,
        );
        assert_eq!(report.total, 3);
        assert_eq!(report.failed, 3);
        assert_eq!(report.verdicts[0].reason.as_deref(), Some("insufficient_data"));
        assert_eq!(
            report.verdicts[1].reason.as_deref(),
            Some("metric missing from evaluation")
        );
        assert_eq!(report.verdicts[2].gate, "calibration.ece");
        assert_eq!(report.verdicts[2].bound, Bound::Max);
    }

    #[test]
    fn test_nothing_to_look_at_never_panics() {
        let mut config = GatesConfig::default();
        config.overall.f1 = Some(0.5);
        config.calibration.max_brier = Some(0.2);
        let report = evaluate_gates(GateInputs::default(), &config);
        assert!(!report.passed);
        assert!(report.verdicts.iter().all(|v| v.actual.is_none()));

        let empty = evaluate_gates(GateInputs::default(), &GatesConfig::default());
        assert!(empty.passed);
        assert_eq!(empty.total, 0);
    }

    #[test]
    fn test_calibration_upper_bounds() {
        let cal = CalibrationMetrics {
            samples: 10,
            ece: MetricValue::Value(0.08),
            brier: MetricValue::Value(0.25),
            bins: Vec::new(),
        };
        let config = GatesConfig {
            calibration: CalibrationGate {
                max_ece: Some(0.1),
                max_brier: Some(0.2),
            },
            ..Default::default()
        };
        let report = evaluate_gates(
            GateInputs {
                metrics: None,
                calibration: Some(&cal),
            },
            &config,
        );
        assert!(report.verdicts[0].passed);
        assert!(!report.verdicts[1].passed);
        assert_eq!(
            report.verdicts[1].reason.as_deref(),
            Some("0.25 exceeds the maximum 0.2")
        );
    }

    #[test]
    fn test_yaml_shape_and_validation() {
        let yaml = r#"
overall: {precision: 0.8, recall: 0.7}
per_event: {phone_use: {precision: 0.8}}
per_stream: {cabin: {recall: 0.6}}
calibration: {max_ece: 0.1}
"#;
        let config: GatesConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.count(), 5);
        assert!(config.per_event.contains_key(&EventType::MobilePhoneUse));

        let bad: GatesConfig = serde_yaml::from_str("overall: {recall: 1.5}").unwrap();
        let err = bad.validate().unwrap_err();
        assert!(err.to_string().contains("gates.overall.recall"));
    }
}
