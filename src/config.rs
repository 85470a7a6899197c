// src/config.rs
//
// YAML configuration. Every section and field has a default, so an
// empty file (or no file) is a valid configuration.

use crate::detection::{EventRuleOverride, EventRules};
use crate::error::ConfigError;
use crate::eval::{CalibrationMethod, GatesConfig, MatchConfig, Objective};
use crate::pipeline::event_bus::REQUESTS_PER_EVENT;
use crate::scoring::ScoringConfig;
use crate::types::EventType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub aggregation: AggregationConfig,
    pub scoring: ScoringConfig,
    pub evaluation: EvaluationConfig,
    pub gates: GatesConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Applied to every event type before the per-type entries.
    pub defaults: EventRuleOverride,
    pub rules: BTreeMap<EventType, EventRuleOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub iou_threshold: f64,
    pub tolerance_ms: i64,
    pub bins: usize,
    pub sweep: SweepConfig,
    pub objective: Objective,
    pub top_k: usize,
    pub calibration: CalibrationConfig,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.30,
            tolerance_ms: 1200,
            bins: 10,
            sweep: SweepConfig::default(),
            objective: Objective::F1,
            top_k: 200,
            calibration: CalibrationConfig::default(),
        }
    }
}

impl EvaluationConfig {
    pub fn match_config(&self) -> MatchConfig {
        MatchConfig {
            iou_threshold: self.iou_threshold,
            tolerance_ms: self.tolerance_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: 1.0,
            step: 0.05,
        }
    }
}

impl SweepConfig {
    /// Grid points, rounded to 4 decimals so float drift never adds or
    /// loses the last point.
    pub fn grid(&self) -> Vec<f64> {
        let steps = ((self.end - self.start) / self.step + 1e-9).floor() as usize;
        (0..=steps)
            .map(|i| ((self.start + i as f64 * self.step) * 10_000.0).round() / 10_000.0)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub method: CalibrationMethod,
    pub min_samples: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            method: CalibrationMethod::Isotonic,
            min_samples: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    pub artifact_queue_capacity: usize,
    /// Evidence clip window around the event center.
    pub clip_pre_event_ms: i64,
    pub clip_post_event_ms: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            artifact_queue_capacity: 256,
            clip_pre_event_ms: 5_000,
            clip_post_event_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Config = serde_yaml::from_str(&contents).map_err(|e| ConfigError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// `None` means built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn event_rules(&self) -> Result<EventRules, ConfigError> {
        EventRules::resolve(&self.aggregation.defaults, &self.aggregation.rules)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.event_rules()?;
        self.scoring.validate()?;
        self.evaluation.validate()?;
        self.gates.validate()?;

        if self.pipeline.workers == 0 {
            return Err(ConfigError::invalid("pipeline.workers", "must be at least 1"));
        }
        if self.pipeline.artifact_queue_capacity < REQUESTS_PER_EVENT {
            return Err(ConfigError::invalid(
                "pipeline.artifact_queue_capacity",
                format!("must be at least {} (one event's requests)", REQUESTS_PER_EVENT),
            ));
        }
        if self.pipeline.clip_pre_event_ms < 0 || self.pipeline.clip_post_event_ms < 0 {
            return Err(ConfigError::invalid(
                "pipeline.clip_pre_event_ms",
                "clip window must not be negative",
            ));
        }
        Ok(())
    }
}

impl EvaluationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(ConfigError::invalid(
                "evaluation.iou_threshold",
                "must be within [0, 1]",
            ));
        }
        if self.tolerance_ms < 0 {
            return Err(ConfigError::invalid(
                "evaluation.tolerance_ms",
                "must not be negative",
            ));
        }
        if self.bins == 0 {
            return Err(ConfigError::invalid("evaluation.bins", "must be at least 1"));
        }
        let sweep = &self.sweep;
        if !(sweep.step > 0.0) {
            return Err(ConfigError::invalid("evaluation.sweep.step", "must be positive"));
        }
        if !(0.0..=1.0).contains(&sweep.start)
            || !(0.0..=1.0).contains(&sweep.end)
            || sweep.start > sweep.end
        {
            return Err(ConfigError::invalid(
                "evaluation.sweep",
                "start and end must satisfy 0 <= start <= end <= 1",
            ));
        }
        if self.calibration.min_samples == 0 {
            return Err(ConfigError::invalid(
                "evaluation.calibration.min_samples",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}
