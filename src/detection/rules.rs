// src/detection/rules.rs
//
// Per-event-type tracker configuration. One table, one row per type;
// the YAML config only lists the fields it wants to change.

use super::smoother::SmoothingPolicy;
use crate::error::ConfigError;
use crate::types::EventType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_DEBOUNCE_MS: i64 = 300;
const DEFAULT_GAP_TOLERANCE_MS: i64 = 400;
const DEFAULT_MIN_SCENE_QUALITY: f32 = 0.3;
// Weight of the newest frame. At ~10 fps this settles in well under a second.
const DEFAULT_EMA_ALPHA: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventRule {
    pub confidence_threshold: f32,
    pub debounce_ms: i64,
    pub min_duration_ms: i64,
    pub cooldown_ms: i64,
    pub gap_tolerance_ms: i64,
    pub min_scene_quality: f32,
    pub ema_alpha: f32,
    pub smoothing: SmoothingPolicy,
}

impl EventRule {
    /// A frame counts toward an event only when it clears both the
    /// confidence threshold and the scene-reliability gate.
    pub fn qualifies(&self, confidence: f32, scene_quality: f32) -> bool {
        scene_quality >= self.min_scene_quality && confidence >= self.confidence_threshold
    }

    pub fn is_scene_gated(&self, scene_quality: f32) -> bool {
        scene_quality < self.min_scene_quality
    }

    fn apply(&mut self, o: &EventRuleOverride) {
        if let Some(v) = o.confidence_threshold {
            self.confidence_threshold = v;
        }
        if let Some(v) = o.debounce_ms {
            self.debounce_ms = v;
        }
        if let Some(v) = o.min_duration_ms {
            self.min_duration_ms = v;
        }
        if let Some(v) = o.cooldown_ms {
            self.cooldown_ms = v;
        }
        if let Some(v) = o.gap_tolerance_ms {
            self.gap_tolerance_ms = v;
        }
        if let Some(v) = o.min_scene_quality {
            self.min_scene_quality = v;
        }
        if let Some(v) = o.ema_alpha {
            self.ema_alpha = v;
        }
        if let Some(v) = o.smoothing {
            self.smoothing = v;
        }
    }

    fn validate(&self, event_type: EventType) -> Result<(), ConfigError> {
        let field = |name: &str| format!("aggregation.rules.{}.{}", event_type, name);
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::invalid(
                &field("confidence_threshold"),
                "must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_scene_quality) {
            return Err(ConfigError::invalid(
                &field("min_scene_quality"),
                "must be within [0, 1]",
            ));
        }
        if !(self.ema_alpha > 0.0 && self.ema_alpha <= 1.0) {
            return Err(ConfigError::invalid(&field("ema_alpha"), "must be within (0, 1]"));
        }
        if let SmoothingPolicy::WindowMax { window } = self.smoothing {
            if window == 0 {
                return Err(ConfigError::invalid(&field("smoothing.window"), "must be at least 1"));
            }
        }
        for (name, value) in [
            ("debounce_ms", self.debounce_ms),
            ("min_duration_ms", self.min_duration_ms),
            ("cooldown_ms", self.cooldown_ms),
            ("gap_tolerance_ms", self.gap_tolerance_ms),
        ] {
            if value < 0 {
                return Err(ConfigError::invalid(&field(name), "must not be negative"));
            }
        }
        Ok(())
    }
}

/// Partial rule as written in YAML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventRuleOverride {
    pub confidence_threshold: Option<f32>,
    pub debounce_ms: Option<i64>,
    pub min_duration_ms: Option<i64>,
    pub cooldown_ms: Option<i64>,
    pub gap_tolerance_ms: Option<i64>,
    pub min_scene_quality: Option<f32>,
    pub ema_alpha: Option<f32>,
    pub smoothing: Option<SmoothingPolicy>,
}

pub fn default_rule(event_type: EventType) -> EventRule {
    let (min_duration_ms, cooldown_ms) = match event_type {
        EventType::DriverFatigue => (15_000, 20_000),
        EventType::Microsleep => (1_500, 8_000),
        EventType::DistractedDriving => (2_000, 7_000),
        EventType::LaneDeviation => (700, 4_000),
        EventType::MobilePhoneUse => (1_000, 6_000),
        EventType::SeatbeltNotWorn => (3_000, 20_000),
        EventType::ObstructionAhead => (800, 4_000),
        EventType::Tailgating => (1_500, 5_000),
    };

    EventRule {
        confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        debounce_ms: DEFAULT_DEBOUNCE_MS,
        min_duration_ms,
        cooldown_ms,
        gap_tolerance_ms: DEFAULT_GAP_TOLERANCE_MS,
        min_scene_quality: DEFAULT_MIN_SCENE_QUALITY,
        ema_alpha: DEFAULT_EMA_ALPHA,
        smoothing: SmoothingPolicy::Ema,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRules {
    rules: BTreeMap<EventType, EventRule>,
}

impl Default for EventRules {
    fn default() -> Self {
        Self {
            rules: EventType::ALL.iter().map(|&t| (t, default_rule(t))).collect(),
        }
    }
}

impl EventRules {
    /// Built-in table, then `shared` over every type, then per-type overrides.
    pub fn resolve(
        shared: &EventRuleOverride,
        per_type: &BTreeMap<EventType, EventRuleOverride>,
    ) -> Result<Self, ConfigError> {
        let mut table = Self::default();
        for (event_type, rule) in table.rules.iter_mut() {
            rule.apply(shared);
            if let Some(o) = per_type.get(event_type) {
                rule.apply(o);
            }
            rule.validate(*event_type)?;
        }
        Ok(table)
    }

    pub fn get(&self, event_type: EventType) -> EventRule {
        self.rules
            .get(&event_type)
            .copied()
            .unwrap_or_else(|| default_rule(event_type))
    }

    pub fn set(&mut self, event_type: EventType, rule: EventRule) {
        self.rules.insert(event_type, rule);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_layer_on_defaults() {
        let shared = EventRuleOverride {
            gap_tolerance_ms: Some(250),
            ..Default::default()
        };
        let mut per_type = BTreeMap::new();
        per_type.insert(
            EventType::MobilePhoneUse,
            EventRuleOverride {
                confidence_threshold: Some(0.7),
                ..Default::default()
            },
        );

        let rules = EventRules::resolve(&shared, &per_type).unwrap();
        let phone = rules.get(EventType::MobilePhoneUse);
        assert_eq!(phone.confidence_threshold, 0.7);
        assert_eq!(phone.gap_tolerance_ms, 250);
        assert_eq!(phone.cooldown_ms, 6_000);

        let lane = rules.get(EventType::LaneDeviation);
        assert_eq!(lane.confidence_threshold, DEFAULT_CONFIDENCE_THRESHOLD);
        assert_eq!(lane.gap_tolerance_ms, 250);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut per_type = BTreeMap::new();
        per_type.insert(
            EventType::Tailgating,
            EventRuleOverride {
                ema_alpha: Some(0.0),
                ..Default::default()
            },
        );
        let err = EventRules::resolve(&EventRuleOverride::default(), &per_type).unwrap_err();
        assert!(err.to_string().contains("tailgating.ema_alpha"));
    }

    #[test]
    fn test_scene_gate_blocks_confident_frames() {
        let rule = default_rule(EventType::LaneDeviation);
        assert!(rule.qualifies(0.9, 0.8));
        assert!(!rule.qualifies(0.99, 0.1));
        assert!(rule.is_scene_gated(0.1));
    }
}
