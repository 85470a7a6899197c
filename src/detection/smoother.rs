// src/detection/smoother.rs
//
// Event-level severity from per-frame confidence.

use super::rules::EventRule;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How per-frame confidences are folded into one severity value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SmoothingPolicy {
    /// Exponential moving average with the rule's `ema_alpha`.
    #[default]
    Ema,
    /// Maximum over the last `window` qualifying frames.
    WindowMax { window: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeveritySmoother {
    policy: SmoothingPolicy,
    alpha: f32,
    ema: Option<f32>,
    history: VecDeque<f32>,
    confidence_sum: f64,
    frames: u32,
}

impl SeveritySmoother {
    pub fn new(rule: &EventRule) -> Self {
        let capacity = match rule.smoothing {
            SmoothingPolicy::WindowMax { window } => window,
            SmoothingPolicy::Ema => 0,
        };
        Self {
            policy: rule.smoothing,
            alpha: rule.ema_alpha,
            ema: None,
            history: VecDeque::with_capacity(capacity),
            confidence_sum: 0.0,
            frames: 0,
        }
    }

    /// Seeded with the first qualifying frame.
    pub fn seeded(rule: &EventRule, confidence: f32) -> Self {
        let mut smoother = Self::new(rule);
        smoother.push(confidence);
        smoother
    }

    pub fn push(&mut self, confidence: f32) {
        let confidence = confidence.clamp(0.0, 1.0);
        self.confidence_sum += confidence as f64;
        self.frames += 1;

        match self.policy {
            SmoothingPolicy::Ema => {
                self.ema = Some(match self.ema {
                    Some(prev) => self.alpha * confidence + (1.0 - self.alpha) * prev,
                    None => confidence,
                });
            }
            SmoothingPolicy::WindowMax { window } => {
                self.history.push_back(confidence);
                while self.history.len() > window.max(1) {
                    self.history.pop_front();
                }
            }
        }
    }

    pub fn severity(&self) -> f32 {
        let value = match self.policy {
            SmoothingPolicy::Ema => self.ema.unwrap_or(0.0),
            SmoothingPolicy::WindowMax { .. } => {
                self.history.iter().copied().fold(0.0_f32, f32::max)
            }
        };
        value.clamp(0.0, 1.0)
    }

    /// Plain mean over every qualifying frame seen.
    pub fn mean_confidence(&self) -> f32 {
        if self.frames == 0 {
            return 0.0;
        }
        ((self.confidence_sum / self.frames as f64) as f32).clamp(0.0, 1.0)
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::rules::default_rule;
    use crate::types::EventType;
    use approx::assert_relative_eq;

    #[test]
    fn test_ema_tracks_newest_frames() {
        let rule = default_rule(EventType::Tailgating);
        let mut smoother = SeveritySmoother::seeded(&rule, 0.8);
        assert_relative_eq!(smoother.severity(), 0.8);

        smoother.push(0.4);
        // 0.25 * 0.4 + 0.75 * 0.8
        assert_relative_eq!(smoother.severity(), 0.7, epsilon = 1e-6);
        assert_relative_eq!(smoother.mean_confidence(), 0.6, epsilon = 1e-6);
        assert_eq!(smoother.frames(), 2);
    }

    #[test]
    fn test_window_max_forgets_old_peaks() {
        let mut rule = default_rule(EventType::Tailgating);
        rule.smoothing = SmoothingPolicy::WindowMax { window: 2 };

        let mut smoother = SeveritySmoother::seeded(&rule, 0.95);
        smoother.push(0.6);
        assert_relative_eq!(smoother.severity(), 0.95);
        smoother.push(0.7);
        assert_relative_eq!(smoother.severity(), 0.7);
    }

    #[test]
    fn test_out_of_range_confidence_is_clamped() {
        let rule = default_rule(EventType::Microsleep);
        let smoother = SeveritySmoother::seeded(&rule, 1.7);
        assert_relative_eq!(smoother.severity(), 1.0);
        assert_relative_eq!(smoother.mean_confidence(), 1.0);
    }
}
