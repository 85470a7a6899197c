// src/scoring.rs
//
// Trip KPI scores. A pure function of the finalized events and the trip
// length: re-scoring the same trip always gives the same numbers.

use crate::error::ConfigError;
use crate::types::{Event, EventType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Fatigue,
    Distraction,
    Lane,
    Following,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Fatigue,
        Category::Distraction,
        Category::Lane,
        Category::Following,
    ];

    pub fn of(event_type: EventType) -> Category {
        match event_type {
            EventType::DriverFatigue | EventType::Microsleep => Category::Fatigue,
            EventType::DistractedDriving
            | EventType::MobilePhoneUse
            | EventType::SeatbeltNotWorn => Category::Distraction,
            EventType::LaneDeviation => Category::Lane,
            EventType::Tailgating | EventType::ObstructionAhead => Category::Following,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Fatigue => "fatigue",
            Category::Distraction => "distraction",
            Category::Lane => "lane",
            Category::Following => "following",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Penalty at which a category score has dropped to 100/e.
    pub saturation: f64,
    /// Flat penalty per event on top of the duration term.
    pub count_penalty: f64,
    pub type_weights: BTreeMap<EventType, f64>,
    pub category_weights: BTreeMap<Category, f64>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let type_weights = [
            (EventType::DriverFatigue, 2.2),
            (EventType::Microsleep, 3.0),
            (EventType::DistractedDriving, 1.9),
            (EventType::MobilePhoneUse, 2.0),
            (EventType::SeatbeltNotWorn, 1.6),
            (EventType::LaneDeviation, 1.5),
            (EventType::Tailgating, 1.8),
            (EventType::ObstructionAhead, 1.4),
        ]
        .into_iter()
        .collect();

        Self {
            saturation: 100.0,
            count_penalty: 0.0,
            type_weights,
            category_weights: Category::ALL.iter().map(|&c| (c, 1.0)).collect(),
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.saturation > 0.0) {
            return Err(ConfigError::invalid("scoring.saturation", "must be positive"));
        }
        if self.count_penalty < 0.0 {
            return Err(ConfigError::invalid("scoring.count_penalty", "must not be negative"));
        }
        if let Some((t, _)) = self.type_weights.iter().find(|(_, w)| **w < 0.0) {
            return Err(ConfigError::invalid(
                &format!("scoring.type_weights.{}", t),
                "must not be negative",
            ));
        }
        if self.category_weights.values().any(|w| *w < 0.0) {
            return Err(ConfigError::invalid(
                "scoring.category_weights",
                "must not be negative",
            ));
        }
        if self.category_weights.values().sum::<f64>() <= 0.0 {
            return Err(ConfigError::invalid(
                "scoring.category_weights",
                "at least one category needs a positive weight",
            ));
        }
        Ok(())
    }

    fn type_weight(&self, event_type: EventType) -> f64 {
        self.type_weights.get(&event_type).copied().unwrap_or(1.0)
    }

    fn category_weight(&self, category: Category) -> f64 {
        self.category_weights.get(&category).copied().unwrap_or(0.0)
    }
}

// ============================================================================
// SCORE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub trip_id: String,
    pub categories: BTreeMap<Category, f64>,
    pub overall: f64,
    pub details: ScoreDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDetails {
    pub penalties: BTreeMap<Category, f64>,
    pub event_counts: BTreeMap<EventType, u32>,
    pub total_events: usize,
    pub duration_seconds: f64,
}

pub fn score_trip(
    trip_id: &str,
    events: &[Event],
    duration_ms: i64,
    config: &ScoringConfig,
) -> Score {
    let duration_seconds = duration_ms.max(0) as f64 / 1000.0;
    let norm = (duration_seconds / 3600.0).max(1.0);

    let mut penalties: BTreeMap<Category, f64> = Category::ALL.iter().map(|&c| (c, 0.0)).collect();
    let mut event_counts: BTreeMap<EventType, u32> = BTreeMap::new();

    for event in events {
        let duration_s = (event.duration_ms().max(0) as f64 / 1000.0).max(0.5);
        let severity = event.severity.clamp(0.0, 1.0) as f64;
        let penalty =
            config.type_weight(event.event_type) * severity * duration_s + config.count_penalty;
        *penalties.entry(Category::of(event.event_type)).or_insert(0.0) += penalty;
        *event_counts.entry(event.event_type).or_insert(0) += 1;
    }

    let categories: BTreeMap<Category, f64> = penalties
        .iter()
        .map(|(&c, &p)| {
            let score = 100.0 * (-(p / norm) / config.saturation).exp();
            (c, round2(score.clamp(0.0, 100.0)))
        })
        .collect();

    let weight_sum: f64 = Category::ALL.iter().map(|&c| config.category_weight(c)).sum();
    let overall = if weight_sum > 0.0 {
        categories
            .iter()
            .map(|(&c, &s)| config.category_weight(c) * s)
            .sum::<f64>()
            / weight_sum
    } else {
        categories.values().sum::<f64>() / categories.len() as f64
    };

    Score {
        trip_id: trip_id.to_string(),
        categories,
        overall: round2(overall.clamp(0.0, 100.0)),
        details: ScoreDetails {
            penalties: penalties.into_iter().map(|(c, p)| (c, round4(p))).collect(),
            event_counts,
            total_events: events.len(),
            duration_seconds: round2(duration_seconds),
        },
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}
