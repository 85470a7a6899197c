// src/detection/mod.rs

mod aggregator;
mod rules;
mod smoother;
mod state_machine;

// Re-export public APIs
pub use aggregator::{aggregate_trip, TripContext};
pub use rules::{EventRuleOverride, EventRules};
pub use smoother::SmoothingPolicy;
pub use state_machine::TrackerStats;
