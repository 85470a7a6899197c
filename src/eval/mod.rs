// src/eval/mod.rs
//
// Offline evaluation and calibration: load labelled and predicted events,
// match them, score the match set, fit calibration, sweep cutoffs, and
// check acceptance gates.

mod calibration;
mod gates;
mod io;
mod matcher;
mod metrics;
mod plots;
mod records;
mod report;
mod threshold;

pub use calibration::{Calibration, CalibrationMethod};
pub use gates::GatesConfig;
pub use io::{apply_date_range, load_ground_truth, load_predictions, parse_date, DateRange};
pub use matcher::{match_events, MatchConfig};
pub use report::{
    gates_from_stored, run_evaluation, write_bundle, EvaluationInputs, EVALUATION_FILE,
};
pub use threshold::Objective;
