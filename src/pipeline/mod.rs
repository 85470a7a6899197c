// src/pipeline/mod.rs

pub mod event_bus;
pub mod metrics;
pub mod trip_processor;
pub mod worker_pool;

pub use metrics::PipelineMetrics;
pub use trip_processor::TripProcessor;
pub use worker_pool::{run_pool, CancelToken, JobOutcome};
