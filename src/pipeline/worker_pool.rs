// src/pipeline/worker_pool.rs
//
// Bounded pool of trip workers. Trips share nothing; each one runs on
// the blocking pool while a semaphore caps how many are in flight.
// Cancellation is cooperative: it is checked before a trip starts and
// never interrupts one that is already running.

use super::trip_processor::TripProcessor;
use crate::types::TripStatus;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Done { trip_id: String },
    Failed { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct PoolOutcome {
    /// Per input, in input order.
    pub jobs: Vec<(PathBuf, JobOutcome)>,
}

impl PoolOutcome {
    fn count(&self, pred: impl Fn(&JobOutcome) -> bool) -> usize {
        self.jobs.iter().filter(|(_, o)| pred(o)).count()
    }

    pub fn done(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Done { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Failed { .. }))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|o| matches!(o, JobOutcome::Cancelled))
    }
}

pub async fn run_pool(
    inputs: Vec<PathBuf>,
    processor: Arc<TripProcessor>,
    workers: usize,
    cancel: CancelToken,
) -> PoolOutcome {
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut outcomes: Vec<Option<JobOutcome>> = vec![None; inputs.len()];
    let mut tasks = JoinSet::new();

    for (idx, path) in inputs.iter().enumerate() {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        if cancel.is_cancelled() {
            break;
        }

        let processor = processor.clone();
        let path = path.clone();
        tasks.spawn_blocking(move || {
            let _permit = permit;
            let outcome = match processor.process_path(&path) {
                Ok(report) if report.trip.status == TripStatus::Done => JobOutcome::Done {
                    trip_id: report.trip_id,
                },
                Ok(report) => JobOutcome::Failed {
                    reason: report.trip.error.unwrap_or_else(|| "trip failed".to_string()),
                },
                Err(e) => {
                    error!("Failed to process {}: {:#}", path.display(), e);
                    JobOutcome::Failed {
                        reason: format!("{:#}", e),
                    }
                }
            };
            (idx, outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
            Err(e) => error!("Trip worker panicked: {}", e),
        }
    }

    let jobs: Vec<(PathBuf, JobOutcome)> = inputs
        .into_iter()
        .zip(outcomes)
        .map(|(path, outcome)| match outcome {
            Some(o) => (path, o),
            None if cancel.is_cancelled() => (path, JobOutcome::Cancelled),
            None => (
                path,
                JobOutcome::Failed {
                    reason: "worker did not report".to_string(),
                },
            ),
        })
        .collect();

    let outcome = PoolOutcome { jobs };
    if outcome.cancelled() > 0 {
        warn!("{} trip(s) not started due to cancellation", outcome.cancelled());
    }
    info!(
        "Worker pool finished: {} done, {} failed, {} cancelled",
        outcome.done(),
        outcome.failed(),
        outcome.cancelled()
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::metrics::PipelineMetrics;
    use std::fs;

    fn manifest(trip_id: &str) -> String {
        format!(
            r#"{{"trip_id": "{}", "clips": [{{"stream": "front", "name": "120000_000_001_A.mp4", "duration_ms": 1000, "detections": []}}]}}"#,
            trip_id
        )
    }

    fn setup(names: &[&str]) -> (tempfile::TempDir, Vec<PathBuf>, Arc<TripProcessor>) {
        let dir = tempfile::tempdir().unwrap();
        let inputs: Vec<PathBuf> = names
            .iter()
            .map(|name| {
                let path = dir.path().join(format!("{}.json", name));
                fs::write(&path, manifest(name)).unwrap();
                path
            })
            .collect();
        let processor = TripProcessor::new(
            &Config::default(),
            &dir.path().join("out"),
            PipelineMetrics::new(),
        )
        .unwrap();
        (dir, inputs, Arc::new(processor))
    }

    #[tokio::test]
    async fn test_pool_processes_every_trip_in_input_order() {
        let (_dir, mut inputs, processor) = setup(&["a", "b", "c"]);
        inputs.push(PathBuf::from("/definitely/missing.json"));

        let outcome = run_pool(inputs, processor, 2, CancelToken::new()).await;
        assert_eq!(outcome.done(), 3);
        assert_eq!(outcome.failed(), 1);
        assert_eq!(
            outcome.jobs[1].1,
            JobOutcome::Done {
                trip_id: "b".to_string()
            }
        );
        assert!(matches!(outcome.jobs[3].1, JobOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_pool_starts_nothing() {
        let (dir, inputs, processor) = setup(&["a", "b"]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = run_pool(inputs, processor, 4, cancel).await;
        assert_eq!(outcome.cancelled(), 2);
        assert!(!dir.path().join("out").exists());
    }
}
