// src/main.rs

mod config;
mod detection;
mod error;
mod eval;
mod ingest;
mod pipeline;
mod scoring;
mod types;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use eval::{
    apply_date_range, gates_from_stored, load_ground_truth, load_predictions, match_events,
    parse_date, run_evaluation, write_bundle, Calibration, CalibrationMethod, DateRange,
    EvaluationInputs, EVALUATION_FILE,
};
use ingest::discover_manifests;
use pipeline::{run_pool, CancelToken, PipelineMetrics, TripProcessor};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "config.yaml";

#[derive(Parser)]
#[command(
    name = "dashcam-events",
    version,
    about = "Dashcam safety event aggregation and offline evaluation"
)]
struct Cli {
    /// YAML config; `./config.yaml` is used when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Turn per-frame detections of one or more trips into events and scores.
    Aggregate(AggregateArgs),
    /// Score predictions against ground truth and write the artifact bundle.
    Evaluate(EvaluateArgs),
    /// Fit per-type confidence calibration on a validation set.
    Calibrate(CalibrateArgs),
    /// Re-check acceptance gates against a stored evaluation.
    Gate(GateArgs),
}

#[derive(Args)]
struct AggregateArgs {
    /// Trip manifest, or a directory of manifests.
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(Args)]
struct SourceArgs {
    #[arg(long)]
    ground_truth: PathBuf,
    /// Predictions file, or a directory of per-trip `report.json` files.
    #[arg(long)]
    predictions: PathBuf,
    /// YYYY-MM-DD, inclusive.
    #[arg(long)]
    date_from: Option<String>,
    #[arg(long)]
    date_to: Option<String>,
}

#[derive(Args)]
struct EvaluateArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, default_value = "eval_reports")]
    outdir: PathBuf,
    #[arg(long)]
    iou_threshold: Option<f64>,
    #[arg(long)]
    tolerance_ms: Option<i64>,
    #[arg(long)]
    bins: Option<usize>,
    /// Calibration artifact produced by `calibrate`.
    #[arg(long)]
    calibration: Option<PathBuf>,
    /// Writes into `<outdir>/eval_<run-id>` instead of `<outdir>`.
    #[arg(long)]
    run_id: Option<String>,
}

#[derive(Args)]
struct CalibrateArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long)]
    output: PathBuf,
    #[arg(long, value_enum)]
    method: Option<MethodArg>,
    #[arg(long)]
    min_samples: Option<usize>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum MethodArg {
    Isotonic,
    #[value(alias = "platt")]
    Logistic,
}

impl From<MethodArg> for CalibrationMethod {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Isotonic => CalibrationMethod::Isotonic,
            MethodArg::Logistic => CalibrationMethod::Logistic,
        }
    }
}

#[derive(Args)]
struct GateArgs {
    /// `evaluation.json` from a previous run.
    #[arg(long)]
    evaluation: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG)).filter(|p| p.is_file()));
    let config = Config::load_or_default(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dashcam_events={}", config.logging.level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &config_path {
        Some(p) => info!("Configuration loaded from {}", p.display()),
        None => info!("No config file, using built-in defaults"),
    }

    match cli.command {
        Command::Aggregate(args) => aggregate(config, args).await,
        Command::Evaluate(args) => evaluate(config, args),
        Command::Calibrate(args) => calibrate(config, args),
        Command::Gate(args) => gate(&config, &args.evaluation),
    }
}

// ============================================================================
// AGGREGATE
// ============================================================================

async fn aggregate(mut config: Config, args: AggregateArgs) -> Result<()> {
    if let Some(workers) = args.workers {
        config.pipeline.workers = workers;
    }
    config.validate()?;

    let inputs = discover_manifests(&args.input)?;
    if inputs.is_empty() {
        warn!("No trip manifests found under {}", args.input.display());
        return Ok(());
    }
    info!(
        "Aggregating {} trip(s) with {} worker(s)",
        inputs.len(),
        config.pipeline.workers
    );

    let metrics = PipelineMetrics::new();
    let processor = Arc::new(TripProcessor::new(&config, &args.out, metrics.clone())?);

    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown signal received, finishing running trips");
            on_signal.cancel();
        }
    });

    let outcome = run_pool(inputs, processor, config.pipeline.workers, cancel).await;
    metrics.add(&metrics.trips_cancelled, outcome.cancelled() as u64);

    let summary = metrics.summary();
    info!("Pipeline summary: {}", serde_json::to_string(&summary)?);

    if outcome.failed() > 0 {
        for (path, job) in &outcome.jobs {
            if let pipeline::JobOutcome::Failed { reason } = job {
                error!("  {}: {}", path.display(), reason);
            }
        }
        anyhow::bail!("{} of {} trip(s) failed", outcome.failed(), outcome.jobs.len());
    }
    Ok(())
}

// ============================================================================
// EVALUATE / CALIBRATE
// ============================================================================

fn date_range(source: &SourceArgs) -> Result<DateRange> {
    Ok(DateRange {
        from: source
            .date_from
            .as_deref()
            .map(|v| parse_date("date_from", v))
            .transpose()?,
        to: source
            .date_to
            .as_deref()
            .map(|v| parse_date("date_to", v))
            .transpose()?,
    })
}

fn evaluate(mut config: Config, args: EvaluateArgs) -> Result<()> {
    let eval_config = &mut config.evaluation;
    if let Some(v) = args.iou_threshold {
        eval_config.iou_threshold = v;
    }
    if let Some(v) = args.tolerance_ms {
        eval_config.tolerance_ms = v;
    }
    if let Some(v) = args.bins {
        eval_config.bins = v;
    }
    config.validate()?;

    let range = date_range(&args.source)?;
    let mut ground_truth = load_ground_truth(&args.source.ground_truth)?;
    let mut predictions = load_predictions(&args.source.predictions)?;
    let calibration = args
        .calibration
        .as_deref()
        .map(Calibration::load)
        .transpose()?;
    let selected_trips = apply_date_range(&mut ground_truth, &mut predictions, &range);

    let report = run_evaluation(
        EvaluationInputs {
            ground_truth: &ground_truth,
            predictions: &predictions,
            calibration,
            date_range: range,
            selected_trips,
        },
        &config.evaluation,
    );
    let gates = report.gates(&config.gates);

    let outdir = match &args.run_id {
        Some(id) => args.outdir.join(format!("eval_{}", id)),
        None => args.outdir.clone(),
    };
    let summary = write_bundle(&report, &gates, &outdir)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn calibrate(config: Config, args: CalibrateArgs) -> Result<()> {
    let method = args
        .method
        .map(CalibrationMethod::from)
        .unwrap_or(config.evaluation.calibration.method);
    let min_samples = args
        .min_samples
        .unwrap_or(config.evaluation.calibration.min_samples);

    let range = date_range(&args.source)?;
    let mut ground_truth = load_ground_truth(&args.source.ground_truth)?;
    let mut predictions = load_predictions(&args.source.predictions)?;
    apply_date_range(&mut ground_truth, &mut predictions, &range);

    let matches = match_events(
        &ground_truth.records,
        &predictions.records,
        &config.evaluation.match_config(),
    );
    let calibration = Calibration::fit(&matches, method, min_samples.max(1));
    let uncalibrated = calibration.uncalibrated_types();
    info!(
        "Fitted {} model(s), {} left uncalibrated",
        calibration.models.len() - uncalibrated.len(),
        uncalibrated.len()
    );
    calibration.save(&args.output)
}

// ============================================================================
// GATE
// ============================================================================

fn gate(config: &Config, evaluation: &Path) -> Result<()> {
    let contents = fs::read_to_string(evaluation)
        .with_context(|| format!("reading {}", evaluation.display()))?;
    let stored: serde_json::Value = serde_json::from_str(&contents)
        .with_context(|| format!("parsing {}", evaluation.display()))?;

    if config.gates.is_empty() {
        warn!("No gates configured; nothing to check");
    }
    let report = gates_from_stored(&stored, &config.gates);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.passed {
        anyhow::bail!(
            "{} of {} gate(s) failed for {}",
            report.failed,
            report.total,
            evaluation
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| EVALUATION_FILE.to_string())
        );
    }
    Ok(())
}
