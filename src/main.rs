use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use stem_ensemble::{OobMetric, SetStatus, TrainerConfig, TrainingOrchestrator};
use stem_io::{
    InventoryRow, KEPT_GEOJSON, LOW_OOB_GEOJSON, Mosaic, RunConfig, RunStore, RunWriter, SampleReader, SetRecord,
    collect_records, read_mosaic, read_var_names, unscored_records, update_inventory, write_score_map,
};

#[derive(Parser)]
#[command(name = "stem")]
#[command(about = "Spatiotemporal exploratory models: one decision tree per overlapping support set")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// RNG seed; overrides the parameter file (drawn at random if neither sets one)
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Enable verbose (debug-level) logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(long, global = true)]
    quiet: bool,

    /// Threads for OOB scoring and score mapping (defaults to all cores)
    #[arg(long, global = true)]
    threads: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Generate support sets, train one tree per set, score and prune them
    Train {
        /// Path to the TOML parameter file
        #[arg(long)]
        params: PathBuf,
    },

    /// Rebuild the OOB score map of a finished run without retraining
    Map {
        /// Run directory written by `stem train`
        #[arg(long)]
        run_dir: PathBuf,

        /// Parameter file to use instead of the copy inside the run directory
        #[arg(long)]
        params: Option<PathBuf>,

        /// Metric to map: "oob_rate" or "oob_count" (defaults to the parameter file's)
        #[arg(long)]
        metric: Option<String>,
    },
}

// --- JSON stdout output structs ---

#[derive(Serialize)]
struct TrainOutput {
    stamp: String,
    run_dir: PathBuf,
    seed: u64,
    n_samples: usize,
    n_sets: usize,
    n_trained: usize,
    n_insufficient: usize,
    n_failed: usize,
    n_kept: usize,
    n_low_oob: usize,
    n_unscored: usize,
    mean_oob_rate: Option<f64>,
    map: Option<MapOutput>,
}

#[derive(Serialize)]
struct MapOutput {
    stamp: String,
    metric: &'static str,
    n_sets: usize,
    n_covered: usize,
    avg_score: Option<f64>,
    avg_count: Option<f64>,
    score_path: PathBuf,
    count_path: PathBuf,
}

fn count_status(records: &[SetRecord], status: SetStatus) -> usize {
    records.iter().filter(|r| r.status == status).count()
}

/// Rasterize kept sets onto the mosaic grid, write the rasters, and
/// rewrite `support_sets.txt`.
fn build_score_map(
    config: &RunConfig,
    run: &RunWriter,
    mosaic: &Mosaic,
    kept: &[SetRecord],
    predictor_names: &[String],
    metric: OobMetric,
) -> Result<MapOutput> {
    let footprints: Vec<_> = kept.iter().filter_map(|r| r.footprint(metric)).collect();
    let map = config
        .score_map
        .map(&mosaic.extent, &mosaic.mask, &footprints)
        .context("score mapping failed")?;
    let paths = write_score_map(&map, run.run_dir(), run.stamp(), metric)?;
    run.write_support_sets(kept, predictor_names)?;

    info!(
        metric = metric.as_str(),
        avg_score = map.mean_score,
        avg_count = map.mean_count,
        n_covered = map.n_covered,
        "score map complete"
    );
    Ok(MapOutput {
        stamp: run.stamp().to_string(),
        metric: metric.as_str(),
        n_sets: footprints.len(),
        n_covered: map.n_covered,
        avg_score: map.mean_score,
        avg_count: map.mean_count,
        score_path: paths.score,
        count_path: paths.count,
    })
}

fn train(params: &Path, seed_override: Option<u64>) -> Result<TrainOutput> {
    let config = RunConfig::load(params).context("failed to load parameter file")?;
    let seed = seed_override.or(config.seed).unwrap_or_else(rand::random);
    info!(seed, params = %params.display(), "starting training run");

    // Inputs
    let var_names = read_var_names(&config.var_info).context("failed to read variable table")?;
    let data = SampleReader::new(&config.sample_txt, &config.x_col, &config.y_col, &config.target_col)
        .read(&var_names, &config.constant_vars)
        .context("failed to read sample table")?;
    let table = &data.table;
    config.check_predictors(table.predictor_names())?;
    let mosaic = read_mosaic(&config.mosaic_path).context("failed to read mosaic")?;
    let study_area = mosaic
        .extent
        .valid_bounds(&mosaic.mask)
        .context("mosaic has no valid pixels")?;

    // Run directory
    let run = RunWriter::create(&config.out_dir, &config.out_dirname, chrono::Local::now().naive_local())?;
    run.copy_params(params)?;
    info!(stamp = run.stamp(), dir = %run.run_dir().display(), "run directory created");

    // Grid -> sample -> train
    let sets = config
        .grid
        .clone()
        .with_seed(seed)
        .generate(&study_area)
        .context("support set generation failed")?;
    let n_sets = sets.len();
    let sampler = config.sampler.clone().with_seed(seed);
    let trainer = TrainerConfig::new(config.model_type, run.model_dir())
        .with_file_prefix(run.stamp())
        .with_forced_features(data.constant_indices.clone())
        .with_output_cap(config.max_target_val.or_else(|| table.max_target()))
        .with_seed(seed);
    let report = TrainingOrchestrator::new(config.n_jobs)?
        .run(sets, table, &sampler, &trainer)
        .context("training failed")?;

    // Persist samples and memberships before scoring.
    let mut store = RunStore::create(&run.db_path())?;
    store.write_run_info(&[
        ("stamp", run.stamp().to_string()),
        ("seed", seed.to_string()),
        ("target_col", config.target_col.clone()),
        ("model_type", config.model_type.as_str().to_string()),
    ])?;
    store.write_samples(table)?;
    store.write_memberships(&report.memberships)?;

    // Score and prune
    let fallback = unscored_records(&report.dropped, &report.trained);
    let n_trained = report.trained.len();
    let oob = match config.oob.score(report.trained, &report.memberships, table) {
        Ok(oob) => oob,
        Err(e) => {
            // Keep the trained sets on record before surfacing the error.
            store.write_sets(&fallback, table.predictor_names())?;
            return Err(e).context("OOB scoring failed");
        }
    };
    let records = collect_records(&report.dropped, &oob);
    store.write_sets(&records, table.predictor_names())?;

    let kept: Vec<SetRecord> = records.iter().filter(|r| r.status == SetStatus::Kept).cloned().collect();
    let low: Vec<SetRecord> = records.iter().filter(|r| r.status == SetStatus::LowOob).cloned().collect();
    run.write_support_sets(&kept, table.predictor_names())?;
    run.write_footprints(KEPT_GEOJSON, &kept)?;
    run.write_footprints(LOW_OOB_GEOJSON, &low)?;
    if kept.is_empty() {
        warn!("every trained set was removed by the OOB policy");
    }
    info!(
        n_sets,
        n_kept = kept.len(),
        n_low_oob = low.len(),
        mean_oob_rate = oob.mean_kept_oob_rate(),
        "OOB pruning complete"
    );

    let map = if config.make_oob_map {
        Some(build_score_map(
            &config,
            &run,
            &mosaic,
            &kept,
            table.predictor_names(),
            config.oob_map_metric,
        )?)
    } else {
        None
    };

    if let Some(inventory) = &config.inventory_txt {
        let row = InventoryRow {
            stamp: run.stamp().to_string(),
            n_sets: kept.len(),
            n_samples: table.len(),
            support_size: config.grid.support_size(),
            sets_per_cell: config.grid.sets_per_cell(),
            max_features: config.max_features,
            avg_oob: map.as_ref().and_then(|m| m.avg_score),
            avg_count: map.as_ref().and_then(|m| m.avg_count),
        };
        update_inventory(inventory, &row).context("failed to update inventory")?;
    }

    Ok(TrainOutput {
        stamp: run.stamp().to_string(),
        run_dir: run.run_dir().to_path_buf(),
        seed,
        n_samples: table.len(),
        n_sets,
        n_trained,
        n_insufficient: count_status(&records, SetStatus::Insufficient),
        n_failed: count_status(&records, SetStatus::Failed),
        n_kept: kept.len(),
        n_low_oob: low.len(),
        n_unscored: count_status(&records, SetStatus::Unscored),
        mean_oob_rate: oob.mean_kept_oob_rate(),
        map,
    })
}

fn remap(run_dir: &Path, params: Option<PathBuf>, metric: Option<String>) -> Result<MapOutput> {
    let run = RunWriter::open(run_dir).context("failed to open run directory")?;
    let params = match params {
        Some(p) => p,
        None => run
            .find_params()
            .context("run directory holds no single parameter file; pass --params")?,
    };
    let config = RunConfig::load(&params).context("failed to load parameter file")?;
    let metric = match metric {
        Some(m) => m.parse::<OobMetric>().map_err(anyhow::Error::msg)?,
        None => config.oob_map_metric,
    };

    let store = RunStore::open(&run.db_path()).context("failed to open run store")?;
    let stored = store.load_sets(Some(SetStatus::Kept))?;
    info!(n_kept = stored.records.len(), stamp = run.stamp(), "reloaded kept sets");
    let mosaic = read_mosaic(&config.mosaic_path).context("failed to read mosaic")?;

    build_score_map(&config, &run, &mosaic, &stored.records, &stored.predictor_names, metric)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match (cli.verbose, cli.quiet) {
        (true, _) => "debug",
        (_, true) => "error",
        _ => "info",
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(threads) = cli.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("failed to configure thread pool")?;
        info!(threads, "thread pool configured");
    }

    match cli.command {
        Command::Train { params } => {
            let output = train(&params, cli.seed)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Map {
            run_dir,
            params,
            metric,
        } => {
            let output = remap(&run_dir, params, metric)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
