use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use tileup_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use tileup_core::error::UpscaleError;
use tileup_core::executor::{UpscaleCallbacks, UpscaleReport};
use tileup_core::fallback::filter_from_str_lossy;
use tileup_core::logging::{self, LogFilters, DEFAULT_LOG_FILTER};
use tileup_core::orchestrator::Upscaler;
use tileup_core::transform::ResampleTransform;

#[derive(Parser)]
#[command(name = "tileup", about = "Tiled image upscaling with memory-aware batching")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale an image tile by tile
    Upscale(UpscaleArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Default)]
struct UpscaleArgs {
    #[arg(help = "Input image (png, jpeg, webp)")]
    input: PathBuf,
    #[arg(short = 'o', long, help = "Output image path")]
    output: PathBuf,
    #[arg(long)]
    tile_size: Option<u32>,
    #[arg(long)]
    overlap: Option<u32>,
    #[arg(long = "batch-size")]
    batch_size: Option<usize>,
    #[arg(long)]
    scale: Option<u32>,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    negative_prompt: Option<String>,
    #[arg(long)]
    steps: Option<u32>,
    #[arg(long)]
    guidance_scale: Option<f32>,
    #[arg(long)]
    noise_level: Option<u32>,
    #[arg(
        long,
        default_value = "lanczos",
        help = "Resampling filter: nearest, bilinear, bicubic, gaussian, lanczos"
    )]
    filter: String,
    #[arg(long, value_name = "PATH", help = "Write the run report as JSON")]
    report: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        eprintln!("Warning: failed to initialize data directory: {e:#}");
    }
    let config = load_config(&resolved_data_dir);

    init_logging(
        &resolved_data_dir,
        cli.verbose,
        cli.log_filter.as_deref(),
        config.logging.retention_files,
    );
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    match cli.command {
        Commands::Upscale(args) => run_upscale(args, config).await,
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load_config(data_dir: &Path) -> AppConfig {
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Warning: failed to load config file, using defaults: {err:#}");
            AppConfig::default()
        }
    }
}

/// CLI flags win over config.toml.
fn apply_overrides(mut config: AppConfig, args: &UpscaleArgs) -> AppConfig {
    let tiling = &mut config.tiling;
    if let Some(v) = args.tile_size {
        tiling.tile_size = v;
    }
    if let Some(v) = args.overlap {
        tiling.overlap = v;
    }
    if let Some(v) = args.batch_size {
        tiling.tile_batch_size = v;
    }
    if let Some(v) = args.scale {
        tiling.scale_factor = v;
    }

    let generation = &mut config.generation;
    if let Some(v) = &args.prompt {
        generation.prompt = v.clone();
    }
    if let Some(v) = &args.negative_prompt {
        generation.negative_prompt = v.clone();
    }
    if let Some(v) = args.steps {
        generation.steps = v;
    }
    if let Some(v) = args.guidance_scale {
        generation.guidance_scale = v;
    }
    if let Some(v) = args.noise_level {
        generation.noise_level = v;
    }
    config
}

/// Stderr always; the rolling file too when `<data_dir>/logs` is writable.
fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>, retention_files: usize) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let filters = LogFilters::select(cli_log_filter, verbose, rust_log.as_deref());

    let (file_layer, file_error) = match logging::open_log_file(data_dir, retention_files) {
        Ok(appender) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(env_filter(&filters.file)),
            ),
            None,
        ),
        Err(error) => (None, Some(error)),
    };

    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter(&filters.console)),
        )
        .with(file_layer);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("tileup: tracing already initialized ({error}); keeping the existing subscriber");
        return;
    }

    debug!(
        source = ?filters.source,
        console = %filters.console,
        file = %filters.file,
        "Log filters selected"
    );
    if let Some(error) = file_error {
        warn!(error = %format!("{error:#}"), "Log file unavailable; logging to stderr only");
    }
}

fn env_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|error| {
        eprintln!("tileup: ignoring log filter {directives:?} ({error}); using {DEFAULT_LOG_FILTER:?}");
        EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn render_progress(done: usize, total: usize, elapsed: f64) -> String {
    let fraction = if total > 0 {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    let bar: String = "█".repeat(filled) + &"░".repeat(empty);

    let rate = if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 };
    let eta = if rate > 0.0 {
        let remaining = total.saturating_sub(done) as f64;
        format!(" | ETA: {}", format_duration(remaining / rate))
    } else {
        String::new()
    };

    format!(
        "[{}] {:5.1}% | Tile {}/{} | {:.2} tiles/s | Elapsed: {}{}",
        bar,
        fraction * 100.0,
        done,
        total,
        rate,
        format_duration(elapsed),
        eta,
    )
}

async fn run_upscale(args: UpscaleArgs, config: AppConfig) -> Result<()> {
    if !args.input.exists() {
        bail!("Input image does not exist: {}", args.input.display());
    }
    let config = apply_overrides(config, &args);
    config.validate().context("Invalid upscale settings")?;

    info!("Loading image: {}", args.input.display());
    let source = image::open(&args.input)
        .with_context(|| format!("Failed to read image: {}", args.input.display()))?
        .to_rgb8();

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            warn!("Interrupt received, cancelling after the current tile");
            ctrl_c_token.cancel();
        }
    });

    let filter = filter_from_str_lossy(&args.filter);
    let run_token = cancel.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let start = Instant::now();
        let callbacks = UpscaleCallbacks {
            on_progress: Some(Box::new(move |done, total| {
                eprint!(
                    "\r{}    ",
                    render_progress(done, total, start.elapsed().as_secs_f64())
                );
            })),
            ..Default::default()
        };
        let mut upscaler = Upscaler::with_recovery(ResampleTransform::new(filter), config.recovery);
        upscaler.run(
            &source,
            &config.generation,
            &config.tiling,
            callbacks,
            &run_token,
        )
    })
    .await
    .context("Upscale task panicked")?;
    eprintln!();

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(UpscaleError::Cancelled {
            processed_tiles,
            total_tiles,
            ..
        }) => bail!("Upscale cancelled after {processed_tiles} of {total_tiles} tiles"),
        Err(error) => return Err(error).context("Upscale failed"),
    };

    log_report(&outcome.report);
    if let Some(report_path) = &args.report {
        write_report(report_path, &outcome.report)?;
    }
    outcome
        .image
        .save(&args.output)
        .with_context(|| format!("Failed to write image: {}", args.output.display()))?;
    info!("Wrote {}", args.output.display());
    Ok(())
}

fn log_report(report: &UpscaleReport) {
    info!(
        tiles = report.processed_tiles,
        batches = report.batches_attempted,
        fallback_batches = report.fallback_batches,
        reductions = report.reductions_used,
        final_tile_size = report.final_tile_size,
        final_batch_size = report.final_batch_size,
        elapsed = %format_duration(report.elapsed_ms as f64 / 1000.0),
        "Upscale completed"
    );
}

fn write_report(path: &Path, report: &UpscaleReport) -> Result<()> {
    let encoded = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
    std::fs::write(path, encoded)
        .with_context(|| format!("Failed to write run report: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.0), "00:00:00");
        assert_eq!(format_duration(59.4), "00:00:59");
        assert_eq!(format_duration(3725.0), "01:02:05");
    }

    #[test]
    fn progress_line_reports_tiles_and_eta() {
        let line = render_progress(5, 10, 10.0);
        assert!(line.contains(" 50.0%"));
        assert!(line.contains("Tile 5/10"));
        assert!(line.contains("0.50 tiles/s"));
        assert!(line.contains("ETA: 00:00:10"));
    }

    #[test]
    fn progress_line_without_rate_has_no_eta() {
        let line = render_progress(0, 4, 0.0);
        assert!(line.contains("Tile 0/4"));
        assert!(!line.contains("ETA"));
    }

    #[test]
    fn selected_filters_parse_as_env_filters() {
        for filters in [
            LogFilters::select(None, 0, None),
            LogFilters::select(None, 0, Some("warn,tileup_core=debug")),
            LogFilters::select(None, 2, None),
        ] {
            assert!(EnvFilter::try_new(&filters.console).is_ok(), "{}", filters.console);
            assert!(EnvFilter::try_new(&filters.file).is_ok(), "{}", filters.file);
        }
    }

    #[test]
    fn cli_flags_override_config() {
        let args = UpscaleArgs {
            tile_size: Some(256),
            batch_size: Some(8),
            prompt: Some("crisp".to_string()),
            noise_level: Some(5),
            ..Default::default()
        };
        let config = apply_overrides(AppConfig::default(), &args);
        assert_eq!(config.tiling.tile_size, 256);
        assert_eq!(config.tiling.tile_batch_size, 8);
        assert_eq!(config.tiling.overlap, 16);
        assert_eq!(config.generation.prompt, "crisp");
        assert_eq!(config.generation.noise_level, 5);
        assert_eq!(config.generation.steps, 30);
    }

    #[test]
    fn report_is_written_as_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("report.json");
        let image = image::RgbImage::new(16, 16);
        let outcome = Upscaler::new(ResampleTransform::default())
            .run(
                &image,
                &Default::default(),
                &tileup_core::types::TileOptions {
                    tile_size: 8,
                    overlap: 0,
                    tile_batch_size: 2,
                    scale_factor: 2,
                },
                UpscaleCallbacks::default(),
                &CancellationToken::new(),
            )
            .expect("upscale");

        write_report(&path, &outcome.report).expect("write report");
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read report"))
                .expect("parse report");
        assert_eq!(value["total_tiles"], 4);
        assert_eq!(value["final_state"], "Completed");
    }

    #[test]
    fn cli_parses_upscale_subcommand() {
        let cli = Cli::try_parse_from([
            "tileup", "-v", "upscale", "in.png", "-o", "out.png", "--tile-size", "64", "--scale",
            "2",
        ])
        .expect("parse cli");
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Commands::Upscale(args) => {
                assert_eq!(args.input, PathBuf::from("in.png"));
                assert_eq!(args.output, PathBuf::from("out.png"));
                assert_eq!(args.tile_size, Some(64));
                assert_eq!(args.scale, Some(2));
                assert_eq!(args.filter, "lanczos");
            }
            Commands::Config => panic!("expected upscale subcommand"),
        }
    }
}
