//! Pipebench command line interface
//!
//! Runs the benchmark session, generates synthetic load, and checks what the
//! ingestion endpoint has stored.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pipebench_benchmarks::{
    build_adapter, utils::format, AdapterKind, BenchmarkReport, BenchmarkRunner, Config, PipelineAdapter,
    PipelineConfig, ReportEmitter, RunnerSettings,
};
use pipebench_ingest::{BatchWriter, HttpTransport, SourceDescriptor, SourceReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "pipebench")]
#[command(about = "Compare pipeline execution models on an identical ingestion workload")]
#[command(version = "0.1.0")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the benchmark session and write a report
    Run {
        /// Timed runs per adapter
        #[arg(short, long)]
        iterations: Option<u32>,

        /// Parquet or CSV source; synthetic data is used when omitted
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Ingestion endpoint base URL
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Comma separated adapters to run (staged, streaming)
        #[arg(short, long, value_delimiter = ',')]
        adapters: Option<Vec<AdapterKind>>,

        /// Report output path
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Per-run timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Untimed warm-up runs per adapter
        #[arg(long)]
        warmup: Option<u32>,

        /// Pause between runs in milliseconds
        #[arg(long)]
        cooldown_ms: Option<u64>,
    },
    /// Write one synthetic workload to the endpoint
    Generate {
        /// Hours of data ending now
        #[arg(long)]
        lookback_hours: Option<u64>,

        /// Seconds between samples
        #[arg(long)]
        interval_secs: Option<u64>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Ingestion endpoint base URL
        #[arg(short, long)]
        endpoint: Option<String>,
    },
    /// Query the endpoint for a metric
    Verify {
        /// Metric name or query expression
        #[arg(short, long, default_value = "temperature_celsius")]
        metric: String,

        /// Ingestion endpoint base URL
        #[arg(short, long)]
        endpoint: Option<String>,
    },
    /// Write the effective configuration as TOML
    Config {
        /// Output file
        #[arg(short, long, default_value = "pipebench.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    let config = load_configuration(&cli)?;

    match cli.command {
        Commands::Run {
            iterations,
            source,
            endpoint,
            adapters,
            report,
            timeout_secs,
            warmup,
            cooldown_ms,
        } => {
            let mut config = config;
            if let Some(iterations) = iterations {
                config.benchmark.iterations = iterations;
            }
            if let Some(source) = source {
                config.workload.source = Some(source);
            }
            if let Some(endpoint) = endpoint {
                config.pipeline.endpoint.url = endpoint;
            }
            if let Some(adapters) = adapters {
                config.benchmark.adapters = adapters;
            }
            if let Some(report) = report {
                config.output.report_path = report;
            }
            if let Some(timeout_secs) = timeout_secs {
                config.benchmark.per_run_timeout_secs = timeout_secs;
            }
            if let Some(warmup) = warmup {
                config.benchmark.warmup_iterations = warmup;
            }
            if let Some(cooldown_ms) = cooldown_ms {
                config.benchmark.cooldown_ms = cooldown_ms;
            }
            config.validate().context("Invalid configuration")?;

            run_command(config).await
        }
        Commands::Generate {
            lookback_hours,
            interval_secs,
            seed,
            endpoint,
        } => {
            let mut config = config;
            if let Some(hours) = lookback_hours {
                config.workload.synthetic.lookback_hours = hours;
            }
            if let Some(interval) = interval_secs {
                config.workload.synthetic.interval_secs = interval;
            }
            if let Some(seed) = seed {
                config.workload.synthetic.seed = seed;
            }
            if let Some(endpoint) = endpoint {
                config.pipeline.endpoint.url = endpoint;
            }
            config.validate().context("Invalid configuration")?;

            generate_command(config).await
        }
        Commands::Verify { metric, endpoint } => {
            let mut config = config;
            if let Some(endpoint) = endpoint {
                config.pipeline.endpoint.url = endpoint;
            }
            verify_command(config, &metric).await
        }
        Commands::Config { output } => {
            config.save_to_file(&output)?;
            info!("Configuration written to: {}", output.display());
            Ok(())
        }
    }
}

/// Initialize logging based on CLI options
fn initialize_logging(cli: &Cli) -> Result<()> {
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("pipebench={}", log_level).parse()?)
        .add_directive(format!("pipebench_benchmarks={}", log_level).parse()?)
        .add_directive(format!("pipebench_ingest={}", log_level).parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }

    Ok(())
}

/// Load configuration from file, the default location, or defaults
fn load_configuration(cli: &Cli) -> Result<Config> {
    let path = match &cli.config {
        Some(path) => Some(path.clone()),
        None => Config::default_config_path().ok().filter(|p| p.exists()),
    };

    if let Some(path) = &path {
        info!("Loading configuration from: {}", path.display());
    }

    Config::load_with_fallback(path).context("Failed to load configuration")
}

async fn run_command(config: Config) -> Result<()> {
    let source = config.workload.descriptor(Utc::now());
    describe_workload(&source);

    let pipeline = PipelineConfig::http(source, config.pipeline.clone())?;
    let runner = BenchmarkRunner::new(RunnerSettings::from_config(&config), pipeline);
    let adapters: Vec<Box<dyn PipelineAdapter>> = config.benchmark.adapters.iter().map(build_adapter).collect();

    info!(
        "Benchmarking {} adapter(s), {} iteration(s) each, timeout {:?}",
        adapters.len(),
        config.benchmark.iterations,
        config.benchmark.per_run_timeout()
    );

    let runs = runner.run_all(&adapters).await;
    let report = BenchmarkReport::build(config.benchmark.iterations, runs);

    let emitter = ReportEmitter::new(&config.output.report_path);
    emitter.write(&report)?;

    print_summary(&report);
    Ok(())
}

async fn generate_command(config: Config) -> Result<()> {
    let spec = config.workload.synthetic.to_spec(Utc::now());
    info!(
        "Generating {} samples from {} to {}",
        spec.expected_samples(),
        spec.start,
        spec.end
    );

    let reader = SourceReader::new(SourceDescriptor::Synthetic(spec), config.pipeline.source.clone());
    let samples = tokio::task::spawn_blocking(move || reader.open()?.collect::<pipebench_ingest::Result<Vec<_>>>())
        .await??;

    let transport = Arc::new(HttpTransport::new(&config.pipeline.endpoint)?);
    let writer = BatchWriter::new(Arc::new(config.pipeline), transport)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling write");
            interrupt.cancel();
        }
    });

    let summary = writer.write_samples(samples, cancel).await?;
    println!("samples_written={}", summary.samples_written);
    println!("batches_flushed={}", summary.batches_flushed);

    if summary.batches_failed > 0 {
        warn!("{} batch(es) could not be delivered", summary.batches_failed);
    }
    Ok(())
}

async fn verify_command(config: Config, metric: &str) -> Result<()> {
    let transport = HttpTransport::with_timeout(&config.pipeline.endpoint.url, Duration::from_secs(10))?;
    let response = transport
        .query(metric)
        .await
        .with_context(|| format!("Query for '{}' failed", metric))?;

    let series = response["data"]["result"].as_array().map(Vec::len).unwrap_or(0);
    info!("Query '{}' returned {} series", metric, series);
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn describe_workload(source: &SourceDescriptor) {
    match source {
        SourceDescriptor::Table { path } => info!("Workload: table {}", path.display()),
        SourceDescriptor::Synthetic(spec) => info!(
            "Workload: {} synthetic samples ({} sensors, {} metrics, seed {})",
            spec.expected_samples(),
            spec.sensors.len(),
            spec.metrics.len(),
            spec.seed
        ),
    }
}

fn print_summary(report: &BenchmarkReport) {
    println!("\nBenchmark session {}", report.session_id);
    for (id, adapter) in &report.per_adapter {
        match &adapter.stats {
            Some(stats) => println!(
                "  {:<12} mean {} (±{:.3}s), p95 {:.3}s, CPU {:.1}%, network {}, {}/{} succeeded",
                id,
                format::duration_human(Duration::from_secs_f64(stats.duration.mean)),
                stats.duration.stddev,
                stats.duration.p95,
                stats.cpu_percent.mean,
                format::bytes_human(stats.network_bytes.mean),
                stats.success_count,
                stats.success_count + stats.failure_count
            ),
            None => println!(
                "  {:<12} {}",
                id,
                adapter.error.as_deref().unwrap_or("no results")
            ),
        }
    }

    if let Some(comparison) = &report.comparison {
        println!("  Fastest: {} ({:.2}x)", comparison.fastest, comparison.speedup);
        for (id, entry) in comparison.adapters.iter().filter(|(id, _)| **id != comparison.fastest) {
            println!(
                "  {} is {:.1}% slower (+{:.3}s)",
                id, entry.percent_slower, entry.time_difference_secs
            );
        }
    }
}
