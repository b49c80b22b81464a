use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use modelguard_core::{
    classify::rules::{Check, LAMBDA_LAYER_CLASS, OP_RULES},
    render_report,
    scanner::fallback,
    ModelScanner, OutputFormat, ScanProgress, ScanReport, ScanSettings, Scanner, Severity,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const EXIT_CLEAN: u8 = 0;
const EXIT_ISSUES: u8 = 1;
const EXIT_FAILURE: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "modelguard",
    author,
    version,
    about = "Static scanner for malicious constructs in serialized ML models"
)]
struct Cli {
    /// Settings file (toml, yaml or json) layered under environment overrides
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan a model file or SavedModel directory
    Scan {
        /// Path to the model artifact
        path: PathBuf,
        /// Report format
        #[arg(long, value_enum, default_value_t = Format::Human)]
        format: Format,
        /// Abort the scan after this long (e.g. `30s`, `2m`)
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<Duration>,
        /// External scanner for formats without a built-in reader (e.g. `modelscan`)
        #[arg(long = "fallback-cmd", value_name = "CMD")]
        fallback_cmd: Option<String>,
    },
    /// List the built-in detection rules
    Rules {
        /// Emit rules as JSON instead of human-readable text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Human,
    Json,
    Yaml,
}

impl From<Format> for OutputFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Human => OutputFormat::Human,
            Format::Json => OutputFormat::Json,
            Format::Yaml => OutputFormat::Yaml,
        }
    }
}

/// How long a cancelled scan may keep running after the CLI has given up.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let outcome = match cli.command {
        Commands::Scan {
            path,
            format,
            timeout,
            fallback_cmd,
        } => block_on_scan(cli.config.as_deref(), path, format, timeout, fallback_cmd),
        Commands::Rules { json } => list_rules(json).map(|()| EXIT_CLEAN),
    };
    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{} {err:#}", "error:".red().bold());
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

/// Drive the scan on a current-thread runtime. The runtime is shut down
/// without waiting on a blocking scan that ignored its cancel flag.
fn block_on_scan(
    config: Option<&Path>,
    path: PathBuf,
    format: Format,
    timeout: Option<Duration>,
    fallback_cmd: Option<String>,
) -> Result<u8> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .context("failed to start async runtime")?;
    let outcome = runtime.block_on(run_scan(config, path, format, timeout, fallback_cmd));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    outcome
}

fn load_settings(config: Option<&Path>) -> Result<ScanSettings> {
    let mut settings = match config {
        Some(path) => config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .and_then(|cfg| cfg.try_deserialize::<ScanSettings>())
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => ScanSettings::default(),
    };
    settings.apply_env()?;
    Ok(settings)
}

async fn run_scan(
    config: Option<&Path>,
    path: PathBuf,
    format: Format,
    timeout: Option<Duration>,
    fallback_cmd: Option<String>,
) -> Result<u8> {
    let mut settings = load_settings(config)?;
    if let Some(command) = fallback_cmd {
        settings.fallback.command = Some(command);
    }
    let timeout = timeout.or_else(|| settings.timeout_secs.map(Duration::from_secs));
    debug!(?settings, ?timeout, "resolved scan settings");

    let fallback = fallback::from_settings(&settings.fallback);
    let scanner = ModelScanner::with_settings(fallback, &settings);
    let progress = Arc::new(ScanProgress::new());
    let task = {
        let progress = Arc::clone(&progress);
        let path = path.clone();
        tokio::task::spawn_blocking(move || scanner.scan_with_progress(&path, &progress))
    };

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => {
                progress.cancel();
                warn!(?limit, "scan timed out");
                anyhow::bail!(
                    "scan of {} exceeded {}",
                    path.display(),
                    humantime::format_duration(limit)
                );
            }
        },
        None => task.await,
    };
    let report = joined
        .context("scan task panicked")?
        .with_context(|| format!("failed to scan {}", path.display()))?;

    println!("{}", render_report(&report, format.into())?.trim_end());
    if matches!(format, Format::Human) {
        println!("{}", verdict(&report));
    }
    Ok(if report.is_clean() {
        EXIT_CLEAN
    } else {
        EXIT_ISSUES
    })
}

fn verdict(report: &ScanReport) -> String {
    match report.highest_severity() {
        None => "verdict: clean".green().bold().to_string(),
        Some(Severity::High) => "verdict: dangerous".red().bold().to_string(),
        Some(Severity::Mid) => "verdict: suspicious".yellow().bold().to_string(),
        Some(Severity::Low) => "verdict: review".cyan().to_string(),
    }
}

fn list_rules(json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(OP_RULES)?);
        return Ok(());
    }

    println!("{} graph op rule(s), plus layer rules", OP_RULES.len());
    for rule in OP_RULES {
        let judgment = match rule.check {
            Check::Always { ability, severity } => format!("{severity} / {ability}"),
            Check::DebugUrls => "per debug URL scheme".to_string(),
            Check::OutputStream => "file output streams".to_string(),
        };
        println!(
            "- {op:<32} [{judgment}] :: {desc}",
            op = rule.op,
            desc = rule.description
        );
    }
    println!(
        "- layer class {LAMBDA_LAYER_CLASS:<20} [high / Code execution] :: any layer embedding serialized code"
    );
    Ok(())
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tokio=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}
