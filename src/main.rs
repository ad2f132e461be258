// Deathstar Guard - Main Entry Point
//
// Command-line front end for the guards:
// - One-shot admission checks against the shared store
// - Ledger inspection and retention
// - Prometheus metrics endpoint

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deathstar_guard::config::Config;
use deathstar_guard::guard::quota::AI_CALLS;
use deathstar_guard::guard::{DashboardBuilder, Gatekeeper, GuardError, GuardRequest, Outcome, Verdict};
use deathstar_guard::{metrics, metrics_server};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error, info, Level};
use tracing_subscriber::EnvFilter;

/// Exit code for an operation the guards refused
const EXIT_REJECTED: u8 = 3;

/// Deathstar Guard: shared-store admission guards
#[derive(Parser, Debug)]
#[command(name = "deathstar-guard")]
#[command(author = "Deathstar Guard Contributors")]
#[command(version)]
#[command(about = "Rate, quota, nonce-window and ledger guards over a shared store", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the XDG config path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path, overriding the configuration
    #[arg(long, global = true)]
    store: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Count one operation against the current rate bucket
    RateCheck,
    /// Charge one use of an operation class against its quota
    QuotaCheck {
        /// Operation class
        #[arg(long, default_value = AI_CALLS)]
        class: String,
    },
    /// Check a nonce (epoch milliseconds) against server time
    ValidateNonce {
        #[arg(allow_negative_numbers = true)]
        nonce: i64,
    },
    /// Append an entry to a ledger
    Append {
        /// Ledger identifier
        #[arg(long)]
        ledger: String,

        /// Block identifier carried by the entry
        #[arg(long)]
        block: String,

        /// Entry nonce (epoch milliseconds)
        #[arg(long, allow_negative_numbers = true)]
        nonce: i64,

        /// Also check the nonce against the skew window
        #[arg(long)]
        check_window: bool,
    },
    /// Print every entry of a ledger
    Ledger {
        /// Ledger identifier
        id: String,
    },
    /// Print a snapshot of guard state
    Dashboard,
    /// Delete rate buckets and usage records older than the cut-off
    Prune {
        #[arg(long)]
        older_than_secs: u64,
    },
    /// Serve Prometheus metrics until interrupted
    ServeMetrics {
        /// Port, overriding the configuration
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Config loading logs before the configured subscriber exists
    let config = tracing::subscriber::with_default(bootstrap_subscriber(args.verbose), || {
        load_config(&args)
    });
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return report(Err(GuardError::Misconfigured(format!("{:#}", e))));
        }
    };

    init_tracing(&config, args.verbose);

    if config.metrics.enabled {
        if let Err(e) = metrics::init() {
            error!(error = %e, "Failed to register metrics");
            eprintln!("Error: Failed to register metrics: {}", e);
            return ExitCode::from(1);
        }
    }

    match run(args.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(path) = &args.store {
        config.store.path = path.clone();
        config.validate()?;
    }
    Ok(config)
}

fn default_level(verbose: bool, configured: Option<Level>) -> EnvFilter {
    let level = if verbose {
        Level::DEBUG
    } else {
        configured.unwrap_or(Level::INFO)
    };
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

fn bootstrap_subscriber(verbose: bool) -> impl tracing::Subscriber + Send + Sync {
    tracing_subscriber::fmt()
        .with_env_filter(default_level(verbose, None))
        .with_writer(std::io::stderr)
        .compact()
        .finish()
}

fn init_tracing(config: &Config, verbose: bool) {
    let filter = default_level(verbose, config.log_level().ok());

    // stdout carries the command's JSON result
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
}

fn open_gatekeeper(config: &Config) -> Result<Gatekeeper> {
    let store = config.store.open()?;
    debug!(backend = %config.store.backend, path = %config.store.path, "Store opened");
    Ok(Gatekeeper::new(store, config.guard()))
}

async fn run(command: Commands, config: Config) -> Result<ExitCode> {
    let gate = open_gatekeeper(&config)?;
    match command {
        Commands::RateCheck => Ok(report(gate.admit(&GuardRequest::new()).await)),
        Commands::QuotaCheck { class } => {
            let request = GuardRequest::new().without_rate_limit().with_quota(class);
            Ok(report(gate.admit(&request).await))
        }
        Commands::ValidateNonce { nonce } => Ok(report(Ok(gate.nonce_validator().validate(nonce)))),
        Commands::Append {
            ledger,
            block,
            nonce,
            check_window,
        } => {
            let result = if check_window {
                let request = GuardRequest::new()
                    .without_rate_limit()
                    .with_ledger_append(ledger, block, nonce);
                gate.admit(&request).await
            } else {
                gate.ledger().append(&ledger, &block, nonce).await
            };
            Ok(report(result))
        }
        Commands::Ledger { id } => {
            let entries = gate.ledger().entries(&id).await?;
            print_json(&json!({ "ledger_id": id, "entries": entries }))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Dashboard => {
            let data = DashboardBuilder::new(&gate).build().await?;
            print_json(&data)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Prune { older_than_secs } => {
            let age = chrono::Duration::from_std(Duration::from_secs(older_than_secs))
                .context("Cut-off is out of range")?;
            let cutoff = gate
                .clock()
                .now()
                .checked_sub_signed(age)
                .context("Cut-off is out of range")?;
            let buckets_before = gate.rate_limiter().bucket_key(cutoff);
            let pruned = gate.store().prune(buckets_before, cutoff).await?;
            info!(
                buckets_removed = pruned.buckets_removed,
                usage_records_removed = pruned.usage_records_removed,
                "Pruned expired guard state"
            );
            print_json(&pruned)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::ServeMetrics { port } => {
            if !config.metrics.enabled {
                anyhow::bail!(
                    "Metrics are disabled; set [metrics] enabled = true or DEATHSTAR_METRICS_ENABLED=true"
                );
            }
            let port = port.unwrap_or(config.metrics.port);
            metrics_server::start_metrics_server(port, gate).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Print a guard result and map it to the process exit code
fn report(result: Result<Verdict, GuardError>) -> ExitCode {
    let outcome = Outcome::from_result(&result);
    let body = match &result {
        Ok(verdict) => json!({
            "outcome": outcome,
            "status": outcome.http_status(),
            "verdict": verdict,
        }),
        Err(e) => json!({
            "outcome": outcome,
            "status": outcome.http_status(),
            "error": e.to_string(),
        }),
    };
    if let Err(e) = print_json(&body) {
        error!("Failed to print result: {:#}", e);
        return ExitCode::from(1);
    }

    match result {
        Ok(Verdict::Accepted) => ExitCode::SUCCESS,
        Ok(Verdict::Rejected(_)) => ExitCode::from(EXIT_REJECTED),
        Err(_) => ExitCode::from(1),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}
