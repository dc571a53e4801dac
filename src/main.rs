use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use signal_backtester::config::{load_config, to_toml, PolicyProfile};
use signal_backtester::data::SignalSource;
use signal_backtester::database::Database;
use signal_backtester::engine::Backtester;
use signal_backtester::sink::{CircuitBreaker, ResilientSink, RetryPolicy};
use signal_backtester::types::SignalFilter;
use signal_backtester::BacktestError;

#[derive(Parser)]
#[command(name = "signal-backtester")]
#[command(author = "Trading Bot")]
#[command(version = "0.1.0")]
#[command(about = "Simulate leveraged exits for historical trading signals", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate every signal in a period and store the outcomes
    Run {
        /// SQLite database URL holding candles and signals
        #[arg(long, default_value = "sqlite:./backtest.db")]
        db: String,
        /// Start of the signal window (RFC 3339 or YYYY-MM-DD)
        #[arg(short, long)]
        start: String,
        /// End of the signal window, exclusive (RFC 3339 or YYYY-MM-DD)
        #[arg(short, long)]
        end: String,
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
        /// Exit policy preset (scalp, swing, trailing)
        #[arg(short, long)]
        profile: Option<String>,
        /// Run identifier; derived from config and signals when omitted
        #[arg(long)]
        run_id: Option<String>,
        /// Minimum signal score
        #[arg(long)]
        min_score: Option<Decimal>,
        /// Allowed UTC hours, comma separated
        #[arg(long, value_delimiter = ',')]
        hours: Vec<u32>,
        /// Close everything still open at the end of the window
        #[arg(long)]
        cut_at_end: bool,
    },
    /// Print the effective configuration as TOML
    PrintConfig {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json)?;

    match cli.command {
        Commands::Run {
            db,
            start,
            end,
            config,
            profile,
            run_id,
            min_score,
            hours,
            cut_at_end,
        } => {
            let filter = SignalFilter {
                min_score,
                allowed_hours: hours,
            };
            run(&db, &start, &end, config.as_deref(), profile.as_deref(), run_id, filter, cut_at_end).await?;
        }
        Commands::PrintConfig { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", to_toml(&config)?);
        }
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if json {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow!("failed to install logger: {}", e))
    } else {
        builder
            .try_init()
            .map_err(|e| anyhow!("failed to install logger: {}", e))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    db_url: &str,
    start: &str,
    end: &str,
    config_path: Option<&str>,
    profile: Option<&str>,
    run_id: Option<String>,
    filter: SignalFilter,
    cut_at_end: bool,
) -> Result<()> {
    let start = parse_time(start)?;
    let end = parse_time(end)?;
    if end <= start {
        return Err(anyhow!("End must be after start"));
    }

    let mut config = load_config(config_path)?;
    if let Some(name) = profile {
        let profile: PolicyProfile = name.parse().map_err(|e: String| anyhow!(e))?;
        profile.apply(&mut config);
        info!("Applied {} profile", profile.name());
    }
    config
        .validate()
        .map_err(|errors| anyhow!("Invalid configuration: {}", errors.join(", ")))?;

    let db = Database::new(db_url).await?;
    let signals = db.get_signals(start, end, &filter).await?;
    if signals.is_empty() {
        warn!("No signals between {} and {}", start, end);
        return Ok(());
    }
    info!(
        "Loaded {} signal(s) between {} and {} ({} policy)",
        signals.len(),
        start,
        end,
        config.exit.policy.name()
    );

    let sink = ResilientSink::new(db.clone(), RetryPolicy::default(), CircuitBreaker::default());
    let backtester = Backtester::new(config, Arc::new(db), Arc::new(sink));

    let controller = backtester.controller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current wave");
            controller.cancel();
        }
    });

    let simulation_end = cut_at_end.then_some(end);
    match backtester.run(signals, run_id, simulation_end).await {
        Ok(report) => {
            report.statistics.print_summary();
            info!("Results stored under run id {}", report.run_id);
            Ok(())
        }
        Err(BacktestError::Cancelled) => {
            warn!("Run cancelled before completion, no results were stored");
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            error!("Run aborted: {}", e);
            Err(e.into())
        }
        Err(e) => {
            error!("Run failed: {}", e);
            Err(e.into())
        }
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| anyhow!("Invalid time '{}'. Use RFC 3339 or YYYY-MM-DD", value))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| anyhow!("Invalid date '{}'", value))
}
