//! tickdna binary: configure, connect, run the pipeline, report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tickdna::api::CoreApi;
use tickdna::broker::session::{BrokerSession, TcpFactory};
use tickdna::config::PipelineConfig;
use tickdna::governor::RateGovernor;
use tickdna::models::Timeframe;
use tickdna::pipeline::{Orchestrator, RunSpec, SessionRunner};
use tickdna::planner::BatchStrategy;
use tickdna::storage::BarStore;

#[derive(Parser)]
#[command(name = "tickdna", about = "Tick-bar ingestion, validation, and DNA labeling")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "tickdna.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download, validate, store, and label a range.
    Run {
        /// Comma-separated symbols, e.g. MSTR,NVDA.
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
        /// Comma-separated timeframes, e.g. 1m,15m,1h.
        #[arg(long, value_delimiter = ',', default_value = "1m")]
        timeframes: Vec<String>,
        /// Inclusive start date (UTC), YYYY-MM-DD.
        #[arg(long)]
        from: NaiveDate,
        /// Exclusive end date (UTC), YYYY-MM-DD.
        #[arg(long)]
        to: NaiveDate,
        #[arg(long, default_value = "mixed")]
        strategy: String,
    },
    /// Report expected-but-absent grid slots for a stored range.
    Missing {
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "1m")]
        timeframe: String,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Aggregate quality over a stored range.
    Quality {
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
}

fn parse_timeframes(raw: &[String]) -> Result<Vec<Timeframe>> {
    raw.iter()
        .map(|s| {
            Timeframe::parse(s).with_context(|| format!("unknown timeframe '{s}'"))
        })
        .collect()
}

fn parse_strategy(raw: &str) -> Result<BatchStrategy> {
    match raw {
        "sequential" => Ok(BatchStrategy::Sequential),
        "parallel_by_symbol" => Ok(BatchStrategy::ParallelBySymbol),
        "parallel_by_timeframe" => Ok(BatchStrategy::ParallelByTimeframe),
        "mixed" => Ok(BatchStrategy::Mixed),
        other => anyhow::bail!("unknown strategy '{other}'"),
    }
}

fn day_start(date: NaiveDate) -> chrono::DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight exists"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let store = BarStore::open(&config.storage.path, config.storage.expected_schema_version)?;

    match cli.command {
        Command::Run { symbols, timeframes, from, to, strategy } => {
            let spec = RunSpec {
                symbols,
                timeframes: parse_timeframes(&timeframes)?,
                range_start: day_start(from),
                range_end: day_start(to),
                strategy: parse_strategy(&strategy)?,
            };

            info!(endpoint = %config.broker.endpoint, "connecting broker session");
            let session = Arc::new(
                BrokerSession::establish(
                    TcpFactory::new(config.broker.endpoint.clone()),
                    config.broker.clone(),
                )
                .await?,
            );
            let runner = SessionRunner::new(
                Arc::clone(&session),
                Duration::from_secs(config.rate_limits.historical.deadline_secs),
            );
            let governor = RateGovernor::new(runner, config.rate_limits.clone());
            let orchestrator = Orchestrator::new(config, store.clone(), governor);
            let api = CoreApi::new(orchestrator.clone(), store);

            let envelope = api.run_pipeline(spec).await;
            println!("{}", serde_json::to_string_pretty(&envelope)?);

            orchestrator.shutdown();
            session.disconnect().await;
            if envelope.data.as_ref().map(|r| r.success) != Some(true) {
                std::process::exit(1);
            }
        }
        Command::Missing { symbol, timeframe, from, to } => {
            let timeframe =
                Timeframe::parse(&timeframe).context("unknown timeframe")?;
            let report =
                store.detect_missing(&symbol, timeframe, day_start(from), day_start(to))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Quality { symbol, from, to } => {
            let report =
                store.quality_report(symbol.as_deref(), day_start(from), day_start(to))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}
