mod config;
mod data;
mod decision;
mod engine;
mod report;
mod research;
mod strategies;
mod types;
mod utils;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use data::{CandleCache, CsvPriceLoader, CsvSignalLoader, GeckoTerminalLoader, PriceLoader};
use decision::{load_stability_csv, select_strategies, SelectionCriteria};
use engine::{BacktestDriver, PortfolioConfig, PortfolioEngine};
use report::Reporter;
use research::{build_stability_table, load_positions_csv, load_summary_drawdowns, DEFAULT_SPLITS};
use strategies::build_strategies;
use utils::WarnDedup;

#[derive(Parser)]
#[command(name = "signal-backtester")]
#[command(version = "0.1.0")]
#[command(about = "Event-driven backtester for token trading signals", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay signals through the strategies and the portfolio engine
    Backtest {
        /// Signals CSV (id, contract_address, timestamp, ...)
        #[arg(short, long)]
        signals: String,

        /// Process signals with a bounded worker pool
        #[arg(long)]
        parallel: bool,

        /// Worker pool size (overrides the configured value)
        #[arg(long)]
        max_workers: Option<usize>,
    },
    /// Stage A: split executed positions into time windows, build the
    /// stability table
    StageA {
        /// Positions-level CSV; defaults to <reports>/portfolio_positions.csv
        #[arg(long)]
        trades: Option<String>,

        /// Report directory (input summary + output tables)
        #[arg(long)]
        reports_dir: Option<String>,

        /// Split counts for the multi-scale analysis
        #[arg(long, num_args = 1.., value_delimiter = ' ')]
        split_counts: Option<Vec<usize>>,
    },
    /// Stage B: apply the selection criteria to a stability table
    StageB {
        /// strategy_stability.csv path; defaults to the report directory
        #[arg(long)]
        stability: Option<String>,

        /// Output directory; defaults to the report directory
        #[arg(long)]
        output_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let app_config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Backtest {
            signals,
            parallel,
            max_workers,
        } => run_backtest(&app_config, &signals, parallel, max_workers).await,
        Commands::StageA {
            trades,
            reports_dir,
            split_counts,
        } => run_stage_a(&app_config, trades, reports_dir, split_counts),
        Commands::StageB {
            stability,
            output_dir,
        } => run_stage_b(&app_config, stability, output_dir),
    }
}

async fn run_backtest(
    app_config: &AppConfig,
    signals_path: &str,
    parallel_flag: bool,
    max_workers_flag: Option<usize>,
) -> Result<()> {
    let warn_dedup = Arc::new(WarnDedup::new());
    let strategies = build_strategies(&app_config.strategies)?;
    if strategies.is_empty() {
        bail!("no strategies configured; add [[strategies]] entries to the config");
    }

    let signals = CsvSignalLoader::new(signals_path).load_signals()?;
    if signals.is_empty() {
        bail!("no signals found in {}", signals_path);
    }

    // The gecko loader is kept around for its end-of-run summary.
    let mut gecko: Option<Arc<GeckoTerminalLoader>> = None;
    let price_loader: Arc<dyn PriceLoader> = match app_config.data.loader.as_str() {
        "gecko" => {
            let loader = Arc::new(GeckoTerminalLoader::new(
                &app_config.data,
                &app_config.rate_limit,
                Arc::clone(&warn_dedup),
            ));
            gecko = Some(Arc::clone(&loader));
            loader
        }
        "csv" => Arc::new(CsvPriceLoader::new(CandleCache::new(
            &app_config.data.candles_dir,
            &app_config.data.timeframe,
        ))),
        other => bail!("unknown data.loader '{}' (expected 'gecko' or 'csv')", other),
    };

    let parallel = parallel_flag || app_config.runtime.parallel;
    let max_workers = max_workers_flag.unwrap_or(app_config.runtime.max_workers);
    let driver = BacktestDriver::new(
        price_loader,
        strategies.clone(),
        app_config.data.before_minutes,
        app_config.data.after_minutes,
        parallel,
        max_workers,
        Arc::clone(&warn_dedup),
    );

    info!(
        "running backtest over {} signals with {} strategies",
        signals.len(),
        strategies.len()
    );
    let results = driver.run(signals).await?;
    if let Some(loader) = &gecko {
        loader.log_summary();
    }
    if results.is_empty() {
        warn!("no strategy results produced; nothing to simulate");
        return Ok(());
    }

    let portfolio_config =
        PortfolioConfig::from_settings(&app_config.portfolio, &app_config.backtest);
    let engine = PortfolioEngine::new(portfolio_config);
    let mut portfolio_results = BTreeMap::new();
    for strategy in &strategies {
        let name = strategy.name().to_string();
        let result = engine.simulate(&results, &name);
        portfolio_results.insert(name, result);
    }

    let reporter = Reporter::new(&app_config.report.output_dir);
    reporter.save_portfolio_positions(&portfolio_results)?;
    reporter.save_portfolio_executions(&portfolio_results)?;
    reporter.save_portfolio_events(&portfolio_results)?;
    reporter.save_portfolio_summary(&portfolio_results)?;

    info!("backtest complete");
    Ok(())
}

fn run_stage_a(
    app_config: &AppConfig,
    trades: Option<String>,
    reports_dir: Option<String>,
    split_counts: Option<Vec<usize>>,
) -> Result<()> {
    let reports_dir =
        PathBuf::from(reports_dir.unwrap_or_else(|| app_config.report.output_dir.clone()));
    let trades_path = trades
        .map(PathBuf::from)
        .unwrap_or_else(|| reports_dir.join("portfolio_positions.csv"));
    let split_counts = split_counts.unwrap_or_else(|| DEFAULT_SPLITS.to_vec());

    info!(
        "Stage A: positions={} splits={:?}",
        trades_path.display(),
        split_counts
    );

    // Shape check happens inside the loader, before any output is written.
    let rows = load_positions_csv(&trades_path)
        .with_context(|| format!("Stage A input rejected: {}", trades_path.display()))?;
    let closed = rows.iter().filter(|r| r.is_closed()).count();
    info!("loaded {} positions ({} closed)", rows.len(), closed);

    let summary_path = reports_dir.join("portfolio_summary.csv");
    let drawdowns = if summary_path.exists() {
        Some(load_summary_drawdowns(&summary_path)?)
    } else {
        None
    };

    let table = build_stability_table(&rows, &split_counts, drawdowns.as_ref());
    if table.is_empty() {
        warn!("no closed positions: stability table is empty");
        return Ok(());
    }

    let reporter = Reporter::new(&reports_dir);
    let path = reporter.save_stability(&table)?;
    info!("Stage A complete: {} rows -> {}", table.len(), path.display());
    Ok(())
}

fn run_stage_b(
    app_config: &AppConfig,
    stability: Option<String>,
    output_dir: Option<String>,
) -> Result<()> {
    let reports_dir = PathBuf::from(app_config.report.output_dir.clone());
    let stability_path = stability
        .map(PathBuf::from)
        .unwrap_or_else(|| reports_dir.join("strategy_stability.csv"));
    let output_dir = output_dir.map(PathBuf::from).unwrap_or(reports_dir);

    info!("Stage B: stability={}", stability_path.display());
    let input = load_stability_csv(&stability_path)?;
    let rows = select_strategies(
        &input,
        &SelectionCriteria::rr_v1(),
        &SelectionCriteria::runner_v1(),
        &SelectionCriteria::runner_v2(),
    );

    let passed = rows.iter().filter(|r| r.passed).count();
    info!("Stage B: {}/{} rows passed", passed, rows.len());
    for row in rows.iter().filter(|r| !r.passed) {
        info!(
            "  rejected {} (split {}): {}",
            row.record.strategy,
            row.record.split_count.unwrap_or_default(),
            row.failed_reasons.join("; ")
        );
    }

    let reporter = Reporter::new(&output_dir);
    reporter.save_selection(&rows)?;
    Ok(())
}
