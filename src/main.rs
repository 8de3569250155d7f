//! Regime signals - main entry point
//!
//! This binary provides six subcommands:
//! - run: Execute one pipeline run and print the report
//! - watch: Run the pipeline on a fixed interval until Ctrl+C
//! - download: Fetch a CoinGecko price history to CSV
//! - signals, performance, regimes: Read the last completed run

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "regime-signals")]
#[command(about = "Regime-aware crypto signal generation and performance evaluation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "configs/default.json")]
    config: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline once
    Run {
        /// Read prices from this CSV instead of the configured source
        #[arg(long)]
        csv: Option<String>,

        /// Starting signal threshold (overrides config file)
        #[arg(long)]
        threshold: Option<f64>,

        /// Use the indicator-confirmed regime rule
        #[arg(long)]
        confirmed_regimes: bool,
    },

    /// Run the pipeline on a schedule
    Watch {
        /// Seconds between runs
        #[arg(long, default_value = "3600")]
        interval: u64,
    },

    /// Download price history from CoinGecko
    Download {
        /// CoinGecko coin id
        #[arg(long, default_value = "bitcoin")]
        coin: String,

        /// Number of days of history to fetch
        #[arg(short, long, default_value = "100")]
        days: u32,

        /// Output CSV path
        #[arg(short, long, default_value = "data/bitcoin_1d.csv")]
        output: String,
    },

    /// Show recent BUY/SELL signals from the last run
    Signals {
        /// Number of signals to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show the performance report of the last run
    Performance,

    /// Show the regime series of the last run
    Regimes {
        /// Number of rows to show
        #[arg(short, long, default_value = "30")]
        limit: usize,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());

    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Run { .. } => "run",
        Commands::Watch { .. } => "watch",
        Commands::Download { .. } => "download",
        Commands::Signals { .. } => "signals",
        Commands::Performance => "performance",
        Commands::Regimes { .. } => "regimes",
    };

    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Run {
            csv,
            threshold,
            confirmed_regimes,
        } => commands::run::run(cli.config, csv, threshold, confirmed_regimes),

        Commands::Watch { interval } => commands::watch::run(cli.config, interval),

        Commands::Download { coin, days, output } => {
            commands::download::run(cli.config, coin, days, output)
        }

        Commands::Signals { limit } => commands::report::signals(cli.config, limit),

        Commands::Performance => commands::report::performance(cli.config),

        Commands::Regimes { limit } => commands::report::regimes(cli.config, limit),
    }
}
