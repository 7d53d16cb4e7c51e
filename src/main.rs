use anyhow::Result;
use clap::{Parser, Subcommand};
use executor::{
    commands::{check_config, generate_whitelist, reconcile, run, status},
    context::AppContext,
    whitelist::WhitelistCriteria,
};
use log::info;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "config/executor.json";

#[derive(Parser)]
#[command(name = "executor")]
#[command(about = "Signal execution and risk engine for a brokerage terminal bridge")]
struct Cli {
    /// Settings file (flat JSON); any key can be overridden by an environment variable
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the entry and monitor loops until interrupted
    Run,
    /// Reconcile persisted trades with the broker once and save
    Reconcile,
    /// Summarise the persisted state file and trade journal
    Status,
    /// Validate settings, symbol table and whitelists
    CheckConfig,
    /// Build a whitelist file from a strategy ranking
    GenerateWhitelist {
        /// Ranking JSON with per-strategy statistics
        ranking: PathBuf,
        /// Destination whitelist file
        #[arg(short, long, value_name = "PATH")]
        output: PathBuf,
        /// Minimum win rate in percent
        #[arg(long, default_value_t = 55.0)]
        min_win_rate: f64,
        /// Minimum number of closed trades
        #[arg(long, default_value_t = 20)]
        min_trades: u32,
        /// Minimum profit factor
        #[arg(long, default_value_t = 1.5)]
        min_profit_factor: f64,
        /// Maximum drawdown in percent (exclusive)
        #[arg(long, default_value_t = 15.0)]
        max_drawdown: f64,
        /// Number of strategies to keep
        #[arg(long, default_value_t = 43)]
        top_n: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting executor. Not financial advice. Most retail traders lose money. Use at your own risk.");

    match command {
        Commands::GenerateWhitelist {
            ranking,
            output,
            min_win_rate,
            min_trades,
            min_profit_factor,
            max_drawdown,
            top_n,
        } => {
            let criteria = WhitelistCriteria {
                min_win_rate,
                min_trades,
                min_profit_factor,
                max_drawdown,
                top_n,
            };
            generate_whitelist::run(&ranking, &output, &criteria)?;
        }
        Commands::Run => run::run(&AppContext::initialize(config)?).await?,
        Commands::Reconcile => reconcile::run(&AppContext::initialize(config)?).await?,
        Commands::Status => status::run(&AppContext::initialize(config)?).await?,
        Commands::CheckConfig => check_config::run(&AppContext::initialize(config)?)?,
    }

    Ok(())
}
