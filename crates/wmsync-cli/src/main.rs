mod commands;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use wmsync_types::wire::SyncMode;

#[derive(Parser)]
#[command(
    name = "wmsync",
    version,
    about = "Warehouse inventory synchronization"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Full,
    Incremental,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => SyncMode::Full,
            ModeArg::Incremental => SyncMode::Incremental,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync over a set of entities
    Run {
        /// Path to sync YAML file
        #[arg(long, env = "WMSYNC_CONFIG")]
        config: PathBuf,
        #[arg(long, value_enum)]
        mode: ModeArg,
        /// Comma-separated entity names (e.g. `orders,order_details`)
        #[arg(long, value_delimiter = ',', required = true)]
        entities: Vec<String>,
    },
    /// Validate configuration and target connectivity
    Check {
        #[arg(long, env = "WMSYNC_CONFIG")]
        config: PathBuf,
    },
    /// List stored bookmarks
    Bookmarks {
        #[arg(long, env = "WMSYNC_CONFIG")]
        config: PathBuf,
    },
    /// Delete the bookmark of one entity
    Reset {
        #[arg(long, env = "WMSYNC_CONFIG")]
        config: PathBuf,
        #[arg(long)]
        entity: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(&cli.log_level);

    match cli.command {
        Commands::Run {
            config,
            mode,
            entities,
        } => commands::run::execute(&config, mode.into(), &entities).await,
        Commands::Check { config } => commands::check::execute(&config).await,
        Commands::Bookmarks { config } => commands::bookmarks::execute(&config).await,
        Commands::Reset { config, entity } => commands::reset::execute(&config, &entity).await,
    }
}
