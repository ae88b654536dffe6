use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use placescout::config::{DEFAULT_CONFIG_FILE, ServiceConfig};
use placescout::logging::init_logging;

mod cmd;

#[derive(Parser)]
#[command(name = "placescout")]
#[command(version, about = "Place discovery pipeline and outreach campaign service")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API
    Serve {
        /// Override the configured listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and run migrations
    InitDb,
    /// Delete pipeline runs older than the retention horizon
    Prune {
        /// Override the configured retention in days
        #[arg(long)]
        days: Option<i64>,
    },
    /// Print the reconciled pipeline status as JSON
    Status,
    /// View configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Print a default configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ServiceConfig::load(&cli.config)?;
    let _log_guard = init_logging(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Serve { port, dev } => {
            if let Some(port) = port {
                config.server.port = *port;
            }
            config.server.dev_mode |= *dev;
            cmd::cmd_serve(config).await?;
        }
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::Prune { days } => {
            if let Some(days) = days {
                config.pipeline.retention_days = *days;
            }
            cmd::cmd_prune(&config).await?;
        }
        Commands::Status => cmd::cmd_status(&config).await?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command.clone())?,
    }

    Ok(())
}
