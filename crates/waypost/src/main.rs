//! waypost - visitor tracking client CLI
//!
//! Subcommands:
//! - `waypost session` - Restore or create the local visitor session
//! - `waypost send <name>` - Send one tracking event to the collector
//! - `waypost listen` - Print messages pushed by the collector
//! - `waypost config` - Show the effective configuration

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use wayconf::WaypostConfig;

mod commands;

use waypost::telemetry;

#[derive(Parser)]
#[command(name = "waypost")]
#[command(about = "Visitor session and collector link client")]
#[command(version)]
struct Cli {
    /// Config file used in place of ./waypost.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore or create the visitor session and print it
    Session {
        /// Landing page recorded on a new session
        #[arg(long)]
        landing_page: Option<String>,
    },

    /// Send one event to the collector
    Send {
        /// Event name
        name: String,

        /// JSON properties
        #[arg(short, long)]
        data: Option<String>,

        /// Collector URL (overrides transport.url)
        #[arg(short, long)]
        url: Option<String>,

        /// Priority: low, normal, high, critical
        #[arg(short, long, default_value = "normal")]
        priority: String,
    },

    /// Connect and print every message the collector pushes
    Listen {
        /// Collector URL (overrides transport.url)
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Print the effective configuration and where it came from
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, sources) = WaypostConfig::load_with_sources_from(cli.config.as_deref())?;

    telemetry::init(&config.telemetry)?;

    let result = match cli.command {
        Commands::Session { landing_page } => commands::session(&config, landing_page).await,
        Commands::Send {
            name,
            data,
            url,
            priority,
        } => commands::send(&config, &name, data.as_deref(), url.as_deref(), &priority).await,
        Commands::Listen { url } => commands::listen(&config, url.as_deref()).await,
        Commands::Config => commands::show_config(&config, &sources),
    };

    telemetry::shutdown();
    result
}
