use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{ConfigCommand, SchemaCommand};
use crm_mirror::Config;

#[derive(Parser)]
#[command(name = "crm-mirror")]
#[command(version)]
#[command(
    about = "Mirrors change-tracked CRM entities into a reporting database",
    long_about = None
)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync service until interrupted (default)
    Run,

    /// Validate the configured entity types against the source
    Check,

    /// Print the table an entity type projects to
    Schema(SchemaCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crm_mirror=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        None | Some(Commands::Run) => commands::run_service(&config).await?,
        Some(Commands::Check) => commands::check(&config).await?,
        Some(Commands::Schema(cmd)) => cmd.run(&config).await?,
        Some(Commands::Config(cmd)) => cmd.run(&config)?,
    }

    Ok(())
}
