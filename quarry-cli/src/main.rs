use anyhow::Result;
use clap::{Parser, Subcommand};
use quarry::config::{Config, LoggingConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "quarry")]
#[command(about = "quarry CLI - Elasticsearch aggregations on ClickHouse")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "quarry.toml", env = "QUARRY_CONFIG")]
    config: PathBuf,

    /// YAML schema file, overrides `schema.path` from the config
    #[arg(short, long, global = true)]
    schema: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a search body and print the planned SQL
    Explain {
        /// Search body (JSON) with `aggs` and optional `query`
        #[arg(short, long)]
        body: PathBuf,
    },

    /// Run a search body against recorded statement results
    Replay {
        /// Search body (JSON) with `aggs` and optional `query`
        #[arg(short, long)]
        body: PathBuf,

        /// JSON array of `{"sql": .., "rows": [..]}` entries
        #[arg(short, long)]
        fixtures: PathBuf,

        /// Evaluation instant for date math (RFC 3339), defaults to now
        #[arg(long)]
        now: Option<String>,
    },
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| logging.level.clone()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };
    init_logging(&config.logging);
    tracing::debug!(config = %cli.config.display(), table = %config.engine.table, "Loaded configuration");

    let schema_path = cli.schema.or_else(|| config.schema.path.clone());

    match cli.command {
        Commands::Explain { body } => {
            commands::run_explain(&config, schema_path.as_deref(), &body)?;
        }
        Commands::Replay { body, fixtures, now } => {
            commands::run_replay(&config, schema_path.as_deref(), &body, &fixtures, now.as_deref()).await?;
        }
    }

    Ok(())
}
