//! Tierflow - multi-tier task routing pipeline
//!
//! Chunks input files and routes every chunk through an ordered sequence of
//! tiers served by scored agent pools.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tierflow::cli::{self, Cli, Commands};
use tierflow::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    // Initialize logging; stdout is reserved for command output
    let level = if cli.verbose {
        "debug"
    } else {
        config.general.log_level.as_str()
    };
    let filter = EnvFilter::from_default_env().add_directive(format!("tierflow={}", level).parse()?);
    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).compact().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    match cli.command {
        Commands::Run(args) => cli::run_pipeline(&args, &config).await?,
        Commands::Chunk(args) => cli::chunk_file(&args, &config)?,
        Commands::Search(args) => cli::search_chunks(&args, &config)?,
        Commands::Config(args) => cli::config_command(&args, &config)?,
    }

    Ok(())
}
