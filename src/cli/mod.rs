//! CLI module - Command line interface definitions and handlers

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use walkdir::WalkDir;

use crate::chunking::{ContentType, SourceMetadata, StrategyKind};
use crate::config::{generate_sample_config, Config};
use crate::pipeline::{
    BatchReport, BatchStatus, FileSpec, PipelineBuilder, PipelineStatus, RetrySummary,
    SimulatedExecutor, TierStatus,
};

/// Tierflow - multi-tier task routing pipeline
///
/// Splits files into checksum-addressed chunks and moves every chunk through
/// an ordered sequence of tiers, each served by a pool of scored agents.
#[derive(Parser, Debug)]
#[command(name = "tierflow")]
#[command(version)]
#[command(about = "Chunk files and route them through a multi-tier agent pipeline", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbose output (debug logging)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Config file (default: platform config dir)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit files as one batch and run it through every tier
    Run(RunArgs),

    /// Chunk a single file and print the chunks
    Chunk(ChunkArgs),

    /// Chunk files and search the chunk index
    Search(SearchArgs),

    /// Show, create or print a sample config
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Files or directories to submit
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Include hidden files when walking directories
    #[arg(long)]
    pub hidden: bool,

    /// Override the simulated executor time scale
    #[arg(long)]
    pub time_scale: Option<f64>,

    /// Give up (and cancel the batch) after this long, e.g. "30s" or "5m"
    #[arg(long, default_value = "10m")]
    pub timeout: String,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ChunkArgs {
    /// File to chunk
    #[arg(required = true)]
    pub file: PathBuf,

    /// Strategy (default: per content type)
    #[arg(long, short, value_enum)]
    pub strategy: Option<StrategyArg>,

    /// Print chunks as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Args)]
pub struct SearchArgs {
    /// Query terms, or a regex with --regex
    #[arg(required = true)]
    pub query: String,

    /// Files or directories to index
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Treat the query as a regular expression
    #[arg(long, short)]
    pub regex: bool,

    /// Maximum hits shown
    #[arg(long, short = 'n', default_value = "10")]
    pub limit: usize,

    /// Include hidden files when walking directories
    #[arg(long)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    /// Print a commented sample config
    #[arg(long)]
    pub sample: bool,

    /// Write the default config if none exists
    #[arg(long)]
    pub init: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    FixedSize,
    Semantic,
    Hybrid,
    Adaptive,
    Hierarchical,
}

impl From<StrategyArg> for StrategyKind {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::FixedSize => StrategyKind::FixedSize,
            StrategyArg::Semantic => StrategyKind::Semantic,
            StrategyArg::Hybrid => StrategyKind::Hybrid,
            StrategyArg::Adaptive => StrategyKind::Adaptive,
            StrategyArg::Hierarchical => StrategyKind::Hierarchical,
        }
    }
}

// ============================================================================
// Input Discovery
// ============================================================================

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.len() > 1)
        .unwrap_or(false)
}

/// Expand paths into file specs; directories are walked recursively
pub fn collect_files(paths: &[PathBuf], include_hidden: bool) -> Result<Vec<FileSpec>> {
    let mut files = Vec::new();

    for root in paths {
        if !root.exists() {
            bail!("Path does not exist: {}", root.display());
        }

        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| include_hidden || e.depth() == 0 || !is_hidden(e.path()));

        for entry in walker {
            let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path().to_path_buf();
            let size = entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", path.display()))?
                .len();
            let id = path
                .strip_prefix(root)
                .ok()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(path.as_path())
                .display()
                .to_string();

            files.push(FileSpec::new(
                id,
                path.clone(),
                size,
                ContentType::from_path(&path).as_str(),
            ));
        }
    }

    Ok(files)
}

// ============================================================================
// Commands
// ============================================================================

/// `tierflow run`
pub async fn run_pipeline(args: &RunArgs, config: &Config) -> Result<()> {
    let timeout = humantime::parse_duration(&args.timeout)
        .with_context(|| format!("Invalid timeout: {}", args.timeout))?;
    let files = collect_files(&args.paths, args.hidden)?;
    if files.is_empty() {
        bail!("No input files found");
    }

    let total_bytes: u64 = files.iter().map(|f| f.size).sum();
    if !args.json {
        println!(
            "{} Submitting {} files ({})",
            "▶".bright_cyan(),
            files.len(),
            humansize::format_size(total_bytes, humansize::BINARY)
        );
    }

    let embedder = config.embedder();
    let registry = config.registry(embedder.clone())?;
    let engine = Arc::new(config.chunking_engine(embedder));
    let scale = args
        .time_scale
        .unwrap_or(config.pipeline.executor_time_scale);

    let pipeline = PipelineBuilder::new(registry)
        .config(config.pipeline_config())
        .default_executor(Arc::new(SimulatedExecutor::new(scale)))
        .chunking(engine)
        .build()?;

    let started = Instant::now();
    let batch_id = pipeline.submit_batch(files).await?;

    let pb = if args.json {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(1000)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {percent}% {msg} [{elapsed_precise}]")?,
    );

    let mut timed_out = false;
    loop {
        let status = pipeline
            .wait_for_batch(batch_id, Duration::from_millis(100))
            .await?;
        let progress = pipeline.progress(batch_id)?;
        pb.set_position((progress * 1000.0) as u64);
        pb.set_message(tier_line(&pipeline.get_pipeline_status()));

        if status.is_terminal() {
            break;
        }
        if started.elapsed() >= timeout {
            timed_out = true;
            pipeline.cancel_batch(batch_id).await?;
            break;
        }
    }
    pb.finish_and_clear();

    let report = pipeline.get_batch_status(batch_id)?;
    let status = pipeline.get_pipeline_status();
    let retries = pipeline.retry_summary();

    if args.json {
        let out = json!({
            "batch": report,
            "pipeline": status,
            "retries": retries,
            "timed_out": timed_out,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        print_report(&report, &status, &retries, started.elapsed());
        if timed_out {
            println!(
                "{} Timed out after {}, batch cancelled",
                "⚠".yellow(),
                humantime::format_duration(timeout)
            );
        }
    }

    pipeline.shutdown().await;
    Ok(())
}

fn tier_line(status: &PipelineStatus) -> String {
    let tiers: Vec<String> = status
        .tiers
        .iter()
        .map(|t| {
            let mark = if t.status == TierStatus::Overloaded { "!" } else { "" };
            format!("{}{} {}/{}+{}", t.id, mark, t.load, t.capacity, t.queued)
        })
        .collect();
    format!("health {} | {}", status.system_health, tiers.join(" "))
}

fn print_report(
    report: &BatchReport,
    status: &PipelineStatus,
    retries: &RetrySummary,
    elapsed: Duration,
) {
    let headline = match report.batch.status {
        BatchStatus::Completed => "completed".bright_green(),
        BatchStatus::PartiallyFailed => "partially failed".yellow(),
        BatchStatus::Cancelled => "cancelled".red(),
        BatchStatus::Pending | BatchStatus::Processing => "unfinished".red(),
    };
    // Whole milliseconds keep the formatted duration short
    let elapsed = Duration::from_millis(elapsed.as_millis() as u64);

    println!(
        "\n{} Batch {} {} in {}",
        "✓".bright_green(),
        report.batch.id.short(),
        headline,
        humantime::format_duration(elapsed)
    );
    println!(
        "  Chains: {} total, {} completed, {} failed, {} cancelled ({:.0}%)",
        report.chains_total,
        report.chains_completed,
        report.chains_failed,
        report.chains_cancelled,
        report.progress * 100.0
    );
    println!(
        "  Retries: {} requeued, {} exhausted",
        retries.requeued, retries.exhausted
    );
    for error in &report.batch.file_errors {
        println!("  {} {}: {}", "⚠".yellow(), error.file_id, error.error);
    }

    println!("\n{}", "Agents".bright_white().bold());
    for tier in &status.tiers {
        for agent in &tier.agents {
            println!(
                "  {:<24} done {:>4}  failed {:>3}  success {:.2}  avg {:>7.1}ms  quality {:.2}",
                agent.id.as_str(),
                agent.stats.tasks_completed,
                agent.stats.tasks_failed,
                agent.stats.success_rate,
                agent.stats.avg_processing_ms,
                agent.stats.quality_score
            );
        }
    }
    println!("\n  System health: {}", status.system_health);
}

/// `tierflow chunk`
pub fn chunk_file(args: &ChunkArgs, config: &Config) -> Result<()> {
    let content = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let source = SourceMetadata::new(
        args.file.display().to_string(),
        ContentType::from_path(&args.file),
        content.len() as u64,
    )
    .with_path(args.file.clone());

    let engine = config.chunking_engine(config.embedder());
    let chunks = engine.chunk(&content, &source, args.strategy.map(Into::into))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&chunks)?);
        return Ok(());
    }

    println!(
        "{} {} ({}, {}): {} chunks",
        "✂".bright_cyan(),
        args.file.display(),
        source.content_type.as_str(),
        humansize::format_size(source.size, humansize::BINARY),
        chunks.len()
    );
    for chunk in &chunks {
        println!(
            "  #{:<4} {:>7}..{:<7} {:<13} complexity {:.2}  edges {:>2}  {}",
            chunk.index,
            chunk.start,
            chunk.end,
            chunk.strategy.as_str(),
            chunk.complexity,
            chunk.relationships.len(),
            &chunk.checksum[..12.min(chunk.checksum.len())]
        );
        for warning in &chunk.warnings {
            println!("        {} {}", "⚠".yellow(), warning);
        }
    }
    Ok(())
}

/// `tierflow search`
pub fn search_chunks(args: &SearchArgs, config: &Config) -> Result<()> {
    let files = collect_files(&args.paths, args.hidden)?;
    let mut sources = Vec::with_capacity(files.len());
    for file in &files {
        match std::fs::read_to_string(&file.path) {
            Ok(content) => sources.push((
                SourceMetadata::new(
                    file.id.clone(),
                    ContentType::from_declared(&file.content_type),
                    file.size,
                )
                .with_path(file.path.clone()),
                content,
            )),
            Err(e) => tracing::warn!("Skipping {}: {}", file.path.display(), e),
        }
    }

    let engine = config.chunking_engine(config.embedder());
    for ((source, _), result) in sources.iter().zip(engine.chunk_sources(&sources)) {
        if let Err(e) = result {
            tracing::warn!("Skipping {}: {}", source.id, e);
        }
    }
    let linked = engine
        .store()
        .link_cross_references(config.chunking.similarity_threshold);
    tracing::debug!("Linked {} cross-file chunk pairs", linked);

    let hits = if args.regex {
        engine.store().search_pattern(&args.query)?
    } else {
        engine.search_chunks(&args.query)
    };

    let stats = engine.store().stats();
    println!(
        "{} {} hits in {} chunks from {} files",
        "🔍".bright_cyan(),
        hits.len(),
        stats.chunk_count,
        stats.source_count
    );
    for hit in hits.iter().take(args.limit) {
        println!(
            "  {:.3}  {}  {}",
            hit.score,
            hit.chunk_id.bright_white(),
            hit.snippet.replace('\n', " ")
        );
    }
    Ok(())
}

/// `tierflow config`
pub fn config_command(args: &ConfigArgs, config: &Config) -> Result<()> {
    if args.sample {
        print!("{}", generate_sample_config());
        return Ok(());
    }
    if args.init {
        let path = Config::ensure_exists()?;
        println!("{} Config at {}", "✓".bright_green(), path.display());
        return Ok(());
    }
    print!("{}", toml::to_string_pretty(config).context("Failed to serialize config")?);
    Ok(())
}
