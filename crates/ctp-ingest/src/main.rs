//! CTP Ingest - clinical trials ingestion tool

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ctp_common::logging::{init_logging, LogConfig, LogLevel};
use ctp_ingest::config::IngestConfig;
use ctp_ingest::load::{JsonLinesLoader, TableLoader};
use ctp_ingest::normalize::Normalizer;
use ctp_ingest::pipeline::{IngestPipeline, Phases};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ctp-ingest")]
#[command(author, version, about = "Clinical trials paginated ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline phases
    Run {
        /// Skip extraction and compaction
        #[arg(long)]
        skip_extract: bool,

        /// Skip normalization and load
        #[arg(long)]
        skip_transform: bool,

        /// Pages to have on disk before the run completes
        #[arg(long, env = "CTP_TARGET_PAGES")]
        pages: Option<u32>,

        /// Directory for JSON-lines tables
        #[arg(long, env = "CTP_OUTPUT_DIR")]
        output_dir: Option<PathBuf>,

        /// Load into PostgreSQL (DATABASE_URL) instead of JSON lines
        #[arg(long)]
        database: bool,
    },

    /// Create the initial extraction state if none exists
    SeedState,

    /// Show extraction state
    Status,

    /// Compact a shard directory into today's consolidated file
    Compact {
        /// Shard directory, defaults to the current run's
        #[arg(long)]
        source: Option<PathBuf>,
    },

    /// Normalize a consolidated file into JSON-lines tables
    Normalize {
        /// Consolidated Parquet file
        #[arg(short, long)]
        input: PathBuf,

        /// Directory for JSON-lines tables
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("ctp-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    let config = IngestConfig::from_env().context("Failed to load configuration")?;

    if let Err(e) = dispatch(cli.command, config).await {
        error!(error = %e, "ctp-ingest failed");
        return Err(e);
    }

    Ok(())
}

async fn dispatch(command: Command, mut config: IngestConfig) -> Result<()> {
    match command {
        Command::Run {
            skip_extract,
            skip_transform,
            pages,
            output_dir,
            database,
        } => {
            if let Some(pages) = pages {
                config.target_pages = pages;
            }
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }

            let phases = Phases {
                extract: !skip_extract,
                transform: !skip_transform,
            };
            let loader = build_loader(&config, database).await?;
            let pipeline = IngestPipeline::new(config);

            let summary = pipeline.run(phases, loader.as_ref()).await?;
            if let Some(extract) = &summary.extract {
                info!(
                    pages_fetched = extract.pages_fetched(),
                    total_pages = extract.end_page,
                    "Extract phase finished"
                );
            }
            if let Some(load) = &summary.load {
                info!(rows = load.total_rows(), "Load phase finished");
            }
            info!("Run complete");
        },

        Command::SeedState => {
            let pipeline = IngestPipeline::new(config);
            let mut store = pipeline.open_store()?;
            if store.seed()? {
                info!(state_file = %pipeline.config().storage.state_file.display(), "Extraction state seeded");
            } else {
                info!("Extraction state already exists, left unchanged");
            }
        },

        Command::Status => {
            let pipeline = IngestPipeline::new(config);
            let store = pipeline.open_store()?;
            match store.state() {
                Some(state) => {
                    println!("{}", serde_json::to_string_pretty(state)?);
                    println!("starting_point: {}", store.determine_starting_point()?);
                    println!("consolidated_file: {}", pipeline.consolidated_file().display());
                },
                None => println!("No extraction state; run 'ctp-ingest seed-state'"),
            }
        },

        Command::Compact { source } => {
            let pipeline = IngestPipeline::new(config);
            let source = match source {
                Some(dir) => dir,
                None => pipeline.current_shard_dir()?,
            };

            match pipeline.compact(&source)? {
                Some(stats) => info!(
                    shards = stats.shards,
                    rows = stats.rows,
                    output = %stats.output.display(),
                    "Compaction finished"
                ),
                None => info!(source = %source.display(), "Nothing to compact"),
            }
        },

        Command::Normalize { input, output_dir } => {
            let loader = JsonLinesLoader::new(output_dir.unwrap_or(config.output_dir));
            let (tables, stats) = Normalizer::flatten_file(&input)?;
            let load = loader.load(&tables.into_batches()?).await?;
            info!(
                input = %input.display(),
                studies = stats.studies,
                rows = load.total_rows(),
                output_dir = %loader.destination(),
                "Normalization finished"
            );
        },
    }

    Ok(())
}

async fn build_loader(config: &IngestConfig, database: bool) -> Result<Box<dyn TableLoader>> {
    if !database {
        return Ok(Box::new(JsonLinesLoader::new(&config.output_dir)));
    }

    #[cfg(feature = "database")]
    {
        let Some(url) = config.database_url.as_deref() else {
            bail!("--database requires DATABASE_URL");
        };
        let loader = ctp_ingest::load::PostgresLoader::connect(url).await?;
        Ok(Box::new(loader))
    }

    #[cfg(not(feature = "database"))]
    {
        bail!("--database requires building with the 'database' feature")
    }
}
