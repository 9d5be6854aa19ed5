//! CTP Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Resumable ingestion of paginated clinical-trial records into a normalized
//! relational model.
//!
//! # Phases
//!
//! - **Extract**: cursor pagination against the studies API, one Parquet
//!   shard per page, crash recovery from the shards on disk
//! - **Compact**: merge a run's shards into one consolidated file
//! - **Transform**: flatten nested records into keyed entity and
//!   relationship tables
//! - **Load**: hand the tables, in dependency order, to a [`load::TableLoader`]
//!
//! # Example
//!
//! ```no_run
//! use ctp_ingest::config::IngestConfig;
//! use ctp_ingest::load::JsonLinesLoader;
//! use ctp_ingest::pipeline::{IngestPipeline, Phases};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let loader = JsonLinesLoader::new(&config.output_dir);
//!     IngestPipeline::new(config).run(Phases::all(), &loader).await?;
//!     Ok(())
//! }
//! ```

pub mod compact;
pub mod config;
pub mod error;
pub mod extract;
pub mod load;
pub mod normalize;
pub mod pipeline;
pub mod rate_limit;
pub mod shard;
pub mod state;

pub use config::IngestConfig;
pub use error::{IngestError, Result};
pub use pipeline::{IngestPipeline, Phases};
