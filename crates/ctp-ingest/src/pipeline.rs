//! Pipeline orchestration
//!
//! Phases, in order:
//! 1. Extract: resume or start pagination and persist one shard per page
//! 2. Compact: merge the run's shards into the day's consolidated file
//! 3. Transform and load: normalize the consolidated file and hand the
//!    tables to a [`TableLoader`]
//!
//! A failing phase is logged with its name and stops the run. Nothing is
//! deleted on failure.

use crate::compact::{self, CompactionStats};
use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::extract::{PageFetcher, PageOutcome};
use crate::load::{LoadStats, TableLoader};
use crate::normalize::{NormalizeStats, Normalizer};
use crate::shard::{self, ShardWriter};
use crate::state::CursorStore;
use chrono::{Local, NaiveDate};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Phases selected for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phases {
    /// Extraction followed by compaction
    pub extract: bool,
    /// Normalization followed by load
    pub transform: bool,
}

impl Phases {
    pub fn all() -> Self {
        Self {
            extract: true,
            transform: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.extract && !self.transform
    }
}

/// Outcome of the extraction phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractSummary {
    pub start_page: u32,
    pub end_page: u32,
    pub shard_dir: PathBuf,
    /// The API reported no further pages before the target was reached
    pub exhausted: bool,
}

impl ExtractSummary {
    pub fn pages_fetched(&self) -> u32 {
        self.end_page.saturating_sub(self.start_page)
    }
}

/// Per-phase results of [`IngestPipeline::run`]
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub extract: Option<ExtractSummary>,
    pub compaction: Option<CompactionStats>,
    pub normalize: Option<NormalizeStats>,
    pub load: Option<LoadStats>,
}

/// Drives one ingestion run
pub struct IngestPipeline {
    config: IngestConfig,
    run_date: NaiveDate,
}

impl IngestPipeline {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            config,
            run_date: Local::now().date_naive(),
        }
    }

    /// Override the date used for new shard and consolidated partitions
    pub fn with_run_date(mut self, run_date: NaiveDate) -> Self {
        self.run_date = run_date;
        self
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn run_date(&self) -> NaiveDate {
        self.run_date
    }

    pub fn open_store(&self) -> Result<CursorStore> {
        CursorStore::open_file(&self.config.storage.state_file)
    }

    /// Shard directory a fresh run would write to
    pub fn todays_shard_dir(&self) -> PathBuf {
        ShardWriter::for_date(&self.config.storage.shard_root, self.run_date)
            .dir()
            .to_path_buf()
    }

    /// Shard directory of the current or most recent run
    pub fn current_shard_dir(&self) -> Result<PathBuf> {
        let store = self.open_store()?;
        Ok(store
            .shard_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.todays_shard_dir()))
    }

    /// Consolidated file for the run date
    pub fn consolidated_file(&self) -> PathBuf {
        compact::consolidated_file_path(&self.config.storage.compact_root, self.run_date)
    }

    /// Fetch pages until `target_pages` are on disk.
    ///
    /// A resumed run keeps writing into the shard directory it started in.
    /// A fresh run refuses a date partition that already holds shards.
    pub async fn extract(&self) -> Result<ExtractSummary> {
        let target = self.config.target_pages;
        let mut store = self.open_store()?;
        let start = store.determine_starting_point()?;

        let recorded_dir = store.shard_dir().map(Path::to_path_buf);
        let shard_dir = match recorded_dir {
            Some(dir) if start > 0 => dir,
            _ => self.todays_shard_dir(),
        };

        if start == 0 {
            let existing = shard::count_shards(&shard_dir)?;
            if existing > 0 {
                return Err(IngestError::PartitionOccupied {
                    dir: shard_dir,
                    shards: existing,
                });
            }
        }

        info!(
            start_page = start,
            target_pages = target,
            shard_dir = %shard_dir.display(),
            "Starting extraction"
        );

        if start >= target {
            info!(pages = start, "Page target already met");
            store.record_run_complete()?;
            return Ok(ExtractSummary {
                start_page: start,
                end_page: start,
                shard_dir,
                exhausted: false,
            });
        }

        let token = if start > 0 {
            let token = match shard::last_shard_token(&shard_dir)? {
                Some(token) => Some(token),
                None => store.continuation_token().map(str::to_string),
            };
            if token.is_none() {
                return Err(IngestError::MissingState(format!(
                    "no continuation token to resume page {}",
                    start + 1
                )));
            }
            token
        } else {
            None
        };

        let mut fetcher = PageFetcher::new(
            self.config.api.clone(),
            &self.config.rate_limit,
            ShardWriter::new(&shard_dir),
            start,
            token.as_deref(),
        )?;

        let mut exhausted = false;
        while fetcher.current_page() < target {
            let outcome = fetcher.make_request(&mut store).await?;
            debug!(page = outcome.page(), target_pages = target, "Extraction progress");
            if let PageOutcome::Exhausted { .. } = outcome {
                exhausted = true;
                break;
            }
        }

        store.record_run_complete()?;

        let summary = ExtractSummary {
            start_page: start,
            end_page: fetcher.current_page(),
            shard_dir,
            exhausted,
        };
        info!(
            pages_fetched = summary.pages_fetched(),
            total_pages = summary.end_page,
            exhausted,
            "Extraction complete"
        );
        Ok(summary)
    }

    /// Merge `shard_dir` into the consolidated file for the run date
    pub fn compact(&self, shard_dir: &Path) -> Result<Option<CompactionStats>> {
        compact::compact_shards(shard_dir, &self.config.storage.compact_root, self.run_date)
    }

    /// Normalize `consolidated` and load the tables
    pub async fn transform_and_load(
        &self,
        consolidated: &Path,
        loader: &dyn TableLoader,
    ) -> Result<(NormalizeStats, LoadStats)> {
        let (tables, stats) = Normalizer::flatten_file(consolidated)?;
        let batches = tables.into_batches()?;

        info!(destination = %loader.destination(), "Loading normalized tables");
        let load_stats = loader.load(&batches).await?;

        Ok((stats, load_stats))
    }

    /// Run the selected phases in order
    pub async fn run(&self, phases: Phases, loader: &dyn TableLoader) -> Result<RunSummary> {
        if phases.is_empty() {
            return Err(IngestError::NoPhaseSelected);
        }

        let mut summary = RunSummary::default();

        if phases.extract {
            let extract = self.extract().await.map_err(|e| phase_failed("extract", e))?;
            summary.compaction = self
                .compact(&extract.shard_dir)
                .map_err(|e| phase_failed("compact", e))?;
            summary.extract = Some(extract);
        }

        if phases.transform {
            let consolidated = self.consolidated_file();
            let (normalize, load) = self
                .transform_and_load(&consolidated, loader)
                .await
                .map_err(|e| phase_failed("transform_and_load", e))?;

            info!(
                studies = normalize.studies,
                rows = load.total_rows(),
                "Transform and load complete"
            );
            summary.normalize = Some(normalize);
            summary.load = Some(load);
        }

        Ok(summary)
    }
}

fn phase_failed(phase: &'static str, err: IngestError) -> IngestError {
    match err.page() {
        Some(page) => error!(phase, page, error = %err, "Phase failed"),
        None => error!(phase, error = %err, "Phase failed"),
    }
    err
}
