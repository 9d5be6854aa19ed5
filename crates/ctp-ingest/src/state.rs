//! Extraction cursor persistence and crash recovery
//!
//! The cursor records how far pagination got, the continuation token for the
//! next page and the outcome of the last run. It is written after every
//! request attempt and every terminal outcome, always through a
//! [`StateBackend`] that replaces the stored record atomically.
//!
//! # Recovery
//!
//! A crash can land between writing a shard and updating the cursor, so the
//! persisted `page_count` may lag behind the disk. Whenever the last run did
//! not finish with SUCCESS, [`CursorStore::determine_starting_point`] counts
//! the shard files in the recorded shard directory and trusts that count over
//! the cursor.

use crate::error::{IngestError, Result};
use crate::shard;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of the most recent extraction run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    InProgress,
    Failure,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => write!(f, "SUCCESS"),
            RunStatus::InProgress => write!(f, "IN_PROGRESS"),
            RunStatus::Failure => write!(f, "FAILURE"),
        }
    }
}

/// Durable pagination progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub run_status: RunStatus,
    /// Pages persisted since the last fully successful run
    pub page_count: u32,
    /// Token for the page after `page_count`; absent before the first page
    pub continuation_token: Option<String>,
    /// Directory holding the current run's shards
    pub shard_dir: Option<PathBuf>,
    pub updated_at: DateTime<Utc>,
}

impl CursorState {
    /// State of a store that has never run, ready for a fresh extraction
    pub fn initial() -> Self {
        Self {
            run_status: RunStatus::Success,
            page_count: 0,
            continuation_token: None,
            shard_dir: None,
            updated_at: Utc::now(),
        }
    }
}

/// Durable storage for a single [`CursorState`] record
pub trait StateBackend {
    /// Read the stored state, `None` if nothing was ever stored
    fn load(&self) -> Result<Option<CursorState>>;

    /// Replace the stored state; a crash must leave either the old or the
    /// new record in place
    fn store(&self, state: &CursorState) -> Result<()>;
}

/// Cursor stored as one JSON document, replaced via temp file + rename
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateBackend for JsonFileBackend {
    fn load(&self) -> Result<Option<CursorState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let contents = fs::read(&self.path)?;
        let state = serde_json::from_slice(&contents)?;
        Ok(Some(state))
    }

    fn store(&self, state: &CursorState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let encoded = serde_json::to_vec_pretty(state)?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// Single-writer owner of the extraction cursor
pub struct CursorStore<B: StateBackend = JsonFileBackend> {
    backend: B,
    state: Option<CursorState>,
}

impl CursorStore<JsonFileBackend> {
    /// Open the JSON cursor file at `path`
    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(JsonFileBackend::new(path))
    }
}

impl<B: StateBackend> CursorStore<B> {
    pub fn open(backend: B) -> Result<Self> {
        let state = backend.load()?;
        Ok(Self { backend, state })
    }

    /// Current state, `None` until seeded
    pub fn state(&self) -> Option<&CursorState> {
        self.state.as_ref()
    }

    /// Store an initial SUCCESS state unless one already exists.
    ///
    /// Returns `true` when a new state was written.
    pub fn seed(&mut self) -> Result<bool> {
        if self.state.is_some() {
            return Ok(false);
        }

        let state = CursorState::initial();
        self.backend.store(&state)?;
        self.state = Some(state);
        info!("Seeded extraction state");
        Ok(true)
    }

    /// Page count the next extraction resumes from
    ///
    /// - no stored state: [`IngestError::MissingState`]
    /// - last run SUCCESS: 0, a fresh run
    /// - otherwise: the number of shards in the recorded shard directory
    pub fn determine_starting_point(&self) -> Result<u32> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| IngestError::MissingState("extraction_result".to_string()))?;

        if state.run_status == RunStatus::Success {
            return Ok(0);
        }

        let Some(shard_dir) = state.shard_dir.as_deref() else {
            debug!(status = %state.run_status, "No shard directory recorded, starting from page 0");
            return Ok(0);
        };

        let on_disk = shard::count_shards(shard_dir)?;
        if on_disk != state.page_count {
            warn!(
                status = %state.run_status,
                cursor_pages = state.page_count,
                shard_pages = on_disk,
                shard_dir = %shard_dir.display(),
                "Cursor disagrees with shards on disk, trusting shard count"
            );
        }

        Ok(on_disk)
    }

    /// Token for the page after the last one the cursor recorded
    pub fn continuation_token(&self) -> Option<&str> {
        self.state.as_ref()?.continuation_token.as_deref()
    }

    pub fn shard_dir(&self) -> Option<&Path> {
        self.state.as_ref()?.shard_dir.as_deref()
    }

    pub fn run_status(&self) -> Option<RunStatus> {
        self.state.as_ref().map(|s| s.run_status)
    }

    /// Mark a request attempt for `page` as started
    ///
    /// Leaving SUCCESS starts a fresh run, so progress is reset and the
    /// previous run's shard directory is forgotten until the first shard of
    /// the new run is saved.
    pub fn record_attempt_start(&mut self, page: u32) -> Result<()> {
        debug!(page, "Recording attempt start");
        self.transition(
            &[RunStatus::Success, RunStatus::InProgress, RunStatus::Failure],
            RunStatus::InProgress,
            |state| {
                if state.run_status == RunStatus::Success {
                    state.page_count = 0;
                    state.continuation_token = None;
                    state.shard_dir = None;
                }
            },
        )
    }

    /// Record that `page` is durably persisted and where the next one starts
    pub fn record_success(&mut self, page: u32, next_token: Option<&str>) -> Result<()> {
        self.transition(&[RunStatus::InProgress], RunStatus::InProgress, |state| {
            state.page_count = page;
            state.continuation_token = next_token.map(str::to_string);
        })
    }

    /// Mark the attempt for `page` as failed
    pub fn record_failure(&mut self, page: u32) -> Result<()> {
        debug!(page, "Recording attempt failure");
        self.transition(&[RunStatus::InProgress], RunStatus::Failure, |_| {})
    }

    /// Remember the directory the current run writes shards to
    pub fn record_shard_dir(&mut self, dir: &Path) -> Result<()> {
        if self.shard_dir() == Some(dir) {
            return Ok(());
        }

        let status = self.require_state()?.run_status;
        let dir = dir.to_path_buf();
        self.transition(&[status], status, move |state| {
            state.shard_dir = Some(dir);
        })
    }

    /// Terminal success: the next extraction starts a fresh run
    pub fn record_run_complete(&mut self) -> Result<()> {
        self.transition(
            &[RunStatus::Success, RunStatus::InProgress, RunStatus::Failure],
            RunStatus::Success,
            |_| {},
        )
    }

    fn require_state(&self) -> Result<&CursorState> {
        self.state
            .as_ref()
            .ok_or_else(|| IngestError::MissingState("extraction_result".to_string()))
    }

    /// Compare-and-swap: apply `mutate` and move to `to` only when the
    /// current status is one of `from`, then persist.
    fn transition(
        &mut self,
        from: &[RunStatus],
        to: RunStatus,
        mutate: impl FnOnce(&mut CursorState),
    ) -> Result<()> {
        let current = self.require_state()?;
        if !from.contains(&current.run_status) {
            return Err(IngestError::InvalidTransition {
                from: current.run_status,
                to,
            });
        }

        let mut next = current.clone();
        mutate(&mut next);
        next.run_status = to;
        next.updated_at = Utc::now();

        self.backend.store(&next)?;
        self.state = Some(next);
        Ok(())
    }
}
