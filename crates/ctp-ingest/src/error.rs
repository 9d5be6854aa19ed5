//! Error types for CTP ingestion

use crate::state::RunStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error taxonomy for the extraction, compaction and normalization phases
///
/// Page- and file-level variants carry the page number or path they failed
/// on so the pipeline driver can log them before halting the phase.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Cursor state cannot be determined; an operator must seed it
    #[error("Extraction state could not be determined: {0}. Run 'ctp-ingest seed-state' to initialize it.")]
    MissingState(String),

    /// Request for a page failed after exhausting retries
    #[error("Request failed on page {page}: {detail}")]
    RequestFailed { page: u32, detail: String },

    /// A successful response carried no continuation token
    #[error("Next page token not found on page {page}")]
    NextPageMissing { page: u32 },

    /// Merging shards failed; the shards are left in place
    #[error("File compaction failed: {cause}. Shards preserved at: {}", source_dir.display())]
    CompactionFailed { source_dir: PathBuf, cause: String },

    /// A shard for this page already exists; shards are never replaced
    #[error("Shard already exists: {}", path.display())]
    ShardExists { path: PathBuf },

    /// A fresh run would write into a partition holding another run's shards
    #[error("Shard directory {} already holds {shards} shard(s) from an earlier run. Move or remove them before starting a fresh run.", dir.display())]
    PartitionOccupied { dir: PathBuf, shards: u32 },

    /// Cursor transition not allowed from the current run status
    #[error("Invalid cursor transition from {from} to {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    /// Pipeline invoked with every phase disabled
    #[error("No pipeline phase selected; enable extraction or transform-and-load")]
    NoPhaseSelected,

    #[error("Configuration error: {0}")]
    Config(String),

    /// Columnar file does not have the expected shape
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Load failed: {0}")]
    Load(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IngestError {
    /// Page number the error refers to, if any
    pub fn page(&self) -> Option<u32> {
        match self {
            IngestError::RequestFailed { page, .. } | IngestError::NextPageMissing { page } => {
                Some(*page)
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_level_errors_expose_page() {
        let err = IngestError::RequestFailed {
            page: 7,
            detail: "HTTP 503".to_string(),
        };
        assert_eq!(err.page(), Some(7));
        assert_eq!(err.to_string(), "Request failed on page 7: HTTP 503");

        assert_eq!(IngestError::NextPageMissing { page: 3 }.page(), Some(3));
        assert_eq!(IngestError::NoPhaseSelected.page(), None);
    }

    #[test]
    fn test_compaction_error_names_preserved_path() {
        let err = IngestError::CompactionFailed {
            source_dir: PathBuf::from("/data/shards/2024-05-01"),
            cause: "cast failed".to_string(),
        };
        assert!(err.to_string().contains("/data/shards/2024-05-01"));
        assert!(err.to_string().contains("cast failed"));
    }

    #[test]
    fn test_occupied_partition_names_directory() {
        let err = IngestError::PartitionOccupied {
            dir: PathBuf::from("/data/shards/2024-05-01"),
            shards: 2,
        };
        assert!(err.to_string().contains("/data/shards/2024-05-01"));
        assert_eq!(err.page(), None);
    }
}
