//! Table loaders
//!
//! A loader receives the normalized tables as named batches, already in load
//! order, and writes them to a destination as one unit: either every table
//! lands or none does. Destination schemas are expected to exist.

use crate::error::{IngestError, Result};
use crate::normalize::TableBatch;
use async_trait::async_trait;
use serde_jsonlines::JsonLinesWriter;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

#[cfg(feature = "database")]
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};

/// Rows inserted per statement by the database loader
pub const LOAD_CHUNK_SIZE: usize = 1000;

/// Rows written by one load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub tables: Vec<(&'static str, usize)>,
}

impl LoadStats {
    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(|(_, rows)| rows).sum()
    }

    pub fn rows_for(&self, table: &str) -> Option<usize> {
        self.tables
            .iter()
            .find(|(name, _)| *name == table)
            .map(|(_, rows)| *rows)
    }
}

/// Destination for normalized tables
#[async_trait]
pub trait TableLoader: Send + Sync {
    /// Load `batches` in the given order as a single unit
    async fn load(&self, batches: &[TableBatch]) -> Result<LoadStats>;

    /// Human-readable destination, for logs
    fn destination(&self) -> String;
}

// ============================================================================
// JSON lines
// ============================================================================

/// Writes one `<table>.jsonl` file per table.
///
/// Empty tables still get an empty file, so a directory reused across loads
/// never keeps rows from an earlier one.
#[derive(Debug, Clone)]
pub struct JsonLinesLoader {
    output_dir: PathBuf,
}

impl JsonLinesLoader {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.output_dir.join(format!("{}.jsonl", table))
    }

    fn stage(&self, batches: &[TableBatch], staged: &mut Vec<(PathBuf, PathBuf)>) -> Result<LoadStats> {
        let mut stats = LoadStats::default();

        for batch in batches {
            if batch.is_empty() {
                debug!(table = batch.name, "Writing empty table");
            }

            let path = self.table_path(batch.name);
            let temp_path = path.with_extension("jsonl.tmp");
            staged.push((temp_path.clone(), path));

            write_rows(&temp_path, batch).map_err(|e| {
                IngestError::Load(format!("table {}: {}", batch.name, e))
            })?;
            stats.tables.push((batch.name, batch.len()));
        }

        Ok(stats)
    }
}

fn write_rows(path: &Path, batch: &TableBatch) -> std::io::Result<()> {
    let mut writer = JsonLinesWriter::new(BufWriter::new(File::create(path)?));
    for row in &batch.rows {
        writer.write(row)?;
    }
    writer.flush()
}

#[async_trait]
impl TableLoader for JsonLinesLoader {
    async fn load(&self, batches: &[TableBatch]) -> Result<LoadStats> {
        fs::create_dir_all(&self.output_dir)?;

        let mut staged = Vec::new();
        let stats = match self.stage(batches, &mut staged) {
            Ok(stats) => stats,
            Err(e) => {
                for (temp_path, _) in &staged {
                    let _ = fs::remove_file(temp_path);
                }
                error!(output_dir = %self.output_dir.display(), error = %e, "Load failed, nothing written");
                return Err(e);
            },
        };

        for (temp_path, path) in &staged {
            fs::rename(temp_path, path)?;
        }

        info!(
            output_dir = %self.output_dir.display(),
            tables = stats.tables.len(),
            rows = stats.total_rows(),
            "Loaded tables as JSON lines"
        );
        Ok(stats)
    }

    fn destination(&self) -> String {
        self.output_dir.display().to_string()
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

/// Inserts every table inside one transaction
#[cfg(feature = "database")]
pub struct PostgresLoader {
    db: PgPool,
}

#[cfg(feature = "database")]
impl PostgresLoader {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self::new(db))
    }

    /// Insert one table in chunks; columns are matched by name through the
    /// table's own row type
    async fn insert_table(tx: &mut Transaction<'_, Postgres>, batch: &TableBatch) -> Result<usize> {
        let statement = format!(
            "INSERT INTO {table} SELECT * FROM jsonb_populate_recordset(NULL::{table}, $1)",
            table = batch.name
        );

        let mut inserted = 0;
        for chunk in batch.rows.chunks(LOAD_CHUNK_SIZE) {
            sqlx::query(&statement)
                .bind(sqlx::types::Json(chunk))
                .execute(&mut **tx)
                .await?;
            inserted += chunk.len();
            debug!(table = batch.name, inserted, "Inserted chunk");
        }

        Ok(inserted)
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl TableLoader for PostgresLoader {
    async fn load(&self, batches: &[TableBatch]) -> Result<LoadStats> {
        let mut tx = self.db.begin().await?;
        let mut stats = LoadStats::default();

        for batch in batches.iter().filter(|b| !b.is_empty()) {
            match Self::insert_table(&mut tx, batch).await {
                Ok(rows) => stats.tables.push((batch.name, rows)),
                Err(e) => {
                    error!(table = batch.name, error = %e, "Load failed, rolling back");
                    tx.rollback().await?;
                    return Err(e);
                },
            }
        }

        tx.commit().await?;

        info!(
            tables = stats.tables.len(),
            rows = stats.total_rows(),
            "Loaded tables into PostgreSQL"
        );
        Ok(stats)
    }

    fn destination(&self) -> String {
        "postgres".to_string()
    }
}
