//! Per-page shard files
//!
//! Every fetched page becomes one immutable Parquet file named by its page
//! number under a date-partitioned directory:
//! `<shard_root>/<YYYY-MM-DD>/<page>.parquet`.
//!
//! Shards hold one row per record and one nullable Utf8 column per top-level
//! record key, each cell carrying the JSON text of the value. The page number
//! and the continuation token returned with the page are stored in the file's
//! key-value metadata, so the last shard on disk is enough to resume.

use crate::error::{IngestError, Result};
use crate::state::{CursorStore, StateBackend};
use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::metadata::KeyValue;
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File extension of shard and consolidated files
pub const SHARD_EXTENSION: &str = "parquet";

/// Record column holding the protocol section of a study
pub const PROTOCOL_SECTION: &str = "protocolSection";

pub const PAGE_NUMBER_KEY: &str = "ctp.page_number";
pub const NEXT_PAGE_TOKEN_KEY: &str = "ctp.next_page_token";

/// Directory name for a calendar date partition
pub fn date_partition(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Writes page responses as shards into one directory
#[derive(Debug, Clone)]
pub struct ShardWriter {
    dir: PathBuf,
}

impl ShardWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Writer for the `<root>/<YYYY-MM-DD>` partition
    pub fn for_date(root: &Path, date: NaiveDate) -> Self {
        Self::new(root.join(date_partition(date)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn shard_path(&self, page: u32) -> PathBuf {
        self.dir.join(format!("{}.{}", page, SHARD_EXTENSION))
    }

    /// Persist one page's records as shard `page`.
    ///
    /// The shard directory is recorded in the cursor before the file is
    /// written, and the file appears under its final name only once it is
    /// complete. An existing shard for `page` is never replaced:
    /// [`IngestError::ShardExists`].
    pub fn save_response<B: StateBackend>(
        &self,
        page: u32,
        records: &[Value],
        next_token: Option<&str>,
        store: &mut CursorStore<B>,
    ) -> Result<PathBuf> {
        let path = self.shard_path(page);
        if path.exists() {
            return Err(IngestError::ShardExists { path });
        }

        fs::create_dir_all(&self.dir)?;
        store.record_shard_dir(&self.dir)?;

        let batch = records_to_batch(records)?;
        let temp_path = path.with_extension(format!("{}.tmp", SHARD_EXTENSION));

        if let Err(e) = write_shard(&temp_path, &batch, page, next_token) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        fs::rename(&temp_path, &path)?;

        info!(
            page,
            rows = batch.num_rows(),
            columns = batch.num_columns(),
            path = %path.display(),
            "Saved shard"
        );

        Ok(path)
    }
}

fn write_shard(path: &Path, batch: &RecordBatch, page: u32, next_token: Option<&str>) -> Result<()> {
    let mut metadata = vec![KeyValue {
        key: PAGE_NUMBER_KEY.to_string(),
        value: Some(page.to_string()),
    }];
    if let Some(token) = next_token {
        metadata.push(KeyValue {
            key: NEXT_PAGE_TOKEN_KEY.to_string(),
            value: Some(token.to_string()),
        });
    }

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .set_key_value_metadata(Some(metadata))
        .build();

    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

/// Build a record batch with one JSON-text column per top-level key.
///
/// Records that are not JSON objects are skipped.
pub fn records_to_batch(records: &[Value]) -> Result<RecordBatch> {
    let objects: Vec<_> = records
        .iter()
        .enumerate()
        .filter_map(|(idx, record)| match record.as_object() {
            Some(object) => Some(object),
            None => {
                warn!(index = idx, "Record is not a JSON object, skipping");
                None
            },
        })
        .collect();

    let mut keys: BTreeSet<&str> = objects
        .iter()
        .flat_map(|object| object.keys().map(String::as_str))
        .collect();
    if keys.is_empty() {
        keys.insert(PROTOCOL_SECTION);
    }

    let mut fields = Vec::with_capacity(keys.len());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(keys.len());
    for key in keys {
        let cells = objects
            .iter()
            .map(|object| match object.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(value) => serde_json::to_string(value).map(Some),
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        fields.push(Field::new(key, DataType::Utf8, true));
        columns.push(Arc::new(StringArray::from(cells)));
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}

/// Shards in `dir` as `(page, path)`, ordered by page number
pub fn list_shards(dir: &Path) -> Result<Vec<(u32, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut shards = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SHARD_EXTENSION) {
            continue;
        }

        match path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u32>().ok())
        {
            Some(page) => shards.push((page, path)),
            None => debug!(path = %path.display(), "Ignoring non-shard parquet file"),
        }
    }

    shards.sort_by_key(|(page, _)| *page);
    Ok(shards)
}

/// Number of shards in `dir`; a missing directory holds none
pub fn count_shards(dir: &Path) -> Result<u32> {
    Ok(list_shards(dir)?.len() as u32)
}

/// Continuation token stored with the highest-numbered shard in `dir`
pub fn last_shard_token(dir: &Path) -> Result<Option<String>> {
    let Some((page, path)) = list_shards(dir)?.pop() else {
        return Ok(None);
    };

    let token = read_metadata_value(&path, NEXT_PAGE_TOKEN_KEY)?;
    debug!(page, has_token = token.is_some(), "Read token from last shard");
    Ok(token)
}

fn read_metadata_value(path: &Path, key: &str) -> Result<Option<String>> {
    let reader = SerializedFileReader::new(File::open(path)?)?;
    let value = reader
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .and_then(|entries| entries.iter().find(|kv| kv.key == key))
        .and_then(|kv| kv.value.clone());
    Ok(value)
}
