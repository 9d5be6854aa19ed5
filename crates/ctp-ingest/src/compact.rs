//! Shard compaction
//!
//! Merges the shards of one extraction run into a single consolidated
//! Parquet file. The first shard's columns define the output schema; later
//! shards are reconciled against it column by column:
//!
//! - matching column: kept
//! - same name, different type: cast to the canonical type
//! - missing column: filled with nulls
//! - extra column: dropped with a warning
//!
//! The consolidated file is written next to its final name and renamed into
//! place only when complete. Shards are never modified.

use crate::error::{IngestError, Result};
use crate::shard::{self, date_partition, SHARD_EXTENSION};
use arrow::array::{new_null_array, ArrayRef};
use arrow::compute::cast;
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Summary of a finished compaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionStats {
    pub shards: usize,
    pub rows: usize,
    pub output: PathBuf,
}

/// `<compact_root>/<YYYY-MM-DD>/studies - <YYYY-MM-DD>.parquet`
pub fn consolidated_file_path(compact_root: &Path, date: NaiveDate) -> PathBuf {
    let partition = date_partition(date);
    compact_root
        .join(&partition)
        .join(format!("studies - {}.{}", partition, SHARD_EXTENSION))
}

/// Merge every shard in `source_dir` into the consolidated file for `date`.
///
/// Returns `Ok(None)` without touching the destination when there are no
/// shards. On failure the partial output is removed and
/// [`IngestError::CompactionFailed`] names the preserved shard directory.
pub fn compact_shards(
    source_dir: &Path,
    compact_root: &Path,
    date: NaiveDate,
) -> Result<Option<CompactionStats>> {
    let shards = shard::list_shards(source_dir).map_err(|e| failed(source_dir, e))?;
    if shards.is_empty() {
        info!(source_dir = %source_dir.display(), "No shards to compact");
        return Ok(None);
    }

    let output = consolidated_file_path(compact_root, date);
    let temp_path = output.with_extension(format!("{}.tmp", SHARD_EXTENSION));

    info!(
        shards = shards.len(),
        source_dir = %source_dir.display(),
        output = %output.display(),
        "Compacting shards"
    );

    let rows = match merge_into(&shards, &temp_path).and_then(|rows| {
        fs::rename(&temp_path, &output)?;
        Ok(rows)
    }) {
        Ok(rows) => rows,
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            error!(source_dir = %source_dir.display(), error = %e, "Compaction failed, shards preserved");
            return Err(failed(source_dir, e));
        },
    };

    info!(
        shards = shards.len(),
        rows,
        output = %output.display(),
        "Compaction complete"
    );

    Ok(Some(CompactionStats {
        shards: shards.len(),
        rows,
        output,
    }))
}

fn failed(source_dir: &Path, cause: IngestError) -> IngestError {
    IngestError::CompactionFailed {
        source_dir: source_dir.to_path_buf(),
        cause: cause.to_string(),
    }
}

fn merge_into(shards: &[(u32, PathBuf)], temp_path: &Path) -> Result<usize> {
    let Some((_, first)) = shards.first() else {
        return Ok(0);
    };
    let canonical = canonical_schema(first)?;

    if let Some(parent) = temp_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(File::create(temp_path)?, canonical.clone(), Some(props))?;

    let mut rows = 0;
    for (page, path) in shards {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
        let shard_schema = builder.schema().clone();

        if shard_schema.fields() != canonical.fields() {
            let extra: Vec<&str> = shard_schema
                .fields()
                .iter()
                .map(|f| f.name().as_str())
                .filter(|name| canonical.field_with_name(name).is_err())
                .collect();
            if !extra.is_empty() {
                warn!(page, columns = ?extra, "Dropping columns absent from the first shard");
            }
            debug!(page, "Reconciling shard schema");
        }

        for batch in builder.build()? {
            let batch = reconcile(&batch?, &canonical)?;
            rows += batch.num_rows();
            writer.write(&batch)?;
        }
    }

    writer.close()?;
    Ok(rows)
}

/// First shard's fields, all nullable, without file-level metadata
fn canonical_schema(path: &Path) -> Result<SchemaRef> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let fields: Vec<Field> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone().with_nullable(true))
        .collect();

    if fields.is_empty() {
        return Err(IngestError::Schema(format!(
            "shard {} has no columns",
            path.display()
        )));
    }

    Ok(Arc::new(Schema::new(fields)))
}

/// Project `batch` onto `target`, casting or null-filling as needed
fn reconcile(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(target.fields().len());
    for field in target.fields() {
        let column = match batch.column_by_name(field.name()) {
            Some(column) if column.data_type() == field.data_type() => column.clone(),
            Some(column) => cast(column, field.data_type())?,
            None => new_null_array(field.data_type(), batch.num_rows()),
        };
        columns.push(column);
    }

    Ok(RecordBatch::try_new(target.clone(), columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array, StringArray};
    use arrow::datatypes::DataType;
    use tempfile::TempDir;

    fn write_parquet(path: &Path, batch: &RecordBatch) {
        let mut writer = ArrowWriter::try_new(File::create(path).unwrap(), batch.schema(), None).unwrap();
        writer.write(batch).unwrap();
        writer.close().unwrap();
    }

    fn utf8_batch(columns: &[(&str, Vec<Option<&str>>)]) -> RecordBatch {
        let fields: Vec<Field> = columns
            .iter()
            .map(|(name, _)| Field::new(*name, DataType::Utf8, true))
            .collect();
        let arrays: Vec<ArrayRef> = columns
            .iter()
            .map(|(_, values)| Arc::new(StringArray::from(values.clone())) as ArrayRef)
            .collect();
        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).unwrap()
    }

    fn read_all(path: &Path) -> Vec<RecordBatch> {
        ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
            .unwrap()
            .build()
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[test]
    fn test_consolidated_file_path() {
        assert_eq!(
            consolidated_file_path(Path::new("/data/compacted"), date()),
            PathBuf::from("/data/compacted/2024-05-01/studies - 2024-05-01.parquet")
        );
    }

    #[test]
    fn test_no_shards_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("shards");
        fs::create_dir_all(&source).unwrap();

        let stats = compact_shards(&source, &tmp.path().join("compacted"), date()).unwrap();
        assert!(stats.is_none());
        assert!(!tmp.path().join("compacted").exists());
    }

    #[test]
    fn test_subset_shard_is_null_filled() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("shards");
        fs::create_dir_all(&source).unwrap();

        write_parquet(
            &source.join("1.parquet"),
            &utf8_batch(&[("a", vec![Some("1"), Some("2")]), ("b", vec![Some("x"), Some("y")])]),
        );
        write_parquet(
            &source.join("2.parquet"),
            &utf8_batch(&[("a", vec![Some("3")]), ("c", vec![Some("dropped")])]),
        );

        let stats = compact_shards(&source, &tmp.path().join("compacted"), date())
            .unwrap()
            .unwrap();
        assert_eq!(stats.shards, 2);
        assert_eq!(stats.rows, 3);

        let batches = read_all(&stats.output);
        let schema = batches[0].schema();
        let names: Vec<&str> = schema.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let b_values: Vec<Option<String>> = batches
            .iter()
            .flat_map(|batch| {
                let col = batch
                    .column_by_name("b")
                    .unwrap()
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .unwrap()
                    .clone();
                (0..col.len())
                    .map(|i| (!col.is_null(i)).then(|| col.value(i).to_string()))
                    .collect::<Vec<_>>()
            })
            .collect();
        assert_eq!(
            b_values,
            vec![Some("x".to_string()), Some("y".to_string()), None]
        );
    }

    #[test]
    fn test_type_mismatch_is_cast_to_canonical_type() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("shards");
        fs::create_dir_all(&source).unwrap();

        write_parquet(&source.join("1.parquet"), &utf8_batch(&[("n", vec![Some("7")])]));
        let ints = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("n", DataType::Int64, true)])),
            vec![Arc::new(Int64Array::from(vec![Some(42)])) as ArrayRef],
        )
        .unwrap();
        write_parquet(&source.join("2.parquet"), &ints);

        let stats = compact_shards(&source, &tmp.path().join("compacted"), date())
            .unwrap()
            .unwrap();
        assert_eq!(stats.rows, 2);

        let values: Vec<String> = read_all(&stats.output)
            .iter()
            .flat_map(|batch| {
                let col = batch
                    .column(0)
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .unwrap()
                    .clone();
                (0..col.len()).map(|i| col.value(i).to_string()).collect::<Vec<_>>()
            })
            .collect();
        assert_eq!(values, vec!["7".to_string(), "42".to_string()]);
    }

    #[test]
    fn test_corrupt_shard_fails_and_preserves_shards() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("shards");
        fs::create_dir_all(&source).unwrap();

        write_parquet(&source.join("1.parquet"), &utf8_batch(&[("a", vec![Some("1")])]));
        fs::write(source.join("2.parquet"), b"not parquet").unwrap();

        let compact_root = tmp.path().join("compacted");
        let err = compact_shards(&source, &compact_root, date()).unwrap_err();
        assert!(matches!(err, IngestError::CompactionFailed { ref source_dir, .. } if source_dir == &source));

        assert!(source.join("1.parquet").exists());
        assert!(source.join("2.parquet").exists());
        let output = consolidated_file_path(&compact_root, date());
        assert!(!output.exists());
        assert!(!output.with_extension("parquet.tmp").exists());
    }
}
