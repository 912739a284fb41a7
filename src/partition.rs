//! Key to bucket assignment shared with the two-level producers.

use std::fmt;

use arrow::{
    array::{ArrayRef, UInt32Array},
    compute::take_record_batch,
    datatypes::DataType,
    error::ArrowError,
    record_batch::RecordBatch,
    row::{RowConverter, SortField},
};

/// Deterministic mapping from group keys to bucket numbers.
///
/// The numbering must match the one used by the workers that produced the
/// two-level batches; otherwise one logical bucket is split across groups.
pub trait BucketPartitioner: fmt::Debug + Send + Sync {
    /// Number of buckets; every assigned bucket is below this value.
    fn bucket_count(&self) -> u32;

    /// Assign a bucket to every row of the given key columns.
    fn partition(&self, keys: &[ArrayRef]) -> Result<Vec<u32>, ArrowError>;
}

/// Hashes the row-encoded group key with CRC32.
pub struct HashBucketPartitioner {
    bucket_count: u32,
    converter: RowConverter,
}

impl HashBucketPartitioner {
    /// Build a partitioner for keys of the given types.
    pub fn try_new(key_types: &[DataType], bucket_count: u32) -> Result<Self, ArrowError> {
        let converter = RowConverter::new(
            key_types
                .iter()
                .map(|data_type| SortField::new(data_type.clone()))
                .collect(),
        )?;
        Ok(Self {
            bucket_count: bucket_count.max(1),
            converter,
        })
    }

    /// Bucket of a single row-encoded key.
    pub fn bucket_of(&self, encoded_key: &[u8]) -> u32 {
        crc32fast::hash(encoded_key) % self.bucket_count
    }
}

impl fmt::Debug for HashBucketPartitioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashBucketPartitioner")
            .field("bucket_count", &self.bucket_count)
            .finish()
    }
}

impl BucketPartitioner for HashBucketPartitioner {
    fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    fn partition(&self, keys: &[ArrayRef]) -> Result<Vec<u32>, ArrowError> {
        if keys.is_empty() {
            return Err(ArrowError::InvalidArgumentError(
                "hash partitioning requires at least one key column".to_string(),
            ));
        }
        let rows = self.converter.convert_columns(keys)?;
        Ok(rows
            .iter()
            .map(|row| self.bucket_of(row.as_ref()))
            .collect())
    }
}

/// Explode a batch into per-bucket sub-batches, ordered by bucket number.
///
/// The first `key_columns` columns are handed to the partitioner.
pub fn split_into_buckets(
    batch: &RecordBatch,
    key_columns: usize,
    partitioner: &dyn BucketPartitioner,
) -> Result<Vec<(u32, RecordBatch)>, ArrowError> {
    if batch.num_rows() == 0 {
        return Ok(Vec::new());
    }
    if key_columns == 0 {
        // Without keys every row is the same group; bucket 0 keeps it whole.
        return Ok(vec![(0, batch.clone())]);
    }
    let buckets = partitioner.partition(&batch.columns()[..key_columns])?;

    let mut indices: Vec<Vec<u32>> = vec![Vec::new(); partitioner.bucket_count() as usize];
    for (row, bucket) in buckets.into_iter().enumerate() {
        let slot = indices.get_mut(bucket as usize).ok_or_else(|| {
            ArrowError::InvalidArgumentError(format!(
                "partitioner assigned bucket {bucket} outside of {} buckets",
                partitioner.bucket_count()
            ))
        })?;
        slot.push(row as u32);
    }

    let mut parts = Vec::new();
    for (bucket, rows) in indices.into_iter().enumerate() {
        if rows.is_empty() {
            continue;
        }
        let part = if rows.len() == batch.num_rows() {
            batch.clone()
        } else {
            take_record_batch(batch, &UInt32Array::from(rows))?
        };
        parts.push((bucket as u32, part));
    }
    Ok(parts)
}
