//! Error taxonomy for the merge stage.

use arrow::{datatypes::DataType, error::ArrowError};
use thiserror::Error;

/// Errors that abort a merge pipeline.
///
/// Every variant except [`MergeError::Arrow`] and [`MergeError::Join`] is a
/// protocol violation by an upstream producer: the data is too entangled with
/// later buckets to skip, so nothing is retried locally.
#[derive(Debug, Error)]
pub enum MergeError {
    /// A batch arrived without a classification tag.
    #[error("batch from producer {producer} carries no classification tag")]
    MissingTag {
        /// Index of the producer that sent the batch.
        producer: usize,
    },
    /// A metadata-encoded tag could not be decoded.
    #[error("unrecognized classification tag {key}={value:?}")]
    UnknownTag {
        /// Metadata key that held the value.
        key: &'static str,
        /// Raw metadata value.
        value: String,
    },
    /// A producer went back to a smaller bucket number than it already reported.
    #[error("producer {producer} regressed from bucket {last} to bucket {bucket}")]
    BucketRegression {
        /// Index of the offending producer.
        producer: usize,
        /// Bucket the producer reported previously.
        last: u32,
        /// Bucket carried by the new batch.
        bucket: u32,
    },
    /// A bucket number outside `[0, bucket_count)` was reported.
    #[error("producer {producer} reported bucket {bucket}, but only {bucket_count} buckets exist")]
    BucketOutOfRange {
        /// Index of the offending producer.
        producer: usize,
        /// Bucket carried by the batch.
        bucket: u32,
        /// Number of buckets known to the partitioner.
        bucket_count: u32,
    },
    /// Re-deriving a row's bucket disagreed with the producer's bucket number.
    #[error("producer {producer} tagged bucket {declared} but a row hashes to bucket {derived}")]
    BucketMismatch {
        /// Index of the offending producer.
        producer: usize,
        /// Bucket carried by the batch.
        declared: u32,
        /// Bucket the partitioner assigns to the first disagreeing row.
        derived: u32,
    },
    /// Single-level rows were promoted into a bucket that was already emitted.
    #[error("single-level rows for bucket {bucket} arrived after the bucket was emitted")]
    LateSingleLevel {
        /// Bucket the promoted rows hash to.
        bucket: u32,
    },
    /// A batch does not match the aggregate layout.
    #[error("batch column {column} has type {actual:?}, expected {expected:?}")]
    SchemaMismatch {
        /// Column position.
        column: usize,
        /// Type the layout expects.
        expected: DataType,
        /// Type found in the batch.
        actual: DataType,
    },
    /// A batch has the wrong number of columns for the aggregate layout.
    #[error("batch has {actual} columns, expected {expected}")]
    ColumnCount {
        /// Column count the layout expects.
        expected: usize,
        /// Column count found in the batch.
        actual: usize,
    },
    /// Arrow kernel failure while splitting or folding batches.
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
    /// A pipeline task panicked or was cancelled.
    #[error("merge task failed: {0}")]
    Join(String),
}

impl MergeError {
    /// `true` for errors caused by malformed upstream data.
    pub fn is_protocol_violation(&self) -> bool {
        !matches!(self, MergeError::Arrow(_) | MergeError::Join(_))
    }
}
