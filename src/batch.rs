//! Tagged row batches and the bucket groups assembled from them.

use std::{collections::HashMap, sync::Arc};

use arrow::{datatypes::Schema, record_batch::RecordBatch};

use crate::error::MergeError;

/// Schema metadata key holding the bucket number (`-1` for single-level).
pub const BUCKET_NUM_KEY: &str = "bucket_num";
/// Schema metadata key holding the overflow flag (`"true"` / `"false"`).
pub const IS_OVERFLOWS_KEY: &str = "is_overflows";

/// Classification attached to every batch by the partial aggregation workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BatchTag {
    /// Output of a worker that did not partition its result.
    SingleLevel,
    /// Output of a worker in two-level mode, belonging to the given bucket.
    TwoLevel(u32),
    /// Rows diverted from bucketed storage after a capacity limit was hit.
    Overflow,
}

impl BatchTag {
    /// Decode the producer-side `(bucket_num, is_overflows)` pair.
    pub fn from_parts(bucket_num: i32, is_overflows: bool) -> Result<Self, MergeError> {
        match (is_overflows, bucket_num) {
            (true, -1) => Ok(BatchTag::Overflow),
            (true, other) => Err(MergeError::UnknownTag {
                key: BUCKET_NUM_KEY,
                value: other.to_string(),
            }),
            (false, -1) => Ok(BatchTag::SingleLevel),
            (false, bucket) if bucket >= 0 => Ok(BatchTag::TwoLevel(bucket as u32)),
            (false, other) => Err(MergeError::UnknownTag {
                key: BUCKET_NUM_KEY,
                value: other.to_string(),
            }),
        }
    }

    /// Encode back into the producer-side `(bucket_num, is_overflows)` pair.
    ///
    /// Fails for bucket numbers the signed producer encoding cannot hold.
    pub fn to_parts(self) -> Result<(i32, bool), MergeError> {
        match self {
            BatchTag::SingleLevel => Ok((-1, false)),
            BatchTag::TwoLevel(bucket) => i32::try_from(bucket)
                .map(|bucket_num| (bucket_num, false))
                .map_err(|_| MergeError::UnknownTag {
                    key: BUCKET_NUM_KEY,
                    value: bucket.to_string(),
                }),
            BatchTag::Overflow => Ok((-1, true)),
        }
    }
}

/// A columnar batch plus its out-of-band classification.
#[derive(Clone, Debug)]
pub struct RowBatch {
    batch: RecordBatch,
    tag: Option<BatchTag>,
}

impl RowBatch {
    /// Wrap a batch with an explicit tag.
    pub fn new(batch: RecordBatch, tag: BatchTag) -> Self {
        Self {
            batch,
            tag: Some(tag),
        }
    }

    /// Batch produced by a worker in single-level mode.
    pub fn single_level(batch: RecordBatch) -> Self {
        Self::new(batch, BatchTag::SingleLevel)
    }

    /// Batch produced by a worker in two-level mode for `bucket`.
    pub fn two_level(batch: RecordBatch, bucket: u32) -> Self {
        Self::new(batch, BatchTag::TwoLevel(bucket))
    }

    /// Overflow rows.
    pub fn overflow(batch: RecordBatch) -> Self {
        Self::new(batch, BatchTag::Overflow)
    }

    /// Batch with no classification. Feeding one to a coordinator is a protocol violation.
    pub fn untagged(batch: RecordBatch) -> Self {
        Self { batch, tag: None }
    }

    /// Read the tag from the batch's schema metadata.
    ///
    /// A batch without either metadata key is returned untagged; the
    /// coordinator rejects it when it is ingested.
    pub fn from_metadata(batch: RecordBatch) -> Result<Self, MergeError> {
        let metadata = batch.schema_ref().metadata();
        let bucket = metadata.get(BUCKET_NUM_KEY);
        let overflow = metadata.get(IS_OVERFLOWS_KEY);
        if bucket.is_none() && overflow.is_none() {
            return Ok(Self::untagged(batch));
        }

        let bucket_num = match bucket {
            Some(value) => value.parse::<i32>().map_err(|_| MergeError::UnknownTag {
                key: BUCKET_NUM_KEY,
                value: value.clone(),
            })?,
            None => -1,
        };
        let is_overflows = match overflow.map(String::as_str) {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(MergeError::UnknownTag {
                    key: IS_OVERFLOWS_KEY,
                    value: other.to_string(),
                })
            }
        };
        let tag = BatchTag::from_parts(bucket_num, is_overflows)?;
        Ok(Self::new(batch, tag))
    }

    /// Return the inner batch with its tag written into the schema metadata.
    pub fn into_metadata_batch(self) -> Result<RecordBatch, MergeError> {
        let Some(tag) = self.tag else {
            return Ok(self.batch);
        };
        let (bucket_num, is_overflows) = tag.to_parts()?;
        let schema = self.batch.schema();
        let mut metadata: HashMap<String, String> = schema.metadata().clone();
        metadata.insert(BUCKET_NUM_KEY.to_string(), bucket_num.to_string());
        metadata.insert(IS_OVERFLOWS_KEY.to_string(), is_overflows.to_string());
        let schema = Arc::new(Schema::new_with_metadata(schema.fields().clone(), metadata));
        Ok(self.batch.with_schema(schema)?)
    }

    /// Classification tag, if any.
    pub fn tag(&self) -> Option<BatchTag> {
        self.tag
    }

    /// Borrow the columnar data.
    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    /// Number of rows in the batch.
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Split into data and tag.
    pub fn into_parts(self) -> (RecordBatch, Option<BatchTag>) {
        (self.batch, self.tag)
    }
}

/// Identity shared by all batches of one emitted group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GroupKind {
    /// A numbered two-level bucket.
    Bucket(u32),
    /// Everything from a run that never switched to two-level mode.
    SingleLevel,
    /// All overflow rows.
    Overflow,
}

impl GroupKind {
    /// Tag carried by the merged batch produced from a group of this kind.
    pub fn output_tag(self) -> BatchTag {
        match self {
            GroupKind::Bucket(bucket) => BatchTag::TwoLevel(bucket),
            GroupKind::SingleLevel => BatchTag::SingleLevel,
            GroupKind::Overflow => BatchTag::Overflow,
        }
    }
}

/// Batches from every producer that share one bucket (or the overflow set).
///
/// Batch order inside a group carries no meaning.
#[derive(Debug)]
pub struct BucketGroup {
    kind: GroupKind,
    batches: Vec<RecordBatch>,
}

impl BucketGroup {
    pub(crate) fn new(kind: GroupKind, batches: Vec<RecordBatch>) -> Self {
        Self { kind, batches }
    }

    /// Group identity.
    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    /// Batches in the group.
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Total rows across all batches.
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(RecordBatch::num_rows).sum()
    }

    /// Take ownership of the batches.
    pub fn into_batches(self) -> Vec<RecordBatch> {
        self.batches
    }
}
