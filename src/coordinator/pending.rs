//! Buffered batches awaiting emission, keyed by their eventual group.

use std::collections::BTreeMap;

use arrow::record_batch::RecordBatch;

use crate::{
    error::MergeError,
    partition::{split_into_buckets, BucketPartitioner},
};

#[derive(Debug, Default)]
pub(crate) struct PendingBatches {
    by_bucket: BTreeMap<u32, Vec<RecordBatch>>,
    single_level: Vec<RecordBatch>,
    overflow: Vec<RecordBatch>,
}

impl PendingBatches {
    pub(crate) fn push_bucket(&mut self, bucket: u32, batch: RecordBatch) {
        if batch.num_rows() > 0 {
            self.by_bucket.entry(bucket).or_default().push(batch);
        }
    }

    pub(crate) fn push_single_level(&mut self, batch: RecordBatch) {
        if batch.num_rows() > 0 {
            self.single_level.push(batch);
        }
    }

    pub(crate) fn push_overflow(&mut self, batch: RecordBatch) {
        if batch.num_rows() > 0 {
            self.overflow.push(batch);
        }
    }

    pub(crate) fn has_single_level(&self) -> bool {
        !self.single_level.is_empty()
    }

    pub(crate) fn first_bucket(&self) -> Option<u32> {
        self.by_bucket.keys().next().copied()
    }

    pub(crate) fn has_buckets(&self) -> bool {
        !self.by_bucket.is_empty()
    }

    /// Re-home one buffered single-level batch into bucket form.
    ///
    /// Rows landing below `min_bucket` belong to a bucket that was already
    /// emitted, which only happens when a producer mixes modes.
    pub(crate) fn promote_one(
        &mut self,
        key_columns: usize,
        partitioner: &dyn BucketPartitioner,
        min_bucket: u32,
    ) -> Result<usize, MergeError> {
        let Some(batch) = self.single_level.last() else {
            return Ok(0);
        };
        let parts = split_into_buckets(batch, key_columns, partitioner)?;
        // Parts come in ascending bucket order, so the first one is the lowest.
        if let Some(&(bucket, _)) = parts.first() {
            if bucket < min_bucket {
                return Err(MergeError::LateSingleLevel { bucket });
            }
        }
        self.single_level.pop();
        let produced = parts.len();
        for (bucket, part) in parts {
            self.push_bucket(bucket, part);
        }
        Ok(produced)
    }

    pub(crate) fn take_first_bucket(&mut self) -> Option<(u32, Vec<RecordBatch>)> {
        self.by_bucket.pop_first()
    }

    pub(crate) fn take_single_level(&mut self) -> Option<Vec<RecordBatch>> {
        (!self.single_level.is_empty()).then(|| std::mem::take(&mut self.single_level))
    }

    pub(crate) fn take_overflow(&mut self) -> Option<Vec<RecordBatch>> {
        (!self.overflow.is_empty()).then(|| std::mem::take(&mut self.overflow))
    }

    /// Drop everything, returning how many batches were discarded.
    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.by_bucket.values().map(Vec::len).sum::<usize>()
            + self.single_level.len()
            + self.overflow.len();
        self.by_bucket.clear();
        self.single_level.clear();
        self.overflow.clear();
        dropped
    }
}
