//! Full-buffering coordinator for inputs known to fit in memory.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use futures_util::{
    future::{self, BoxFuture},
    FutureExt,
};

use super::{pending::PendingBatches, CoordinatorStats};
use crate::{
    batch::{BatchTag, BucketGroup, GroupKind, RowBatch},
    error::MergeError,
    executor::{Processor, Status},
    partition::BucketPartitioner,
    port::{InputPort, OutputPort, Pull},
};

/// Coordinator that buffers every producer to end of stream before emitting.
///
/// Emits the same groups in the same order as
/// [`BucketCoordinator`](super::BucketCoordinator) but holds the whole input
/// in memory, so it is only suitable when the partial results are known to
/// be small.
pub struct SortingCoordinator {
    inputs: Vec<InputPort<RowBatch>>,
    output: OutputPort<BucketGroup>,
    key_columns: usize,
    partitioner: Arc<dyn BucketPartitioner>,
    pending: PendingBatches,
    two_level: bool,
    inputs_drained: bool,
    stats: CoordinatorStats,
}

impl SortingCoordinator {
    /// Build a coordinator over `inputs`; `key_columns` and `partitioner`
    /// are used only to promote single-level batches.
    pub fn new(
        inputs: Vec<InputPort<RowBatch>>,
        output: OutputPort<BucketGroup>,
        key_columns: usize,
        partitioner: Arc<dyn BucketPartitioner>,
    ) -> Self {
        Self {
            inputs,
            output,
            key_columns,
            partitioner,
            pending: PendingBatches::default(),
            two_level: false,
            inputs_drained: false,
            stats: CoordinatorStats::default(),
        }
    }

    /// Counters.
    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    fn ingest(&mut self, row_batch: RowBatch, producer: usize) -> Result<(), MergeError> {
        let (batch, tag) = row_batch.into_parts();
        self.stats.batches_ingested += 1;
        match tag.ok_or(MergeError::MissingTag { producer })? {
            BatchTag::Overflow => self.pending.push_overflow(batch),
            BatchTag::SingleLevel => self.pending.push_single_level(batch),
            BatchTag::TwoLevel(bucket) => {
                let bucket_count = self.partitioner.bucket_count();
                if bucket >= bucket_count {
                    return Err(MergeError::BucketOutOfRange {
                        producer,
                        bucket,
                        bucket_count,
                    });
                }
                self.two_level = true;
                self.pending.push_bucket(bucket, batch);
            }
        }
        Ok(())
    }

    /// Drain everything currently available. Returns `true` once all inputs ended.
    fn drain_inputs(&mut self) -> Result<bool, MergeError> {
        let mut open = false;
        for producer in 0..self.inputs.len() {
            loop {
                match self.inputs[producer].try_pull() {
                    Pull::Ready(batch) => self.ingest(batch, producer)?,
                    Pull::Empty => {
                        open = true;
                        break;
                    }
                    Pull::Finished => break,
                }
            }
        }
        Ok(!open)
    }

    fn push_group(&mut self, kind: GroupKind, batches: Vec<RecordBatch>) {
        let rows = batches.iter().map(|batch| batch.num_rows() as u64).sum::<u64>();
        if self.output.push(BucketGroup::new(kind, batches)).is_ok() {
            match kind {
                GroupKind::Bucket(_) => self.stats.bucket_groups += 1,
                GroupKind::SingleLevel => self.stats.single_level_groups += 1,
                GroupKind::Overflow => self.stats.overflow_groups += 1,
            }
            self.stats.rows_emitted += rows;
        }
    }
}

impl Processor for SortingCoordinator {
    fn name(&self) -> &'static str {
        "sorting_coordinator"
    }

    fn step(&mut self) -> Result<Status, MergeError> {
        if self.output.is_finished() {
            self.inputs.iter_mut().for_each(InputPort::close);
            self.pending.clear();
            return Ok(Status::Done);
        }
        if !self.inputs_drained {
            self.inputs_drained = self.drain_inputs()?;
            if !self.inputs_drained {
                return Ok(Status::NeedsInput);
            }
        }
        if self.two_level && self.pending.has_single_level() {
            return Ok(Status::ReadyToRun);
        }
        if !self.output.can_push() {
            return Ok(Status::OutputBlocked);
        }

        if let Some((bucket, batches)) = self.pending.take_first_bucket() {
            self.push_group(GroupKind::Bucket(bucket), batches);
            return Ok(Status::OutputBlocked);
        }
        if let Some(batches) = self.pending.take_single_level() {
            self.push_group(GroupKind::SingleLevel, batches);
            return Ok(Status::OutputBlocked);
        }
        if let Some(batches) = self.pending.take_overflow() {
            self.push_group(GroupKind::Overflow, batches);
            return Ok(Status::OutputBlocked);
        }
        self.output.finish();
        Ok(Status::Done)
    }

    fn wait(&mut self, status: Status) -> BoxFuture<'_, ()> {
        if status == Status::OutputBlocked {
            return self.output.ready().boxed();
        }
        let ready: Vec<_> = self
            .inputs
            .iter_mut()
            .filter(|input| !input.is_finished())
            .map(|input| input.ready().boxed())
            .collect();
        if ready.is_empty() {
            return future::ready(()).boxed();
        }
        future::select_all(ready).map(|_| ()).boxed()
    }

    fn work(&mut self) -> Result<(), MergeError> {
        self.pending
            .promote_one(self.key_columns, self.partitioner.as_ref(), 0)?;
        self.stats.batches_promoted += 1;
        Ok(())
    }
}
