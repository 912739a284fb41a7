//! Grouping of partially aggregated batches into per-bucket merge units.
//!
//! [`BucketCoordinator`] reads tagged batches from N producers and hands out
//! one [`BucketGroup`] per bucket as soon as no producer can still contribute
//! to it. Producers in two-level mode send buckets in non-decreasing order,
//! so bucket `b` is complete once every open producer reported a bucket past
//! `b`. Single-level batches are promoted into buckets as soon as any
//! producer turns out to be two-level; if none ever does they are emitted as
//! one group at the end, followed by the overflow rows.

mod pending;
mod sorting;

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use futures_util::{
    future::{self, BoxFuture},
    FutureExt,
};
use pending::PendingBatches;
pub use sorting::SortingCoordinator;

use crate::{
    batch::{BatchTag, BucketGroup, GroupKind, RowBatch},
    error::MergeError,
    executor::{Processor, Status},
    logging::{merge_log, LogContext},
    option::MergeOptions,
    partition::BucketPartitioner,
    port::{InputPort, OutputPort, Pull},
};

/// Aggregation mode observed across all producers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// No batch classified yet.
    Undetermined,
    /// Only single-level (and overflow) batches seen so far.
    SingleLevel,
    /// At least one two-level batch seen; never reverts.
    TwoLevel,
}

/// Counters describing what a coordinator has done so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Tagged batches read from producers.
    pub batches_ingested: u64,
    /// Single-level batches re-homed into buckets.
    pub batches_promoted: u64,
    /// Numbered bucket groups emitted.
    pub bucket_groups: u64,
    /// Single-level groups emitted (zero or one).
    pub single_level_groups: u64,
    /// Overflow groups emitted (zero or one).
    pub overflow_groups: u64,
    /// Rows handed downstream across all groups.
    pub rows_emitted: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct ProducerState {
    last_bucket: Option<u32>,
    has_delivered: bool,
    is_finished: bool,
}

/// N-input, 1-output step machine assembling bucket groups.
pub struct BucketCoordinator {
    inputs: Vec<InputPort<RowBatch>>,
    output: OutputPort<BucketGroup>,
    producers: Vec<ProducerState>,
    key_columns: usize,
    partitioner: Arc<dyn BucketPartitioner>,
    expect_several_batches_per_bucket: bool,
    verify_bucket_assignment: bool,
    pending: PendingBatches,
    mode: Mode,
    probed_all: bool,
    waiting_on: Vec<usize>,
    current_bucket: u32,
    next_bucket_to_emit: u32,
    all_producers_finished: bool,
    stats: CoordinatorStats,
    ctx: LogContext,
}

impl BucketCoordinator {
    /// Build a coordinator reading from `inputs` and emitting into `output`.
    ///
    /// `key_columns` leading columns of every batch are the group-by keys;
    /// `partitioner` must number buckets exactly as the producers do.
    pub fn new(
        inputs: Vec<InputPort<RowBatch>>,
        output: OutputPort<BucketGroup>,
        key_columns: usize,
        partitioner: Arc<dyn BucketPartitioner>,
        options: &MergeOptions,
    ) -> Self {
        let producers = vec![ProducerState::default(); inputs.len()];
        Self {
            inputs,
            output,
            producers,
            key_columns,
            partitioner,
            expect_several_batches_per_bucket: options.expect_several_batches_per_bucket,
            verify_bucket_assignment: options.verify_bucket_assignment,
            pending: PendingBatches::default(),
            mode: Mode::Undetermined,
            probed_all: false,
            waiting_on: Vec::new(),
            current_bucket: 0,
            next_bucket_to_emit: 0,
            all_producers_finished: false,
            stats: CoordinatorStats::default(),
            ctx: LogContext::new(""),
        }
    }

    pub(crate) fn with_log_context(mut self, ctx: LogContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Mode observed so far.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Smallest bucket not yet known to be complete.
    pub fn current_bucket(&self) -> u32 {
        self.current_bucket
    }

    /// Counters.
    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    /// Highest bucket reported by `producer`, if it sent any two-level data.
    pub fn last_bucket_seen(&self, producer: usize) -> Option<u32> {
        self.producers.get(producer).and_then(|state| state.last_bucket)
    }

    fn needs_input(&self, producer: usize) -> bool {
        match self.producers[producer].last_bucket {
            None => true,
            Some(last) if last < self.current_bucket => true,
            Some(last) => self.expect_several_batches_per_bucket && last == self.current_bucket,
        }
    }

    fn promotion_pending(&self) -> bool {
        self.mode == Mode::TwoLevel && self.pending.has_single_level()
    }

    fn mark_finished(&mut self, producer: usize) {
        let state = &mut self.producers[producer];
        if !state.is_finished {
            state.is_finished = true;
            merge_log!(
                log::Level::Trace,
                ctx: self.ctx,
                "producer_finished",
                "producer={} last_bucket={:?}",
                producer,
                state.last_bucket
            );
        }
    }

    /// Read one batch from every producer that has not delivered yet.
    fn probe_inputs(&mut self) -> Result<(), MergeError> {
        let mut waiting = false;
        for producer in 0..self.inputs.len() {
            let state = self.producers[producer];
            if state.is_finished || state.has_delivered {
                continue;
            }
            match self.inputs[producer].try_pull() {
                Pull::Ready(batch) => self.ingest(batch, producer)?,
                Pull::Empty => {
                    self.waiting_on.push(producer);
                    waiting = true;
                }
                Pull::Finished => self.mark_finished(producer),
            }
        }
        self.probed_all = !waiting;
        if self.probed_all {
            merge_log!(
                log::Level::Debug,
                ctx: self.ctx,
                "producers_probed",
                "producers={} mode={:?}",
                self.inputs.len(),
                self.mode
            );
        }
        Ok(())
    }

    fn ingest(&mut self, row_batch: RowBatch, producer: usize) -> Result<(), MergeError> {
        let (batch, tag) = row_batch.into_parts();
        let tag = tag.ok_or(MergeError::MissingTag { producer })?;
        self.producers[producer].has_delivered = true;
        self.stats.batches_ingested += 1;

        match tag {
            BatchTag::Overflow => self.pending.push_overflow(batch),
            BatchTag::SingleLevel => {
                if self.mode == Mode::Undetermined {
                    self.mode = Mode::SingleLevel;
                }
                self.pending.push_single_level(batch);
            }
            BatchTag::TwoLevel(bucket) => {
                self.check_bucket(producer, bucket, &batch)?;
                self.producers[producer].last_bucket = Some(bucket);
                self.pending.push_bucket(bucket, batch);
                if self.mode != Mode::TwoLevel {
                    merge_log!(
                        log::Level::Debug,
                        ctx: self.ctx,
                        "two_level_detected",
                        "producer={} bucket={}",
                        producer,
                        bucket
                    );
                    self.mode = Mode::TwoLevel;
                }
            }
        }
        Ok(())
    }

    fn check_bucket(
        &self,
        producer: usize,
        bucket: u32,
        batch: &RecordBatch,
    ) -> Result<(), MergeError> {
        let bucket_count = self.partitioner.bucket_count();
        if bucket >= bucket_count {
            return Err(MergeError::BucketOutOfRange {
                producer,
                bucket,
                bucket_count,
            });
        }
        if let Some(last) = self.producers[producer].last_bucket {
            if bucket < last {
                return Err(MergeError::BucketRegression {
                    producer,
                    last,
                    bucket,
                });
            }
        }
        if self.verify_bucket_assignment && self.key_columns > 0 && batch.num_rows() > 0 {
            let derived = self
                .partitioner
                .partition(&batch.columns()[..self.key_columns])?;
            if let Some(&derived) = derived.iter().find(|derived| **derived != bucket) {
                return Err(MergeError::BucketMismatch {
                    producer,
                    declared: bucket,
                    derived,
                });
            }
        }
        Ok(())
    }

    fn push_group(&mut self, kind: GroupKind, batches: Vec<RecordBatch>) -> bool {
        let rows = batches.iter().map(RecordBatch::num_rows).sum::<usize>();
        let count = batches.len();
        if self.output.push(BucketGroup::new(kind, batches)).is_err() {
            // Only a vanished consumer rejects a push after `can_push`; the
            // next step observes the closed output and tears down.
            return false;
        }
        match kind {
            GroupKind::Bucket(_) => self.stats.bucket_groups += 1,
            GroupKind::SingleLevel => self.stats.single_level_groups += 1,
            GroupKind::Overflow => self.stats.overflow_groups += 1,
        }
        self.stats.rows_emitted += rows as u64;
        merge_log!(
            log::Level::Trace,
            ctx: self.ctx,
            "group_emitted",
            "kind={:?} batches={} rows={}",
            kind,
            count,
            rows
        );
        true
    }

    fn try_emit_bucket(&mut self) -> bool {
        let Some(bucket) = self.pending.first_bucket() else {
            return false;
        };
        let drained = self.all_producers_finished && !self.pending.has_single_level();
        if bucket >= self.current_bucket && !drained {
            return false;
        }
        let Some((bucket, batches)) = self.pending.take_first_bucket() else {
            return false;
        };
        self.next_bucket_to_emit = bucket + 1;
        self.push_group(GroupKind::Bucket(bucket), batches)
    }

    fn try_emit_single_level(&mut self) -> bool {
        match self.pending.take_single_level() {
            Some(batches) => self.push_group(GroupKind::SingleLevel, batches),
            None => false,
        }
    }

    fn try_emit_overflow(&mut self) -> bool {
        match self.pending.take_overflow() {
            Some(batches) => self.push_group(GroupKind::Overflow, batches),
            None => false,
        }
    }

    /// Pull from lagging producers, advancing the cursor while nobody lags.
    ///
    /// Returns `Some(status)` when the step has to stop early.
    fn pull_lagging(&mut self) -> Result<Option<Status>, MergeError> {
        loop {
            let mut finished = true;
            let mut need_data = false;

            for producer in 0..self.inputs.len() {
                if self.producers[producer].is_finished {
                    continue;
                }
                finished = false;
                // Keep reading until the producer is past the cursor or dry.
                while self.needs_input(producer) {
                    match self.inputs[producer].try_pull() {
                        Pull::Empty => {
                            self.waiting_on.push(producer);
                            need_data = true;
                            break;
                        }
                        Pull::Finished => {
                            self.mark_finished(producer);
                            break;
                        }
                        Pull::Ready(batch) => {
                            self.ingest(batch, producer)?;
                            if self.promotion_pending() {
                                return Ok(Some(Status::ReadyToRun));
                            }
                        }
                    }
                }
            }

            if finished {
                if !self.all_producers_finished {
                    merge_log!(
                        log::Level::Debug,
                        ctx: self.ctx,
                        "producers_exhausted",
                        "mode={:?} cursor={}",
                        self.mode,
                        self.current_bucket
                    );
                }
                self.all_producers_finished = true;
                return Ok(None);
            }
            if need_data {
                return Ok(Some(Status::NeedsInput));
            }
            self.current_bucket += 1;
        }
    }

    /// Close every input and drop buffered data without merging it.
    fn cancel(&mut self) {
        for (producer, input) in self.inputs.iter_mut().enumerate() {
            input.close();
            self.producers[producer].is_finished = true;
        }
        let dropped = self.pending.clear();
        if dropped > 0 {
            merge_log!(
                log::Level::Debug,
                ctx: self.ctx,
                "coordinator_cancelled",
                "dropped_batches={}",
                dropped
            );
        }
    }
}

impl Processor for BucketCoordinator {
    fn name(&self) -> &'static str {
        "bucket_coordinator"
    }

    fn step(&mut self) -> Result<Status, MergeError> {
        self.waiting_on.clear();
        if self.output.is_finished() {
            self.cancel();
            return Ok(Status::Done);
        }

        // One batch from everybody tells whether any producer is two-level
        // before single-level data gets buffered for good.
        if !self.probed_all {
            self.probe_inputs()?;
            if !self.probed_all {
                return Ok(Status::NeedsInput);
            }
        }

        if self.promotion_pending() {
            return Ok(Status::ReadyToRun);
        }

        // Reading while the output is full would only grow the buffers.
        if !self.output.can_push() {
            return Ok(Status::OutputBlocked);
        }

        let mut pushed = self.mode == Mode::TwoLevel && self.try_emit_bucket();

        if let Some(status) = self.pull_lagging()? {
            return Ok(status);
        }

        if !pushed {
            pushed = match self.mode {
                Mode::TwoLevel => self.try_emit_bucket(),
                Mode::SingleLevel | Mode::Undetermined => self.try_emit_single_level(),
            };
        }
        if !pushed {
            pushed = self.try_emit_overflow();
        }
        if pushed {
            return Ok(Status::OutputBlocked);
        }

        if self.output.is_finished() {
            self.cancel();
            return Ok(Status::Done);
        }
        self.output.finish();
        merge_log!(
            log::Level::Debug,
            ctx: self.ctx,
            "coordinator_done",
            "ingested={} promoted={} groups={}",
            self.stats.batches_ingested,
            self.stats.batches_promoted,
            self.stats.bucket_groups + self.stats.single_level_groups + self.stats.overflow_groups
        );
        Ok(Status::Done)
    }

    fn wait(&mut self, status: Status) -> BoxFuture<'_, ()> {
        if status == Status::OutputBlocked {
            return self.output.ready().boxed();
        }
        let waiting_on = &self.waiting_on;
        let ready: Vec<_> = self
            .inputs
            .iter_mut()
            .enumerate()
            .filter(|(producer, _)| waiting_on.contains(producer))
            .map(|(_, input)| input.ready().boxed())
            .collect();
        if ready.is_empty() {
            return future::ready(()).boxed();
        }
        future::select_all(ready).map(|_| ()).boxed()
    }

    fn work(&mut self) -> Result<(), MergeError> {
        let parts = self.pending.promote_one(
            self.key_columns,
            self.partitioner.as_ref(),
            self.next_bucket_to_emit,
        )?;
        self.stats.batches_promoted += 1;
        merge_log!(
            log::Level::Trace,
            ctx: self.ctx,
            "single_level_promoted",
            "buckets={}",
            parts
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        port::{self, InputPort},
        test_util::{closed_producer, drain_groups, keyed_batch, partitioner, rows_of},
    };

    fn build(
        inputs: Vec<InputPort<RowBatch>>,
        bucket_count: u32,
        options: MergeOptions,
    ) -> (BucketCoordinator, InputPort<BucketGroup>) {
        let (out, groups) = port::channel(1);
        let coordinator =
            BucketCoordinator::new(inputs, out, 1, partitioner(bucket_count), &options);
        (coordinator, groups)
    }

    fn group_rows(group: &BucketGroup) -> Vec<(String, i64)> {
        let mut rows: Vec<_> = group.batches().iter().flat_map(rows_of).collect();
        rows.sort();
        rows
    }

    fn kinds(groups: &[BucketGroup]) -> Vec<GroupKind> {
        groups.iter().map(BucketGroup::kind).collect()
    }

    #[test]
    fn two_producers_with_skipped_buckets() {
        let p1 = closed_producer(vec![
            RowBatch::two_level(keyed_batch(&[("p1-b0", 1)]), 0),
            RowBatch::two_level(keyed_batch(&[("p1-b2", 1)]), 2),
            RowBatch::two_level(keyed_batch(&[("p1-b3", 1)]), 3),
        ]);
        let p2 = closed_producer(vec![
            RowBatch::two_level(keyed_batch(&[("p2-b0", 1)]), 0),
            RowBatch::two_level(keyed_batch(&[("p2-b1", 1)]), 1),
            RowBatch::two_level(keyed_batch(&[("p2-b3", 1)]), 3),
        ]);
        let (mut coordinator, mut groups) = build(vec![p1, p2], 4, MergeOptions::default());
        let emitted = drain_groups(&mut coordinator, &mut groups);

        assert_eq!(
            kinds(&emitted),
            vec![
                GroupKind::Bucket(0),
                GroupKind::Bucket(1),
                GroupKind::Bucket(2),
                GroupKind::Bucket(3),
            ]
        );
        let batches: Vec<usize> = emitted.iter().map(|group| group.batches().len()).collect();
        assert_eq!(batches, vec![2, 1, 1, 2]);
        assert_eq!(
            group_rows(&emitted[1]),
            vec![("p2-b1".to_string(), 1)],
            "bucket 1 only exists on producer 2"
        );
        assert_eq!(group_rows(&emitted[2]), vec![("p1-b2".to_string(), 1)]);
        assert_eq!(coordinator.mode(), Mode::TwoLevel);
        assert_eq!(coordinator.stats().bucket_groups, 4);
        assert_eq!(coordinator.step().expect("step"), Status::Done);
    }

    #[test]
    fn buffered_batches_are_read_before_reporting_starvation() {
        let producer = closed_producer(vec![
            RowBatch::two_level(keyed_batch(&[("a", 1)]), 0),
            RowBatch::two_level(keyed_batch(&[("b", 1)]), 0),
            RowBatch::two_level(keyed_batch(&[("c", 1)]), 1),
        ]);
        let (mut coordinator, mut groups) = build(vec![producer], 4, MergeOptions::default());

        assert_eq!(coordinator.step().expect("step"), Status::OutputBlocked);
        assert_eq!(coordinator.stats().batches_ingested, 3);

        let emitted = drain_groups(&mut coordinator, &mut groups);
        assert_eq!(kinds(&emitted), vec![GroupKind::Bucket(0), GroupKind::Bucket(1)]);
        assert_eq!(emitted[0].batches().len(), 2);
    }

    #[test]
    fn single_level_run_emits_one_group() {
        let empty = closed_producer(Vec::new());
        let a = closed_producer(vec![RowBatch::single_level(keyed_batch(&[("a", 1), ("b", 2)]))]);
        let b = closed_producer(vec![RowBatch::single_level(keyed_batch(&[("a", 3)]))]);
        let (mut coordinator, mut groups) =
            build(vec![empty, a, b], 4, MergeOptions::default());

        let emitted = drain_groups(&mut coordinator, &mut groups);
        assert_eq!(kinds(&emitted), vec![GroupKind::SingleLevel]);
        assert_eq!(emitted[0].batches().len(), 2);
        assert_eq!(
            group_rows(&emitted[0]),
            vec![
                ("a".to_string(), 1),
                ("a".to_string(), 3),
                ("b".to_string(), 2)
            ]
        );
        assert_eq!(coordinator.mode(), Mode::SingleLevel);
    }

    #[test]
    fn single_level_batches_are_promoted_once_two_level_appears() {
        let keys: Vec<String> = (0..40).map(|i| format!("key-{i}")).collect();
        let single_rows: Vec<(&str, i64)> = keys.iter().map(|key| (key.as_str(), 1)).collect();
        let single = closed_producer(vec![RowBatch::single_level(keyed_batch(&single_rows))]);

        let bucketing = partitioner(4);
        let two_level_rows: Vec<(u32, &str)> = keys
            .iter()
            .take(10)
            .map(|key| {
                let batch = keyed_batch(&[(key.as_str(), 0)]);
                let bucket = bucketing.partition(&batch.columns()[..1]).expect("partition")[0];
                (bucket, key.as_str())
            })
            .collect();
        let mut sorted = two_level_rows.clone();
        sorted.sort();
        let two_level = closed_producer(
            sorted
                .iter()
                .map(|(bucket, key)| RowBatch::two_level(keyed_batch(&[(*key, 100)]), *bucket))
                .collect(),
        );

        let (mut coordinator, mut groups) =
            build(vec![single, two_level], 4, MergeOptions::default());
        let emitted = drain_groups(&mut coordinator, &mut groups);

        assert!(emitted
            .iter()
            .all(|group| matches!(group.kind(), GroupKind::Bucket(_))));
        let buckets: Vec<u32> = emitted
            .iter()
            .filter_map(|group| match group.kind() {
                GroupKind::Bucket(bucket) => Some(bucket),
                _ => None,
            })
            .collect();
        assert!(buckets.windows(2).all(|pair| pair[0] < pair[1]));

        let total: usize = emitted.iter().map(BucketGroup::num_rows).sum();
        assert_eq!(total, 50, "no row lost or duplicated");
        for group in &emitted {
            let GroupKind::Bucket(bucket) = group.kind() else {
                unreachable!()
            };
            for batch in group.batches() {
                let derived = bucketing.partition(&batch.columns()[..1]).expect("partition");
                assert!(derived.iter().all(|b| *b == bucket));
            }
        }
        assert_eq!(coordinator.stats().batches_promoted, 1);
    }

    #[test]
    fn overflow_comes_after_every_bucket() {
        let p1 = closed_producer(vec![
            RowBatch::overflow(keyed_batch(&[("o1", 1)])),
            RowBatch::two_level(keyed_batch(&[("a", 1)]), 0),
            RowBatch::two_level(keyed_batch(&[("b", 1)]), 1),
        ]);
        let p2 = closed_producer(vec![
            RowBatch::two_level(keyed_batch(&[("c", 1)]), 1),
            RowBatch::overflow(keyed_batch(&[("o2", 1)])),
        ]);
        let (mut coordinator, mut groups) = build(vec![p1, p2], 4, MergeOptions::default());
        let emitted = drain_groups(&mut coordinator, &mut groups);

        assert_eq!(
            kinds(&emitted),
            vec![GroupKind::Bucket(0), GroupKind::Bucket(1), GroupKind::Overflow]
        );
        assert_eq!(
            group_rows(&emitted[2]),
            vec![("o1".to_string(), 1), ("o2".to_string(), 1)]
        );
    }

    #[test]
    fn bucket_waits_until_every_open_producer_moved_past_it() {
        let (mut tx0, rx0) = port::channel::<RowBatch>(4);
        let (mut tx1, rx1) = port::channel::<RowBatch>(4);
        let (mut coordinator, mut groups) = build(vec![rx0, rx1], 4, MergeOptions::default());

        let mut emitted: Vec<GroupKind> = Vec::new();
        let mut step = |coordinator: &mut BucketCoordinator, emitted: &mut Vec<GroupKind>| {
            for _ in 0..3 {
                match coordinator.step().expect("step") {
                    Status::ReadyToRun => coordinator.work().expect("work"),
                    Status::Done => break,
                    Status::NeedsInput | Status::OutputBlocked => {}
                }
                while let Pull::Ready(group) = groups.try_pull() {
                    if let GroupKind::Bucket(bucket) = group.kind() {
                        for producer in 0..2 {
                            if let Some(last) = coordinator.last_bucket_seen(producer) {
                                let open = !coordinator.producers[producer].is_finished;
                                assert!(!open || last > bucket, "bucket {bucket} emitted early");
                            }
                        }
                    }
                    emitted.push(group.kind());
                }
            }
        };

        tx0.push(RowBatch::two_level(keyed_batch(&[("a", 1)]), 0)).expect("push");
        tx1.push(RowBatch::two_level(keyed_batch(&[("b", 1)]), 0)).expect("push");
        step(&mut coordinator, &mut emitted);
        assert!(emitted.is_empty());

        tx0.push(RowBatch::two_level(keyed_batch(&[("c", 1)]), 1)).expect("push");
        step(&mut coordinator, &mut emitted);
        assert!(emitted.is_empty(), "producer 1 may still send bucket 0");

        tx1.push(RowBatch::two_level(keyed_batch(&[("d", 1)]), 2)).expect("push");
        step(&mut coordinator, &mut emitted);
        assert_eq!(emitted, vec![GroupKind::Bucket(0)]);

        tx0.finish();
        step(&mut coordinator, &mut emitted);
        assert_eq!(emitted, vec![GroupKind::Bucket(0), GroupKind::Bucket(1)]);

        tx1.finish();
        step(&mut coordinator, &mut emitted);
        assert_eq!(
            emitted,
            vec![GroupKind::Bucket(0), GroupKind::Bucket(1), GroupKind::Bucket(2)]
        );
    }

    #[test]
    fn one_batch_per_bucket_mode_emits_on_arrival() {
        let (mut tx0, rx0) = port::channel::<RowBatch>(4);
        let (mut tx1, rx1) = port::channel::<RowBatch>(4);
        let options = MergeOptions::default().expect_several_batches_per_bucket(false);
        let (mut coordinator, mut groups) = build(vec![rx0, rx1], 4, options);

        tx0.push(RowBatch::two_level(keyed_batch(&[("a", 1)]), 0)).expect("push");
        tx1.push(RowBatch::two_level(keyed_batch(&[("b", 1)]), 0)).expect("push");
        assert_eq!(coordinator.step().expect("step"), Status::NeedsInput);
        assert_eq!(coordinator.current_bucket(), 1);
        assert_eq!(coordinator.step().expect("step"), Status::NeedsInput);

        let Pull::Ready(group) = groups.try_pull() else {
            panic!("bucket 0 should be out");
        };
        assert_eq!(group.kind(), GroupKind::Bucket(0));
        assert_eq!(group.batches().len(), 2);
    }

    #[test]
    fn full_output_stops_reading() {
        let producer = closed_producer(vec![
            RowBatch::two_level(keyed_batch(&[("a", 1)]), 0),
            RowBatch::two_level(keyed_batch(&[("b", 1)]), 1),
            RowBatch::two_level(keyed_batch(&[("c", 1)]), 2),
            RowBatch::two_level(keyed_batch(&[("d", 1)]), 3),
        ]);
        let (mut coordinator, _groups) = build(vec![producer], 4, MergeOptions::default());

        let mut saw_blocked = false;
        for _ in 0..4 {
            if coordinator.step().expect("step") == Status::OutputBlocked {
                saw_blocked = true;
                break;
            }
        }
        assert!(saw_blocked);
        let ingested = coordinator.stats().batches_ingested;
        for _ in 0..3 {
            assert_eq!(coordinator.step().expect("step"), Status::OutputBlocked);
        }
        assert_eq!(coordinator.stats().batches_ingested, ingested);
    }

    #[test]
    fn closed_output_closes_every_input() {
        let (tx0, rx0) = port::channel::<RowBatch>(4);
        let (mut tx1, rx1) = port::channel::<RowBatch>(4);
        let (mut coordinator, mut groups) = build(vec![rx0, rx1], 4, MergeOptions::default());
        tx1.push(RowBatch::two_level(keyed_batch(&[("a", 1)]), 0)).expect("push");
        assert_eq!(coordinator.step().expect("step"), Status::NeedsInput);

        groups.close();
        assert_eq!(coordinator.step().expect("step"), Status::Done);
        assert!(tx0.is_finished());
        assert!(tx1.is_finished());
    }

    #[test]
    fn untagged_batch_is_rejected() {
        let good = closed_producer(vec![RowBatch::single_level(keyed_batch(&[("a", 1)]))]);
        let bad = closed_producer(vec![RowBatch::untagged(keyed_batch(&[("b", 1)]))]);
        let (mut coordinator, _groups) = build(vec![good, bad], 4, MergeOptions::default());
        let err = coordinator.step().expect_err("missing tag");
        assert!(matches!(err, MergeError::MissingTag { producer: 1 }));
    }

    #[test]
    fn bucket_numbers_are_checked() {
        let regress = closed_producer(vec![
            RowBatch::two_level(keyed_batch(&[("a", 1)]), 2),
            RowBatch::two_level(keyed_batch(&[("b", 1)]), 1),
        ]);
        let (mut coordinator, mut groups) = build(vec![regress], 4, MergeOptions::default());
        let err = loop {
            match coordinator.step() {
                Ok(Status::ReadyToRun) => coordinator.work().expect("work"),
                Ok(Status::Done) => panic!("regression went unnoticed"),
                Ok(_) => while let Pull::Ready(_) = groups.try_pull() {},
                Err(err) => break err,
            }
        };
        assert!(matches!(
            err,
            MergeError::BucketRegression {
                last: 2,
                bucket: 1,
                ..
            }
        ));

        let too_big = closed_producer(vec![RowBatch::two_level(keyed_batch(&[("a", 1)]), 9)]);
        let (mut coordinator, _groups) = build(vec![too_big], 4, MergeOptions::default());
        assert!(matches!(
            coordinator.step(),
            Err(MergeError::BucketOutOfRange { bucket: 9, .. })
        ));
    }

    #[test]
    fn verification_catches_foreign_bucket_numbering() {
        let batch = keyed_batch(&[("a", 1)]);
        let derived = partitioner(4)
            .partition(&batch.columns()[..1])
            .expect("partition")[0];
        let wrong = (derived + 1) % 4;
        let producer = closed_producer(vec![RowBatch::two_level(batch, wrong)]);
        let options = MergeOptions::default().verify_bucket_assignment(true);
        let (mut coordinator, _groups) = build(vec![producer], 4, options);
        let err = coordinator.step().expect_err("mismatch");
        let MergeError::BucketMismatch {
            declared,
            derived: reported,
            ..
        } = err
        else {
            panic!("unexpected error {err}");
        };
        assert_eq!((declared, reported), (wrong, derived));
    }
}
