//! Wiring of one coordinator and several mergers onto the tokio runtime.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_stream::try_stream;
use futures_core::Stream;
use futures_util::TryStreamExt;

use crate::{
    aggregate::AggregateLayout,
    batch::{BucketGroup, RowBatch},
    coordinator::{BucketCoordinator, SortingCoordinator},
    error::MergeError,
    executor::tokio::TokioExecutor,
    logging::{merge_log, LogContext},
    merger::BucketMerger,
    option::MergeOptions,
    partition::{BucketPartitioner, HashBucketPartitioner},
    port::{self, InputPort},
};

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(0);

/// Which coordinator feeds the mergers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CoordinatorKind {
    /// Memory-bounded, emits each bucket as soon as it is complete.
    #[default]
    Bucketed,
    /// Buffers all input before emitting anything.
    Sorting,
}

/// Builder for a merge pipeline: producers -> coordinator -> N mergers -> output.
#[derive(Debug)]
pub struct MergePipeline {
    layout: Arc<AggregateLayout>,
    partitioner: Arc<dyn BucketPartitioner>,
    options: MergeOptions,
    coordinator: CoordinatorKind,
}

impl MergePipeline {
    /// Merge batches laid out as `layout`, re-bucketing single-level data
    /// with `partitioner`.
    pub fn new(
        layout: AggregateLayout,
        partitioner: Arc<dyn BucketPartitioner>,
        options: MergeOptions,
    ) -> Self {
        Self {
            layout: Arc::new(layout),
            partitioner,
            options,
            coordinator: CoordinatorKind::default(),
        }
    }

    /// Use a [`HashBucketPartitioner`] over the layout's key columns.
    pub fn with_hash_partitioner(
        layout: AggregateLayout,
        options: MergeOptions,
    ) -> Result<Self, MergeError> {
        let key_types: Vec<_> = layout
            .key_fields()
            .iter()
            .map(|field| field.data_type().clone())
            .collect();
        let partitioner = HashBucketPartitioner::try_new(&key_types, options.bucket_count)?;
        Ok(Self::new(layout, Arc::new(partitioner), options))
    }

    /// Choose the coordinator. Defaults to [`CoordinatorKind::Bucketed`].
    pub fn coordinator(self, coordinator: CoordinatorKind) -> Self {
        Self {
            coordinator,
            ..self
        }
    }

    /// Start merging `producers`. Must be called from within a tokio runtime.
    pub fn spawn(self, producers: Vec<InputPort<RowBatch>>) -> PipelineHandle {
        let id = NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed);
        let ctx = LogContext::new(format!("pipeline={id}"));
        let (group_tx, group_rx) = port::channel::<BucketGroup>(self.options.channel_capacity);
        let (merged_tx, merged_rx) = port::channel::<RowBatch>(self.options.channel_capacity);
        let key_columns = self.layout.key_columns();

        merge_log!(
            log::Level::Debug,
            ctx: ctx,
            "pipeline_spawned",
            "producers={} mergers={} coordinator={:?} final={}",
            producers.len(),
            self.options.merge_threads,
            self.coordinator,
            self.options.final_output
        );

        let mut executor = TokioExecutor::new();
        match self.coordinator {
            CoordinatorKind::Bucketed => executor.spawn(
                BucketCoordinator::new(
                    producers,
                    group_tx,
                    key_columns,
                    Arc::clone(&self.partitioner),
                    &self.options,
                )
                .with_log_context(ctx.clone()),
                ctx.clone(),
            ),
            CoordinatorKind::Sorting => executor.spawn(
                SortingCoordinator::new(
                    producers,
                    group_tx,
                    key_columns,
                    Arc::clone(&self.partitioner),
                ),
                ctx.clone(),
            ),
        }
        for _ in 0..self.options.merge_threads {
            let merger = BucketMerger::new(
                group_rx.clone(),
                merged_tx.clone(),
                Arc::clone(&self.layout),
                self.options.final_output,
            )
            .with_log_context(ctx.clone());
            executor.spawn(merger, ctx.clone());
        }
        // Only the spawned tasks may hold port ends, or end of stream never arrives.
        drop(group_rx);
        drop(merged_tx);

        PipelineHandle {
            output: merged_rx,
            executor,
        }
    }
}

/// Running pipeline. Dropping it cancels every task.
#[derive(Debug)]
pub struct PipelineHandle {
    output: InputPort<RowBatch>,
    executor: TokioExecutor,
}

impl PipelineHandle {
    /// Merged batches in completion order, followed by the first task error, if any.
    pub fn into_stream(self) -> impl Stream<Item = Result<RowBatch, MergeError>> + Send {
        let PipelineHandle {
            mut output,
            executor,
        } = self;
        try_stream! {
            while let Some(batch) = output.recv().await {
                yield batch;
            }
            executor.join().await?;
        }
    }

    /// Wait for the whole pipeline and gather its output.
    pub async fn collect(self) -> Result<Vec<RowBatch>, MergeError> {
        self.into_stream().try_collect().await
    }
}
