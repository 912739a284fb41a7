//! Folding of one bucket group into a single aggregated batch.

use std::{collections::HashMap, sync::Arc};

use arrow::{
    array::ArrayRef,
    record_batch::{RecordBatch, RecordBatchOptions},
    row::{OwnedRow, RowConverter, SortField},
};
use futures_util::{future::BoxFuture, FutureExt};

use crate::{
    aggregate::{AggregateLayout, StateAccumulator},
    batch::{BucketGroup, RowBatch},
    error::MergeError,
    executor::{Processor, Status},
    logging::{merge_log, LogContext},
    port::{InputPort, OutputPort, Pull},
};

/// Merge partial-state batches that share a bucket into one batch.
///
/// Rows with equal key values are combined through each aggregate's
/// [`StateAccumulator`]. With `final_output` the combined states are
/// finalized, otherwise they stay mergeable. Groups appear in first-seen
/// order; the result does not depend on the order of `batches`.
pub fn merge_batches(
    layout: &AggregateLayout,
    batches: &[RecordBatch],
    final_output: bool,
) -> Result<RecordBatch, MergeError> {
    for batch in batches {
        layout.validate(batch)?;
    }

    let mut accumulators: Vec<Box<dyn StateAccumulator>> = layout
        .aggregates()
        .iter()
        .map(|function| function.create_accumulator())
        .collect();
    let key_columns = layout.key_columns();

    let (mut columns, total_groups) = if key_columns == 0 {
        // A global aggregate: every row belongs to the single group.
        let total_groups = usize::from(batches.iter().any(|batch| batch.num_rows() > 0));
        for batch in batches {
            let indices = vec![0; batch.num_rows()];
            fold_states(layout, &mut accumulators, batch, &indices, total_groups)?;
        }
        (Vec::new(), total_groups)
    } else {
        let converter = RowConverter::new(
            layout
                .key_fields()
                .iter()
                .map(|field| SortField::new(field.data_type().clone()))
                .collect(),
        )?;
        let mut groups: HashMap<OwnedRow, usize> = HashMap::new();
        let mut group_keys: Vec<OwnedRow> = Vec::new();
        let mut indices = Vec::new();

        for batch in batches {
            let rows = converter.convert_columns(&batch.columns()[..key_columns])?;
            indices.clear();
            indices.reserve(rows.num_rows());
            for row in rows.iter() {
                let next = group_keys.len();
                let group = *groups.entry(row.owned()).or_insert_with_key(|key| {
                    group_keys.push(key.clone());
                    next
                });
                indices.push(group);
            }
            fold_states(layout, &mut accumulators, batch, &indices, group_keys.len())?;
        }

        let keys = converter.convert_rows(group_keys.iter().map(OwnedRow::row))?;
        (keys, group_keys.len())
    };

    for accumulator in &mut accumulators {
        if final_output {
            columns.push(accumulator.finalize()?);
        } else {
            columns.extend(accumulator.state()?);
        }
    }

    let options = RecordBatchOptions::new().with_row_count(Some(total_groups));
    Ok(RecordBatch::try_new_with_options(
        Arc::clone(layout.output_schema(final_output)),
        columns,
        &options,
    )?)
}

fn fold_states(
    layout: &AggregateLayout,
    accumulators: &mut [Box<dyn StateAccumulator>],
    batch: &RecordBatch,
    indices: &[usize],
    total_groups: usize,
) -> Result<(), MergeError> {
    for (position, accumulator) in accumulators.iter_mut().enumerate() {
        let states: &[ArrayRef] = &batch.columns()[layout.state_range(position)];
        accumulator.merge(states, indices, total_groups)?;
    }
    Ok(())
}

/// Counters describing what a merger has done so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergerStats {
    /// Groups folded.
    pub groups_merged: u64,
    /// Rows consumed across all groups.
    pub rows_in: u64,
    /// Rows produced.
    pub rows_out: u64,
}

/// 1-input, 1-output step machine applying [`merge_batches`] to every group.
pub struct BucketMerger {
    input: InputPort<BucketGroup>,
    output: OutputPort<RowBatch>,
    layout: Arc<AggregateLayout>,
    final_output: bool,
    current: Option<BucketGroup>,
    merged: Option<RowBatch>,
    stats: MergerStats,
    ctx: LogContext,
}

impl BucketMerger {
    /// Merge groups from `input` into `output`, finalizing states when
    /// `final_output` is set.
    pub fn new(
        input: InputPort<BucketGroup>,
        output: OutputPort<RowBatch>,
        layout: Arc<AggregateLayout>,
        final_output: bool,
    ) -> Self {
        Self {
            input,
            output,
            layout,
            final_output,
            current: None,
            merged: None,
            stats: MergerStats::default(),
            ctx: LogContext::new(""),
        }
    }

    pub(crate) fn with_log_context(mut self, ctx: LogContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Counters.
    pub fn stats(&self) -> MergerStats {
        self.stats
    }
}

impl Processor for BucketMerger {
    fn name(&self) -> &'static str {
        "bucket_merger"
    }

    fn step(&mut self) -> Result<Status, MergeError> {
        if self.output.is_finished() {
            self.input.close();
            self.current = None;
            self.merged = None;
            return Ok(Status::Done);
        }

        if let Some(merged) = self.merged.take() {
            // Sibling mergers share the output, so a push can still bounce.
            if let Err(merged) = self.output.push(merged) {
                self.merged = Some(merged);
                return Ok(Status::OutputBlocked);
            }
        }

        if self.current.is_some() {
            return Ok(Status::ReadyToRun);
        }

        match self.input.try_pull() {
            Pull::Ready(group) => {
                self.current = Some(group);
                Ok(Status::ReadyToRun)
            }
            Pull::Empty => Ok(Status::NeedsInput),
            Pull::Finished => {
                self.output.finish();
                merge_log!(
                    log::Level::Debug,
                    ctx: self.ctx,
                    "merger_done",
                    "groups={} rows_in={} rows_out={}",
                    self.stats.groups_merged,
                    self.stats.rows_in,
                    self.stats.rows_out
                );
                Ok(Status::Done)
            }
        }
    }

    fn wait(&mut self, status: Status) -> BoxFuture<'_, ()> {
        match status {
            Status::OutputBlocked => self.output.ready().boxed(),
            _ => self.input.ready().boxed(),
        }
    }

    fn work(&mut self) -> Result<(), MergeError> {
        let Some(group) = self.current.take() else {
            return Ok(());
        };
        let kind = group.kind();
        let rows_in = group.num_rows();
        let batches = group.into_batches();
        let merged = merge_batches(&self.layout, &batches, self.final_output)?;
        drop(batches);

        self.stats.groups_merged += 1;
        self.stats.rows_in += rows_in as u64;
        self.stats.rows_out += merged.num_rows() as u64;
        merge_log!(
            log::Level::Trace,
            ctx: self.ctx,
            "group_merged",
            "kind={:?} rows_in={} rows_out={}",
            kind,
            rows_in,
            merged.num_rows()
        );
        self.merged = Some(RowBatch::new(merged, kind.output_tag()));
        Ok(())
    }
}
