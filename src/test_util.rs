//! Test-only helpers for building keyed batches and driving processors.

use std::sync::Arc;

use arrow::{
    array::{AsArray, Int64Array, StringArray},
    datatypes::{DataType, Field, Int64Type, Schema, SchemaRef},
    record_batch::RecordBatch,
};

use crate::{
    aggregate::{AggregateLayout, Sum},
    batch::{BucketGroup, RowBatch},
    executor::{Processor, Status},
    partition::{BucketPartitioner, HashBucketPartitioner},
    port::{self, InputPort, Pull},
};

pub(crate) fn keyed_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Utf8, false),
        Field::new("v", DataType::Int64, true),
    ]))
}

/// `(key, partial sum)` rows in the layout of [`sum_layout`].
pub(crate) fn keyed_batch(rows: &[(&str, i64)]) -> RecordBatch {
    let keys: Vec<&str> = rows.iter().map(|(key, _)| *key).collect();
    let values: Vec<i64> = rows.iter().map(|(_, value)| *value).collect();
    RecordBatch::try_new(
        keyed_schema(),
        vec![
            Arc::new(StringArray::from(keys)),
            Arc::new(Int64Array::from(values)),
        ],
    )
    .expect("keyed batch")
}

pub(crate) fn sum_layout() -> AggregateLayout {
    AggregateLayout::new(
        vec![Field::new("k", DataType::Utf8, false)],
        vec![Arc::new(Sum::<Int64Type>::new("v"))],
    )
}

pub(crate) fn partitioner(bucket_count: u32) -> Arc<dyn BucketPartitioner> {
    Arc::new(HashBucketPartitioner::try_new(&[DataType::Utf8], bucket_count).expect("partitioner"))
}

/// Rows of a `(k, v)` batch, sorted by key.
pub(crate) fn rows_of(batch: &RecordBatch) -> Vec<(String, i64)> {
    let keys = batch.column(0).as_string::<i32>();
    let values = batch.column(1).as_primitive::<Int64Type>();
    let mut rows: Vec<(String, i64)> = (0..batch.num_rows())
        .map(|row| (keys.value(row).to_string(), values.value(row)))
        .collect();
    rows.sort();
    rows
}

/// A producer that already sent `batches` and closed.
pub(crate) fn closed_producer(batches: Vec<RowBatch>) -> InputPort<RowBatch> {
    let (mut tx, rx) = port::channel(batches.len().max(1));
    for batch in batches {
        tx.push(batch).expect("producer capacity");
    }
    tx.finish();
    rx
}

/// Step `processor` to completion, draining `groups` whenever it blocks.
///
/// Panics if the processor waits for input, so every producer must be closed.
pub(crate) fn drain_groups(
    processor: &mut dyn Processor,
    groups: &mut InputPort<BucketGroup>,
) -> Vec<BucketGroup> {
    let mut emitted = Vec::new();
    loop {
        match processor.step().expect("step") {
            Status::ReadyToRun => processor.work().expect("work"),
            Status::OutputBlocked => {
                while let Pull::Ready(group) = groups.try_pull() {
                    emitted.push(group);
                }
            }
            Status::NeedsInput => panic!("all producers are closed, nothing to wait for"),
            Status::Done => {
                while let Pull::Ready(group) = groups.try_pull() {
                    emitted.push(group);
                }
                return emitted;
            }
        }
    }
}
