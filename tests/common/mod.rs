//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::{collections::BTreeMap, sync::Arc};

use aggmerge::{
    aggregate::{Count, Sum},
    port::{self, InputPort},
    split_into_buckets, AggregateLayout, BucketPartitioner, HashBucketPartitioner, RowBatch,
};
use arrow::{
    array::{AsArray, Int64Array, StringArray},
    datatypes::{DataType, Field, Int64Type},
    record_batch::RecordBatch,
};
use tokio::task::JoinHandle;

/// Expected `(sum, count)` per key.
pub type Totals = BTreeMap<String, (i64, i64)>;

/// Key `k`, then `v` summed and `c` counted.
pub fn layout() -> AggregateLayout {
    AggregateLayout::new(
        vec![Field::new("k", DataType::Utf8, false)],
        vec![
            Arc::new(Sum::<Int64Type>::new("v")),
            Arc::new(Count::new("c")),
        ],
    )
}

pub fn partitioner(bucket_count: u32) -> Arc<dyn BucketPartitioner> {
    Arc::new(
        HashBucketPartitioner::try_new(&[DataType::Utf8], bucket_count)
            .expect("partitioner should build"),
    )
}

/// Random raw rows over `keys` distinct keys.
pub fn random_rows(rng: &mut fastrand::Rng, rows: usize, keys: usize) -> Vec<(String, i64)> {
    (0..rows)
        .map(|_| (format!("key-{}", rng.usize(..keys)), rng.i64(-1_000..1_000)))
        .collect()
}

/// What a single worker would produce after partially aggregating `rows`.
pub fn partial_state(rows: &[(String, i64)]) -> RecordBatch {
    let mut totals = Totals::new();
    for (key, value) in rows {
        let entry = totals.entry(key.clone()).or_default();
        entry.0 += value;
        entry.1 += 1;
    }
    totals_batch(&totals)
}

pub fn totals_batch(totals: &Totals) -> RecordBatch {
    let keys: Vec<&str> = totals.keys().map(String::as_str).collect();
    let sums: Vec<i64> = totals.values().map(|(sum, _)| *sum).collect();
    let counts: Vec<i64> = totals.values().map(|(_, count)| *count).collect();
    RecordBatch::try_new(
        layout().state_schema().clone(),
        vec![
            Arc::new(StringArray::from(keys)),
            Arc::new(Int64Array::from(sums)),
            Arc::new(Int64Array::from(counts)),
        ],
    )
    .expect("state batch should match the layout")
}

pub fn expected_totals<'a>(producers: impl IntoIterator<Item = &'a Vec<(String, i64)>>) -> Totals {
    let mut totals = Totals::new();
    for rows in producers {
        for (key, value) in rows {
            let entry = totals.entry(key.clone()).or_default();
            entry.0 += value;
            entry.1 += 1;
        }
    }
    totals
}

/// Partial state of `rows` split into ascending two-level buckets.
pub fn two_level(rows: &[(String, i64)], partitioner: &dyn BucketPartitioner) -> Vec<RowBatch> {
    let state = partial_state(rows);
    split_into_buckets(&state, 1, partitioner)
        .expect("split should succeed")
        .into_iter()
        .map(|(bucket, batch)| RowBatch::two_level(batch, bucket))
        .collect()
}

/// Spawn a task that sends `batches` one by one and then closes.
///
/// The task resolves to the number of batches the pipeline accepted.
pub fn spawn_producer(
    batches: Vec<RowBatch>,
    capacity: usize,
) -> (InputPort<RowBatch>, JoinHandle<usize>) {
    let (mut tx, rx) = port::channel(capacity);
    let handle = tokio::spawn(async move {
        let mut sent = 0;
        for batch in batches {
            if tx.send(batch).await.is_err() {
                break;
            }
            sent += 1;
            tokio::task::yield_now().await;
        }
        tx.finish();
        sent
    });
    (rx, handle)
}

/// Fold final output batches into per-key totals, failing on duplicate keys.
pub fn collect_totals(batches: &[RecordBatch]) -> Totals {
    let mut totals = Totals::new();
    for batch in batches {
        let keys = batch.column(0).as_string::<i32>();
        let sums = batch.column(1).as_primitive::<Int64Type>();
        let counts = batch.column(2).as_primitive::<Int64Type>();
        for row in 0..batch.num_rows() {
            let previous = totals.insert(
                keys.value(row).to_string(),
                (sums.value(row), counts.value(row)),
            );
            assert!(
                previous.is_none(),
                "key {} emitted twice",
                keys.value(row)
            );
        }
    }
    totals
}
