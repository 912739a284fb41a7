#![warn(missing_docs)]
//! Memory-efficient merging of partially aggregated Arrow data.
//!
//! Several producers emit partial aggregation states as Arrow `RecordBatch`
//! values, each tagged either as single-level (covering every key) or as one
//! bucket of a two-level layout. A [`coordinator::BucketCoordinator`] reads
//! all producers, groups the data bucket by bucket and hands complete groups
//! to [`merger::BucketMerger`] stages that fold them into one batch per
//! group. Because a bucket is released as soon as every producer has moved
//! past it, peak memory stays close to one bucket per producer.
//!
//! Stages are cooperative [`executor::Processor`]s connected by bounded
//! [`port`]s, so they can be stepped by hand or spawned on tokio through
//! [`pipeline::MergePipeline`].

pub mod aggregate;
pub mod batch;
pub mod coordinator;
pub mod error;
pub mod executor;
mod logging;
pub mod merger;
pub mod option;
pub mod partition;
#[cfg(feature = "tokio")]
pub mod pipeline;
pub mod port;

#[cfg(test)]
mod test_util;

pub use crate::{
    aggregate::{AggregateFunction, AggregateLayout, StateAccumulator},
    batch::{BatchTag, BucketGroup, GroupKind, RowBatch},
    coordinator::{BucketCoordinator, SortingCoordinator},
    error::MergeError,
    merger::{merge_batches, BucketMerger},
    option::MergeOptions,
    partition::{split_into_buckets, BucketPartitioner, HashBucketPartitioner},
};
#[cfg(feature = "tokio")]
pub use crate::pipeline::{CoordinatorKind, MergePipeline, PipelineHandle};
