//! Tunables for one merge.

/// Default number of two-level buckets produced by the aggregation workers.
pub const DEFAULT_BUCKET_COUNT: u32 = 256;

/// Tuning knobs for one merge pipeline.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub(crate) bucket_count: u32,
    pub(crate) final_output: bool,
    pub(crate) expect_several_batches_per_bucket: bool,
    pub(crate) verify_bucket_assignment: bool,
    pub(crate) merge_threads: usize,
    pub(crate) channel_capacity: usize,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            bucket_count: DEFAULT_BUCKET_COUNT,
            final_output: true,
            expect_several_batches_per_bucket: true,
            verify_bucket_assignment: false,
            merge_threads: 1,
            channel_capacity: 1,
        }
    }
}

impl MergeOptions {
    /// Number of two-level buckets the producers partition into. At least 1.
    pub fn bucket_count(self, bucket_count: u32) -> Self {
        MergeOptions {
            bucket_count: bucket_count.max(1),
            ..self
        }
    }

    /// Finalize aggregate states (`true`) or keep them mergeable for a further stage.
    pub fn final_output(self, final_output: bool) -> Self {
        MergeOptions {
            final_output,
            ..self
        }
    }

    /// Whether a producer may send more than one batch for the same bucket.
    pub fn expect_several_batches_per_bucket(
        self,
        expect_several_batches_per_bucket: bool,
    ) -> Self {
        MergeOptions {
            expect_several_batches_per_bucket,
            ..self
        }
    }

    /// Re-hash incoming two-level rows and reject batches whose bucket disagrees.
    pub fn verify_bucket_assignment(self, verify_bucket_assignment: bool) -> Self {
        MergeOptions {
            verify_bucket_assignment,
            ..self
        }
    }

    /// Number of merger tasks fed by the coordinator. At least 1.
    pub fn merge_threads(self, merge_threads: usize) -> Self {
        MergeOptions {
            merge_threads: merge_threads.max(1),
            ..self
        }
    }

    /// Groups and merged batches buffered between stages. At least 1.
    pub fn channel_capacity(self, channel_capacity: usize) -> Self {
        MergeOptions {
            channel_capacity: channel_capacity.max(1),
            ..self
        }
    }

}
