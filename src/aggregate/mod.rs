//! Aggregate layout and the opaque state-combination interface.
//!
//! A partially aggregated batch stores the group-by key columns first,
//! followed by the state columns of every aggregate function in declaration
//! order. The merger never inspects state values itself: it maps rows to
//! groups and hands state columns to each function's [`StateAccumulator`].

mod builtin;

use std::{fmt, ops::Range, sync::Arc};

use arrow::{
    array::ArrayRef,
    datatypes::{Field, Schema, SchemaRef},
    error::ArrowError,
    record_batch::RecordBatch,
};
pub use builtin::{Avg, Count, Max, Min, Sum};

use crate::error::MergeError;

/// An aggregate function as seen by the merge stage.
pub trait AggregateFunction: fmt::Debug + Send + Sync {
    /// Function name, used for logging and default column names.
    fn name(&self) -> &str;

    /// Columns holding one partial state.
    fn state_fields(&self) -> Vec<Field>;

    /// Column produced when the state is finalized.
    fn output_field(&self) -> Field;

    /// Fresh accumulator for one merge.
    fn create_accumulator(&self) -> Box<dyn StateAccumulator>;
}

/// Per-group partial states of one aggregate function during a merge.
pub trait StateAccumulator: Send {
    /// Combine the state in row `i` of `states` into group `group_indices[i]`.
    ///
    /// `total_groups` is the number of groups known so far; every index is
    /// below it.
    fn merge(
        &mut self,
        states: &[ArrayRef],
        group_indices: &[usize],
        total_groups: usize,
    ) -> Result<(), ArrowError>;

    /// Emit the combined, still mergeable states, one row per group.
    fn state(&mut self) -> Result<Vec<ArrayRef>, ArrowError>;

    /// Emit finished output values, one row per group.
    fn finalize(&mut self) -> Result<ArrayRef, ArrowError>;
}

/// Column layout shared by every batch entering the merge stage.
#[derive(Debug, Clone)]
pub struct AggregateLayout {
    key_fields: Vec<Field>,
    aggregates: Vec<Arc<dyn AggregateFunction>>,
    state_ranges: Vec<Range<usize>>,
    state_schema: SchemaRef,
    final_schema: SchemaRef,
}

impl AggregateLayout {
    /// Describe batches made of `key_fields` followed by the states of `aggregates`.
    pub fn new(key_fields: Vec<Field>, aggregates: Vec<Arc<dyn AggregateFunction>>) -> Self {
        let mut state_columns = key_fields.clone();
        let mut final_columns = key_fields.clone();
        let mut state_ranges = Vec::with_capacity(aggregates.len());
        for aggregate in &aggregates {
            let start = state_columns.len();
            state_columns.extend(aggregate.state_fields());
            state_ranges.push(start..state_columns.len());
            final_columns.push(aggregate.output_field());
        }
        Self {
            key_fields,
            aggregates,
            state_ranges,
            state_schema: Arc::new(Schema::new(state_columns)),
            final_schema: Arc::new(Schema::new(final_columns)),
        }
    }

    /// Number of leading group-by key columns.
    pub fn key_columns(&self) -> usize {
        self.key_fields.len()
    }

    /// Group-by key fields.
    pub fn key_fields(&self) -> &[Field] {
        &self.key_fields
    }

    /// Aggregate functions in column order.
    pub fn aggregates(&self) -> &[Arc<dyn AggregateFunction>] {
        &self.aggregates
    }

    /// Schema of partial-state batches.
    pub fn state_schema(&self) -> &SchemaRef {
        &self.state_schema
    }

    /// Schema of the merged output.
    pub fn output_schema(&self, final_output: bool) -> &SchemaRef {
        if final_output {
            &self.final_schema
        } else {
            &self.state_schema
        }
    }

    /// Columns holding the states of aggregate `index`.
    pub(crate) fn state_range(&self, index: usize) -> Range<usize> {
        self.state_ranges[index].clone()
    }

    /// Check that a batch has the state layout.
    pub fn validate(&self, batch: &RecordBatch) -> Result<(), MergeError> {
        let expected = self.state_schema.fields();
        if batch.num_columns() != expected.len() {
            return Err(MergeError::ColumnCount {
                expected: expected.len(),
                actual: batch.num_columns(),
            });
        }
        for (column, (field, array)) in expected.iter().zip(batch.columns()).enumerate() {
            if field.data_type() != array.data_type() {
                return Err(MergeError::SchemaMismatch {
                    column,
                    expected: field.data_type().clone(),
                    actual: array.data_type().clone(),
                });
            }
        }
        Ok(())
    }
}
