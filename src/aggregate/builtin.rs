//! Built-in aggregate functions: sum, count, min, max and avg.

use std::{fmt, marker::PhantomData, mem, sync::Arc};

use arrow::{
    array::{Array, ArrayRef, AsArray, Float64Array, Int64Array, PrimitiveArray},
    datatypes::{ArrowNativeTypeOp, ArrowPrimitiveType, DataType, Field, Float64Type, Int64Type},
    error::ArrowError,
};

use super::{AggregateFunction, StateAccumulator};

fn state_column<'a, T: ArrowPrimitiveType>(
    states: &'a [ArrayRef],
    index: usize,
    function: &str,
) -> Result<&'a PrimitiveArray<T>, ArrowError> {
    states
        .get(index)
        .and_then(|array| array.as_primitive_opt::<T>())
        .ok_or_else(|| {
            ArrowError::InvalidArgumentError(format!(
                "{function}: state column {index} is missing or not {:?}",
                T::DATA_TYPE
            ))
        })
}

fn add<N: ArrowNativeTypeOp>(acc: N, value: N) -> N {
    acc.add_wrapping(value)
}

fn min<N: ArrowNativeTypeOp>(acc: N, value: N) -> N {
    if value.is_lt(acc) {
        value
    } else {
        acc
    }
}

fn max<N: ArrowNativeTypeOp>(acc: N, value: N) -> N {
    if value.is_gt(acc) {
        value
    } else {
        acc
    }
}

/// Single-column state folded with an associative binary operation.
struct FoldAccumulator<T: ArrowPrimitiveType> {
    function: &'static str,
    values: Vec<Option<T::Native>>,
    combine: fn(T::Native, T::Native) -> T::Native,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ArrowPrimitiveType> FoldAccumulator<T> {
    fn new(function: &'static str, combine: fn(T::Native, T::Native) -> T::Native) -> Self {
        Self {
            function,
            values: Vec::new(),
            combine,
            _marker: PhantomData,
        }
    }
}

impl<T: ArrowPrimitiveType> StateAccumulator for FoldAccumulator<T> {
    fn merge(
        &mut self,
        states: &[ArrayRef],
        group_indices: &[usize],
        total_groups: usize,
    ) -> Result<(), ArrowError> {
        let states = state_column::<T>(states, 0, self.function)?;
        if self.values.len() < total_groups {
            self.values.resize(total_groups, None);
        }
        for (row, &group) in group_indices.iter().enumerate() {
            if states.is_null(row) {
                continue;
            }
            let value = states.value(row);
            let slot = &mut self.values[group];
            *slot = Some(match *slot {
                Some(acc) => (self.combine)(acc, value),
                None => value,
            });
        }
        Ok(())
    }

    fn state(&mut self) -> Result<Vec<ArrayRef>, ArrowError> {
        Ok(vec![self.finalize()?])
    }

    fn finalize(&mut self) -> Result<ArrayRef, ArrowError> {
        let values = mem::take(&mut self.values);
        Ok(Arc::new(values.into_iter().collect::<PrimitiveArray<T>>()))
    }
}

macro_rules! fold_function {
    ($name:ident, $label:literal, $combine:ident, $doc:literal) => {
        #[doc = $doc]
        pub struct $name<T> {
            name: String,
            _marker: PhantomData<fn() -> T>,
        }

        impl<T> $name<T> {
            /// Create the function; `name` becomes the column name.
            pub fn new(name: impl Into<String>) -> Self {
                Self {
                    name: name.into(),
                    _marker: PhantomData,
                }
            }
        }

        impl<T> fmt::Debug for $name<T> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("name", &self.name)
                    .finish()
            }
        }

        impl<T: ArrowPrimitiveType> AggregateFunction for $name<T> {
            fn name(&self) -> &str {
                &self.name
            }

            fn state_fields(&self) -> Vec<Field> {
                vec![Field::new(&self.name, T::DATA_TYPE, true)]
            }

            fn output_field(&self) -> Field {
                Field::new(&self.name, T::DATA_TYPE, true)
            }

            fn create_accumulator(&self) -> Box<dyn StateAccumulator> {
                Box::new(FoldAccumulator::<T>::new($label, $combine::<T::Native>))
            }
        }
    };
}

fold_function!(Sum, "sum", add, "Sum of a primitive column; overflow wraps.");
fold_function!(Min, "min", min, "Minimum of a primitive column.");
fold_function!(Max, "max", max, "Maximum of a primitive column.");

/// Row count. The state is an `Int64` partial count.
#[derive(Debug)]
pub struct Count {
    name: String,
}

impl Count {
    /// Create the function; `name` becomes the column name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl AggregateFunction for Count {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_fields(&self) -> Vec<Field> {
        vec![Field::new(&self.name, DataType::Int64, true)]
    }

    fn output_field(&self) -> Field {
        Field::new(&self.name, DataType::Int64, false)
    }

    fn create_accumulator(&self) -> Box<dyn StateAccumulator> {
        Box::new(CountAccumulator { counts: Vec::new() })
    }
}

struct CountAccumulator {
    counts: Vec<i64>,
}

impl StateAccumulator for CountAccumulator {
    fn merge(
        &mut self,
        states: &[ArrayRef],
        group_indices: &[usize],
        total_groups: usize,
    ) -> Result<(), ArrowError> {
        let states = state_column::<Int64Type>(states, 0, "count")?;
        if self.counts.len() < total_groups {
            self.counts.resize(total_groups, 0);
        }
        for (row, &group) in group_indices.iter().enumerate() {
            if states.is_valid(row) {
                self.counts[group] = self.counts[group].add_checked(states.value(row))?;
            }
        }
        Ok(())
    }

    fn state(&mut self) -> Result<Vec<ArrayRef>, ArrowError> {
        Ok(vec![self.finalize()?])
    }

    fn finalize(&mut self) -> Result<ArrayRef, ArrowError> {
        Ok(Arc::new(Int64Array::from(mem::take(&mut self.counts))))
    }
}

/// Arithmetic mean over `Float64` input.
///
/// The partial state is a `(sum, count)` pair; finalizing a group that never
/// saw a value yields null.
#[derive(Debug)]
pub struct Avg {
    name: String,
}

impl Avg {
    /// Create the function; `name` becomes the output column name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl AggregateFunction for Avg {
    fn name(&self) -> &str {
        &self.name
    }

    fn state_fields(&self) -> Vec<Field> {
        vec![
            Field::new(format!("{}[sum]", self.name), DataType::Float64, true),
            Field::new(format!("{}[count]", self.name), DataType::Int64, true),
        ]
    }

    fn output_field(&self) -> Field {
        Field::new(&self.name, DataType::Float64, true)
    }

    fn create_accumulator(&self) -> Box<dyn StateAccumulator> {
        Box::new(AvgAccumulator {
            sums: Vec::new(),
            counts: Vec::new(),
        })
    }
}

struct AvgAccumulator {
    sums: Vec<f64>,
    counts: Vec<i64>,
}

impl StateAccumulator for AvgAccumulator {
    fn merge(
        &mut self,
        states: &[ArrayRef],
        group_indices: &[usize],
        total_groups: usize,
    ) -> Result<(), ArrowError> {
        let sums = state_column::<Float64Type>(states, 0, "avg")?;
        let counts = state_column::<Int64Type>(states, 1, "avg")?;
        if self.sums.len() < total_groups {
            self.sums.resize(total_groups, 0.0);
            self.counts.resize(total_groups, 0);
        }
        for (row, &group) in group_indices.iter().enumerate() {
            if sums.is_null(row) || counts.is_null(row) {
                continue;
            }
            self.sums[group] += sums.value(row);
            self.counts[group] = self.counts[group].add_checked(counts.value(row))?;
        }
        Ok(())
    }

    fn state(&mut self) -> Result<Vec<ArrayRef>, ArrowError> {
        let sums = Float64Array::from(mem::take(&mut self.sums));
        let counts = Int64Array::from(mem::take(&mut self.counts));
        Ok(vec![Arc::new(sums), Arc::new(counts)])
    }

    fn finalize(&mut self) -> Result<ArrayRef, ArrowError> {
        let sums = mem::take(&mut self.sums);
        let counts = mem::take(&mut self.counts);
        let means: Float64Array = sums
            .into_iter()
            .zip(counts)
            .map(|(sum, count)| (count > 0).then(|| sum / count as f64))
            .collect();
        Ok(Arc::new(means))
    }
}
