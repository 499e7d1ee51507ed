//! Per-column accumulators folded over every batch of a source.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::{self, cast};
use arrow::datatypes::{DataType, Float64Type, Int64Type, UInt64Type};
use indexmap::IndexSet;

use super::{ColumnDomain, DomainValue, MetadataRecord};
use crate::error::Result;

#[derive(Debug)]
struct Bounds<T> {
    lower: Option<T>,
    upper: Option<T>,
}

impl<T: PartialOrd + Copy> Bounds<T> {
    fn new() -> Self {
        Self {
            lower: None,
            upper: None,
        }
    }

    fn fold(&mut self, lower: Option<T>, upper: Option<T>) {
        if let Some(v) = lower
            && self.lower.is_none_or(|current| v < current)
        {
            self.lower = Some(v);
        }
        if let Some(v) = upper
            && self.upper.is_none_or(|current| v > current)
        {
            self.upper = Some(v);
        }
    }

    fn finish(&self, value: impl Fn(T) -> DomainValue) -> ColumnDomain {
        match (self.lower, self.upper) {
            (Some(lower), Some(upper)) => ColumnDomain::Bounded {
                lower: value(lower),
                upper: value(upper),
            },
            _ => ColumnDomain::Unknown,
        }
    }
}

/// Bounds or enumerated values of one column.
#[derive(Debug)]
enum DomainAccumulator {
    Int(Bounds<i64>),
    UInt(Bounds<u64>),
    Float(Bounds<f64>),
    Boolean { seen_false: bool, seen_true: bool },
    /// `None` once more than `max_values` distinct values were seen.
    Text {
        values: Option<IndexSet<String>>,
        max_values: usize,
    },
}

impl DomainAccumulator {
    fn for_type(data_type: &DataType, max_values: usize) -> Option<Self> {
        let accumulator = match data_type {
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64 => {
                DomainAccumulator::Int(Bounds::new())
            }
            DataType::UInt8 | DataType::UInt16 | DataType::UInt32 | DataType::UInt64 => {
                DomainAccumulator::UInt(Bounds::new())
            }
            DataType::Float16 | DataType::Float32 | DataType::Float64 => {
                DomainAccumulator::Float(Bounds::new())
            }
            DataType::Boolean => DomainAccumulator::Boolean {
                seen_false: false,
                seen_true: false,
            },
            data_type if is_text(data_type) => DomainAccumulator::Text {
                values: Some(IndexSet::new()),
                max_values,
            },
            _ => return None,
        };
        Some(accumulator)
    }

    /// Fold `column` in. Text columns must already be cast to `Utf8`.
    fn update(&mut self, column: &ArrayRef) -> Result<()> {
        match self {
            DomainAccumulator::Int(bounds) => {
                let values = cast(column, &DataType::Int64)?;
                let values = values.as_primitive::<Int64Type>();
                bounds.fold(compute::min(values), compute::max(values));
            }
            DomainAccumulator::UInt(bounds) => {
                let values = cast(column, &DataType::UInt64)?;
                let values = values.as_primitive::<UInt64Type>();
                bounds.fold(compute::min(values), compute::max(values));
            }
            DomainAccumulator::Float(bounds) => {
                let values = cast(column, &DataType::Float64)?;
                for v in values
                    .as_primitive::<Float64Type>()
                    .iter()
                    .flatten()
                    .filter(|v| !v.is_nan())
                {
                    bounds.fold(Some(v), Some(v));
                }
            }
            DomainAccumulator::Boolean {
                seen_false,
                seen_true,
            } => {
                let values = column.as_boolean();
                let trues = values.true_count();
                *seen_true |= trues > 0;
                *seen_false |= values.len() - values.null_count() > trues;
            }
            DomainAccumulator::Text { values, max_values } => {
                let Some(set) = values.as_mut() else {
                    return Ok(());
                };
                for value in column.as_string::<i32>().iter().flatten() {
                    if !set.contains(value) {
                        set.insert(value.to_string());
                    }
                    if set.len() > *max_values {
                        *values = None;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&self) -> ColumnDomain {
        match self {
            DomainAccumulator::Int(bounds) => bounds.finish(DomainValue::Int),
            DomainAccumulator::UInt(bounds) => bounds.finish(DomainValue::UInt),
            DomainAccumulator::Float(bounds) => bounds.finish(DomainValue::Float),
            DomainAccumulator::Boolean {
                seen_false,
                seen_true,
            } => {
                let mut values = Vec::new();
                if *seen_false {
                    values.push(DomainValue::Boolean(false));
                }
                if *seen_true {
                    values.push(DomainValue::Boolean(true));
                }
                ColumnDomain::Enumerated(values)
            }
            DomainAccumulator::Text {
                values: Some(set), ..
            } => ColumnDomain::Enumerated(set.iter().cloned().map(DomainValue::Text).collect()),
            DomainAccumulator::Text { values: None, .. } => ColumnDomain::Unknown,
        }
    }
}

/// Value counts and, for text, the longest value.
#[derive(Debug, Default)]
struct MetadataAccumulator {
    non_null: u64,
    null: u64,
    max_string_bytes: Option<usize>,
}

impl MetadataAccumulator {
    fn update(&mut self, column: &ArrayRef) {
        let nulls = column.null_count();
        self.null += nulls as u64;
        self.non_null += (column.len() - nulls) as u64;
        if let Some(current) = &mut self.max_string_bytes
            && let Some(longest) = column.as_string::<i32>().iter().flatten().map(str::len).max()
        {
            *current = (*current).max(longest);
        }
    }

    fn finish(&self) -> Vec<MetadataRecord> {
        let mut records = vec![MetadataRecord::ValueCounts {
            non_null: self.non_null,
            null: self.null,
        }];
        if let Some(bytes) = self.max_string_bytes {
            records.push(MetadataRecord::MaxStringLength { bytes });
        }
        records
    }
}

/// Everything tracked for one column.
#[derive(Debug)]
pub(crate) struct ColumnAccumulator {
    text: bool,
    domain: Option<DomainAccumulator>,
    metadata: MetadataAccumulator,
}

impl ColumnAccumulator {
    pub fn new(data_type: &DataType, max_values: usize, compute_domains: bool) -> Self {
        let text = is_text(data_type);
        Self {
            text,
            domain: compute_domains
                .then(|| DomainAccumulator::for_type(data_type, max_values))
                .flatten(),
            metadata: MetadataAccumulator {
                max_string_bytes: text.then_some(0),
                ..Default::default()
            },
        }
    }

    pub fn update(&mut self, column: &ArrayRef) -> Result<()> {
        let column = if self.text && column.data_type() != &DataType::Utf8 {
            cast(column, &DataType::Utf8)?
        } else {
            Arc::clone(column)
        };
        if let Some(domain) = &mut self.domain {
            domain.update(&column)?;
        }
        self.metadata.update(&column);
        Ok(())
    }

    pub fn domain(&self) -> ColumnDomain {
        self.domain
            .as_ref()
            .map_or(ColumnDomain::Unknown, DomainAccumulator::finish)
    }

    pub fn metadata(&self) -> Vec<MetadataRecord> {
        self.metadata.finish()
    }
}

fn is_text(data_type: &DataType) -> bool {
    match data_type {
        DataType::Utf8 | DataType::LargeUtf8 | DataType::Utf8View => true,
        DataType::Dictionary(_, values) => is_text(values),
        _ => false,
    }
}
