//! Row-to-partition assignment shared by local and distributed exchanges.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt32Array};
use arrow::compute::take_record_batch;
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use quarry_common::{QuarryError, Result};
use quarry_planner::PartitioningSpec;

use crate::scalar::{ScalarValue, hash_key, key_at, take_index};

/// Splits batches according to a [`PartitioningSpec`].
///
/// Assignment depends only on row values, so every producer (and every
/// retry of a producer) routes a given row to the same partition.
#[derive(Debug, Clone)]
pub struct Partitioner {
    spec: PartitioningSpec,
    key_indices: Vec<usize>,
    partitions: usize,
}

impl Partitioner {
    /// Resolve the partition keys of `spec` against `schema`.
    pub fn try_new(spec: &PartitioningSpec, schema: &SchemaRef) -> Result<Self> {
        let keys: Vec<&str> = match spec {
            PartitioningSpec::HashKeys { keys, .. } => keys.iter().map(String::as_str).collect(),
            PartitioningSpec::Range { key, .. } => vec![key.as_str()],
            PartitioningSpec::Single => vec![],
        };
        let key_indices = keys
            .iter()
            .map(|k| {
                schema.index_of(k).map_err(|_| {
                    QuarryError::Planning(format!("unknown partition key column: {k}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if let PartitioningSpec::Range { key, bounds } = spec {
            let dt = schema.field(key_indices[0]).data_type();
            if !dt.is_integer() {
                return Err(QuarryError::TypeMismatch(format!(
                    "range partition key '{key}' must be an integer column, got {dt:?}"
                )));
            }
            if bounds.windows(2).any(|w| w[0] >= w[1]) {
                return Err(QuarryError::Planning(format!(
                    "range bounds must be strictly ascending: {bounds:?}"
                )));
            }
        }
        Ok(Self {
            spec: spec.clone(),
            key_indices,
            partitions: spec.partition_count(),
        })
    }

    pub fn partition_count(&self) -> usize {
        self.partitions
    }

    /// Partition index of every row of `batch`.
    pub fn assign(&self, batch: &RecordBatch) -> Result<Vec<usize>> {
        let columns: Vec<ArrayRef> = self
            .key_indices
            .iter()
            .map(|i| Arc::clone(batch.column(*i)))
            .collect();
        (0..batch.num_rows())
            .map(|row| match &self.spec {
                PartitioningSpec::Single => Ok(0),
                PartitioningSpec::HashKeys { .. } => {
                    let key = key_at(&columns, row)?;
                    Ok((hash_key(&key) % self.partitions as u64) as usize)
                }
                PartitioningSpec::Range { bounds, .. } => {
                    match ScalarValue::try_from_array(&columns[0], row)? {
                        ScalarValue::Int64(v) => Ok(bounds.partition_point(|b| *b <= v)),
                        _ => Ok(0),
                    }
                }
            })
            .collect()
    }

    /// Split `batch` into `(partition, rows)` pieces, in ascending partition
    /// order. Row order within a piece follows the input. Empty pieces are
    /// omitted.
    pub fn partition_batch(&self, batch: &RecordBatch) -> Result<Vec<(usize, RecordBatch)>> {
        if self.partitions == 1 {
            return Ok(if batch.num_rows() == 0 {
                vec![]
            } else {
                vec![(0, batch.clone())]
            });
        }
        let mut buckets: Vec<Vec<u32>> = vec![Vec::new(); self.partitions];
        for (row, p) in self.assign(batch)?.into_iter().enumerate() {
            buckets[p].push(take_index(row)?);
        }
        let mut out = Vec::new();
        for (p, rows) in buckets.into_iter().enumerate() {
            if rows.is_empty() {
                continue;
            }
            let indices = UInt32Array::from(rows);
            let piece = take_record_batch(batch, &indices as &dyn Array)
                .map_err(|e| QuarryError::Execution(format!("partition take failed: {e}")))?;
            out.push((p, piece));
        }
        Ok(out)
    }

    /// Rows of `batch` that belong to `partition`, if any.
    pub fn select(&self, batch: &RecordBatch, partition: usize) -> Result<Option<RecordBatch>> {
        Ok(self
            .partition_batch(batch)?
            .into_iter()
            .find(|(p, _)| *p == partition)
            .map(|(_, b)| b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow_schema::{DataType, Field, Schema};

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("s", DataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![
                    Some(1),
                    Some(15),
                    None,
                    Some(7),
                    Some(30),
                    Some(1),
                ])),
                Arc::new(StringArray::from(vec!["a", "b", "c", "d", "e", "f"])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn hash_partitioning_conserves_rows_and_groups_keys() {
        let b = batch();
        let spec = PartitioningSpec::HashKeys {
            keys: vec!["k".to_string()],
            partitions: 4,
        };
        let p = Partitioner::try_new(&spec, &b.schema()).unwrap();
        let pieces = p.partition_batch(&b).unwrap();
        let total: usize = pieces.iter().map(|(_, b)| b.num_rows()).sum();
        assert_eq!(total, 6);
        let assigned = p.assign(&b).unwrap();
        assert_eq!(assigned[0], assigned[5]);
        assert!(pieces.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn range_partitioning_uses_bounds_and_sends_nulls_to_zero() {
        let b = batch();
        let spec = PartitioningSpec::Range {
            key: "k".to_string(),
            bounds: vec![5, 20],
        };
        let p = Partitioner::try_new(&spec, &b.schema()).unwrap();
        assert_eq!(p.partition_count(), 3);
        assert_eq!(p.assign(&b).unwrap(), vec![0, 1, 0, 1, 2, 0]);
    }

    #[test]
    fn range_key_must_be_integer() {
        let b = batch();
        let spec = PartitioningSpec::Range {
            key: "s".to_string(),
            bounds: vec![1],
        };
        let err = Partitioner::try_new(&spec, &b.schema()).unwrap_err();
        assert!(matches!(err, QuarryError::TypeMismatch(_)));
    }
}
