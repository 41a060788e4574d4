//! Columnar memory helpers layered on the query's buffer-pool tracker.
//!
//! Operators that hold data across batches (join build sides, sort and
//! aggregate state) keep it in a [`BatchBuffer`] or build it through a
//! [`ColumnAllocator`], so every retained byte is charged to the query and
//! the pool before it is materialized.

use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef};
use quarry_common::{MemoryReservation, QuarryError, QueryMemory, Result};

use crate::scalar::ScalarValue;

/// Estimated buffer bytes for `rows` values of `dt`, including validity.
///
/// Variable-width types use `avg_value_bytes` per value plus offsets.
pub fn estimate_column_bytes(dt: &DataType, rows: usize, avg_value_bytes: usize) -> usize {
    let validity = rows.div_ceil(8);
    let values = match dt {
        DataType::Null => return 0,
        DataType::Boolean => rows.div_ceil(8),
        DataType::Utf8 | DataType::Binary => 4 * (rows + 1) + avg_value_bytes * rows,
        DataType::LargeUtf8 | DataType::LargeBinary => 8 * (rows + 1) + avg_value_bytes * rows,
        other => other.primitive_width().unwrap_or(8) * rows,
    };
    values + validity
}

/// Memory a batch holds in its buffers.
pub fn batch_memory_size(batch: &RecordBatch) -> usize {
    batch.get_array_memory_size()
}

/// Column materialized under a reservation.
#[derive(Debug)]
pub struct TrackedArray {
    array: ArrayRef,
    reservation: MemoryReservation,
}

impl TrackedArray {
    pub fn array(&self) -> &ArrayRef {
        &self.array
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reservation.size()
    }
}

/// Batch materialized under a reservation. The bytes stay charged until
/// the batch is handed off with [`TrackedBatch::into_batch`] or dropped.
#[derive(Debug)]
pub struct TrackedBatch {
    batch: RecordBatch,
    reservation: MemoryReservation,
}

impl TrackedBatch {
    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reservation.size()
    }

    /// Release the reservation and return the batch.
    pub fn into_batch(self) -> RecordBatch {
        self.batch
    }

    /// Split into the batch and the reservation still covering it.
    pub fn into_parts(self) -> (RecordBatch, MemoryReservation) {
        (self.batch, self.reservation)
    }
}

/// Allocates typed columns against a query's memory limit.
#[derive(Debug, Clone)]
pub struct ColumnAllocator {
    memory: Arc<QueryMemory>,
}

impl ColumnAllocator {
    pub fn new(memory: Arc<QueryMemory>) -> Self {
        Self { memory }
    }

    /// Reserve the column's estimated size, then build it from `values`.
    ///
    /// The reservation is trued up to the real buffer size after building.
    /// Fails with `OutOfMemory` before allocating when the estimate does not
    /// fit.
    pub fn build_column(&self, dt: &DataType, values: &[ScalarValue]) -> Result<TrackedArray> {
        let avg = if values.is_empty() {
            0
        } else {
            values.iter().map(ScalarValue::estimate_bytes).sum::<usize>() / values.len()
        };
        let mut reservation = self
            .memory
            .try_reserve(estimate_column_bytes(dt, values.len(), avg))?;
        let array = ScalarValue::iter_to_array(values, dt)?;
        reservation.try_resize(array.get_array_memory_size())?;
        Ok(TrackedArray { array, reservation })
    }

    /// Build a batch column by column.
    pub fn build_batch(
        &self,
        schema: SchemaRef,
        columns: &[Vec<ScalarValue>],
    ) -> Result<TrackedBatch> {
        if columns.len() != schema.fields().len() {
            return Err(QuarryError::Execution(format!(
                "expected {} columns, got {}",
                schema.fields().len(),
                columns.len()
            )));
        }
        let mut reservation = self.memory.empty_reservation();
        let mut arrays = Vec::with_capacity(columns.len());
        for (field, values) in schema.fields().iter().zip(columns) {
            let tracked = self.build_column(field.data_type(), values)?;
            reservation.merge(tracked.reservation);
            arrays.push(tracked.array);
        }
        let batch = RecordBatch::try_new(schema, arrays)
            .map_err(|e| QuarryError::Execution(format!("build batch failed: {e}")))?;
        Ok(TrackedBatch { batch, reservation })
    }
}

/// Batches retained by an operator, charged to the query as they arrive.
#[derive(Debug)]
pub struct BatchBuffer {
    schema: SchemaRef,
    memory: Arc<QueryMemory>,
    batches: Vec<RecordBatch>,
    rows: usize,
    reservation: MemoryReservation,
}

impl BatchBuffer {
    pub fn new(schema: SchemaRef, memory: &Arc<QueryMemory>) -> Self {
        Self {
            schema,
            memory: Arc::clone(memory),
            batches: Vec::new(),
            rows: 0,
            reservation: memory.empty_reservation(),
        }
    }

    /// Retain `batch`, failing with `OutOfMemory` if it does not fit.
    pub fn push(&mut self, batch: RecordBatch) -> Result<()> {
        self.reservation.try_grow(batch_memory_size(&batch))?;
        self.rows += batch.num_rows();
        self.batches.push(batch);
        Ok(())
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reservation.size()
    }

    /// Concatenate everything retained into one batch.
    ///
    /// The copy is charged before the parts are released, so peak usage is
    /// counted honestly.
    pub fn into_single_batch(mut self) -> Result<TrackedBatch> {
        let mut reservation = self.memory.try_reserve(self.reservation.size())?;
        let batch = concat_batches(&self.schema, &self.batches)
            .map_err(|e| QuarryError::Execution(format!("concat failed: {e}")))?;
        self.batches.clear();
        self.reservation.free();
        reservation.try_resize(batch_memory_size(&batch))?;
        Ok(TrackedBatch { batch, reservation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::{Field, Schema};
    use quarry_common::{BufferPool, QueryId};

    fn batch(n: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from_iter_values(0..n))]).unwrap()
    }

    #[test]
    fn buffer_charges_and_releases() {
        let pool = BufferPool::unbounded();
        let q = pool.register_query(QueryId(1), usize::MAX);
        let b = batch(100);
        let mut buf = BatchBuffer::new(b.schema(), &q);
        buf.push(b.clone()).unwrap();
        buf.push(b).unwrap();
        assert_eq!(buf.num_rows(), 200);
        assert!(q.in_use() >= 1600);
        let single = buf.into_single_batch().unwrap();
        assert_eq!(single.batch().num_rows(), 200);
        assert_eq!(q.in_use(), single.reserved_bytes());
        drop(single);
        assert_eq!(q.in_use(), 0);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn buffer_rejects_over_limit() {
        let pool = BufferPool::unbounded();
        let q = pool.register_query(QueryId(2), 1024);
        let b = batch(1000);
        let mut buf = BatchBuffer::new(b.schema(), &q);
        let err = buf.push(b).unwrap_err();
        assert!(matches!(err, QuarryError::OutOfMemory { .. }));
        assert_eq!(q.in_use(), 0);
    }

    #[test]
    fn allocator_reserves_before_building() {
        let pool = BufferPool::new(4096, 1024, 128);
        let q = pool.register_query(QueryId(3), usize::MAX);
        let alloc = ColumnAllocator::new(Arc::clone(&q));
        let values: Vec<_> = (0..1000).map(ScalarValue::Int64).collect();
        let err = alloc.build_column(&DataType::Int64, &values).unwrap_err();
        assert!(matches!(err, QuarryError::OutOfMemory { .. }));
        assert_eq!(pool.in_use(), 0);

        let col = alloc
            .build_column(&DataType::Int64, &values[..4])
            .unwrap();
        assert_eq!(col.array().len(), 4);
        assert_eq!(pool.in_use(), col.reserved_bytes());
    }

    #[test]
    fn estimates_cover_validity_and_offsets() {
        assert_eq!(estimate_column_bytes(&DataType::Int64, 8, 0), 65);
        assert_eq!(estimate_column_bytes(&DataType::Utf8, 2, 10), 12 + 20 + 1);
        assert_eq!(estimate_column_bytes(&DataType::Null, 100, 0), 0);
    }
}
