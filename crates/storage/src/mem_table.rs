use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use quarry_common::{QuarryError, Result};
use quarry_execution::{ExecNode, SendableRecordBatchStream, TaskContext, memory_stream};

use crate::provider::{TableProvider, TableStats};

/// Table held in memory as a list of partitions of batches.
#[derive(Debug, Clone)]
pub struct MemTable {
    schema: SchemaRef,
    partitions: Vec<Arc<Vec<RecordBatch>>>,
}

impl MemTable {
    /// Build a table, checking every batch against `schema`.
    pub fn try_new(schema: SchemaRef, partitions: Vec<Vec<RecordBatch>>) -> Result<Self> {
        if partitions.is_empty() {
            return Err(QuarryError::InvalidConfig(
                "a table needs at least one partition".to_string(),
            ));
        }
        for batch in partitions.iter().flatten() {
            if batch.schema().fields() != schema.fields() {
                return Err(QuarryError::Planning(format!(
                    "batch schema {:?} does not match table schema {:?}",
                    batch.schema(),
                    schema
                )));
            }
        }
        Ok(Self {
            schema,
            partitions: partitions.into_iter().map(Arc::new).collect(),
        })
    }

    /// Spread `batches` over `n` partitions round robin.
    pub fn round_robin(schema: SchemaRef, batches: Vec<RecordBatch>, n: usize) -> Result<Self> {
        let mut partitions = vec![Vec::new(); n.max(1)];
        for (i, batch) in batches.into_iter().enumerate() {
            partitions[i % n.max(1)].push(batch);
        }
        Self::try_new(schema, partitions)
    }
}

impl TableProvider for MemTable {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn statistics(&self) -> TableStats {
        let batches = self.partitions.iter().flat_map(|p| p.iter());
        let (rows, bytes) = batches.fold((0u64, 0u64), |(r, b), batch| {
            (
                r + batch.num_rows() as u64,
                b + batch.get_array_memory_size() as u64,
            )
        });
        TableStats {
            rows: Some(rows),
            bytes: Some(bytes),
        }
    }

    fn scan(&self, partition: usize, projection: Option<&[String]>) -> Result<Arc<dyn ExecNode>> {
        let batches = self.partitions.get(partition).ok_or_else(|| {
            QuarryError::Execution(format!(
                "partition {partition} out of range ({} partitions)",
                self.partitions.len()
            ))
        })?;
        let indices = match projection {
            Some(cols) => Some(
                cols.iter()
                    .map(|c| {
                        self.schema.index_of(c).map_err(|_| {
                            QuarryError::Planning(format!("unknown column in projection: {c}"))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => None,
        };
        let schema = match &indices {
            Some(idx) => Arc::new(
                self.schema
                    .project(idx)
                    .map_err(|e| QuarryError::Planning(format!("projection failed: {e}")))?,
            ),
            None => Arc::clone(&self.schema),
        };
        Ok(Arc::new(MemScanNode {
            schema,
            indices,
            batches: Arc::clone(batches),
        }))
    }
}

/// Scan of one in-memory partition.
///
/// Batches are re-sliced to the task's batch size, which shrinks under
/// buffer-pool pressure.
pub struct MemScanNode {
    schema: SchemaRef,
    indices: Option<Vec<usize>>,
    batches: Arc<Vec<RecordBatch>>,
}

impl ExecNode for MemScanNode {
    fn name(&self) -> &'static str {
        "Scan"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn execute(&self, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let chunk = ctx.batch_size_rows();
        let mut out = Vec::new();
        for batch in self.batches.iter() {
            let batch = match &self.indices {
                Some(idx) => batch
                    .project(idx)
                    .map_err(|e| QuarryError::Execution(format!("projection failed: {e}")))?,
                None => batch.clone(),
            };
            let mut offset = 0;
            while offset < batch.num_rows() {
                let len = chunk.min(batch.num_rows() - offset);
                out.push(batch.slice(offset, len));
                offset += len;
            }
        }
        Ok(memory_stream(self.schema(), out))
    }
}
