use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::{StreamExt, TryStreamExt, future, stream};
use quarry_common::Result;

use crate::context::TaskContext;
use crate::exec_node::ExecNode;
use crate::repartition::Partitioner;
use crate::stream::{SendableRecordBatchStream, StreamAdapter, memory_stream};

/// In-process shuffle: runs every input partition in turn and keeps the
/// rows that route to `partition`.
///
/// Each output partition re-executes its inputs, trading CPU for not having
/// to buffer the whole exchange.
pub struct LocalShuffleNode {
    inputs: Vec<Arc<dyn ExecNode>>,
    partitioner: Partitioner,
    partition: usize,
    schema: SchemaRef,
}

impl LocalShuffleNode {
    pub fn new(
        inputs: Vec<Arc<dyn ExecNode>>,
        partitioner: Partitioner,
        partition: usize,
        schema: SchemaRef,
    ) -> Self {
        Self {
            inputs,
            partitioner,
            partition,
            schema,
        }
    }
}

impl ExecNode for LocalShuffleNode {
    fn name(&self) -> &'static str {
        "ShuffleRead"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn execute(&self, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let inputs = self.inputs.clone();
        let partitioner = self.partitioner.clone();
        let target = self.partition;
        let out = stream::iter(inputs.into_iter().map(move |node| node.execute(Arc::clone(&ctx))))
            .try_flatten()
            .try_filter_map(move |batch| future::ready(partitioner.select(&batch, target)))
            .boxed();
        Ok(Box::pin(StreamAdapter::new(self.schema(), out)))
    }
}

/// Leaf that replays one partition of an upstream stage's output, already
/// fetched from the exchange layer.
pub struct StageInputNode {
    stage_id: u64,
    schema: SchemaRef,
    batches: Arc<Vec<RecordBatch>>,
}

impl StageInputNode {
    pub fn new(stage_id: u64, schema: SchemaRef, batches: Arc<Vec<RecordBatch>>) -> Self {
        Self {
            stage_id,
            schema,
            batches,
        }
    }

    pub fn stage_id(&self) -> u64 {
        self.stage_id
    }
}

impl ExecNode for StageInputNode {
    fn name(&self) -> &'static str {
        "StageInput"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn execute(&self, _ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        Ok(memory_stream(self.schema(), self.batches.as_ref().clone()))
    }
}
