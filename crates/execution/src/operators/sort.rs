use std::sync::Arc;

use arrow::compute::{SortColumn, SortOptions, lexsort_to_indices, take_record_batch};
use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::StreamExt;
use quarry_common::{QuarryError, Result};
use quarry_planner::SortExpr;
use tracing::debug;

use crate::columnar::BatchBuffer;
use crate::context::TaskContext;
use crate::exec_node::ExecNode;
use crate::expressions::{PhysicalExpr, compile_expr};
use crate::operators::{deferred_stream, split_batch};
use crate::stream::SendableRecordBatchStream;

struct CompiledSortKey {
    expr: Arc<dyn PhysicalExpr>,
    options: SortOptions,
}

/// Buffers its whole input under the query's memory limit, then emits it
/// ordered by the sort keys. With `fetch` only the first rows are kept.
pub struct SortNode {
    input: Arc<dyn ExecNode>,
    keys: Arc<Vec<CompiledSortKey>>,
    fetch: Option<usize>,
}

impl SortNode {
    pub fn try_new(
        input: Arc<dyn ExecNode>,
        exprs: &[SortExpr],
        fetch: Option<usize>,
    ) -> Result<Self> {
        let schema = input.schema();
        let keys = exprs
            .iter()
            .map(|s| {
                Ok(CompiledSortKey {
                    expr: compile_expr(&s.expr, &schema)?,
                    options: SortOptions {
                        descending: !s.asc,
                        nulls_first: s.nulls_first,
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            input,
            keys: Arc::new(keys),
            fetch,
        })
    }
}

impl ExecNode for SortNode {
    fn name(&self) -> &'static str {
        "Sort"
    }

    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }

    fn execute(&self, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let input = self.input.execute(Arc::clone(&ctx))?;
        let keys = Arc::clone(&self.keys);
        let fetch = self.fetch;
        let schema = self.schema();
        Ok(deferred_stream(schema, async move {
            sort_all(input, &keys, fetch, &ctx).await
        }))
    }
}

async fn sort_all(
    mut input: SendableRecordBatchStream,
    keys: &[CompiledSortKey],
    fetch: Option<usize>,
    ctx: &TaskContext,
) -> Result<Vec<RecordBatch>> {
    let mut buffer = BatchBuffer::new(input.schema(), ctx.memory());
    while let Some(batch) = input.next().await {
        buffer.push(batch?)?;
    }
    if buffer.num_rows() == 0 {
        return Ok(vec![]);
    }
    let tracked = buffer.into_single_batch()?;
    let all = tracked.batch();
    let columns = keys
        .iter()
        .map(|k| {
            Ok(SortColumn {
                values: k.expr.evaluate(all)?,
                options: Some(k.options),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let indices = lexsort_to_indices(&columns, fetch)
        .map_err(|e| QuarryError::Execution(format!("sort failed: {e}")))?;
    let sorted = take_record_batch(all, &indices)
        .map_err(|e| QuarryError::Execution(format!("sort take failed: {e}")))?;
    debug!(
        rows = sorted.num_rows(),
        reserved_bytes = tracked.reserved_bytes(),
        "sort materialized"
    );

    Ok(split_batch(sorted, ctx.batch_size_rows()))
}
