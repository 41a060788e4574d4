use std::sync::Arc;

use arrow_schema::SchemaRef;
use quarry_common::Result;

use crate::context::TaskContext;
use crate::stream::{MonitoredStream, OperatorStats, SendableRecordBatchStream};

/// A physical operator instance that produces RecordBatches for one
/// partition.
///
/// Operators are pull-based: nothing runs until the consumer polls the
/// returned stream.
pub trait ExecNode: Send + Sync {
    /// Operator name used for logs and metric labels.
    fn name(&self) -> &'static str;

    /// Output schema of every batch.
    fn schema(&self) -> SchemaRef;

    /// Start the operator and return its output stream.
    fn execute(&self, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream>;
}

/// Wraps an operator so its output stream checks cancellation at every
/// batch boundary and reports row/batch counters when it finishes.
pub struct MonitoredExec {
    inner: Arc<dyn ExecNode>,
    stats: Arc<OperatorStats>,
    children: Vec<Arc<OperatorStats>>,
}

impl MonitoredExec {
    /// Wrap `inner`; `children` are the stats handles of its wrapped inputs.
    pub fn new(inner: Arc<dyn ExecNode>, children: Vec<Arc<OperatorStats>>) -> Self {
        Self {
            inner,
            stats: Arc::new(OperatorStats::default()),
            children,
        }
    }

    /// Counters of this operator's output.
    pub fn stats(&self) -> Arc<OperatorStats> {
        Arc::clone(&self.stats)
    }
}

impl ExecNode for MonitoredExec {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn schema(&self) -> SchemaRef {
        self.inner.schema()
    }

    fn execute(&self, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        ctx.query.check_cancelled()?;
        let inner = self.inner.execute(Arc::clone(&ctx))?;
        Ok(Box::pin(MonitoredStream::new(
            inner,
            ctx,
            self.inner.name(),
            Arc::clone(&self.stats),
            self.children.clone(),
        )))
    }
}
