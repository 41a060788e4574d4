//! Record-batch stream abstractions and the monitored stream every operator
//! output passes through.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::Stream;
use quarry_common::metrics::global_metrics;
use quarry_common::Result;
use tracing::debug;

use crate::context::TaskContext;

/// A stream of RecordBatches that also knows its output schema.
pub trait RecordBatchStream: Stream<Item = Result<RecordBatch>> + Send {
    /// Output schema for every batch yielded by this stream.
    fn schema(&self) -> SchemaRef;
}

/// The standard "stream you can return from operators".
pub type SendableRecordBatchStream = Pin<Box<dyn RecordBatchStream>>;

/// Adapter that attaches a schema to any `Stream<Item = Result<RecordBatch>>`.
pub struct StreamAdapter<S> {
    schema: SchemaRef,
    inner: S,
}

impl<S> StreamAdapter<S> {
    /// Create a new schema-attached stream adapter.
    pub fn new(schema: SchemaRef, inner: S) -> Self {
        Self { schema, inner }
    }
}

impl<S> RecordBatchStream for StreamAdapter<S>
where
    S: Stream<Item = Result<RecordBatch>> + Send + Unpin + 'static,
{
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

impl<S> Stream for StreamAdapter<S>
where
    S: Stream<Item = Result<RecordBatch>> + Unpin,
{
    type Item = Result<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Stream over batches that are already in memory.
pub fn memory_stream(schema: SchemaRef, batches: Vec<RecordBatch>) -> SendableRecordBatchStream {
    let inner = futures::stream::iter(batches.into_iter().map(Ok));
    Box::pin(StreamAdapter::new(schema, inner))
}

/// Output counters of one operator instance.
#[derive(Debug, Default)]
pub struct OperatorStats {
    rows: AtomicU64,
    batches: AtomicU64,
}

impl OperatorStats {
    /// Rows emitted so far.
    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    /// Batches emitted so far.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    fn add(&self, rows: usize) {
        self.rows.fetch_add(rows as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }
}

/// Stream wrapper that stops at the first batch boundary after the query is
/// cancelled.
///
/// After cancellation it yields a single `Err(Cancelled)` and then ends
/// without polling its input again.
pub struct MonitoredStream {
    inner: SendableRecordBatchStream,
    ctx: Arc<TaskContext>,
    operator: &'static str,
    stats: Arc<OperatorStats>,
    children: Vec<Arc<OperatorStats>>,
    started: Instant,
    finished: bool,
}

impl MonitoredStream {
    /// Wrap `inner`, counting into `stats`.
    pub fn new(
        inner: SendableRecordBatchStream,
        ctx: Arc<TaskContext>,
        operator: &'static str,
        stats: Arc<OperatorStats>,
        children: Vec<Arc<OperatorStats>>,
    ) -> Self {
        Self {
            inner,
            ctx,
            operator,
            stats,
            children,
            started: Instant::now(),
            finished: false,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        let rows_in: u64 = self.children.iter().map(|c| c.rows()).sum();
        let batches_in: u64 = self.children.iter().map(|c| c.batches()).sum();
        let secs = self.started.elapsed().as_secs_f64();
        global_metrics().record_operator(
            &self.ctx.query.query_id().to_string(),
            self.ctx.stage_id,
            self.ctx.task_id,
            self.operator,
            rows_in,
            self.stats.rows(),
            batches_in,
            self.stats.batches(),
            secs,
        );
        debug!(
            query_id = %self.ctx.query.query_id(),
            stage_id = self.ctx.stage_id,
            task_id = self.ctx.task_id,
            partition = self.ctx.partition,
            operator = self.operator,
            rows_in,
            rows_out = self.stats.rows(),
            elapsed_ms = secs * 1000.0,
            "operator finished"
        );
    }
}

impl RecordBatchStream for MonitoredStream {
    fn schema(&self) -> SchemaRef {
        self.inner.schema()
    }
}

impl Stream for MonitoredStream {
    type Item = Result<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if let Err(e) = self.ctx.query.check_cancelled() {
            self.finish();
            return Poll::Ready(Some(Err(e)));
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(batch))) => {
                self.stats.add(batch.num_rows());
                Poll::Ready(Some(Ok(batch)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Drain a stream into a vector.
pub async fn collect(mut stream: SendableRecordBatchStream) -> Result<Vec<RecordBatch>> {
    use futures::StreamExt;
    let mut out = Vec::new();
    while let Some(batch) = stream.next().await {
        out.push(batch?);
    }
    Ok(out)
}
