//! Physical operator implementations.
//!
//! Every operator implements [`ExecNode`](crate::exec_node::ExecNode) for a
//! single partition. Blocking operators (sort, aggregate, join build) drain
//! their input lazily on the first poll.

mod aggregate;
mod exchange;
mod filter;
mod hash_join;
mod limit;
mod project;
mod sort;

use std::future::Future;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::{StreamExt, TryFutureExt, stream};
use quarry_common::{QuarryError, Result};

use crate::stream::{SendableRecordBatchStream, StreamAdapter};

pub use aggregate::{HashAggregateNode, avg_count_column};
pub use exchange::{LocalShuffleNode, StageInputNode};
pub use filter::FilterNode;
pub use hash_join::HashJoinNode;
pub use limit::LimitNode;
pub use project::ProjectNode;
pub use sort::SortNode;

/// Stream whose batches come from a future that runs on first poll.
fn deferred_stream<F>(schema: SchemaRef, fut: F) -> SendableRecordBatchStream
where
    F: Future<Output = Result<Vec<RecordBatch>>> + Send + 'static,
{
    let out = fut
        .map_ok(|batches| stream::iter(batches.into_iter().map(Ok::<_, QuarryError>)))
        .try_flatten_stream()
        .boxed();
    Box::pin(StreamAdapter::new(schema, out))
}

/// Slice `batch` into pieces of at most `rows` rows.
fn split_batch(batch: RecordBatch, rows: usize) -> Vec<RecordBatch> {
    let rows = rows.max(1);
    if batch.num_rows() <= rows {
        return if batch.num_rows() == 0 { vec![] } else { vec![batch] };
    }
    (0..batch.num_rows())
        .step_by(rows)
        .map(|offset| batch.slice(offset, rows.min(batch.num_rows() - offset)))
        .collect()
}
