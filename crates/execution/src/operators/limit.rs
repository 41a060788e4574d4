use std::sync::Arc;

use arrow_schema::SchemaRef;
use futures::{StreamExt, stream};
use quarry_common::Result;

use crate::context::TaskContext;
use crate::exec_node::ExecNode;
use crate::stream::{SendableRecordBatchStream, StreamAdapter};

/// Emits the first `n` rows of its input and stops pulling once they are
/// produced.
pub struct LimitNode {
    input: Arc<dyn ExecNode>,
    n: usize,
}

impl LimitNode {
    pub fn new(input: Arc<dyn ExecNode>, n: usize) -> Self {
        Self { input, n }
    }
}

impl ExecNode for LimitNode {
    fn name(&self) -> &'static str {
        "Limit"
    }

    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }

    fn execute(&self, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let input = self.input.execute(ctx)?;
        let out = stream::unfold((input, self.n), |(mut input, remaining)| async move {
            if remaining == 0 {
                return None;
            }
            match input.next().await? {
                Ok(batch) => {
                    let take = batch.num_rows().min(remaining);
                    let batch = if take < batch.num_rows() {
                        batch.slice(0, take)
                    } else {
                        batch
                    };
                    Some((Ok(batch), (input, remaining - take)))
                }
                Err(e) => Some((Err(e), (input, 0))),
            }
        })
        .boxed();
        Ok(Box::pin(StreamAdapter::new(self.schema(), out)))
    }
}
