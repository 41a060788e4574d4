use std::sync::Arc;

use arrow::array::BooleanArray;
use arrow::compute::filter_record_batch;
use arrow_schema::{DataType, SchemaRef};
use futures::{StreamExt, future};
use quarry_common::{QuarryError, Result};
use quarry_planner::Expr;

use crate::context::TaskContext;
use crate::exec_node::ExecNode;
use crate::expressions::{PhysicalExpr, compile_expr};
use crate::stream::{SendableRecordBatchStream, StreamAdapter};

/// Keeps rows whose predicate is TRUE. FALSE and NULL rows are dropped;
/// batches left empty are not emitted.
pub struct FilterNode {
    input: Arc<dyn ExecNode>,
    predicate: Arc<dyn PhysicalExpr>,
}

impl FilterNode {
    pub fn try_new(input: Arc<dyn ExecNode>, predicate: &Expr) -> Result<Self> {
        let predicate = compile_expr(predicate, &input.schema())?;
        match predicate.data_type() {
            DataType::Boolean | DataType::Null => {}
            other => {
                return Err(QuarryError::TypeMismatch(format!(
                    "filter predicate must be boolean, got {other:?}"
                )));
            }
        }
        Ok(Self { input, predicate })
    }
}

impl ExecNode for FilterNode {
    fn name(&self) -> &'static str {
        "Filter"
    }

    fn schema(&self) -> SchemaRef {
        self.input.schema()
    }

    fn execute(&self, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let input = self.input.execute(ctx)?;
        let predicate = Arc::clone(&self.predicate);
        let stream = input
            .map(move |batch| {
                let batch = batch?;
                let mask = predicate.evaluate(&batch)?;
                let filtered = match mask.as_any().downcast_ref::<BooleanArray>() {
                    Some(mask) => filter_record_batch(&batch, mask)
                        .map_err(|e| QuarryError::Execution(format!("filter failed: {e}")))?,
                    // An untyped NULL predicate keeps nothing.
                    None => batch.slice(0, 0),
                };
                Ok(filtered)
            })
            .filter(|b: &Result<_>| {
                future::ready(b.as_ref().map_or(true, |b| b.num_rows() > 0))
            });
        Ok(Box::pin(StreamAdapter::new(self.schema(), stream)))
    }
}
