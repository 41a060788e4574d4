use std::sync::Arc;

use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::{Field, Schema, SchemaRef};
use futures::StreamExt;
use quarry_common::{QuarryError, Result};
use quarry_planner::Expr;

use crate::context::TaskContext;
use crate::exec_node::ExecNode;
use crate::expressions::{PhysicalExpr, compile_expr};
use crate::stream::{SendableRecordBatchStream, StreamAdapter};

/// Evaluates one expression per output column. Row count is preserved.
pub struct ProjectNode {
    input: Arc<dyn ExecNode>,
    exprs: Vec<Arc<dyn PhysicalExpr>>,
    schema: SchemaRef,
}

impl ProjectNode {
    pub fn try_new(input: Arc<dyn ExecNode>, exprs: &[(Expr, String)]) -> Result<Self> {
        let in_schema = input.schema();
        let mut fields = Vec::with_capacity(exprs.len());
        let mut compiled = Vec::with_capacity(exprs.len());
        for (expr, name) in exprs {
            if fields.iter().any(|f: &Field| f.name() == name) {
                return Err(QuarryError::Planning(format!(
                    "duplicate projection name: {name}"
                )));
            }
            let e = compile_expr(expr, &in_schema)?;
            fields.push(Field::new(name, e.data_type(), true));
            compiled.push(e);
        }
        Ok(Self {
            input,
            exprs: compiled,
            schema: Arc::new(Schema::new(fields)),
        })
    }
}

impl ExecNode for ProjectNode {
    fn name(&self) -> &'static str {
        "Project"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn execute(&self, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let input = self.input.execute(ctx)?;
        let exprs = self.exprs.clone();
        let schema = Arc::clone(&self.schema);
        let out_schema = Arc::clone(&schema);
        let stream = input.map(move |batch| {
            let batch = batch?;
            let columns = exprs
                .iter()
                .map(|e| e.evaluate(&batch))
                .collect::<Result<Vec<_>>>()?;
            let options = RecordBatchOptions::new().with_row_count(Some(batch.num_rows()));
            RecordBatch::try_new_with_options(Arc::clone(&out_schema), columns, &options)
                .map_err(|e| QuarryError::Execution(format!("project failed: {e}")))
        });
        Ok(Box::pin(StreamAdapter::new(schema, stream)))
    }
}
