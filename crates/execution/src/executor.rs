//! Builds operator trees from physical plans and drives local execution.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use quarry_common::{QuarryError, Result};
use quarry_planner::{ExchangeExec, PhysicalPlan};
use tracing::{debug, info};

use crate::context::{ExecutionContext, TaskContext};
use crate::exec_node::{ExecNode, MonitoredExec};
use crate::operators::{
    FilterNode, HashAggregateNode, HashJoinNode, LimitNode, LocalShuffleNode, ProjectNode,
    SortNode, StageInputNode,
};
use crate::repartition::Partitioner;
use crate::stream::{OperatorStats, SendableRecordBatchStream, collect};

/// Resolves table scans to partition-local leaf operators.
pub trait TableSource: Send + Sync {
    /// Leaf producing partition `partition` of `table`, restricted to
    /// `projection` when given.
    fn scan(
        &self,
        table: &str,
        partition: usize,
        projection: Option<&[String]>,
    ) -> Result<Arc<dyn ExecNode>>;
}

/// Prefetched output of one upstream stage partition.
#[derive(Debug, Clone)]
pub struct StageInputData {
    pub schema: SchemaRef,
    pub batches: Arc<Vec<RecordBatch>>,
}

/// Everything needed to instantiate a plan on this process.
#[derive(Clone)]
pub struct ExecEnv {
    pub tables: Arc<dyn TableSource>,
    /// Inputs of `StageInput` leaves, keyed by upstream stage id.
    pub stage_inputs: HashMap<u64, StageInputData>,
}

impl ExecEnv {
    pub fn new(tables: Arc<dyn TableSource>) -> Self {
        Self {
            tables,
            stage_inputs: HashMap::new(),
        }
    }

    pub fn with_stage_input(mut self, stage_id: u64, data: StageInputData) -> Self {
        self.stage_inputs.insert(stage_id, data);
        self
    }
}

/// Instantiate `plan` for output partition `partition`.
///
/// Every operator is wrapped so it stops at the next batch boundary after
/// cancellation and reports its counters when done.
pub fn create_exec_node(
    plan: &PhysicalPlan,
    partition: usize,
    env: &ExecEnv,
) -> Result<Arc<dyn ExecNode>> {
    Ok(build(plan, partition, env)?.0)
}

fn build(
    plan: &PhysicalPlan,
    partition: usize,
    env: &ExecEnv,
) -> Result<(Arc<dyn ExecNode>, Arc<OperatorStats>)> {
    let mut children = Vec::new();
    let mut child = |p: &PhysicalPlan, part: usize| -> Result<Arc<dyn ExecNode>> {
        let (node, stats) = build(p, part, env)?;
        children.push(stats);
        Ok(node)
    };

    let node: Arc<dyn ExecNode> = match plan {
        PhysicalPlan::Scan(scan) => {
            if partition >= scan.partitions {
                return Err(QuarryError::Execution(format!(
                    "scan of '{}' has {} partitions, partition {partition} requested",
                    scan.table, scan.partitions
                )));
            }
            env.tables
                .scan(&scan.table, partition, scan.projection.as_deref())?
        }
        PhysicalPlan::Filter(f) => {
            Arc::new(FilterNode::try_new(child(&f.input, partition)?, &f.predicate)?)
        }
        PhysicalPlan::Project(p) => {
            Arc::new(ProjectNode::try_new(child(&p.input, partition)?, &p.exprs)?)
        }
        PhysicalPlan::HashJoin(j) => {
            let (lp, rp) = (j.left.output_partitions(), j.right.output_partitions());
            if lp != rp {
                return Err(QuarryError::Planning(format!(
                    "join inputs are partitioned differently: {lp} vs {rp}"
                )));
            }
            let left = child(&j.left, partition)?;
            let right = child(&j.right, partition)?;
            Arc::new(HashJoinNode::try_new(
                left,
                right,
                &j.on,
                j.join_type,
                j.build_side,
            )?)
        }
        PhysicalPlan::HashAggregate(a) => Arc::new(HashAggregateNode::try_new(
            child(&a.input, partition)?,
            a.mode,
            &a.group_exprs,
            &a.aggr_exprs,
        )?),
        PhysicalPlan::Sort(s) => {
            Arc::new(SortNode::try_new(child(&s.input, partition)?, &s.exprs, s.fetch)?)
        }
        PhysicalPlan::Limit(l) => Arc::new(LimitNode::new(child(&l.input, partition)?, l.n)),
        PhysicalPlan::Exchange(ExchangeExec::ShuffleRead(read)) => {
            let PhysicalPlan::Exchange(ExchangeExec::ShuffleWrite(write)) = read.input.as_ref()
            else {
                return Err(QuarryError::Planning(
                    "ShuffleRead must sit directly on a ShuffleWrite".to_string(),
                ));
            };
            if write.partitioning != read.partitioning {
                return Err(QuarryError::Planning(
                    "ShuffleRead partitioning differs from its ShuffleWrite".to_string(),
                ));
            }
            let inputs = (0..write.input.output_partitions())
                .map(|p| child(&write.input, p))
                .collect::<Result<Vec<_>>>()?;
            let schema = inputs
                .first()
                .map(|n| n.schema())
                .ok_or_else(|| QuarryError::Planning("shuffle without inputs".to_string()))?;
            let partitioner = Partitioner::try_new(&read.partitioning, &schema)?;
            Arc::new(LocalShuffleNode::new(inputs, partitioner, partition, schema))
        }
        PhysicalPlan::Exchange(ExchangeExec::ShuffleWrite(_)) => {
            return Err(QuarryError::Planning(
                "ShuffleWrite is a stage root and cannot be executed as an operator".to_string(),
            ));
        }
        PhysicalPlan::Exchange(ExchangeExec::StageInput(input)) => {
            let data = env.stage_inputs.get(&input.stage_id).ok_or_else(|| {
                QuarryError::Execution(format!(
                    "no input fetched for upstream stage {}",
                    input.stage_id
                ))
            })?;
            Arc::new(StageInputNode::new(
                input.stage_id,
                Arc::clone(&data.schema),
                Arc::clone(&data.batches),
            ))
        }
    };
    let monitored = MonitoredExec::new(node, children);
    let stats = monitored.stats();
    Ok((Arc::new(monitored), stats))
}

/// Start `plan` for one partition under `ctx`.
pub fn execute_partition(
    plan: &PhysicalPlan,
    ctx: Arc<TaskContext>,
    env: &ExecEnv,
) -> Result<SendableRecordBatchStream> {
    let node = create_exec_node(plan, ctx.partition, env)?;
    node.execute(ctx)
}

/// Run every output partition of `plan` in this process and concatenate the
/// results in partition order.
pub async fn execute_plan(
    plan: &PhysicalPlan,
    query: Arc<ExecutionContext>,
    env: &ExecEnv,
) -> Result<Vec<RecordBatch>> {
    let partitions = plan.output_partitions();
    info!(
        query_id = %query.query_id(),
        root = plan.name(),
        partitions,
        "executing plan locally"
    );
    let mut out = Vec::new();
    for partition in 0..partitions {
        let ctx = TaskContext::local(Arc::clone(&query), partition);
        let batches = collect(execute_partition(plan, ctx, env)?).await?;
        debug!(partition, batches = batches.len(), "partition finished");
        out.extend(batches);
    }
    Ok(out)
}
