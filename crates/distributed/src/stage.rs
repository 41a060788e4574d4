use quarry_common::{QuarryError, Result, StageId};
use quarry_planner::{ExchangeExec, PartitioningSpec, PhysicalPlan, StageInputExchange};
use serde::{Deserialize, Serialize};

/// What a stage does with its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageOutput {
    /// Shuffle to the consumer stage with this partitioning.
    Shuffle(PartitioningSpec),
    /// Final rows returned to the client.
    Result,
}

/// Upstream stage read by a consumer stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInputRef {
    pub stage_id: u64,
    /// Producer tasks that will send `End` for every partition.
    pub producers: usize,
    pub partitioning: PartitioningSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageNode {
    pub id: StageId,
    /// Executable fragment; shuffled inputs appear as `StageInput` leaves.
    pub plan: PhysicalPlan,
    pub output: StageOutput,
    /// One task per output partition of `plan`.
    pub task_count: usize,
    pub inputs: Vec<StageInputRef>,
    pub operators: Vec<String>,
    /// Producer stages.
    pub parents: Vec<StageId>,
    /// Consumer stage.
    pub children: Vec<StageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDag {
    /// Indexed by stage id; stage 0 is the result stage.
    pub stages: Vec<StageNode>,
}

impl StageDag {
    pub fn root_id(&self) -> Option<StageId> {
        self.stages.first().map(|s| s.id)
    }

    pub fn stage(&self, id: StageId) -> Option<&StageNode> {
        self.stages.get(id.0 as usize)
    }
}

/// Cut `plan` into stages at every `ShuffleRead` boundary.
///
/// The `ShuffleRead(ShuffleWrite(x))` pair becomes a `StageInput` leaf in the
/// consumer fragment and `x` becomes the root of a new producer stage.
pub fn build_stage_dag(plan: &PhysicalPlan) -> Result<StageDag> {
    let mut dag = StageDag { stages: Vec::new() };
    let root = reserve_stage(&mut dag);
    let fragment = cut(plan, root, &mut dag)?;
    finish_stage(&mut dag, root, fragment, StageOutput::Result);
    Ok(dag)
}

fn reserve_stage(dag: &mut StageDag) -> StageId {
    let id = StageId(dag.stages.len() as u64);
    dag.stages.push(StageNode {
        id,
        plan: PhysicalPlan::Exchange(ExchangeExec::StageInput(StageInputExchange {
            stage_id: id.0,
            partitioning: PartitioningSpec::Single,
        })),
        output: StageOutput::Result,
        task_count: 0,
        inputs: Vec::new(),
        operators: Vec::new(),
        parents: Vec::new(),
        children: Vec::new(),
    });
    id
}

fn finish_stage(dag: &mut StageDag, id: StageId, fragment: PhysicalPlan, output: StageOutput) {
    let mut operators = Vec::new();
    collect_operators(&fragment, &mut operators);
    let stage = &mut dag.stages[id.0 as usize];
    stage.task_count = fragment.output_partitions();
    stage.operators = operators;
    stage.plan = fragment;
    stage.output = output;
}

fn add_edge(dag: &mut StageDag, producer: StageId, consumer: StageId) {
    if !dag.stages[producer.0 as usize].children.contains(&consumer) {
        dag.stages[producer.0 as usize].children.push(consumer);
    }
    if !dag.stages[consumer.0 as usize].parents.contains(&producer) {
        dag.stages[consumer.0 as usize].parents.push(producer);
    }
}

fn cut(plan: &PhysicalPlan, stage: StageId, dag: &mut StageDag) -> Result<PhysicalPlan> {
    let boxed = |p: &PhysicalPlan, dag: &mut StageDag| cut(p, stage, dag).map(Box::new);
    Ok(match plan {
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
            let upstream = reserve_stage(dag);
            add_edge(dag, upstream, stage);
            let fragment = cut(&write.input, upstream, dag)?;
            let producers = fragment.output_partitions();
            finish_stage(
                dag,
                upstream,
                fragment,
                StageOutput::Shuffle(write.partitioning.clone()),
            );
            dag.stages[stage.0 as usize].inputs.push(StageInputRef {
                stage_id: upstream.0,
                producers,
                partitioning: write.partitioning.clone(),
            });
            PhysicalPlan::Exchange(ExchangeExec::StageInput(StageInputExchange {
                stage_id: upstream.0,
                partitioning: write.partitioning.clone(),
            }))
        }
        PhysicalPlan::Exchange(ExchangeExec::ShuffleWrite(_)) => {
            return Err(QuarryError::Planning(
                "ShuffleWrite without a ShuffleRead consumer".to_string(),
            ));
        }
        PhysicalPlan::Exchange(ExchangeExec::StageInput(_)) | PhysicalPlan::Scan(_) => plan.clone(),
        PhysicalPlan::Filter(x) => {
            let mut x = x.clone();
            x.input = boxed(&x.input, dag)?;
            PhysicalPlan::Filter(x)
        }
        PhysicalPlan::Project(x) => {
            let mut x = x.clone();
            x.input = boxed(&x.input, dag)?;
            PhysicalPlan::Project(x)
        }
        PhysicalPlan::HashJoin(x) => {
            let mut x = x.clone();
            x.left = boxed(&x.left, dag)?;
            x.right = boxed(&x.right, dag)?;
            PhysicalPlan::HashJoin(x)
        }
        PhysicalPlan::HashAggregate(x) => {
            let mut x = x.clone();
            x.input = boxed(&x.input, dag)?;
            PhysicalPlan::HashAggregate(x)
        }
        PhysicalPlan::Sort(x) => {
            let mut x = x.clone();
            x.input = boxed(&x.input, dag)?;
            PhysicalPlan::Sort(x)
        }
        PhysicalPlan::Limit(x) => {
            let mut x = x.clone();
            x.input = boxed(&x.input, dag)?;
            PhysicalPlan::Limit(x)
        }
    })
}

fn collect_operators(plan: &PhysicalPlan, out: &mut Vec<String>) {
    out.push(plan.name().to_string());
    for child in plan.children() {
        collect_operators(child, out);
    }
}
