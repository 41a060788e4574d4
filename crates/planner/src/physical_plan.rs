use crate::logical_plan::{AggExpr, Expr, JoinType, SortExpr};
use serde::{Deserialize, Serialize};

/// The physical operator graph.
///
/// Each node owns its children exclusively, so the tree is acyclic by
/// construction. Exchange nodes mark stage boundaries; the distributed layer
/// cuts the tree at every [`ExchangeExec::ShuffleRead`] and replaces it with an
/// [`ExchangeExec::StageInput`] leaf in the consuming fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PhysicalPlan {
    /// Table partition scan.
    Scan(ScanExec),
    /// Row filter.
    Filter(FilterExec),
    /// Projection.
    Project(ProjectExec),
    /// Hash join.
    HashJoin(HashJoinExec),
    /// Hash aggregate (partial, final or single phase).
    HashAggregate(HashAggregateExec),
    /// Multi-key sort.
    Sort(SortExec),
    /// Limit.
    Limit(LimitExec),
    /// Data exchange boundary.
    Exchange(ExchangeExec),
}

impl PhysicalPlan {
    /// Returns direct child operators.
    pub fn children(&self) -> Vec<&PhysicalPlan> {
        match self {
            PhysicalPlan::Scan(_) => vec![],
            PhysicalPlan::Filter(x) => vec![x.input.as_ref()],
            PhysicalPlan::Project(x) => vec![x.input.as_ref()],
            PhysicalPlan::HashJoin(x) => vec![x.left.as_ref(), x.right.as_ref()],
            PhysicalPlan::HashAggregate(x) => vec![x.input.as_ref()],
            PhysicalPlan::Sort(x) => vec![x.input.as_ref()],
            PhysicalPlan::Limit(x) => vec![x.input.as_ref()],
            PhysicalPlan::Exchange(x) => match x {
                ExchangeExec::ShuffleWrite(e) => vec![e.input.as_ref()],
                ExchangeExec::ShuffleRead(e) => vec![e.input.as_ref()],
                ExchangeExec::StageInput(_) => vec![],
            },
        }
    }

    /// Operator name used in logs, metrics and explain output.
    pub fn name(&self) -> &'static str {
        match self {
            PhysicalPlan::Scan(_) => "Scan",
            PhysicalPlan::Filter(_) => "Filter",
            PhysicalPlan::Project(_) => "Project",
            PhysicalPlan::HashJoin(_) => "HashJoin",
            PhysicalPlan::HashAggregate(x) => match x.mode {
                AggregateMode::Partial => "PartialHashAggregate",
                AggregateMode::Final => "FinalHashAggregate",
                AggregateMode::Single => "HashAggregate",
            },
            PhysicalPlan::Sort(_) => "Sort",
            PhysicalPlan::Limit(_) => "Limit",
            PhysicalPlan::Exchange(ExchangeExec::ShuffleWrite(_)) => "ShuffleWrite",
            PhysicalPlan::Exchange(ExchangeExec::ShuffleRead(_)) => "ShuffleRead",
            PhysicalPlan::Exchange(ExchangeExec::StageInput(_)) => "StageInput",
        }
    }

    /// Number of partitions this plan produces when run.
    ///
    /// Scans produce one partition per table partition; exchanges produce the
    /// partition count of their partitioning; everything else inherits from
    /// its (left-most) input.
    pub fn output_partitions(&self) -> usize {
        match self {
            PhysicalPlan::Scan(x) => x.partitions,
            PhysicalPlan::Filter(x) => x.input.output_partitions(),
            PhysicalPlan::Project(x) => x.input.output_partitions(),
            PhysicalPlan::HashJoin(x) => x.left.output_partitions(),
            PhysicalPlan::HashAggregate(x) => x.input.output_partitions(),
            PhysicalPlan::Sort(x) => x.input.output_partitions(),
            PhysicalPlan::Limit(x) => x.input.output_partitions(),
            PhysicalPlan::Exchange(ExchangeExec::ShuffleWrite(x)) => x.input.output_partitions(),
            PhysicalPlan::Exchange(ExchangeExec::ShuffleRead(x)) => x.partitioning.partition_count(),
            PhysicalPlan::Exchange(ExchangeExec::StageInput(x)) => x.partitioning.partition_count(),
        }
    }
}

/// Scan of one catalog table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanExec {
    /// Table name from the catalog.
    pub table: String,
    /// Column names to keep, in output order.
    pub projection: Option<Vec<String>>,
    /// Partition count resolved from the catalog at planning time.
    pub partitions: usize,
}

/// Row filter operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExec {
    /// Predicate.
    pub predicate: Expr,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Projection operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectExec {
    /// (expr, output_name)
    pub exprs: Vec<(Expr, String)>,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Side chosen to build the hash table for [`HashJoinExec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildSide {
    /// Build hash table from left input.
    Left,
    /// Build hash table from right input.
    Right,
}

/// Hash join physical operator.
///
/// Contract:
/// - `on` is positional key mapping `(left_key, right_key)`;
/// - output columns are left columns followed by right columns;
/// - NULL keys never match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashJoinExec {
    /// Left input.
    pub left: Box<PhysicalPlan>,
    /// Right input.
    pub right: Box<PhysicalPlan>,
    /// Join key pairs `(left_key, right_key)`.
    pub on: Vec<(String, String)>,
    /// Join type.
    pub join_type: JoinType,
    /// The side the in-memory hash table is built from.
    pub build_side: BuildSide,
}

/// Aggregation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateMode {
    /// Phase 1: per-partition partial states. AVG emits a hidden count column.
    Partial,
    /// Phase 2: merges partial states after repartitioning by group key.
    Final,
    /// Raw input to final values in one step.
    Single,
}

/// Hash aggregate operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashAggregateExec {
    /// Aggregation phase.
    pub mode: AggregateMode,
    /// Grouping expressions (plain columns).
    pub group_exprs: Vec<Expr>,
    /// Aggregate expressions and aliases.
    pub aggr_exprs: Vec<(AggExpr, String)>,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Sort operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortExec {
    /// Sort keys, most significant first.
    pub exprs: Vec<SortExpr>,
    /// Keep only the first `fetch` rows when set.
    pub fetch: Option<usize>,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Limit operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitExec {
    /// Maximum number of rows.
    pub n: usize,
    /// Input plan.
    pub input: Box<PhysicalPlan>,
}

/// Stage-boundary exchange operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExchangeExec {
    /// Producer side: partitions the input and sends it to consumers.
    ShuffleWrite(ShuffleWriteExchange),
    /// Consumer side: reads one partition of the child's shuffled output.
    ShuffleRead(ShuffleReadExchange),
    /// Leaf standing in for a `ShuffleRead` once the plan is cut into stages.
    StageInput(StageInputExchange),
}

/// Shuffle write boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleWriteExchange {
    /// Input plan.
    pub input: Box<PhysicalPlan>,
    /// Partitioning specification.
    pub partitioning: PartitioningSpec,
}

/// Shuffle read boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuffleReadExchange {
    /// Input plan, always a [`ExchangeExec::ShuffleWrite`].
    pub input: Box<PhysicalPlan>,
    /// Partitioning specification.
    pub partitioning: PartitioningSpec,
}

/// Reference to a producer stage's shuffled output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInputExchange {
    /// Producer stage id.
    pub stage_id: u64,
    /// Partitioning the producer wrote with.
    pub partitioning: PartitioningSpec,
}

/// Partitioning contract used by exchanges and the distributed stage planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PartitioningSpec {
    /// Hash partition by key columns into N buckets.
    HashKeys {
        /// Partition key names.
        keys: Vec<String>,
        /// Partition count.
        partitions: usize,
    },
    /// Range partition on one Int64 column.
    ///
    /// `bounds` are ascending split points: partition `i` holds keys in
    /// `[bounds[i-1], bounds[i])`, so there are `bounds.len() + 1` partitions.
    /// NULL keys go to partition 0.
    Range {
        /// Partition key name.
        key: String,
        /// Ascending split points.
        bounds: Vec<i64>,
    },
    /// Single partition.
    Single,
}

impl PartitioningSpec {
    pub fn partition_count(&self) -> usize {
        match self {
            PartitioningSpec::HashKeys { partitions, .. } => (*partitions).max(1),
            PartitioningSpec::Range { bounds, .. } => bounds.len() + 1,
            PartitioningSpec::Single => 1,
        }
    }
}
