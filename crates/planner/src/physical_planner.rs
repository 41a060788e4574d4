use quarry_common::{EngineConfig, QuarryError, Result};

use crate::logical_plan::{Expr, JoinType, LogicalPlan, SortExpr};
use crate::physical_plan::{
    AggregateMode, BuildSide, ExchangeExec, FilterExec, HashAggregateExec, HashJoinExec,
    LimitExec, PartitioningSpec, PhysicalPlan, ProjectExec, ScanExec, ShuffleReadExchange,
    ShuffleWriteExchange, SortExec,
};

#[derive(Debug, Clone)]
pub struct PhysicalPlannerConfig {
    /// Number of hash partitions used by shuffle exchanges.
    pub shuffle_partitions: usize,
}

impl Default for PhysicalPlannerConfig {
    fn default() -> Self {
        Self {
            shuffle_partitions: 8,
        }
    }
}

impl From<&EngineConfig> for PhysicalPlannerConfig {
    fn from(engine: &EngineConfig) -> Self {
        Self {
            shuffle_partitions: engine.shuffle_partitions,
        }
    }
}

/// Table metadata the physical planner needs.
pub trait PlanningContext {
    /// Number of partitions a scan of `table` produces.
    fn table_partitions(&self, table: &str) -> Result<usize>;
}

/// Lower a logical plan to executable physical operators.
///
/// Contracts:
/// - logical semantics are preserved;
/// - aggregate lowers to `Partial -> ShuffleWrite/Read(hash(group keys)) -> Final`,
///   or to a shuffle of raw rows feeding a `Single` aggregate when any
///   aggregate (COUNT DISTINCT) cannot be split;
/// - join repartitions both inputs by their join keys;
/// - sort and limit gather multi-partition input into one partition, with a
///   per-partition pre-pass (`Sort{fetch}` / `Limit`) before the gather;
/// - unsupported logical shapes return a planning error.
pub fn create_physical_plan(
    logical: &LogicalPlan,
    cfg: &PhysicalPlannerConfig,
    ctx: &dyn PlanningContext,
) -> Result<PhysicalPlan> {
    if cfg.shuffle_partitions == 0 {
        return Err(QuarryError::InvalidConfig(
            "shuffle_partitions must be > 0".to_string(),
        ));
    }
    match logical {
        LogicalPlan::TableScan { table, projection } => {
            let partitions = ctx.table_partitions(table)?;
            if partitions == 0 {
                return Err(QuarryError::Planning(format!(
                    "table '{table}' has no partitions"
                )));
            }
            Ok(PhysicalPlan::Scan(ScanExec {
                table: table.clone(),
                projection: projection.clone(),
                partitions,
            }))
        }

        LogicalPlan::Filter { predicate, input } => {
            let child = create_physical_plan(input, cfg, ctx)?;
            Ok(PhysicalPlan::Filter(FilterExec {
                predicate: predicate.clone(),
                input: Box::new(child),
            }))
        }

        LogicalPlan::Projection { exprs, input } => {
            if exprs.is_empty() {
                return Err(QuarryError::Planning(
                    "projection needs at least one expression".to_string(),
                ));
            }
            let child = create_physical_plan(input, cfg, ctx)?;
            Ok(PhysicalPlan::Project(ProjectExec {
                exprs: exprs.clone(),
                input: Box::new(child),
            }))
        }

        LogicalPlan::Sort { exprs, input } => plan_sort(exprs, None, input, cfg, ctx),

        LogicalPlan::Limit { n, input } => {
            if let LogicalPlan::Sort { exprs, input } = input.as_ref() {
                return plan_sort(exprs, Some(*n), input, cfg, ctx);
            }
            let child = create_physical_plan(input, cfg, ctx)?;
            let child = if child.output_partitions() > 1 {
                gather(PhysicalPlan::Limit(LimitExec {
                    n: *n,
                    input: Box::new(child),
                }))
            } else {
                child
            };
            Ok(PhysicalPlan::Limit(LimitExec {
                n: *n,
                input: Box::new(child),
            }))
        }

        LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            input,
        } => {
            let child = create_physical_plan(input, cfg, ctx)?;

            let keys = group_exprs
                .iter()
                .map(expr_to_key_name)
                .collect::<Result<Vec<_>>>()?;
            let partitioning = if keys.is_empty() {
                PartitioningSpec::Single
            } else {
                PartitioningSpec::HashKeys {
                    keys,
                    partitions: cfg.shuffle_partitions,
                }
            };

            // Distinct counts need every row of a group in one place, so the
            // raw input is shuffled and aggregated in a single phase.
            if !aggr_exprs.iter().all(|(a, _)| a.is_decomposable()) {
                return Ok(PhysicalPlan::HashAggregate(HashAggregateExec {
                    mode: AggregateMode::Single,
                    group_exprs: group_exprs.clone(),
                    aggr_exprs: aggr_exprs.clone(),
                    input: Box::new(shuffle(child, partitioning)),
                }));
            }

            let partial = PhysicalPlan::HashAggregate(HashAggregateExec {
                mode: AggregateMode::Partial,
                group_exprs: group_exprs.clone(),
                aggr_exprs: aggr_exprs.clone(),
                input: Box::new(child),
            });
            Ok(PhysicalPlan::HashAggregate(HashAggregateExec {
                mode: AggregateMode::Final,
                group_exprs: group_exprs.clone(),
                aggr_exprs: aggr_exprs.clone(),
                input: Box::new(shuffle(partial, partitioning)),
            }))
        }

        LogicalPlan::Join {
            left,
            right,
            on,
            join_type,
        } => {
            if on.is_empty() {
                return Err(QuarryError::Planning(
                    "join requires at least one key pair".to_string(),
                ));
            }
            let l = create_physical_plan(left, cfg, ctx)?;
            let r = create_physical_plan(right, cfg, ctx)?;

            let left_keys: Vec<String> = on.iter().map(|(lk, _)| lk.clone()).collect();
            let right_keys: Vec<String> = on.iter().map(|(_, rk)| rk.clone()).collect();
            let part_l = PartitioningSpec::HashKeys {
                keys: left_keys,
                partitions: cfg.shuffle_partitions,
            };
            let part_r = PartitioningSpec::HashKeys {
                keys: right_keys,
                partitions: cfg.shuffle_partitions,
            };

            // Probe order drives output order; probing the left input keeps
            // left-preserving joins in input order.
            let build_side = match join_type {
                JoinType::Right => BuildSide::Left,
                JoinType::Inner | JoinType::Left | JoinType::Full => BuildSide::Right,
            };

            Ok(PhysicalPlan::HashJoin(HashJoinExec {
                left: Box::new(shuffle(l, part_l)),
                right: Box::new(shuffle(r, part_r)),
                on: on.clone(),
                join_type: *join_type,
                build_side,
            }))
        }
    }
}

fn plan_sort(
    exprs: &[SortExpr],
    fetch: Option<usize>,
    input: &LogicalPlan,
    cfg: &PhysicalPlannerConfig,
    ctx: &dyn PlanningContext,
) -> Result<PhysicalPlan> {
    if exprs.is_empty() {
        return Err(QuarryError::Planning(
            "sort needs at least one key".to_string(),
        ));
    }
    let child = create_physical_plan(input, cfg, ctx)?;
    let child = if child.output_partitions() > 1 {
        // Top-k per partition is enough when only `fetch` rows survive.
        let pre = match fetch {
            Some(_) => PhysicalPlan::Sort(SortExec {
                exprs: exprs.to_vec(),
                fetch,
                input: Box::new(child),
            }),
            None => child,
        };
        gather(pre)
    } else {
        child
    };
    Ok(PhysicalPlan::Sort(SortExec {
        exprs: exprs.to_vec(),
        fetch,
        input: Box::new(child),
    }))
}

fn shuffle(input: PhysicalPlan, partitioning: PartitioningSpec) -> PhysicalPlan {
    let write = PhysicalPlan::Exchange(ExchangeExec::ShuffleWrite(ShuffleWriteExchange {
        input: Box::new(input),
        partitioning: partitioning.clone(),
    }));
    PhysicalPlan::Exchange(ExchangeExec::ShuffleRead(ShuffleReadExchange {
        input: Box::new(write),
        partitioning,
    }))
}

fn gather(input: PhysicalPlan) -> PhysicalPlan {
    shuffle(input, PartitioningSpec::Single)
}

fn expr_to_key_name(e: &Expr) -> Result<String> {
    match e {
        Expr::Column(name) => Ok(name.clone()),
        _ => Err(QuarryError::Unsupported(
            "physical planner only supports grouping by plain columns".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::logical_plan::{AggExpr, LogicalPlanBuilder, col, lit};

    struct Partitions(HashMap<&'static str, usize>);

    impl PlanningContext for Partitions {
        fn table_partitions(&self, table: &str) -> Result<usize> {
            self.0
                .get(table)
                .copied()
                .ok_or_else(|| QuarryError::Planning(format!("unknown table '{table}'")))
        }
    }

    fn ctx() -> Partitions {
        Partitions(HashMap::from([("orders", 4), ("customers", 2), ("small", 1)]))
    }

    fn cfg() -> PhysicalPlannerConfig {
        PhysicalPlannerConfig {
            shuffle_partitions: 3,
        }
    }

    #[test]
    fn aggregate_lowers_to_two_phase_with_hash_exchange() {
        let logical = LogicalPlanBuilder::scan("orders")
            .aggregate(vec![col("k")], vec![(AggExpr::Sum(col("v")), "s")])
            .build();
        let plan = create_physical_plan(&logical, &cfg(), &ctx()).expect("plan");
        let PhysicalPlan::HashAggregate(fin) = &plan else {
            panic!("expected final aggregate, got {}", plan.name());
        };
        assert_eq!(fin.mode, AggregateMode::Final);
        let PhysicalPlan::Exchange(ExchangeExec::ShuffleRead(read)) = fin.input.as_ref() else {
            panic!("expected shuffle read");
        };
        assert_eq!(
            read.partitioning,
            PartitioningSpec::HashKeys {
                keys: vec!["k".to_string()],
                partitions: 3
            }
        );
        assert_eq!(plan.output_partitions(), 3);
    }

    #[test]
    fn global_aggregate_gathers_into_single_partition() {
        let logical = LogicalPlanBuilder::scan("orders")
            .aggregate(vec![], vec![(AggExpr::Count(col("v")), "c")])
            .build();
        let plan = create_physical_plan(&logical, &cfg(), &ctx()).expect("plan");
        assert_eq!(plan.output_partitions(), 1);
    }

    #[test]
    fn count_distinct_shuffles_raw_rows_into_single_phase() {
        let logical = LogicalPlanBuilder::scan("orders")
            .aggregate(
                vec![col("k")],
                vec![
                    (AggExpr::CountDistinct(col("v")), "dv"),
                    (AggExpr::Sum(col("v")), "s"),
                ],
            )
            .build();
        let plan = create_physical_plan(&logical, &cfg(), &ctx()).expect("plan");
        let PhysicalPlan::HashAggregate(agg) = &plan else {
            panic!("expected aggregate, got {}", plan.name());
        };
        assert_eq!(agg.mode, AggregateMode::Single);
        let PhysicalPlan::Exchange(ExchangeExec::ShuffleRead(read)) = agg.input.as_ref() else {
            panic!("expected shuffle read");
        };
        let PhysicalPlan::Exchange(ExchangeExec::ShuffleWrite(write)) = read.input.as_ref() else {
            panic!("expected shuffle write");
        };
        assert!(matches!(write.input.as_ref(), PhysicalPlan::Scan(_)));
    }

    #[test]
    fn join_repartitions_both_sides() {
        let logical = LogicalPlanBuilder::scan("orders")
            .join(
                LogicalPlanBuilder::scan("customers"),
                &[("cust_id", "id")],
                JoinType::Left,
            )
            .build();
        let plan = create_physical_plan(&logical, &cfg(), &ctx()).expect("plan");
        let PhysicalPlan::HashJoin(join) = &plan else {
            panic!("expected join");
        };
        assert_eq!(join.left.output_partitions(), 3);
        assert_eq!(join.right.output_partitions(), 3);
        assert_eq!(join.build_side, BuildSide::Right);
    }

    #[test]
    fn limit_over_sort_becomes_top_k_with_gather() {
        let logical = LogicalPlanBuilder::scan("orders")
            .sort(vec![SortExpr::desc(col("v"))])
            .limit(10)
            .build();
        let plan = create_physical_plan(&logical, &cfg(), &ctx()).expect("plan");
        let PhysicalPlan::Sort(sort) = &plan else {
            panic!("expected sort at root");
        };
        assert_eq!(sort.fetch, Some(10));
        assert_eq!(plan.output_partitions(), 1);
        let PhysicalPlan::Exchange(ExchangeExec::ShuffleRead(read)) = sort.input.as_ref() else {
            panic!("expected gather");
        };
        let PhysicalPlan::Exchange(ExchangeExec::ShuffleWrite(write)) = read.input.as_ref() else {
            panic!("expected shuffle write");
        };
        assert!(matches!(
            write.input.as_ref(),
            PhysicalPlan::Sort(SortExec { fetch: Some(10), .. })
        ));
    }

    #[test]
    fn single_partition_limit_needs_no_exchange() {
        let logical = LogicalPlanBuilder::scan("small")
            .filter(col("v").gt(lit(1_i64)))
            .limit(3)
            .build();
        let plan = create_physical_plan(&logical, &cfg(), &ctx()).expect("plan");
        let PhysicalPlan::Limit(limit) = &plan else {
            panic!("expected limit");
        };
        assert!(matches!(limit.input.as_ref(), PhysicalPlan::Filter(_)));
    }

    #[test]
    fn unknown_table_is_planning_error() {
        let logical = LogicalPlanBuilder::scan("nope").build();
        let err = create_physical_plan(&logical, &cfg(), &ctx()).expect_err("must fail");
        assert!(matches!(err, QuarryError::Planning(_)));
    }

    #[test]
    fn grouping_by_expression_is_unsupported() {
        let logical = LogicalPlanBuilder::scan("orders")
            .aggregate(
                vec![col("k").plus(lit(1_i64))],
                vec![(AggExpr::Count(col("v")), "c")],
            )
            .build();
        let err = create_physical_plan(&logical, &cfg(), &ctx()).expect_err("must fail");
        assert!(matches!(err, QuarryError::Unsupported(_)));
    }
}
