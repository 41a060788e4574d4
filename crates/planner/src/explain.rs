use crate::logical_plan::{AggExpr, Expr, LiteralValue, LogicalPlan, SortExpr};
use crate::physical_plan::{ExchangeExec, PartitioningSpec, PhysicalPlan};

/// Render logical plan as human-readable multiline text.
pub fn explain_logical(plan: &LogicalPlan) -> String {
    let mut s = String::new();
    fmt_plan(plan, 0, &mut s);
    s
}

/// Render physical plan as human-readable multiline text.
pub fn explain_physical(plan: &PhysicalPlan) -> String {
    let mut s = String::new();
    fmt_physical(plan, 0, &mut s);
    s
}

fn fmt_plan(plan: &LogicalPlan, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    match plan {
        LogicalPlan::TableScan { table, projection } => {
            out.push_str(&format!("{pad}TableScan table={table}\n"));
            out.push_str(&format!("{pad}  projection={projection:?}\n"));
        }
        LogicalPlan::Filter { predicate, input } => {
            out.push_str(&format!("{pad}Filter {}\n", fmt_expr(predicate)));
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Projection { exprs, input } => {
            out.push_str(&format!("{pad}Projection\n"));
            for (e, name) in exprs {
                out.push_str(&format!("{pad}  {name} := {}\n", fmt_expr(e)));
            }
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Aggregate {
            group_exprs,
            aggr_exprs,
            input,
        } => {
            out.push_str(&format!("{pad}Aggregate\n"));
            fmt_aggregate_body(&pad, group_exprs, aggr_exprs, out);
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Join {
            on,
            join_type,
            left,
            right,
        } => {
            out.push_str(&format!("{pad}Join type={join_type:?}\n"));
            out.push_str(&format!("{pad}  on={on:?}\n"));
            out.push_str(&format!("{pad}  left:\n"));
            fmt_plan(left, indent + 2, out);
            out.push_str(&format!("{pad}  right:\n"));
            fmt_plan(right, indent + 2, out);
        }
        LogicalPlan::Sort { exprs, input } => {
            out.push_str(&format!("{pad}Sort {}\n", fmt_sort_exprs(exprs)));
            fmt_plan(input, indent + 1, out);
        }
        LogicalPlan::Limit { n, input } => {
            out.push_str(&format!("{pad}Limit n={n}\n"));
            fmt_plan(input, indent + 1, out);
        }
    }
}

fn fmt_physical(plan: &PhysicalPlan, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    match plan {
        PhysicalPlan::Scan(x) => {
            out.push_str(&format!(
                "{pad}Scan table={} partitions={} projection={:?}\n",
                x.table, x.partitions, x.projection
            ));
        }
        PhysicalPlan::Filter(x) => {
            out.push_str(&format!("{pad}Filter {}\n", fmt_expr(&x.predicate)));
        }
        PhysicalPlan::Project(x) => {
            out.push_str(&format!("{pad}Project\n"));
            for (e, name) in &x.exprs {
                out.push_str(&format!("{pad}  {name} := {}\n", fmt_expr(e)));
            }
        }
        PhysicalPlan::HashJoin(x) => {
            out.push_str(&format!(
                "{pad}HashJoin type={:?} build={:?} on={:?}\n",
                x.join_type, x.build_side, x.on
            ));
        }
        PhysicalPlan::HashAggregate(x) => {
            out.push_str(&format!("{pad}{}\n", plan.name()));
            fmt_aggregate_body(&pad, &x.group_exprs, &x.aggr_exprs, out);
        }
        PhysicalPlan::Sort(x) => {
            out.push_str(&format!(
                "{pad}Sort {} fetch={:?}\n",
                fmt_sort_exprs(&x.exprs),
                x.fetch
            ));
        }
        PhysicalPlan::Limit(x) => {
            out.push_str(&format!("{pad}Limit n={}\n", x.n));
        }
        PhysicalPlan::Exchange(ExchangeExec::ShuffleWrite(x)) => {
            out.push_str(&format!(
                "{pad}ShuffleWrite {}\n",
                fmt_partitioning(&x.partitioning)
            ));
        }
        PhysicalPlan::Exchange(ExchangeExec::ShuffleRead(x)) => {
            out.push_str(&format!(
                "{pad}ShuffleRead {}\n",
                fmt_partitioning(&x.partitioning)
            ));
        }
        PhysicalPlan::Exchange(ExchangeExec::StageInput(x)) => {
            out.push_str(&format!(
                "{pad}StageInput stage={} {}\n",
                x.stage_id,
                fmt_partitioning(&x.partitioning)
            ));
        }
    }
    for child in plan.children() {
        fmt_physical(child, indent + 1, out);
    }
}

fn fmt_aggregate_body(
    pad: &str,
    group_exprs: &[Expr],
    aggr_exprs: &[(AggExpr, String)],
    out: &mut String,
) {
    out.push_str(&format!("{pad}  group_by={}\n", group_exprs.len()));
    for g in group_exprs {
        out.push_str(&format!("{pad}    {}\n", fmt_expr(g)));
    }
    out.push_str(&format!("{pad}  aggs={}\n", aggr_exprs.len()));
    for (a, name) in aggr_exprs {
        out.push_str(&format!(
            "{pad}    {name} := {}({})\n",
            a.name(),
            fmt_expr(a.input())
        ));
    }
}

fn fmt_partitioning(p: &PartitioningSpec) -> String {
    match p {
        PartitioningSpec::HashKeys { keys, partitions } => {
            format!("hash({}) partitions={partitions}", keys.join(", "))
        }
        PartitioningSpec::Range { key, bounds } => format!("range({key}) bounds={bounds:?}"),
        PartitioningSpec::Single => "single".to_string(),
    }
}

fn fmt_sort_exprs(exprs: &[SortExpr]) -> String {
    exprs
        .iter()
        .map(|s| {
            format!(
                "{} {} {}",
                fmt_expr(&s.expr),
                if s.asc { "ASC" } else { "DESC" },
                if s.nulls_first {
                    "NULLS FIRST"
                } else {
                    "NULLS LAST"
                }
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_literal(v: &LiteralValue) -> String {
    match v {
        LiteralValue::Int64(x) => x.to_string(),
        LiteralValue::Float64(x) => format!("{x:?}"),
        LiteralValue::Utf8(s) => format!("'{s}'"),
        LiteralValue::Boolean(b) => b.to_string(),
        LiteralValue::Date32(d) => format!("DATE {d}"),
        LiteralValue::Timestamp(t, unit) => format!("TIMESTAMP({unit:?}) {t}"),
        LiteralValue::Null => "NULL".to_string(),
    }
}

pub(crate) fn fmt_expr(e: &Expr) -> String {
    match e {
        Expr::Column(c) => c.clone(),
        Expr::Literal(v) => fmt_literal(v),
        Expr::Cast { expr, to_type } => format!("cast({} as {to_type:?})", fmt_expr(expr)),
        Expr::Not(x) => format!("NOT ({})", fmt_expr(x)),
        Expr::Negative(x) => format!("-({})", fmt_expr(x)),
        Expr::IsNull(x) => format!("({}) IS NULL", fmt_expr(x)),
        Expr::IsNotNull(x) => format!("({}) IS NOT NULL", fmt_expr(x)),
        Expr::And(a, b) => format!("({}) AND ({})", fmt_expr(a), fmt_expr(b)),
        Expr::Or(a, b) => format!("({}) OR ({})", fmt_expr(a), fmt_expr(b)),
        Expr::BinaryOp { left, op, right } => {
            format!("({}) {} ({})", fmt_expr(left), op.symbol(), fmt_expr(right))
        }
        Expr::Like {
            expr,
            pattern,
            negated,
        } => format!(
            "({}) {}LIKE '{pattern}'",
            fmt_expr(expr),
            if *negated { "NOT " } else { "" }
        ),
        Expr::ScalarFunction { func, args } => format!(
            "{}({})",
            func.name(),
            args.iter().map(fmt_expr).collect::<Vec<_>>().join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logical_plan::{JoinType, LogicalPlanBuilder, col, lit};
    use crate::physical_plan::{FilterExec, ScanExec};

    #[test]
    fn logical_explain_lists_join_sides() {
        let plan = LogicalPlanBuilder::scan("a")
            .join(LogicalPlanBuilder::scan("b"), &[("x", "y")], JoinType::Inner)
            .build();
        let text = explain_logical(&plan);
        assert!(text.contains("Join type=Inner"));
        assert!(text.contains("  left:\n    TableScan table=a"));
        assert!(text.contains("  right:\n    TableScan table=b"));
    }

    #[test]
    fn physical_explain_renders_children_indented() {
        let plan = PhysicalPlan::Filter(FilterExec {
            predicate: col("a").gt_eq(lit(3_i64)).and(col("s").eq(lit("x"))),
            input: Box::new(PhysicalPlan::Scan(ScanExec {
                table: "t".to_string(),
                projection: None,
                partitions: 2,
            })),
        });
        let text = explain_physical(&plan);
        assert_eq!(
            text,
            "Filter ((a) >= (3)) AND ((s) = ('x'))\n  Scan table=t partitions=2 projection=None\n"
        );
    }
}
