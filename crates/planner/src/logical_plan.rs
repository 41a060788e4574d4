use arrow_schema::{DataType, TimeUnit};
use quarry_common::{QuarryError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Column(String),
    Literal(LiteralValue),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Cast {
        expr: Box<Expr>,
        to_type: DataType,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Negative(Box<Expr>),
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
    /// SQL `LIKE` against a constant pattern (`%` and `_` wildcards).
    Like {
        expr: Box<Expr>,
        pattern: String,
        negated: bool,
    },
    ScalarFunction {
        func: ScalarFunc,
        args: Vec<Expr>,
    },
}

/// Built-in scalar functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarFunc {
    Power,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Ln,
    Log10,
    /// First non-NULL argument.
    Coalesce,
    /// `SUBSTRING(s, start [, length])`, 1-based, constant bounds.
    Substring,
    /// String concatenation; NULL when any argument is NULL.
    Concat,
}

impl ScalarFunc {
    pub fn name(self) -> &'static str {
        match self {
            ScalarFunc::Power => "POWER",
            ScalarFunc::Sin => "SIN",
            ScalarFunc::Cos => "COS",
            ScalarFunc::Tan => "TAN",
            ScalarFunc::Asin => "ASIN",
            ScalarFunc::Acos => "ACOS",
            ScalarFunc::Atan => "ATAN",
            ScalarFunc::Ln => "LN",
            ScalarFunc::Log10 => "LOG10",
            ScalarFunc::Coalesce => "COALESCE",
            ScalarFunc::Substring => "SUBSTRING",
            ScalarFunc::Concat => "CONCAT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LiteralValue {
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Boolean(bool),
    /// Days since the UNIX epoch.
    Date32(i32),
    /// Timestamp without time zone.
    Timestamp(i64, TimeUnit),
    /// Untyped NULL; adopts the type of the other operand where one exists.
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
        }
    }
}

/// Column reference.
pub fn col(name: impl Into<String>) -> Expr {
    Expr::Column(name.into())
}

/// Literal value.
pub fn lit(value: impl Into<LiteralValue>) -> Expr {
    Expr::Literal(value.into())
}

/// Typed-less NULL literal.
pub fn null() -> Expr {
    Expr::Literal(LiteralValue::Null)
}

impl From<i64> for LiteralValue {
    fn from(v: i64) -> Self {
        LiteralValue::Int64(v)
    }
}

impl From<f64> for LiteralValue {
    fn from(v: f64) -> Self {
        LiteralValue::Float64(v)
    }
}

impl From<bool> for LiteralValue {
    fn from(v: bool) -> Self {
        LiteralValue::Boolean(v)
    }
}

impl From<&str> for LiteralValue {
    fn from(v: &str) -> Self {
        LiteralValue::Utf8(v.to_string())
    }
}

impl From<String> for LiteralValue {
    fn from(v: String) -> Self {
        LiteralValue::Utf8(v)
    }
}

impl Expr {
    fn binary(self, op: BinaryOp, other: Expr) -> Expr {
        Expr::BinaryOp {
            left: Box::new(self),
            op,
            right: Box::new(other),
        }
    }

    pub fn eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn not_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::NotEq, other)
    }

    pub fn lt(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn lt_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::LtEq, other)
    }

    pub fn gt(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn gt_eq(self, other: Expr) -> Expr {
        self.binary(BinaryOp::GtEq, other)
    }

    pub fn plus(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Plus, other)
    }

    pub fn minus(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Minus, other)
    }

    pub fn multiply(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Multiply, other)
    }

    pub fn divide(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Divide, other)
    }

    pub fn modulo(self, other: Expr) -> Expr {
        self.binary(BinaryOp::Modulo, other)
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    pub fn is_null(self) -> Expr {
        Expr::IsNull(Box::new(self))
    }

    pub fn is_not_null(self) -> Expr {
        Expr::IsNotNull(Box::new(self))
    }

    pub fn cast(self, to_type: DataType) -> Expr {
        Expr::Cast {
            expr: Box::new(self),
            to_type,
        }
    }

    pub fn like(self, pattern: impl Into<String>) -> Expr {
        Expr::Like {
            expr: Box::new(self),
            pattern: pattern.into(),
            negated: false,
        }
    }

    pub fn not_like(self, pattern: impl Into<String>) -> Expr {
        Expr::Like {
            expr: Box::new(self),
            pattern: pattern.into(),
            negated: true,
        }
    }
}

/// Call a scalar function.
pub fn call(func: ScalarFunc, args: Vec<Expr>) -> Expr {
    Expr::ScalarFunction { func, args }
}

pub fn coalesce(args: Vec<Expr>) -> Expr {
    call(ScalarFunc::Coalesce, args)
}

pub fn concat(args: Vec<Expr>) -> Expr {
    call(ScalarFunc::Concat, args)
}

pub fn substring(expr: Expr, start: i64, length: Option<i64>) -> Expr {
    let mut args = vec![expr, lit(start)];
    args.extend(length.map(lit));
    call(ScalarFunc::Substring, args)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortExpr {
    pub expr: Expr,
    pub asc: bool,
    pub nulls_first: bool,
}

impl SortExpr {
    /// Ascending, NULLs last.
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            asc: true,
            nulls_first: false,
        }
    }

    /// Descending, NULLs first.
    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            asc: false,
            nulls_first: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggExpr {
    Count(Expr),
    Sum(Expr),
    Min(Expr),
    Max(Expr),
    Avg(Expr),
    CountDistinct(Expr),
}

impl AggExpr {
    pub fn input(&self) -> &Expr {
        match self {
            AggExpr::Count(e)
            | AggExpr::Sum(e)
            | AggExpr::Min(e)
            | AggExpr::Max(e)
            | AggExpr::Avg(e)
            | AggExpr::CountDistinct(e) => e,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggExpr::Count(_) => "COUNT",
            AggExpr::Sum(_) => "SUM",
            AggExpr::Min(_) => "MIN",
            AggExpr::Max(_) => "MAX",
            AggExpr::Avg(_) => "AVG",
            AggExpr::CountDistinct(_) => "COUNT_DISTINCT",
        }
    }

    /// Result type for an input column of type `input`.
    ///
    /// Counts are Int64, AVG is Float64, SUM widens to Int64 or Float64 and
    /// MIN/MAX keep the input type.
    pub fn output_type(&self, input: &DataType) -> Result<DataType> {
        let numeric = input.is_integer() || input.is_floating() || *input == DataType::Null;
        match self {
            AggExpr::Count(_) | AggExpr::CountDistinct(_) => Ok(DataType::Int64),
            AggExpr::Sum(_) | AggExpr::Avg(_) if !numeric => Err(QuarryError::TypeMismatch(
                format!("{}({input:?}) requires a numeric argument", self.name()),
            )),
            AggExpr::Sum(_) if input.is_floating() => Ok(DataType::Float64),
            AggExpr::Sum(_) => Ok(DataType::Int64),
            AggExpr::Avg(_) => Ok(DataType::Float64),
            AggExpr::Min(_) | AggExpr::Max(_) => Ok(input.clone()),
        }
    }

    /// Whether the aggregate can be split into partial and final phases.
    pub fn is_decomposable(&self) -> bool {
        !matches!(self, AggExpr::CountDistinct(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogicalPlan {
    TableScan {
        table: String,
        projection: Option<Vec<String>>,
    },
    Projection {
        exprs: Vec<(Expr, String)>,
        input: Box<LogicalPlan>,
    },
    Filter {
        predicate: Expr,
        input: Box<LogicalPlan>,
    },
    Join {
        left: Box<LogicalPlan>,
        right: Box<LogicalPlan>,
        on: Vec<(String, String)>,
        join_type: JoinType,
    },
    Aggregate {
        group_exprs: Vec<Expr>,
        aggr_exprs: Vec<(AggExpr, String)>,
        input: Box<LogicalPlan>,
    },
    Sort {
        exprs: Vec<SortExpr>,
        input: Box<LogicalPlan>,
    },
    Limit {
        n: usize,
        input: Box<LogicalPlan>,
    },
}

/// Fluent construction of logical plans.
#[derive(Debug, Clone)]
pub struct LogicalPlanBuilder {
    plan: LogicalPlan,
}

impl LogicalPlanBuilder {
    pub fn scan(table: impl Into<String>) -> Self {
        Self {
            plan: LogicalPlan::TableScan {
                table: table.into(),
                projection: None,
            },
        }
    }

    pub fn scan_with_projection(table: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            plan: LogicalPlan::TableScan {
                table: table.into(),
                projection: Some(columns.iter().map(|c| c.to_string()).collect()),
            },
        }
    }

    pub fn filter(self, predicate: Expr) -> Self {
        Self {
            plan: LogicalPlan::Filter {
                predicate,
                input: Box::new(self.plan),
            },
        }
    }

    pub fn project(self, exprs: Vec<(Expr, &str)>) -> Self {
        Self {
            plan: LogicalPlan::Projection {
                exprs: exprs
                    .into_iter()
                    .map(|(e, name)| (e, name.to_string()))
                    .collect(),
                input: Box::new(self.plan),
            },
        }
    }

    pub fn join(self, right: LogicalPlanBuilder, on: &[(&str, &str)], join_type: JoinType) -> Self {
        Self {
            plan: LogicalPlan::Join {
                left: Box::new(self.plan),
                right: Box::new(right.plan),
                on: on
                    .iter()
                    .map(|(l, r)| (l.to_string(), r.to_string()))
                    .collect(),
                join_type,
            },
        }
    }

    pub fn aggregate(self, group_exprs: Vec<Expr>, aggr_exprs: Vec<(AggExpr, &str)>) -> Self {
        Self {
            plan: LogicalPlan::Aggregate {
                group_exprs,
                aggr_exprs: aggr_exprs
                    .into_iter()
                    .map(|(a, name)| (a, name.to_string()))
                    .collect(),
                input: Box::new(self.plan),
            },
        }
    }

    pub fn sort(self, exprs: Vec<SortExpr>) -> Self {
        Self {
            plan: LogicalPlan::Sort {
                exprs,
                input: Box::new(self.plan),
            },
        }
    }

    pub fn limit(self, n: usize) -> Self {
        Self {
            plan: LogicalPlan::Limit {
                n,
                input: Box::new(self.plan),
            },
        }
    }

    pub fn build(self) -> LogicalPlan {
        self.plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_nests_children_in_call_order() {
        let plan = LogicalPlanBuilder::scan("t")
            .filter(col("a").gt(lit(1_i64)))
            .limit(5)
            .build();
        let LogicalPlan::Limit { n, input } = plan else {
            panic!("expected limit at root");
        };
        assert_eq!(n, 5);
        assert!(matches!(*input, LogicalPlan::Filter { .. }));
    }

    #[test]
    fn expr_helpers_build_expected_tree() {
        let e = col("a").plus(lit(2_i64)).eq(lit(3_i64)).and(col("b").is_null());
        match e {
            Expr::And(l, r) => {
                assert!(matches!(*l, Expr::BinaryOp { op: BinaryOp::Eq, .. }));
                assert!(matches!(*r, Expr::IsNull(_)));
            }
            other => panic!("unexpected expr {other:?}"),
        }
    }

    #[test]
    fn aggregate_output_types_follow_input() {
        assert_eq!(
            AggExpr::Sum(col("x")).output_type(&DataType::Int32).unwrap(),
            DataType::Int64
        );
        assert_eq!(
            AggExpr::Sum(col("x")).output_type(&DataType::Float32).unwrap(),
            DataType::Float64
        );
        assert_eq!(
            AggExpr::Max(col("x")).output_type(&DataType::Date32).unwrap(),
            DataType::Date32
        );
        assert_eq!(
            AggExpr::CountDistinct(col("x"))
                .output_type(&DataType::Utf8)
                .unwrap(),
            DataType::Int64
        );
        assert!(matches!(
            AggExpr::Avg(col("x")).output_type(&DataType::Utf8),
            Err(QuarryError::TypeMismatch(_))
        ));
        assert!(!AggExpr::CountDistinct(col("x")).is_decomposable());
    }
}
