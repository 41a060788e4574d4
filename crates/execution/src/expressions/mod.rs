//! Expression compilation and evaluation for execution operators.
//!
//! Compilation resolves column names against the input schema, coerces
//! operand types and reports incompatible operands as
//! [`QuarryError::TypeMismatch`] before any batch is touched.
//!
//! Evaluation returns an `ArrayRef` aligned with the input batch row count
//! and follows SQL null semantics: arithmetic and comparisons yield NULL
//! when either side is NULL, `AND`/`OR` use three-valued logic.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Date32Array, Float64Array, Float64Builder,
    Int64Array, Int64Builder, Scalar, StringArray, StringBuilder, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray, TimestampSecondArray, new_null_array,
};
use arrow::compute::kernels::{
    boolean::{and_kleene, not, or_kleene},
    cast::{can_cast_types, cast},
    cmp::{eq, gt, gt_eq, lt, lt_eq, neq},
    comparison::{like, nlike},
    numeric::{add, div, mul, neg, rem, sub},
    substring::substring_by_char,
    zip::zip,
};
use arrow::compute::{is_not_null, is_null};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, SchemaRef, TimeUnit};
use quarry_common::{QuarryError, Result};
use quarry_planner::{BinaryOp, Expr, LiteralValue, ScalarFunc};

/// Executable expression.
///
/// Planner `Expr` trees are compiled once per operator instance; the result
/// is evaluated against every input batch.
pub trait PhysicalExpr: Send + Sync {
    /// Static output data type of this expression.
    fn data_type(&self) -> DataType;
    /// Evaluate the expression for every row in `batch`.
    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef>;
}

/// Compile planner `Expr` into a runnable expression over `input_schema`.
pub fn compile_expr(expr: &Expr, input_schema: &SchemaRef) -> Result<Arc<dyn PhysicalExpr>> {
    match expr {
        Expr::Column(name) => {
            let idx = input_schema
                .fields()
                .iter()
                .position(|f| f.name() == name)
                .ok_or_else(|| QuarryError::Planning(format!("unknown column: {name}")))?;
            let dt = input_schema.field(idx).data_type().clone();
            Ok(Arc::new(ColumnExpr { index: idx, dt }))
        }

        Expr::Literal(v) => Ok(Arc::new(LiteralExpr {
            v: v.clone(),
            dt: literal_type(v),
        })),

        Expr::Cast { expr, to_type } => {
            let inner = compile_expr(expr, input_schema)?;
            let from = inner.data_type();
            if !can_cast_types(&from, to_type) {
                return Err(QuarryError::TypeMismatch(format!(
                    "cannot cast {from:?} to {to_type:?}"
                )));
            }
            Ok(coerce(inner, to_type))
        }

        Expr::Not(e) => {
            let inner = boolean_operand(compile_expr(e, input_schema)?, "NOT")?;
            Ok(Arc::new(NotExpr { inner }))
        }

        Expr::And(a, b) | Expr::Or(a, b) => {
            let op = if matches!(expr, Expr::And(..)) {
                BoolOp::And
            } else {
                BoolOp::Or
            };
            let name = if op == BoolOp::And { "AND" } else { "OR" };
            let left = boolean_operand(compile_expr(a, input_schema)?, name)?;
            let right = boolean_operand(compile_expr(b, input_schema)?, name)?;
            Ok(Arc::new(BoolBinaryExpr { left, right, op }))
        }

        Expr::Negative(e) => {
            let inner = compile_expr(e, input_schema)?;
            let dt = inner.data_type();
            if !is_numeric(&dt) && dt != DataType::Null {
                return Err(QuarryError::TypeMismatch(format!(
                    "cannot negate {dt:?}"
                )));
            }
            Ok(Arc::new(NegativeExpr { inner }))
        }

        Expr::IsNull(e) => Ok(Arc::new(NullCheckExpr {
            inner: compile_expr(e, input_schema)?,
            negated: false,
        })),

        Expr::IsNotNull(e) => Ok(Arc::new(NullCheckExpr {
            inner: compile_expr(e, input_schema)?,
            negated: true,
        })),

        Expr::BinaryOp { left, op, right } => {
            let l = compile_expr(left, input_schema)?;
            let r = compile_expr(right, input_schema)?;
            let operand = coerce_binary(*op, &l.data_type(), &r.data_type())?;
            let out = if op.is_comparison() {
                DataType::Boolean
            } else {
                operand.clone()
            };
            Ok(Arc::new(BinaryExpr {
                left: coerce(l, &operand),
                right: coerce(r, &operand),
                op: *op,
                operand,
                out,
            }))
        }

        Expr::Like {
            expr,
            pattern,
            negated,
        } => {
            let inner = compile_expr(expr, input_schema)?;
            let inner = match inner.data_type() {
                DataType::Utf8 => inner,
                DataType::Null => coerce(inner, &DataType::Utf8),
                other => {
                    return Err(QuarryError::TypeMismatch(format!(
                        "LIKE expects a string operand, got {other:?}"
                    )));
                }
            };
            Ok(Arc::new(LikeExpr {
                inner,
                pattern: pattern.clone(),
                negated: *negated,
            }))
        }

        Expr::ScalarFunction { func, args } => {
            let args = args
                .iter()
                .map(|a| compile_expr(a, input_schema))
                .collect::<Result<Vec<_>>>()?;
            compile_function(*func, args, expr)
        }
    }
}

fn compile_function(
    func: ScalarFunc,
    args: Vec<Arc<dyn PhysicalExpr>>,
    expr: &Expr,
) -> Result<Arc<dyn PhysicalExpr>> {
    let arity = |n: std::ops::RangeInclusive<usize>| {
        if n.contains(&args.len()) {
            Ok(())
        } else {
            Err(QuarryError::Planning(format!(
                "{} takes {}..={} arguments, got {}",
                func.name(),
                n.start(),
                n.end(),
                args.len()
            )))
        }
    };
    match func {
        ScalarFunc::Coalesce => {
            arity(1..=usize::MAX)?;
            let mut out = DataType::Null;
            for a in &args {
                out = common_type(&out, &a.data_type()).ok_or_else(|| {
                    QuarryError::TypeMismatch(format!(
                        "COALESCE arguments have no common type: {out:?} and {:?}",
                        a.data_type()
                    ))
                })?;
            }
            let args = args.into_iter().map(|a| coerce(a, &out)).collect();
            Ok(Arc::new(CoalesceExpr { args, out }))
        }
        ScalarFunc::Concat => {
            arity(1..=usize::MAX)?;
            let args = args
                .into_iter()
                .map(|a| string_operand(a, "CONCAT"))
                .collect::<Result<Vec<_>>>()?;
            Ok(Arc::new(ConcatExpr { args }))
        }
        ScalarFunc::Substring => {
            arity(2..=3)?;
            let Expr::ScalarFunction { args: raw, .. } = expr else {
                return Err(QuarryError::Planning("malformed SUBSTRING".to_string()));
            };
            let constant = |e: &Expr| match e {
                Expr::Literal(LiteralValue::Int64(v)) => Ok(*v),
                other => Err(QuarryError::Unsupported(format!(
                    "SUBSTRING bounds must be integer literals, got {other:?}"
                ))),
            };
            let start = constant(&raw[1])?;
            let length = raw.get(2).map(constant).transpose()?;
            if length.is_some_and(|l| l < 0) {
                return Err(QuarryError::Planning(
                    "negative SUBSTRING length".to_string(),
                ));
            }
            let mut args = args;
            args.truncate(1);
            let inner = string_operand(args.remove(0), "SUBSTRING")?;
            Ok(Arc::new(SubstringExpr {
                inner,
                start,
                length,
            }))
        }
        ScalarFunc::Power => {
            arity(2..=2)?;
            let mut it = args.into_iter();
            let (base, exp) = match (it.next(), it.next()) {
                (Some(b), Some(e)) => (b, e),
                _ => return Err(QuarryError::Planning("POWER takes two arguments".to_string())),
            };
            Ok(Arc::new(PowerExpr {
                base: float_operand(base, "POWER")?,
                exp: float_operand(exp, "POWER")?,
            }))
        }
        ScalarFunc::Sin
        | ScalarFunc::Cos
        | ScalarFunc::Tan
        | ScalarFunc::Asin
        | ScalarFunc::Acos
        | ScalarFunc::Atan
        | ScalarFunc::Ln
        | ScalarFunc::Log10 => {
            arity(1..=1)?;
            let mut args = args;
            Ok(Arc::new(MathExpr {
                inner: float_operand(args.remove(0), func.name())?,
                func,
            }))
        }
    }
}

/// Wrap `expr` in a cast unless it already produces `to`.
fn coerce(expr: Arc<dyn PhysicalExpr>, to: &DataType) -> Arc<dyn PhysicalExpr> {
    if expr.data_type() == *to {
        expr
    } else {
        Arc::new(CastExpr {
            inner: expr,
            to_type: to.clone(),
        })
    }
}

fn boolean_operand(expr: Arc<dyn PhysicalExpr>, op: &str) -> Result<Arc<dyn PhysicalExpr>> {
    match expr.data_type() {
        DataType::Boolean => Ok(expr),
        DataType::Null => Ok(coerce(expr, &DataType::Boolean)),
        other => Err(QuarryError::TypeMismatch(format!(
            "{op} expects a boolean operand, got {other:?}"
        ))),
    }
}

fn string_operand(expr: Arc<dyn PhysicalExpr>, op: &str) -> Result<Arc<dyn PhysicalExpr>> {
    let dt = expr.data_type();
    if dt == DataType::Utf8 {
        Ok(expr)
    } else if dt == DataType::Null || can_cast_types(&dt, &DataType::Utf8) {
        Ok(coerce(expr, &DataType::Utf8))
    } else {
        Err(QuarryError::TypeMismatch(format!(
            "{op} expects string-convertible operands, got {dt:?}"
        )))
    }
}

fn float_operand(expr: Arc<dyn PhysicalExpr>, op: &str) -> Result<Arc<dyn PhysicalExpr>> {
    let dt = expr.data_type();
    if is_numeric(&dt) || dt == DataType::Null {
        Ok(coerce(expr, &DataType::Float64))
    } else {
        Err(QuarryError::TypeMismatch(format!(
            "{op} expects a numeric operand, got {dt:?}"
        )))
    }
}

fn is_numeric(dt: &DataType) -> bool {
    dt.is_integer() || dt.is_floating()
}

fn is_temporal(dt: &DataType) -> bool {
    matches!(dt, DataType::Date32 | DataType::Timestamp(..))
}

fn unit_rank(u: &TimeUnit) -> u8 {
    match u {
        TimeUnit::Second => 0,
        TimeUnit::Millisecond => 1,
        TimeUnit::Microsecond => 2,
        TimeUnit::Nanosecond => 3,
    }
}

/// Common type of two date/time operands. Dates widen to timestamps and
/// mixed timestamp units resolve to the finer unit.
fn temporal_supertype(l: &DataType, r: &DataType) -> Option<DataType> {
    match (l, r) {
        (DataType::Date32, DataType::Date32) => Some(DataType::Date32),
        (DataType::Date32, ts @ DataType::Timestamp(..))
        | (ts @ DataType::Timestamp(..), DataType::Date32) => Some(ts.clone()),
        (DataType::Timestamp(ul, tz), DataType::Timestamp(ur, _)) => {
            let unit = if unit_rank(ul) >= unit_rank(ur) { ul } else { ur };
            Some(DataType::Timestamp(*unit, tz.clone()))
        }
        // String literals compared against dates parse as that date type.
        (t, DataType::Utf8) | (DataType::Utf8, t) if is_temporal(t) => Some(t.clone()),
        _ => None,
    }
}

/// Type two operands can be compared or merged in, if any.
fn common_type(l: &DataType, r: &DataType) -> Option<DataType> {
    match (l, r) {
        (DataType::Null, other) | (other, DataType::Null) => Some(other.clone()),
        _ if l == r => Some(l.clone()),
        _ => numeric_supertype(l, r).or_else(|| temporal_supertype(l, r)),
    }
}

/// Common numeric type: any float widens to Float64, integers to Int64.
fn numeric_supertype(l: &DataType, r: &DataType) -> Option<DataType> {
    if !is_numeric(l) || !is_numeric(r) {
        return None;
    }
    if l.is_floating() || r.is_floating() {
        Some(DataType::Float64)
    } else {
        Some(DataType::Int64)
    }
}

/// Type both operands of `op` are evaluated in.
fn coerce_binary(op: BinaryOp, l: &DataType, r: &DataType) -> Result<DataType> {
    let mismatch = || {
        QuarryError::TypeMismatch(format!(
            "cannot apply '{}' to {l:?} and {r:?}",
            op.symbol()
        ))
    };
    let (l, r) = match (l, r) {
        (DataType::Null, DataType::Null) => return Ok(DataType::Null),
        (DataType::Null, other) | (other, DataType::Null) => (other, other),
        _ => (l, r),
    };
    if op.is_comparison() {
        if let Some(t) = numeric_supertype(l, r).or_else(|| temporal_supertype(l, r)) {
            return Ok(t);
        }
        match (l, r) {
            (DataType::Utf8, DataType::Utf8) => Ok(DataType::Utf8),
            (DataType::Boolean, DataType::Boolean) => Ok(DataType::Boolean),
            (DataType::Decimal128(..), DataType::Decimal128(..)) if l == r => Ok(l.clone()),
            _ => Err(mismatch()),
        }
    } else {
        numeric_supertype(l, r).ok_or_else(mismatch)
    }
}

struct ColumnExpr {
    index: usize,
    dt: DataType,
}

impl PhysicalExpr for ColumnExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        Ok(batch.column(self.index).clone())
    }
}

struct LiteralExpr {
    v: LiteralValue,
    dt: DataType,
}

impl PhysicalExpr for LiteralExpr {
    fn data_type(&self) -> DataType {
        self.dt.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        Ok(literal_to_array(&self.v, batch.num_rows()))
    }
}

struct CastExpr {
    inner: Arc<dyn PhysicalExpr>,
    to_type: DataType,
}

impl PhysicalExpr for CastExpr {
    fn data_type(&self) -> DataType {
        self.to_type.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        cast(&arr, &self.to_type).map_err(|e| QuarryError::Execution(format!("cast failed: {e}")))
    }
}

struct NotExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for NotExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let b = as_boolean(&arr)?;
        Ok(Arc::new(not(b).map_err(kernel_err("not"))?))
    }
}

struct NegativeExpr {
    inner: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for NegativeExpr {
    fn data_type(&self) -> DataType {
        self.inner.data_type()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        if arr.data_type() == &DataType::Null {
            return Ok(arr);
        }
        neg(&arr).map_err(kernel_err("negate"))
    }
}

struct NullCheckExpr {
    inner: Arc<dyn PhysicalExpr>,
    negated: bool,
}

impl PhysicalExpr for NullCheckExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let out = if self.negated {
            is_not_null(&arr)
        } else {
            is_null(&arr)
        };
        Ok(Arc::new(out.map_err(kernel_err("null check"))?))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BoolOp {
    And,
    Or,
}

struct BoolBinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BoolOp,
}

impl PhysicalExpr for BoolBinaryExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        let (lb, rb) = (as_boolean(&l)?, as_boolean(&r)?);
        let out = match self.op {
            BoolOp::And => and_kleene(lb, rb),
            BoolOp::Or => or_kleene(lb, rb),
        }
        .map_err(kernel_err("boolean"))?;
        Ok(Arc::new(out))
    }
}

struct BinaryExpr {
    left: Arc<dyn PhysicalExpr>,
    right: Arc<dyn PhysicalExpr>,
    op: BinaryOp,
    /// Type both operands were coerced to.
    operand: DataType,
    out: DataType,
}

impl PhysicalExpr for BinaryExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let l = self.left.evaluate(batch)?;
        let r = self.right.evaluate(batch)?;
        if self.operand == DataType::Null {
            return Ok(new_null_array(&self.out, batch.num_rows()));
        }
        if self.op.is_comparison() {
            eval_cmp(self.op, &l, &r)
        } else {
            eval_arith(self.op, &l, &r)
        }
    }
}

fn literal_type(v: &LiteralValue) -> DataType {
    match v {
        LiteralValue::Int64(_) => DataType::Int64,
        LiteralValue::Float64(_) => DataType::Float64,
        LiteralValue::Utf8(_) => DataType::Utf8,
        LiteralValue::Boolean(_) => DataType::Boolean,
        LiteralValue::Date32(_) => DataType::Date32,
        LiteralValue::Timestamp(_, unit) => DataType::Timestamp(*unit, None),
        LiteralValue::Null => DataType::Null,
    }
}

fn literal_to_array(v: &LiteralValue, len: usize) -> ArrayRef {
    match v {
        LiteralValue::Int64(x) => {
            let mut b = Int64Builder::with_capacity(len);
            b.append_value_n(*x, len);
            Arc::new(b.finish())
        }
        LiteralValue::Float64(x) => {
            let mut b = Float64Builder::with_capacity(len);
            b.append_value_n(*x, len);
            Arc::new(b.finish())
        }
        LiteralValue::Utf8(s) => {
            let mut b = StringBuilder::with_capacity(len, s.len() * len);
            for _ in 0..len {
                b.append_value(s);
            }
            Arc::new(b.finish())
        }
        LiteralValue::Boolean(x) => {
            let mut b = BooleanBuilder::with_capacity(len);
            b.append_n(len, *x);
            Arc::new(b.finish())
        }
        LiteralValue::Date32(d) => Arc::new(Date32Array::from(vec![*d; len])),
        LiteralValue::Timestamp(t, unit) => {
            let ticks = vec![*t; len];
            match unit {
                TimeUnit::Second => Arc::new(TimestampSecondArray::from(ticks)),
                TimeUnit::Millisecond => Arc::new(TimestampMillisecondArray::from(ticks)),
                TimeUnit::Microsecond => Arc::new(TimestampMicrosecondArray::from(ticks)),
                TimeUnit::Nanosecond => Arc::new(TimestampNanosecondArray::from(ticks)),
            }
        }
        LiteralValue::Null => new_null_array(&DataType::Null, len),
    }
}

fn eval_arith(op: BinaryOp, l: &ArrayRef, r: &ArrayRef) -> Result<ArrayRef> {
    if matches!(op, BinaryOp::Divide | BinaryOp::Modulo) && has_zero_divisor(l, r) {
        return Err(QuarryError::Execution("division by zero".to_string()));
    }
    let out = match op {
        BinaryOp::Plus => add(l, r),
        BinaryOp::Minus => sub(l, r),
        BinaryOp::Multiply => mul(l, r),
        BinaryOp::Divide => div(l, r),
        BinaryOp::Modulo => rem(l, r),
        other => {
            return Err(QuarryError::Execution(format!(
                "'{}' is not an arithmetic operator",
                other.symbol()
            )));
        }
    };
    out.map_err(kernel_err(op.symbol()))
}

/// Whether a row with a non-null dividend divides by zero. Rows with a NULL
/// on either side evaluate to NULL instead.
fn has_zero_divisor(l: &ArrayRef, r: &ArrayRef) -> bool {
    let live = |i: usize| l.is_valid(i);
    if let Some(a) = r.as_any().downcast_ref::<Int64Array>() {
        a.iter().enumerate().any(|(i, v)| v == Some(0) && live(i))
    } else if let Some(a) = r.as_any().downcast_ref::<Float64Array>() {
        a.iter().enumerate().any(|(i, v)| v == Some(0.0) && live(i))
    } else {
        false
    }
}

fn eval_cmp(op: BinaryOp, l: &ArrayRef, r: &ArrayRef) -> Result<ArrayRef> {
    let out = match op {
        BinaryOp::Eq => eq(l, r),
        BinaryOp::NotEq => neq(l, r),
        BinaryOp::Lt => lt(l, r),
        BinaryOp::LtEq => lt_eq(l, r),
        BinaryOp::Gt => gt(l, r),
        BinaryOp::GtEq => gt_eq(l, r),
        other => {
            return Err(QuarryError::Execution(format!(
                "'{}' is not a comparison",
                other.symbol()
            )));
        }
    };
    Ok(Arc::new(out.map_err(kernel_err(op.symbol()))?))
}

struct LikeExpr {
    inner: Arc<dyn PhysicalExpr>,
    pattern: String,
    negated: bool,
}

impl PhysicalExpr for LikeExpr {
    fn data_type(&self) -> DataType {
        DataType::Boolean
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let pattern = Scalar::new(StringArray::from(vec![self.pattern.as_str()]));
        let out = if self.negated {
            nlike(&arr, &pattern)
        } else {
            like(&arr, &pattern)
        };
        Ok(Arc::new(out.map_err(kernel_err("LIKE"))?))
    }
}

struct CoalesceExpr {
    args: Vec<Arc<dyn PhysicalExpr>>,
    out: DataType,
}

impl PhysicalExpr for CoalesceExpr {
    fn data_type(&self) -> DataType {
        self.out.clone()
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let mut acc = new_null_array(&self.out, batch.num_rows());
        for arg in self.args.iter().rev() {
            let arr = arg.evaluate(batch)?;
            if arr.data_type() == &DataType::Null {
                continue;
            }
            let present = is_not_null(&arr).map_err(kernel_err("COALESCE"))?;
            acc = zip(&present, &arr, &acc).map_err(kernel_err("COALESCE"))?;
        }
        Ok(acc)
    }
}

struct ConcatExpr {
    args: Vec<Arc<dyn PhysicalExpr>>,
}

impl PhysicalExpr for ConcatExpr {
    fn data_type(&self) -> DataType {
        DataType::Utf8
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arrays = self
            .args
            .iter()
            .map(|a| a.evaluate(batch))
            .collect::<Result<Vec<_>>>()?;
        let strings = arrays
            .iter()
            .map(|a| as_string(a))
            .collect::<Result<Vec<_>>>()?;
        let mut b = StringBuilder::with_capacity(batch.num_rows(), 0);
        let mut row_buf = String::new();
        for row in 0..batch.num_rows() {
            if strings.iter().any(|s| s.is_null(row)) {
                b.append_null();
                continue;
            }
            row_buf.clear();
            for s in &strings {
                row_buf.push_str(s.value(row));
            }
            b.append_value(&row_buf);
        }
        Ok(Arc::new(b.finish()))
    }
}

struct SubstringExpr {
    inner: Arc<dyn PhysicalExpr>,
    /// 1-based start as written in SQL.
    start: i64,
    length: Option<i64>,
}

impl PhysicalExpr for SubstringExpr {
    fn data_type(&self) -> DataType {
        DataType::Utf8
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let strings = as_string(&arr)?;
        // Positions before 1 consume part of the requested length.
        let (start, length) = if self.start >= 1 {
            (self.start - 1, self.length)
        } else {
            (0, self.length.map(|l| (l + self.start - 1).max(0)))
        };
        let length = length.map(|l| l.unsigned_abs());
        let out = substring_by_char(strings, start, length).map_err(kernel_err("SUBSTRING"))?;
        Ok(Arc::new(out))
    }
}

struct PowerExpr {
    base: Arc<dyn PhysicalExpr>,
    exp: Arc<dyn PhysicalExpr>,
}

impl PhysicalExpr for PowerExpr {
    fn data_type(&self) -> DataType {
        DataType::Float64
    }

    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let base = self.base.evaluate(batch)?;
        let exp = self.exp.evaluate(batch)?;
        let (base, exp) = (as_float(&base)?, as_float(&exp)?);
        let out: Float64Array = base
            .iter()
            .zip(exp.iter())
            .map(|(b, e)| Some(b?.powf(e?)))
            .collect();
        Ok(Arc::new(out))
    }
}

struct MathExpr {
    inner: Arc<dyn PhysicalExpr>,
    func: ScalarFunc,
}

impl PhysicalExpr for MathExpr {
    fn data_type(&self) -> DataType {
        DataType::Float64
    }

    /// Inputs outside a function's domain (LN of a non-positive value, ASIN
    /// beyond ±1) evaluate to NULL.
    fn evaluate(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let arr = self.inner.evaluate(batch)?;
        let func = self.func;
        let out = as_float(&arr)?.unary_opt::<_, arrow::datatypes::Float64Type>(|x| {
            match func {
                ScalarFunc::Sin => Some(x.sin()),
                ScalarFunc::Cos => Some(x.cos()),
                ScalarFunc::Tan => Some(x.tan()),
                ScalarFunc::Atan => Some(x.atan()),
                ScalarFunc::Asin => (-1.0..=1.0).contains(&x).then(|| x.asin()),
                ScalarFunc::Acos => (-1.0..=1.0).contains(&x).then(|| x.acos()),
                ScalarFunc::Ln => (x > 0.0).then(|| x.ln()),
                ScalarFunc::Log10 => (x > 0.0).then(|| x.log10()),
                _ => None,
            }
        });
        Ok(Arc::new(out))
    }
}

fn as_string(arr: &ArrayRef) -> Result<&StringArray> {
    arr.as_any().downcast_ref::<StringArray>().ok_or_else(|| {
        QuarryError::TypeMismatch(format!("expected Utf8, got {:?}", arr.data_type()))
    })
}

fn as_float(arr: &ArrayRef) -> Result<&Float64Array> {
    arr.as_any().downcast_ref::<Float64Array>().ok_or_else(|| {
        QuarryError::TypeMismatch(format!("expected Float64, got {:?}", arr.data_type()))
    })
}

fn as_boolean(arr: &ArrayRef) -> Result<&BooleanArray> {
    arr.as_any().downcast_ref::<BooleanArray>().ok_or_else(|| {
        QuarryError::TypeMismatch(format!("expected Boolean, got {:?}", arr.data_type()))
    })
}

fn kernel_err(what: &str) -> impl Fn(arrow_schema::ArrowError) -> QuarryError + '_ {
    move |e| QuarryError::Execution(format!("{what} failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::{Field, Schema};
    use quarry_planner::{call, coalesce, col, concat, lit, null, substring};

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Float64, true),
            Field::new("s", DataType::Utf8, true),
            Field::new("f", DataType::Boolean, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![Some(1), None, Some(3), Some(4)])),
                Arc::new(Float64Array::from(vec![Some(0.5), Some(1.5), None, Some(2.0)])),
                Arc::new(StringArray::from(vec![Some("x"), Some("y"), None, Some("x")])),
                Arc::new(BooleanArray::from(vec![Some(true), None, Some(false), None])),
            ],
        )
        .unwrap()
    }

    fn eval(expr: Expr) -> Result<ArrayRef> {
        let b = batch();
        compile_expr(&expr, &b.schema())?.evaluate(&b)
    }

    fn ints(arr: &ArrayRef) -> Vec<Option<i64>> {
        arr.as_any().downcast_ref::<Int64Array>().unwrap().iter().collect()
    }

    fn bools(arr: &ArrayRef) -> Vec<Option<bool>> {
        arr.as_any().downcast_ref::<BooleanArray>().unwrap().iter().collect()
    }

    #[test]
    fn arithmetic_propagates_nulls() {
        let out = eval(col("a").plus(lit(10i64))).unwrap();
        assert_eq!(ints(&out), vec![Some(11), None, Some(13), Some(14)]);
        let out = eval(col("a").modulo(lit(2i64))).unwrap();
        assert_eq!(ints(&out), vec![Some(1), None, Some(1), Some(0)]);
    }

    #[test]
    fn mixed_numeric_widens_to_float() {
        let out = eval(col("a").multiply(col("b"))).unwrap();
        assert_eq!(out.data_type(), &DataType::Float64);
        let f = out.as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(f.value(0), 0.5);
        assert!(f.is_null(1));
        assert!(f.is_null(2));
        assert_eq!(f.value(3), 8.0);
    }

    #[test]
    fn comparisons_use_sql_nulls() {
        let out = eval(col("a").gt(lit(1i64))).unwrap();
        assert_eq!(bools(&out), vec![Some(false), None, Some(true), Some(true)]);
        let out = eval(col("s").eq(lit("x"))).unwrap();
        assert_eq!(bools(&out), vec![Some(true), Some(false), None, Some(true)]);
        let out = eval(col("a").eq(null())).unwrap();
        assert_eq!(bools(&out), vec![None, None, None, None]);
    }

    #[test]
    fn kleene_logic() {
        let out = eval(col("f").and(lit(false))).unwrap();
        assert_eq!(bools(&out), vec![Some(false); 4]);
        let out = eval(col("f").or(lit(true))).unwrap();
        assert_eq!(bools(&out), vec![Some(true); 4]);
        let out = eval(col("f").and(lit(true))).unwrap();
        assert_eq!(bools(&out), vec![Some(true), None, Some(false), None]);
        let out = eval(col("f").not()).unwrap();
        assert_eq!(bools(&out), vec![Some(false), None, Some(true), None]);
    }

    #[test]
    fn null_checks_and_negation() {
        let out = eval(col("a").is_null()).unwrap();
        assert_eq!(bools(&out), vec![Some(false), Some(true), Some(false), Some(false)]);
        let out = eval(col("b").is_not_null()).unwrap();
        assert_eq!(bools(&out), vec![Some(true), Some(true), Some(false), Some(true)]);
        let out = eval(Expr::Negative(Box::new(col("a")))).unwrap();
        assert_eq!(ints(&out), vec![Some(-1), None, Some(-3), Some(-4)]);
    }

    #[test]
    fn incompatible_operands_fail_at_compile_time() {
        let schema = batch().schema();
        for expr in [
            col("s").plus(lit(1i64)),
            col("s").lt(col("a")),
            col("a").and(lit(true)),
            col("s").not(),
            Expr::Negative(Box::new(col("f"))),
        ] {
            let err = compile_expr(&expr, &schema).err().unwrap();
            assert!(matches!(err, QuarryError::TypeMismatch(_)), "{expr:?}: {err}");
        }
    }

    #[test]
    fn division_by_zero_is_an_execution_error() {
        let err = eval(col("a").divide(lit(0i64))).unwrap_err();
        assert!(matches!(err, QuarryError::Execution(_)));
        let out = eval(col("a").divide(null())).unwrap();
        assert_eq!(ints(&out), vec![None; 4]);
    }

    #[test]
    fn null_dividend_over_zero_is_null() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("n", DataType::Int64, true),
            Field::new("d", DataType::Int64, true),
        ]));
        let b = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![None, Some(6)])),
                Arc::new(Int64Array::from(vec![Some(0), Some(3)])),
            ],
        )
        .unwrap();
        let out = compile_expr(&col("n").divide(col("d")), &schema)
            .unwrap()
            .evaluate(&b)
            .unwrap();
        assert_eq!(ints(&out), vec![None, Some(2)]);
    }

    fn strings(arr: &ArrayRef) -> Vec<Option<String>> {
        arr.as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
            .iter()
            .map(|v| v.map(str::to_string))
            .collect()
    }

    #[test]
    fn like_matches_wildcards_and_keeps_nulls() {
        let out = eval(col("s").like("x%")).unwrap();
        assert_eq!(bools(&out), vec![Some(true), Some(false), None, Some(true)]);
        let out = eval(col("s").not_like("_")).unwrap();
        assert_eq!(bools(&out), vec![Some(false), Some(false), None, Some(false)]);
        let err = compile_expr(&col("a").like("1%"), &batch().schema()).err().unwrap();
        assert!(matches!(err, QuarryError::TypeMismatch(_)));
    }

    #[test]
    fn coalesce_takes_first_present_value_in_common_type() {
        let out = eval(coalesce(vec![col("a"), col("b"), lit(-1i64)])).unwrap();
        assert_eq!(out.data_type(), &DataType::Float64);
        let f = out.as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(f.iter().collect::<Vec<_>>(), vec![Some(1.0), Some(1.5), Some(3.0), Some(4.0)]);
        let out = eval(coalesce(vec![null(), col("s"), lit("z")])).unwrap();
        assert_eq!(
            strings(&out),
            vec![Some("x".into()), Some("y".into()), Some("z".into()), Some("x".into())]
        );
        let err = compile_expr(&coalesce(vec![col("a"), col("s")]), &batch().schema())
            .err()
            .unwrap();
        assert!(matches!(err, QuarryError::TypeMismatch(_)));
    }

    #[test]
    fn concat_and_substring() {
        let out = eval(concat(vec![col("s"), lit("-"), col("a")])).unwrap();
        assert_eq!(
            strings(&out),
            vec![Some("x-1".into()), None, None, Some("x-4".into())]
        );
        let schema = Arc::new(Schema::new(vec![Field::new("w", DataType::Utf8, true)]));
        let b = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(StringArray::from(vec![Some("quarry"), None, Some("ab")]))],
        )
        .unwrap();
        let run = |e: Expr| compile_expr(&e, &schema).unwrap().evaluate(&b).unwrap();
        assert_eq!(
            strings(&run(substring(col("w"), 2, Some(3)))),
            vec![Some("uar".into()), None, Some("b".into())]
        );
        assert_eq!(
            strings(&run(substring(col("w"), 0, Some(2)))),
            vec![Some("q".into()), None, Some("a".into())]
        );
        assert_eq!(
            strings(&run(substring(col("w"), 4, None))),
            vec![Some("rry".into()), None, Some("".into())]
        );
    }

    #[test]
    fn math_functions_null_outside_domain() {
        let out = eval(call(ScalarFunc::Power, vec![col("a"), lit(2i64)])).unwrap();
        let f = out.as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(f.iter().collect::<Vec<_>>(), vec![Some(1.0), None, Some(9.0), Some(16.0)]);
        let out = eval(call(ScalarFunc::Ln, vec![col("a").minus(lit(1i64))])).unwrap();
        let f = out.as_any().downcast_ref::<Float64Array>().unwrap();
        assert!(f.is_null(0));
        assert!((f.value(2) - 2f64.ln()).abs() < 1e-12);
        let out = eval(call(ScalarFunc::Asin, vec![col("b")])).unwrap();
        let f = out.as_any().downcast_ref::<Float64Array>().unwrap();
        assert!((f.value(0) - 0.5f64.asin()).abs() < 1e-12);
        assert!(f.is_null(1));
        let err = compile_expr(&call(ScalarFunc::Sin, vec![col("s")]), &batch().schema())
            .err()
            .unwrap();
        assert!(matches!(err, QuarryError::TypeMismatch(_)));
    }

    #[test]
    fn dates_compare_with_timestamps_and_date_strings() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("d", DataType::Date32, true),
            Field::new("ts", DataType::Timestamp(TimeUnit::Second, None), true),
        ]));
        let b = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Date32Array::from(vec![Some(0), Some(19_723), None])),
                Arc::new(TimestampSecondArray::from(vec![Some(3_600), Some(0), Some(1)])),
            ],
        )
        .unwrap();
        let run = |e: Expr| compile_expr(&e, &schema).unwrap().evaluate(&b).unwrap();
        // 19723 days after the epoch is 2024-01-01.
        assert_eq!(
            bools(&run(col("d").gt_eq(lit("2024-01-01")))),
            vec![Some(false), Some(true), None]
        );
        assert_eq!(
            bools(&run(col("d").lt(col("ts")))),
            vec![Some(true), Some(false), None]
        );
        assert_eq!(
            bools(&run(col("d").eq(Expr::Literal(LiteralValue::Date32(0))))),
            vec![Some(true), Some(false), None]
        );
        let err = compile_expr(&col("d").plus(lit(1i64)), &schema).err().unwrap();
        assert!(matches!(err, QuarryError::TypeMismatch(_)));
    }

    #[test]
    fn unknown_column_is_a_planning_error() {
        let err = eval(col("missing")).unwrap_err();
        assert!(matches!(err, QuarryError::Planning(_)));
    }
}
