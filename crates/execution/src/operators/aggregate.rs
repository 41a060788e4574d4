use std::collections::{HashMap, HashSet};
use std::collections::hash_map::Entry;
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use futures::StreamExt;
use quarry_common::{QuarryError, Result};
use quarry_planner::{AggExpr, AggregateMode, Expr};
use tracing::debug;

use crate::columnar::ColumnAllocator;
use crate::context::TaskContext;
use crate::exec_node::ExecNode;
use crate::expressions::{PhysicalExpr, compile_expr};
use crate::operators::{deferred_stream, split_batch};
use crate::scalar::{ScalarValue, key_at};
use crate::stream::SendableRecordBatchStream;

/// Hidden partial-state column carrying the row count behind an AVG sum.
pub fn avg_count_column(name: &str) -> String {
    format!("__avg_count_{name}")
}

/// Where one aggregate reads its per-row input from.
enum AggInput {
    /// Raw input expression (partial and single modes).
    Expr(Arc<dyn PhysicalExpr>),
    /// Partial-state columns (final mode).
    State { value: usize, count: Option<usize> },
}

struct AggSpec {
    expr: AggExpr,
    name: String,
    input: AggInput,
    /// Type of the partial state column.
    state_type: DataType,
}

impl AggSpec {
    fn final_type(&self) -> DataType {
        match self.expr {
            AggExpr::Count(_) | AggExpr::CountDistinct(_) => DataType::Int64,
            AggExpr::Avg(_) => DataType::Float64,
            _ => self.state_type.clone(),
        }
    }
}

#[derive(Debug, Clone)]
enum AggState {
    Count(i64),
    SumInt(Option<i64>),
    SumFloat(Option<f64>),
    Min(Option<ScalarValue>),
    Max(Option<ScalarValue>),
    Avg { sum: f64, count: i64 },
    Distinct(HashSet<ScalarValue>),
}

struct GroupSpec {
    name: String,
    expr: Arc<dyn PhysicalExpr>,
}

/// Hash aggregation in one of three modes.
///
/// `Partial` emits per-group states, `Final` merges states produced by
/// partial aggregates, `Single` goes from raw rows to final values. Output
/// groups are ordered by key so repeated runs emit identical batches.
pub struct HashAggregateNode {
    input: Arc<dyn ExecNode>,
    mode: AggregateMode,
    groups: Arc<Vec<GroupSpec>>,
    specs: Arc<Vec<AggSpec>>,
    schema: SchemaRef,
}

impl HashAggregateNode {
    pub fn try_new(
        input: Arc<dyn ExecNode>,
        mode: AggregateMode,
        group_exprs: &[Expr],
        aggr_exprs: &[(AggExpr, String)],
    ) -> Result<Self> {
        let in_schema = input.schema();
        let groups = group_exprs
            .iter()
            .map(|e| match e {
                Expr::Column(name) => Ok(GroupSpec {
                    name: name.clone(),
                    expr: compile_expr(e, &in_schema)?,
                }),
                other => Err(QuarryError::Unsupported(format!(
                    "group expression must be a column, got {other:?}"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        let specs = aggr_exprs
            .iter()
            .map(|(expr, name)| build_spec(expr, name, mode, &in_schema))
            .collect::<Result<Vec<_>>>()?;

        let mut fields: Vec<Field> = groups
            .iter()
            .map(|g| Field::new(&g.name, g.expr.data_type(), true))
            .collect();
        for spec in &specs {
            let dt = if mode == AggregateMode::Partial {
                spec.state_type.clone()
            } else {
                spec.final_type()
            };
            fields.push(Field::new(&spec.name, dt, true));
        }
        if mode == AggregateMode::Partial {
            for spec in specs.iter().filter(|s| matches!(s.expr, AggExpr::Avg(_))) {
                fields.push(Field::new(avg_count_column(&spec.name), DataType::Int64, true));
            }
        }
        Ok(Self {
            input,
            mode,
            groups: Arc::new(groups),
            specs: Arc::new(specs),
            schema: Arc::new(Schema::new(fields)),
        })
    }
}

fn build_spec(
    expr: &AggExpr,
    name: &str,
    mode: AggregateMode,
    schema: &SchemaRef,
) -> Result<AggSpec> {
    if !expr.is_decomposable() && mode != AggregateMode::Single {
        return Err(QuarryError::Planning(format!(
            "{} only runs as a single-phase aggregate",
            expr.name()
        )));
    }
    if mode == AggregateMode::Final {
        let value = schema.index_of(name).map_err(|_| {
            QuarryError::Planning(format!("missing partial state column: {name}"))
        })?;
        let count = if matches!(expr, AggExpr::Avg(_)) {
            let hidden = avg_count_column(name);
            Some(schema.index_of(&hidden).map_err(|_| {
                QuarryError::Planning(format!("missing partial state column: {hidden}"))
            })?)
        } else {
            None
        };
        return Ok(AggSpec {
            expr: expr.clone(),
            name: name.to_string(),
            input: AggInput::State { value, count },
            state_type: schema.field(value).data_type().clone(),
        });
    }

    let compiled = compile_expr(expr.input(), schema)?;
    let state_type = expr.output_type(&compiled.data_type())?;
    Ok(AggSpec {
        expr: expr.clone(),
        name: name.to_string(),
        input: AggInput::Expr(compiled),
        state_type,
    })
}

fn init_states(specs: &[AggSpec]) -> Vec<AggState> {
    specs
        .iter()
        .map(|s| match s.expr {
            AggExpr::Count(_) => AggState::Count(0),
            AggExpr::Sum(_) if s.state_type == DataType::Float64 => AggState::SumFloat(None),
            AggExpr::Sum(_) => AggState::SumInt(None),
            AggExpr::Min(_) => AggState::Min(None),
            AggExpr::Max(_) => AggState::Max(None),
            AggExpr::Avg(_) => AggState::Avg { sum: 0.0, count: 0 },
            AggExpr::CountDistinct(_) => AggState::Distinct(HashSet::new()),
        })
        .collect()
}

/// Fold one input value into `state`. When `merging`, `value` is a partial
/// state and `merge_count` the hidden AVG count that came with it.
///
/// Returns the bytes the state grew by.
fn update_state(
    state: &mut AggState,
    value: ScalarValue,
    merge_count: Option<i64>,
    merging: bool,
) -> Result<usize> {
    match state {
        AggState::Count(acc) => {
            let add = match (merging, &value) {
                (true, ScalarValue::Int64(v)) => *v,
                (true, _) => 0,
                (false, ScalarValue::Null) => 0,
                (false, _) => 1,
            };
            *acc = acc
                .checked_add(add)
                .ok_or_else(|| QuarryError::Execution("COUNT overflow".to_string()))?;
        }
        AggState::SumInt(acc) => {
            if let ScalarValue::Int64(v) = value {
                let next = acc.unwrap_or(0).checked_add(v).ok_or_else(|| {
                    QuarryError::Execution("integer overflow in SUM".to_string())
                })?;
                *acc = Some(next);
            }
        }
        AggState::SumFloat(acc) => {
            if let Some(v) = value.as_f64() {
                *acc = Some(acc.unwrap_or(0.0) + v);
            }
        }
        AggState::Min(cur) => {
            if !value.is_null() && cur.as_ref().is_none_or(|c| value < *c) {
                *cur = Some(value);
            }
        }
        AggState::Max(cur) => {
            if !value.is_null() && cur.as_ref().is_none_or(|c| value > *c) {
                *cur = Some(value);
            }
        }
        AggState::Avg { sum, count } => {
            if let Some(v) = value.as_f64() {
                *sum += v;
                if !merging {
                    *count += 1;
                }
            }
            if merging {
                *count += merge_count.unwrap_or(0);
            }
        }
        AggState::Distinct(seen) => {
            let bytes = value.estimate_bytes() + 16;
            if !value.is_null() && seen.insert(value) {
                return Ok(bytes);
            }
        }
    }
    Ok(0)
}

fn state_value(state: &AggState) -> ScalarValue {
    match state {
        AggState::Count(v) => ScalarValue::Int64(*v),
        AggState::SumInt(v) => v.map_or(ScalarValue::Null, ScalarValue::Int64),
        AggState::SumFloat(v) => v.map_or(ScalarValue::Null, ScalarValue::float64),
        AggState::Min(v) | AggState::Max(v) => v.clone().unwrap_or(ScalarValue::Null),
        AggState::Avg { sum, .. } => ScalarValue::float64(*sum),
        AggState::Distinct(seen) => ScalarValue::Int64(seen.len() as i64),
    }
}

fn final_value(state: &AggState) -> ScalarValue {
    match state {
        AggState::Avg { count: 0, .. } => ScalarValue::Null,
        AggState::Avg { sum, count } => ScalarValue::float64(*sum / *count as f64),
        other => state_value(other),
    }
}

fn group_bytes(key: &[ScalarValue], specs: usize) -> usize {
    key.iter().map(ScalarValue::estimate_bytes).sum::<usize>() + specs * 24 + 48
}

impl ExecNode for HashAggregateNode {
    fn name(&self) -> &'static str {
        match self.mode {
            AggregateMode::Partial => "PartialHashAggregate",
            AggregateMode::Final => "FinalHashAggregate",
            AggregateMode::Single => "HashAggregate",
        }
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn execute(&self, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let input = self.input.execute(Arc::clone(&ctx))?;
        let run = AggregateRun {
            mode: self.mode,
            groups: Arc::clone(&self.groups),
            specs: Arc::clone(&self.specs),
            schema: self.schema(),
        };
        Ok(deferred_stream(self.schema(), async move {
            run.execute(input, &ctx).await
        }))
    }
}

struct AggregateRun {
    mode: AggregateMode,
    groups: Arc<Vec<GroupSpec>>,
    specs: Arc<Vec<AggSpec>>,
    schema: SchemaRef,
}

impl AggregateRun {
    async fn execute(
        &self,
        mut input: SendableRecordBatchStream,
        ctx: &TaskContext,
    ) -> Result<Vec<RecordBatch>> {
        let merging = self.mode == AggregateMode::Final;
        let mut table: HashMap<Vec<ScalarValue>, Vec<AggState>> = HashMap::new();
        let mut reservation = ctx.memory().empty_reservation();
        let mut estimated = 0usize;
        if self.groups.is_empty() {
            table.insert(vec![], init_states(&self.specs));
        }

        while let Some(batch) = input.next().await {
            let batch = batch?;
            let keys = self
                .groups
                .iter()
                .map(|g| g.expr.evaluate(&batch))
                .collect::<Result<Vec<ArrayRef>>>()?;
            let values = self
                .specs
                .iter()
                .map(|s| match &s.input {
                    AggInput::Expr(e) => Ok((e.evaluate(&batch)?, None)),
                    AggInput::State { value, count } => Ok((
                        Arc::clone(batch.column(*value)),
                        count.map(|c| Arc::clone(batch.column(c))),
                    )),
                })
                .collect::<Result<Vec<(ArrayRef, Option<ArrayRef>)>>>()?;

            for row in 0..batch.num_rows() {
                let states = match table.entry(key_at(&keys, row)?) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(e) => {
                        estimated += group_bytes(e.key(), self.specs.len());
                        e.insert(init_states(&self.specs))
                    }
                };
                for (state, (value, count)) in states.iter_mut().zip(&values) {
                    let merge_count = match count {
                        Some(c) => match ScalarValue::try_from_array(c, row)? {
                            ScalarValue::Int64(n) => Some(n),
                            _ => None,
                        },
                        None => None,
                    };
                    let value = ScalarValue::try_from_array(value, row)?;
                    estimated += update_state(state, value, merge_count, merging)?;
                }
            }
            reservation.try_resize(estimated)?;
        }

        let mut rows: Vec<(Vec<ScalarValue>, Vec<AggState>)> = table.into_iter().collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(
            mode = ?self.mode,
            groups = rows.len(),
            reserved_bytes = reservation.size(),
            "aggregate input drained"
        );

        let n_groups = self.groups.len();
        let n_specs = self.specs.len();
        let mut hidden = n_groups + n_specs;
        let avg_count_slots: Vec<Option<usize>> = self
            .specs
            .iter()
            .map(|s| {
                (self.mode == AggregateMode::Partial && matches!(s.expr, AggExpr::Avg(_))).then(|| {
                    hidden += 1;
                    hidden - 1
                })
            })
            .collect();
        let mut columns: Vec<Vec<ScalarValue>> =
            vec![Vec::with_capacity(rows.len()); self.schema.fields().len()];
        for (key, states) in rows {
            for (i, k) in key.into_iter().enumerate() {
                columns[i].push(k);
            }
            for (i, state) in states.iter().enumerate() {
                let value = if self.mode == AggregateMode::Partial {
                    state_value(state)
                } else {
                    final_value(state)
                };
                columns[n_groups + i].push(value);
                if let (Some(slot), AggState::Avg { count, .. }) = (avg_count_slots[i], state) {
                    columns[slot].push(ScalarValue::Int64(*count));
                }
            }
        }

        let allocator = ColumnAllocator::new(Arc::clone(ctx.memory()));
        let tracked = allocator.build_batch(Arc::clone(&self.schema), &columns)?;
        drop(reservation);
        Ok(split_batch(tracked.into_batch(), ctx.batch_size_rows()))
    }
}
