use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, UInt32Array, new_null_array};
use arrow::compute::take;
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use futures::stream::BoxStream;
use futures::{StreamExt, TryFutureExt, stream};
use quarry_common::{MemoryReservation, QuarryError, Result};
use quarry_planner::{BuildSide, JoinType};
use tracing::debug;

use crate::columnar::BatchBuffer;
use crate::context::TaskContext;
use crate::exec_node::ExecNode;
use crate::scalar::{ScalarValue, key_at, take_index};
use crate::stream::{SendableRecordBatchStream, StreamAdapter};

/// Equi-join that materializes the build side into a hash table and streams
/// the probe side through it.
///
/// Output columns are always left columns followed by right columns,
/// whichever side is built. NULL keys never match.
pub struct HashJoinNode {
    left: Arc<dyn ExecNode>,
    right: Arc<dyn ExecNode>,
    left_keys: Vec<usize>,
    right_keys: Vec<usize>,
    join_type: JoinType,
    build_side: BuildSide,
    schema: SchemaRef,
}

impl HashJoinNode {
    pub fn try_new(
        left: Arc<dyn ExecNode>,
        right: Arc<dyn ExecNode>,
        on: &[(String, String)],
        join_type: JoinType,
        build_side: BuildSide,
    ) -> Result<Self> {
        if on.is_empty() {
            return Err(QuarryError::Planning(
                "hash join requires at least one key pair".to_string(),
            ));
        }
        let (ls, rs) = (left.schema(), right.schema());
        let mut left_keys = Vec::with_capacity(on.len());
        let mut right_keys = Vec::with_capacity(on.len());
        for (l, r) in on {
            let li = ls
                .index_of(l)
                .map_err(|_| QuarryError::Planning(format!("unknown left join key: {l}")))?;
            let ri = rs
                .index_of(r)
                .map_err(|_| QuarryError::Planning(format!("unknown right join key: {r}")))?;
            let (lt, rt) = (ls.field(li).data_type(), rs.field(ri).data_type());
            if !join_compatible(lt, rt) {
                return Err(QuarryError::TypeMismatch(format!(
                    "join key {l} ({lt:?}) is not comparable with {r} ({rt:?})"
                )));
            }
            left_keys.push(li);
            right_keys.push(ri);
        }

        let mut fields: Vec<Field> = Vec::with_capacity(ls.fields().len() + rs.fields().len());
        for f in ls.fields().iter().chain(rs.fields().iter()) {
            if fields.iter().any(|existing| existing.name() == f.name()) {
                return Err(QuarryError::Planning(format!(
                    "duplicate column name in join output: {}",
                    f.name()
                )));
            }
            fields.push(f.as_ref().clone().with_nullable(true));
        }
        Ok(Self {
            left,
            right,
            left_keys,
            right_keys,
            join_type,
            build_side,
            schema: Arc::new(Schema::new(fields)),
        })
    }
}

fn join_compatible(l: &DataType, r: &DataType) -> bool {
    l == r || (l.is_integer() && r.is_integer()) || (l.is_floating() && r.is_floating())
}

impl ExecNode for HashJoinNode {
    fn name(&self) -> &'static str {
        "HashJoin"
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn execute(&self, ctx: Arc<TaskContext>) -> Result<SendableRecordBatchStream> {
        let build_is_left = self.build_side == BuildSide::Left;
        let (build, probe, build_keys, probe_keys) = if build_is_left {
            (&self.left, &self.right, &self.left_keys, &self.right_keys)
        } else {
            (&self.right, &self.left, &self.right_keys, &self.left_keys)
        };
        let build_stream = build.execute(Arc::clone(&ctx))?;
        let probe_stream = probe.execute(Arc::clone(&ctx))?;
        let (keep_build, keep_probe) = match (self.join_type, build_is_left) {
            (JoinType::Inner, _) => (false, false),
            (JoinType::Full, _) => (true, true),
            (JoinType::Left, true) | (JoinType::Right, false) => (true, false),
            (JoinType::Left, false) | (JoinType::Right, true) => (false, true),
        };
        let shape = JoinShape {
            schema: self.schema(),
            build_is_left,
            keep_build,
            keep_probe,
            probe_keys: probe_keys.clone(),
            probe_schema: probe.schema(),
        };
        let build_keys = build_keys.clone();

        let out = async move {
            let table = build_table(build_stream, &build_keys, &ctx).await?;
            Ok::<_, QuarryError>(probe_with(table, shape, probe_stream))
        }
        .try_flatten_stream()
        .boxed();
        Ok(Box::pin(StreamAdapter::new(self.schema(), out)))
    }
}

struct JoinShape {
    schema: SchemaRef,
    build_is_left: bool,
    keep_build: bool,
    keep_probe: bool,
    probe_keys: Vec<usize>,
    probe_schema: SchemaRef,
}

struct BuildTable {
    batch: RecordBatch,
    rows: HashMap<Vec<ScalarValue>, Vec<u32>>,
    matched: Vec<bool>,
    _reservation: MemoryReservation,
}

async fn build_table(
    mut input: SendableRecordBatchStream,
    keys: &[usize],
    ctx: &TaskContext,
) -> Result<BuildTable> {
    let mut buffer = BatchBuffer::new(input.schema(), ctx.memory());
    while let Some(batch) = input.next().await {
        buffer.push(batch?)?;
    }
    let (batch, mut reservation) = buffer.into_single_batch()?.into_parts();

    let key_columns: Vec<ArrayRef> = keys.iter().map(|i| Arc::clone(batch.column(*i))).collect();
    let mut rows: HashMap<Vec<ScalarValue>, Vec<u32>> = HashMap::new();
    let mut table_bytes = 0usize;
    for row in 0..batch.num_rows() {
        let key = key_at(&key_columns, row)?;
        if key.iter().any(ScalarValue::is_null) {
            continue;
        }
        table_bytes += 4;
        rows.entry(key)
            .or_insert_with_key(|k| {
                table_bytes += k.iter().map(ScalarValue::estimate_bytes).sum::<usize>() + 48;
                Vec::new()
            })
            .push(take_index(row)?);
    }
    reservation.try_grow(table_bytes)?;
    debug!(
        build_rows = batch.num_rows(),
        distinct_keys = rows.len(),
        reserved_bytes = reservation.size(),
        "hash join build side ready"
    );
    Ok(BuildTable {
        matched: vec![false; batch.num_rows()],
        batch,
        rows,
        _reservation: reservation,
    })
}

fn probe_with(
    table: BuildTable,
    shape: JoinShape,
    probe: SendableRecordBatchStream,
) -> BoxStream<'static, Result<RecordBatch>> {
    stream::unfold(
        (Some(table), shape, probe),
        |(table, shape, mut probe)| async move {
            let mut table = table?;
            match probe.next().await {
                Some(Ok(batch)) => {
                    let out = probe_batch(&mut table, &shape, &batch);
                    let next = if out.is_ok() { Some(table) } else { None };
                    Some((out, (next, shape, probe)))
                }
                Some(Err(e)) => Some((Err(e), (None, shape, probe))),
                None if shape.keep_build => match unmatched_build_rows(&table, &shape) {
                    Ok(b) if b.num_rows() == 0 => None,
                    out => Some((out, (None, shape, probe))),
                },
                None => None,
            }
        },
    )
    .boxed()
}

fn probe_batch(
    table: &mut BuildTable,
    shape: &JoinShape,
    batch: &RecordBatch,
) -> Result<RecordBatch> {
    let key_columns: Vec<ArrayRef> = shape
        .probe_keys
        .iter()
        .map(|i| Arc::clone(batch.column(*i)))
        .collect();
    let mut build_idx: Vec<Option<u32>> = Vec::new();
    let mut probe_idx: Vec<Option<u32>> = Vec::new();
    for row in 0..batch.num_rows() {
        let key = key_at(&key_columns, row)?;
        let probe_row = take_index(row)?;
        let matches = if key.iter().any(ScalarValue::is_null) {
            None
        } else {
            table.rows.get(&key)
        };
        match matches {
            Some(rows) => {
                for b in rows {
                    table.matched[*b as usize] = true;
                    build_idx.push(Some(*b));
                    probe_idx.push(Some(probe_row));
                }
            }
            None if shape.keep_probe => {
                build_idx.push(None);
                probe_idx.push(Some(probe_row));
            }
            None => {}
        }
    }
    assemble(
        shape,
        &table.batch,
        &UInt32Array::from(build_idx),
        batch,
        &UInt32Array::from(probe_idx),
    )
}

fn unmatched_build_rows(table: &BuildTable, shape: &JoinShape) -> Result<RecordBatch> {
    let build_idx: Vec<Option<u32>> = table
        .matched
        .iter()
        .enumerate()
        .filter(|(_, m)| !**m)
        .map(|(i, _)| take_index(i).map(Some))
        .collect::<Result<_>>()?;
    let n = build_idx.len();
    let probe_columns = shape
        .probe_schema
        .fields()
        .iter()
        .map(|f| new_null_array(f.data_type(), n))
        .collect::<Vec<_>>();
    let build_columns = take_columns(&table.batch, &UInt32Array::from(build_idx))?;
    combine(shape, build_columns, probe_columns)
}

fn assemble(
    shape: &JoinShape,
    build: &RecordBatch,
    build_idx: &UInt32Array,
    probe: &RecordBatch,
    probe_idx: &UInt32Array,
) -> Result<RecordBatch> {
    combine(
        shape,
        take_columns(build, build_idx)?,
        take_columns(probe, probe_idx)?,
    )
}

fn take_columns(batch: &RecordBatch, indices: &UInt32Array) -> Result<Vec<ArrayRef>> {
    batch
        .columns()
        .iter()
        .map(|c| {
            take(c.as_ref(), indices, None)
                .map_err(|e| QuarryError::Execution(format!("join take failed: {e}")))
        })
        .collect()
}

fn combine(shape: &JoinShape, build: Vec<ArrayRef>, probe: Vec<ArrayRef>) -> Result<RecordBatch> {
    let (left, right) = if shape.build_is_left {
        (build, probe)
    } else {
        (probe, build)
    };
    let columns = left.into_iter().chain(right).collect();
    RecordBatch::try_new(Arc::clone(&shape.schema), columns)
        .map_err(|e| QuarryError::Execution(format!("join output failed: {e}")))
}
