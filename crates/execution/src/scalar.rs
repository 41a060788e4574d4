//! Row-level scalar values used for hash keys, aggregate states and
//! partitioning.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, BooleanBuilder, Date32Array, Decimal128Array, Float32Array,
    Float32Builder, Float64Array, Float64Builder, Int32Array, Int32Builder, Int64Array,
    Int64Builder, StringArray, StringBuilder, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray, TimestampSecondArray, new_null_array,
};
use arrow_schema::{DataType, TimeUnit};
use quarry_common::{QuarryError, Result};

/// One value of a column.
///
/// Floats are stored as bits so the type can be `Eq + Hash` and serve as a
/// hash-table key. Narrow integer and float columns widen to 64 bits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64Bits(u64),
    Utf8(String),
    Date32(i32),
    Timestamp(i64, TimeUnit),
    Decimal128 {
        value: i128,
        precision: u8,
        scale: i8,
    },
}

impl ScalarValue {
    /// Float key with `-0.0` folded into `0.0` and every NaN into one bit
    /// pattern, so equal SQL values hash equally.
    pub fn float64(v: f64) -> Self {
        let v = if v == 0.0 {
            0.0
        } else if v.is_nan() {
            f64::NAN
        } else {
            v
        };
        ScalarValue::Float64Bits(v.to_bits())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Int64(x) => Some(*x as f64),
            ScalarValue::Float64Bits(x) => Some(f64::from_bits(*x)),
            _ => None,
        }
    }

    pub fn estimate_bytes(&self) -> usize {
        match self {
            ScalarValue::Int64(_) | ScalarValue::Float64Bits(_) | ScalarValue::Timestamp(..) => 8,
            ScalarValue::Date32(_) => 4,
            ScalarValue::Decimal128 { .. } => 16,
            ScalarValue::Utf8(s) => s.len() + 4,
            ScalarValue::Boolean(_) => 1,
            ScalarValue::Null => 0,
        }
    }

    /// Read row `row` of `array`.
    pub fn try_from_array(array: &ArrayRef, row: usize) -> Result<Self> {
        if array.is_null(row) {
            return Ok(ScalarValue::Null);
        }
        match array.data_type() {
            DataType::Null => Ok(ScalarValue::Null),
            DataType::Int64 => Ok(ScalarValue::Int64(downcast::<Int64Array>(array)?.value(row))),
            DataType::Int32 => Ok(ScalarValue::Int64(
                downcast::<Int32Array>(array)?.value(row) as i64,
            )),
            DataType::Float64 => Ok(ScalarValue::float64(
                downcast::<Float64Array>(array)?.value(row),
            )),
            DataType::Float32 => Ok(ScalarValue::float64(
                downcast::<Float32Array>(array)?.value(row) as f64,
            )),
            DataType::Utf8 => Ok(ScalarValue::Utf8(
                downcast::<StringArray>(array)?.value(row).to_string(),
            )),
            DataType::Boolean => Ok(ScalarValue::Boolean(
                downcast::<BooleanArray>(array)?.value(row),
            )),
            DataType::Date32 => Ok(ScalarValue::Date32(
                downcast::<Date32Array>(array)?.value(row),
            )),
            DataType::Timestamp(unit, _) => {
                let v = match unit {
                    TimeUnit::Second => downcast::<TimestampSecondArray>(array)?.value(row),
                    TimeUnit::Millisecond => {
                        downcast::<TimestampMillisecondArray>(array)?.value(row)
                    }
                    TimeUnit::Microsecond => {
                        downcast::<TimestampMicrosecondArray>(array)?.value(row)
                    }
                    TimeUnit::Nanosecond => downcast::<TimestampNanosecondArray>(array)?.value(row),
                };
                Ok(ScalarValue::Timestamp(v, *unit))
            }
            DataType::Decimal128(precision, scale) => Ok(ScalarValue::Decimal128 {
                value: downcast::<Decimal128Array>(array)?.value(row),
                precision: *precision,
                scale: *scale,
            }),
            other => Err(QuarryError::Unsupported(format!(
                "scalar type not supported: {other:?}"
            ))),
        }
    }

    /// Build an array of type `dt` from `values`.
    pub fn iter_to_array(values: &[ScalarValue], dt: &DataType) -> Result<ArrayRef> {
        match dt {
            DataType::Null => Ok(new_null_array(&DataType::Null, values.len())),
            DataType::Int64 => {
                let mut b = Int64Builder::with_capacity(values.len());
                for v in values {
                    match v {
                        ScalarValue::Int64(x) => b.append_value(*x),
                        ScalarValue::Null => b.append_null(),
                        other => return Err(build_mismatch(dt, other)),
                    }
                }
                Ok(Arc::new(b.finish()))
            }
            DataType::Int32 => {
                let mut b = Int32Builder::with_capacity(values.len());
                for v in values {
                    match v {
                        ScalarValue::Int64(x) => {
                            let narrowed = i32::try_from(*x).map_err(|_| {
                                QuarryError::Execution(format!("value {x} overflows Int32"))
                            })?;
                            b.append_value(narrowed)
                        }
                        ScalarValue::Null => b.append_null(),
                        other => return Err(build_mismatch(dt, other)),
                    }
                }
                Ok(Arc::new(b.finish()))
            }
            DataType::Float64 => {
                let mut b = Float64Builder::with_capacity(values.len());
                for v in values {
                    match v {
                        ScalarValue::Float64Bits(x) => b.append_value(f64::from_bits(*x)),
                        ScalarValue::Int64(x) => b.append_value(*x as f64),
                        ScalarValue::Null => b.append_null(),
                        other => return Err(build_mismatch(dt, other)),
                    }
                }
                Ok(Arc::new(b.finish()))
            }
            DataType::Float32 => {
                let mut b = Float32Builder::with_capacity(values.len());
                for v in values {
                    match v {
                        ScalarValue::Float64Bits(x) => b.append_value(f64::from_bits(*x) as f32),
                        ScalarValue::Null => b.append_null(),
                        other => return Err(build_mismatch(dt, other)),
                    }
                }
                Ok(Arc::new(b.finish()))
            }
            DataType::Utf8 => {
                let bytes = values.iter().map(ScalarValue::estimate_bytes).sum();
                let mut b = StringBuilder::with_capacity(values.len(), bytes);
                for v in values {
                    match v {
                        ScalarValue::Utf8(x) => b.append_value(x),
                        ScalarValue::Null => b.append_null(),
                        other => return Err(build_mismatch(dt, other)),
                    }
                }
                Ok(Arc::new(b.finish()))
            }
            DataType::Boolean => {
                let mut b = BooleanBuilder::with_capacity(values.len());
                for v in values {
                    match v {
                        ScalarValue::Boolean(x) => b.append_value(*x),
                        ScalarValue::Null => b.append_null(),
                        other => return Err(build_mismatch(dt, other)),
                    }
                }
                Ok(Arc::new(b.finish()))
            }
            DataType::Date32 => {
                let days = values
                    .iter()
                    .map(|v| match v {
                        ScalarValue::Date32(d) => Ok(Some(*d)),
                        ScalarValue::Null => Ok(None),
                        other => Err(build_mismatch(dt, other)),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Arc::new(Date32Array::from(days)))
            }
            DataType::Timestamp(unit, tz) => {
                let ticks = values
                    .iter()
                    .map(|v| match v {
                        ScalarValue::Timestamp(t, u) if u == unit => Ok(Some(*t)),
                        ScalarValue::Null => Ok(None),
                        other => Err(build_mismatch(dt, other)),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let tz = tz.clone();
                Ok(match unit {
                    TimeUnit::Second => {
                        Arc::new(TimestampSecondArray::from(ticks).with_timezone_opt(tz))
                    }
                    TimeUnit::Millisecond => {
                        Arc::new(TimestampMillisecondArray::from(ticks).with_timezone_opt(tz))
                    }
                    TimeUnit::Microsecond => {
                        Arc::new(TimestampMicrosecondArray::from(ticks).with_timezone_opt(tz))
                    }
                    TimeUnit::Nanosecond => {
                        Arc::new(TimestampNanosecondArray::from(ticks).with_timezone_opt(tz))
                    }
                })
            }
            DataType::Decimal128(precision, scale) => {
                let raw = values
                    .iter()
                    .map(|v| match v {
                        ScalarValue::Decimal128 { value, scale: s, .. } if s == scale => {
                            Ok(Some(*value))
                        }
                        ScalarValue::Null => Ok(None),
                        other => Err(build_mismatch(dt, other)),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let arr = Decimal128Array::from(raw)
                    .with_precision_and_scale(*precision, *scale)
                    .map_err(|e| QuarryError::Execution(format!("decimal column: {e}")))?;
                Ok(Arc::new(arr))
            }
            other => Err(QuarryError::Unsupported(format!(
                "output type not supported: {other:?}"
            ))),
        }
    }
}

fn build_mismatch(dt: &DataType, v: &ScalarValue) -> QuarryError {
    QuarryError::TypeMismatch(format!("cannot append {v:?} to {dt:?} column"))
}

fn downcast<T: 'static>(array: &ArrayRef) -> Result<&T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        QuarryError::Execution(format!(
            "array of type {:?} failed to downcast",
            array.data_type()
        ))
    })
}

impl ScalarValue {
    fn rank(&self) -> u8 {
        match self {
            ScalarValue::Null => 0,
            ScalarValue::Boolean(_) => 1,
            ScalarValue::Int64(_) => 2,
            ScalarValue::Float64Bits(_) => 3,
            ScalarValue::Utf8(_) => 4,
            ScalarValue::Date32(_) => 5,
            ScalarValue::Timestamp(..) => 6,
            ScalarValue::Decimal128 { .. } => 7,
        }
    }
}

impl PartialOrd for ScalarValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order: NULL first, then by variant, then by value. Floats use
/// IEEE total ordering.
impl Ord for ScalarValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ScalarValue::Boolean(a), ScalarValue::Boolean(b)) => a.cmp(b),
            (ScalarValue::Int64(a), ScalarValue::Int64(b)) => a.cmp(b),
            (ScalarValue::Float64Bits(a), ScalarValue::Float64Bits(b)) => {
                f64::from_bits(*a).total_cmp(&f64::from_bits(*b))
            }
            (ScalarValue::Utf8(a), ScalarValue::Utf8(b)) => a.cmp(b),
            (ScalarValue::Date32(a), ScalarValue::Date32(b)) => a.cmp(b),
            (ScalarValue::Timestamp(a, ua), ScalarValue::Timestamp(b, ub)) => {
                ua.cmp(ub).then(a.cmp(b))
            }
            (
                ScalarValue::Decimal128 { value: a, scale: sa, .. },
                ScalarValue::Decimal128 { value: b, scale: sb, .. },
            ) => sa.cmp(sb).then(a.cmp(b)),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Stable hash of a composite key, identical on every worker.
pub fn hash_key(key: &[ScalarValue]) -> u64 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    h.finish()
}

/// Row position as a `take` index.
pub fn take_index(row: usize) -> Result<u32> {
    u32::try_from(row).map_err(|_| {
        QuarryError::Execution(format!("row index {row} exceeds the u32 take range"))
    })
}

/// Read the key tuple at `row` from `columns`.
pub fn key_at(columns: &[ArrayRef], row: usize) -> Result<Vec<ScalarValue>> {
    columns
        .iter()
        .map(|c| ScalarValue::try_from_array(c, row))
        .collect()
}
