//! Execution-layer primitives used by runtimes and physical operators.
//!
//! Architecture role:
//! - task/query contexts carrying memory limits and the cancellation flag
//! - execution node contracts and the pull-based operator set
//! - expression compilation/evaluation
//! - batch stream abstractions, channels and columnar memory helpers
//!
//! Key modules:
//! - [`context`]
//! - [`exec_node`]
//! - [`executor`]
//! - [`expressions`]
//! - [`operators`]
//! - [`stream`]

pub mod columnar;
pub mod context;
pub mod exec_node;
pub mod executor;
pub mod expressions;
pub mod operators;
pub mod repartition;
pub mod scalar;
pub mod stream;

// Re-export only what callers need at the crate root (no globs).
pub use columnar::{BatchBuffer, ColumnAllocator, TrackedBatch, estimate_column_bytes};
pub use context::{ExecutionContext, ResourceLimits, SharedTaskContext, TaskContext};
pub use exec_node::{ExecNode, MonitoredExec};
pub use executor::{
    ExecEnv, StageInputData, TableSource, create_exec_node, execute_partition, execute_plan,
};
pub use expressions::{PhysicalExpr, compile_expr};
pub use repartition::Partitioner;
pub use scalar::ScalarValue;
pub use stream::{
    OperatorStats, RecordBatchStream, SendableRecordBatchStream, StreamAdapter, collect,
    memory_stream,
};
