//! Distributed query scheduling for Quarry.
//!
//! Architecture role:
//! - [`stage`] cuts physical plans into a stage DAG at shuffle boundaries
//! - [`coordinator`] owns query/task state, retries and worker liveness
//! - [`worker`] pulls tasks, executes fragments and ships shuffle output
//! - [`runtime`] wires a coordinator, an exchange hub and in-process workers
//!   into an embedded cluster
//!
//! Workers reach the coordinator only through
//! [`worker::WorkerControlPlane`]; data moves between workers only through the
//! exchange layer.

pub mod coordinator;
pub mod runtime;
pub mod stage;
pub mod worker;

pub use coordinator::{
    Coordinator, CoordinatorConfig, HeartbeatAck, QueryState, QueryStatus, StageMetrics,
    TaskAssignment, TaskFailure, TaskOutput, TaskState,
};
pub use runtime::{LocalCluster, LocalClusterConfig};
pub use stage::{StageDag, StageInputRef, StageNode, StageOutput, build_stage_dag};
pub use worker::{
    DefaultTaskExecutor, ExchangeInput, InProcessControlPlane, SpoolInput, TaskExecutionResult,
    TaskExecutor, Worker, WorkerConfig, WorkerControlPlane, WorkerResources,
};
