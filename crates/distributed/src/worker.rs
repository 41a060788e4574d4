//! Worker runtime and task execution loop.
//!
//! Responsibilities:
//! - pull task attempts from the coordinator (`get_task`);
//! - wait for shuffled stage inputs in the local partition spool;
//! - execute stage fragments with the local pull-based executor;
//! - ship shuffle outputs through the exchange for producer stages;
//! - publish final query results for the result stage;
//! - report task state transitions and heartbeat, applying cancel/release
//!   instructions carried by the heartbeat response.
//!
//! Retry/attempt semantics:
//! - each assignment carries an explicit `attempt`;
//! - exchange frames carry `(producer_task, attempt, seq)`; receivers drop
//!   resends within one attempt and discard a superseded attempt's frames
//!   once the retry's first frame lands, so a retry that slices its output
//!   differently never mixes with what the failed attempt already sent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use futures::StreamExt;
use quarry_common::{BufferPool, EngineConfig, QuarryError, QueryId, Result, WorkerId};
use quarry_exchange::{
    ExchangeConfig, ExchangeSender, FrameTransport, PartitionSpool, SpoolKey, WorkerInbox,
};
use quarry_execution::{
    ExecEnv, ExecutionContext, ResourceLimits, StageInputData, TableSource, TaskContext,
    collect, create_exec_node,
};
use quarry_planner::PhysicalPlan;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::coordinator::{
    Coordinator, HeartbeatAck, TaskAssignment, TaskFailure, TaskOutput, TaskState,
};
use crate::stage::StageInputRef;

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Worker resource/configuration controls.
pub struct WorkerConfig {
    /// Stable worker id used in scheduling, heartbeats and partition maps.
    pub worker_id: WorkerId,
    /// Max concurrent task executions.
    pub cpu_slots: usize,
    /// Buffer pool ceiling shared by all queries on this worker.
    pub engine_memory_budget_bytes: usize,
    /// Per-query limit drawn from the pool.
    pub query_mem_limit_bytes: usize,
    /// Base execution batch size used when pressure is normal.
    pub batch_size_rows: usize,
    /// Batch size floor under memory pressure.
    pub min_batch_size_rows: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::new("worker-1"),
            cpu_slots: 2,
            engine_memory_budget_bytes: 512 * 1024 * 1024,
            query_mem_limit_bytes: 256 * 1024 * 1024,
            batch_size_rows: 8192,
            min_batch_size_rows: 256,
        }
    }
}

impl WorkerConfig {
    /// Worker sized by the engine-wide memory and batch settings.
    pub fn from_engine(worker_id: WorkerId, cpu_slots: usize, engine: &EngineConfig) -> Self {
        Self {
            worker_id,
            cpu_slots,
            engine_memory_budget_bytes: engine.mem_budget_bytes,
            query_mem_limit_bytes: engine.query_mem_limit_bytes,
            batch_size_rows: engine.batch_size_rows,
            min_batch_size_rows: engine.min_batch_size_rows,
        }
    }
}

#[derive(Debug, Clone)]
/// Task execution outputs returned by [`TaskExecutor`].
pub struct TaskExecutionResult {
    /// Output schema of the fragment.
    pub schema: SchemaRef,
    /// Output batches emitted by the result stage.
    pub output_batches: Vec<RecordBatch>,
    /// Whether result batches should be published to the coordinator.
    pub publish_results: bool,
    /// Human-readable completion message.
    pub message: String,
}

#[async_trait]
/// Control-plane contract used by worker runtime.
pub trait WorkerControlPlane: Send + Sync {
    /// Pull up to `capacity` task assignments for `worker_id`.
    async fn get_task(&self, worker_id: &WorkerId, capacity: u32) -> Result<Vec<TaskAssignment>>;
    /// Report a task state transition and status message.
    async fn report_task_status(
        &self,
        worker_id: &WorkerId,
        assignment: &TaskAssignment,
        state: TaskState,
        failure: Option<TaskFailure>,
        message: String,
    ) -> Result<()>;
    /// Publish one result-stage task's payload for client fetching.
    async fn register_query_results(
        &self,
        assignment: &TaskAssignment,
        ipc_payload: Vec<u8>,
    ) -> Result<()>;
    /// Report liveness and learn which queries to cancel or release.
    async fn heartbeat(&self, worker_id: &WorkerId, running_tasks: u32) -> Result<HeartbeatAck>;
}

#[async_trait]
/// Source of shuffled stage inputs for consumer tasks.
pub trait ExchangeInput: Send + Sync {
    /// Wait for every producer of `input` to finish `partition`, then return
    /// its batches.
    async fn read_stage_partition(
        &self,
        ctx: &TaskContext,
        input: &StageInputRef,
        partition: usize,
    ) -> Result<StageInputData>;
}

#[async_trait]
/// Task execution contract for worker-assigned plan fragments.
pub trait TaskExecutor: Send + Sync {
    /// Execute one task assignment and return its outputs.
    async fn execute(
        &self,
        assignment: &TaskAssignment,
        ctx: Arc<TaskContext>,
    ) -> Result<TaskExecutionResult>;
}

/// [`ExchangeInput`] backed by this worker's [`PartitionSpool`].
pub struct SpoolInput {
    spool: Arc<PartitionSpool>,
    timeout: Duration,
}

impl SpoolInput {
    pub fn new(spool: Arc<PartitionSpool>, timeout: Duration) -> Self {
        Self { spool, timeout }
    }
}

#[async_trait]
impl ExchangeInput for SpoolInput {
    async fn read_stage_partition(
        &self,
        ctx: &TaskContext,
        input: &StageInputRef,
        partition: usize,
    ) -> Result<StageInputData> {
        let key = SpoolKey::new(ctx.query.query_id(), input.stage_id, partition);
        let (schema, batches) = self
            .spool
            .wait_partition(key, input.producers, self.timeout, &ctx.query)
            .await?;
        Ok(StageInputData {
            schema,
            batches: Arc::new(batches),
        })
    }
}

/// Everything a task executor needs on one worker.
#[derive(Clone)]
pub struct WorkerResources {
    pub worker_id: WorkerId,
    pub tables: Arc<dyn TableSource>,
    pub transport: Arc<dyn FrameTransport>,
    pub input: Arc<dyn ExchangeInput>,
    pub exchange: ExchangeConfig,
}

/// Default task executor that evaluates physical plan fragments in-process.
pub struct DefaultTaskExecutor {
    resources: WorkerResources,
}

impl std::fmt::Debug for DefaultTaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultTaskExecutor")
            .field("worker_id", &self.resources.worker_id)
            .finish()
    }
}

impl DefaultTaskExecutor {
    pub fn new(resources: WorkerResources) -> Self {
        Self { resources }
    }

    async fn build_env(&self, assignment: &TaskAssignment, ctx: &TaskContext) -> Result<ExecEnv> {
        let mut env = ExecEnv::new(Arc::clone(&self.resources.tables));
        for input in &assignment.inputs {
            let data = self
                .resources
                .input
                .read_stage_partition(ctx, input, ctx.partition)
                .await?;
            debug!(
                query_id = %assignment.query_id,
                stage_id = assignment.stage_id,
                input_stage = input.stage_id,
                partition = ctx.partition,
                batches = data.batches.len(),
                "stage input ready"
            );
            env = env.with_stage_input(input.stage_id, data);
        }
        Ok(env)
    }
}

#[async_trait]
impl TaskExecutor for DefaultTaskExecutor {
    async fn execute(
        &self,
        assignment: &TaskAssignment,
        ctx: Arc<TaskContext>,
    ) -> Result<TaskExecutionResult> {
        let plan: PhysicalPlan = serde_json::from_slice(&assignment.plan_fragment_json)
            .map_err(|e| QuarryError::Planning(format!("invalid plan fragment: {e}")))?;
        let env = self.build_env(assignment, &ctx).await?;
        let node = create_exec_node(&plan, ctx.partition, &env)?;
        let schema = node.schema();
        let mut stream = node.execute(Arc::clone(&ctx))?;

        match &assignment.output {
            TaskOutput::Shuffle {
                partitioning,
                partition_map,
            } => {
                let mut sender = ExchangeSender::try_new(
                    Arc::clone(&self.resources.transport),
                    Arc::clone(partition_map),
                    partitioning,
                    Arc::clone(&schema),
                    assignment.task_id,
                    assignment.attempt,
                    self.resources.exchange.clone(),
                )?;
                while let Some(batch) = stream.next().await {
                    let batch = batch?;
                    ctx.query.check_cancelled()?;
                    sender.send_batch(&batch).await?;
                }
                let summary = sender.finish().await?;
                let frames: u64 = summary.batches_per_partition.iter().sum();
                Ok(TaskExecutionResult {
                    schema,
                    output_batches: Vec::new(),
                    publish_results: false,
                    message: format!(
                        "shuffled {frames} batches ({} bytes) to {} partitions",
                        summary.bytes_sent,
                        summary.batches_per_partition.len()
                    ),
                })
            }
            TaskOutput::Result => {
                let batches = collect(stream).await?;
                let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
                Ok(TaskExecutionResult {
                    schema,
                    output_batches: batches,
                    publish_results: true,
                    message: format!("produced {rows} result rows"),
                })
            }
        }
    }
}

/// Worker runtime that orchestrates pull scheduling and task execution.
pub struct Worker<C, E>
where
    C: WorkerControlPlane + 'static,
    E: TaskExecutor + ?Sized + 'static,
{
    config: WorkerConfig,
    control_plane: Arc<C>,
    task_executor: Arc<E>,
    cpu_slots: Arc<Semaphore>,
    pool: Arc<BufferPool>,
    spool: Arc<PartitionSpool>,
    queries: Arc<Mutex<HashMap<QueryId, Arc<ExecutionContext>>>>,
}

impl<C, E> Clone for Worker<C, E>
where
    C: WorkerControlPlane + 'static,
    E: TaskExecutor + ?Sized + 'static,
{
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            control_plane: Arc::clone(&self.control_plane),
            task_executor: Arc::clone(&self.task_executor),
            cpu_slots: Arc::clone(&self.cpu_slots),
            pool: Arc::clone(&self.pool),
            spool: Arc::clone(&self.spool),
            queries: Arc::clone(&self.queries),
        }
    }
}

impl<C, E> Worker<C, E>
where
    C: WorkerControlPlane + 'static,
    E: TaskExecutor + ?Sized + 'static,
{
    /// Build worker runtime. `pool` and `spool` must be the ones this
    /// worker's inbox pump feeds.
    pub fn new(
        config: WorkerConfig,
        control_plane: Arc<C>,
        task_executor: Arc<E>,
        pool: Arc<BufferPool>,
        spool: Arc<PartitionSpool>,
    ) -> Self {
        let slots = config.cpu_slots.max(1);
        Self {
            config,
            control_plane,
            task_executor,
            cpu_slots: Arc::new(Semaphore::new(slots)),
            pool,
            spool,
            queries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    fn running_tasks(&self) -> u32 {
        self.config
            .cpu_slots
            .max(1)
            .saturating_sub(self.cpu_slots.available_permits()) as u32
    }

    /// Send a heartbeat and apply the instructions it returns.
    pub async fn heartbeat(&self) -> Result<()> {
        let ack = self
            .control_plane
            .heartbeat(&self.config.worker_id, self.running_tasks())
            .await?;
        self.apply_ack(ack);
        Ok(())
    }

    fn apply_ack(&self, ack: HeartbeatAck) {
        let mut queries = lock(&self.queries);
        for query_id in ack.cancel {
            if let Some(ctx) = queries.get(&query_id) {
                info!(
                    worker_id = %self.config.worker_id,
                    query_id = %query_id,
                    "cancelling running tasks"
                );
                ctx.cancel();
            }
        }
        for query_id in ack.release {
            queries.remove(&query_id);
            self.spool.release_query(query_id);
        }
    }

    fn query_context(&self, query_id: QueryId) -> Arc<ExecutionContext> {
        let mut queries = lock(&self.queries);
        Arc::clone(queries.entry(query_id).or_insert_with(|| {
            ExecutionContext::new(
                query_id,
                ResourceLimits {
                    mem_limit_bytes: self.config.query_mem_limit_bytes,
                    batch_size_rows: self.config.batch_size_rows,
                },
                &self.pool,
            )
        }))
    }

    /// Perform one poll cycle:
    /// - heartbeat and apply cancel/release instructions
    /// - pull assignments up to the free CPU slots
    /// - spawn each task; it reports its own status and results
    pub async fn poll_once(&self) -> Result<usize> {
        self.heartbeat().await?;
        let capacity = self.cpu_slots.available_permits() as u32;
        if capacity == 0 {
            return Ok(0);
        }
        let tasks = self
            .control_plane
            .get_task(&self.config.worker_id, capacity)
            .await?;
        let task_count = tasks.len();

        for assignment in tasks {
            debug!(
                worker_id = %self.config.worker_id,
                query_id = %assignment.query_id,
                stage_id = assignment.stage_id,
                task_id = assignment.task_id,
                attempt = assignment.attempt,
                "worker picked task assignment"
            );
            let permit = Arc::clone(&self.cpu_slots)
                .acquire_owned()
                .await
                .map_err(|e| QuarryError::Execution(format!("failed to acquire cpu slot: {e}")))?;
            let task_ctx = Arc::new(TaskContext {
                query: self.query_context(assignment.query_id),
                stage_id: assignment.stage_id,
                task_id: assignment.task_id,
                partition: assignment.partition(),
                attempt: assignment.attempt,
            });
            let worker_id = self.config.worker_id.clone();
            let control_plane = Arc::clone(&self.control_plane);
            let task_executor = Arc::clone(&self.task_executor);
            tokio::spawn(async move {
                let _permit = permit;
                run_task(worker_id, control_plane, task_executor, assignment, task_ctx).await;
            });
        }
        Ok(task_count)
    }

    /// Poll until `shutdown` flips to `true`, then cancel and drain running
    /// tasks.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>, poll_interval: Duration) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.poll_once().await {
                warn!(
                    worker_id = %self.config.worker_id,
                    error = %e,
                    "worker poll failed"
                );
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
        self.drain().await;
    }

    async fn drain(&self) {
        for ctx in lock(&self.queries).values() {
            ctx.cancel();
        }
        let slots = self.config.cpu_slots.max(1) as u32;
        if let Ok(all) = self.cpu_slots.acquire_many(slots).await {
            drop(all);
        }
        info!(worker_id = %self.config.worker_id, "worker stopped");
    }
}

async fn run_task<C, E>(
    worker_id: WorkerId,
    control_plane: Arc<C>,
    task_executor: Arc<E>,
    assignment: TaskAssignment,
    ctx: Arc<TaskContext>,
) where
    C: WorkerControlPlane + ?Sized,
    E: TaskExecutor + ?Sized,
{
    if let Err(e) = control_plane
        .report_task_status(
            &worker_id,
            &assignment,
            TaskState::Running,
            None,
            "running".to_string(),
        )
        .await
    {
        warn!(worker_id = %worker_id, error = %e, "failed to report running state");
    }

    let outcome = match task_executor.execute(&assignment, Arc::clone(&ctx)).await {
        Ok(result) => publish(&*control_plane, &assignment, result).await,
        Err(e) => Err(e),
    };
    let report = match outcome {
        Ok(message) => {
            info!(
                worker_id = %worker_id,
                query_id = %assignment.query_id,
                stage_id = assignment.stage_id,
                task_id = assignment.task_id,
                attempt = assignment.attempt,
                "task execution succeeded"
            );
            control_plane
                .report_task_status(&worker_id, &assignment, TaskState::Succeeded, None, message)
                .await
        }
        Err(e) => {
            let msg = e.to_string();
            error!(
                worker_id = %worker_id,
                query_id = %assignment.query_id,
                stage_id = assignment.stage_id,
                task_id = assignment.task_id,
                attempt = assignment.attempt,
                error = %msg,
                "task execution failed"
            );
            control_plane
                .report_task_status(
                    &worker_id,
                    &assignment,
                    TaskState::Failed,
                    Some(TaskFailure::from_error(&e)),
                    msg,
                )
                .await
        }
    };
    if let Err(e) = report {
        warn!(worker_id = %worker_id, error = %e, "failed to report task outcome");
    }
}

async fn publish<C>(
    control_plane: &C,
    assignment: &TaskAssignment,
    result: TaskExecutionResult,
) -> Result<String>
where
    C: WorkerControlPlane + ?Sized,
{
    if result.publish_results {
        let payload = encode_record_batches_ipc(&result.schema, &result.output_batches)?;
        control_plane
            .register_query_results(assignment, payload)
            .await?;
    }
    Ok(result.message)
}

/// Move frames from `inbox` into `spool` until the hub drops the worker.
pub fn spawn_inbox_pump(mut inbox: WorkerInbox, spool: Arc<PartitionSpool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = inbox.recv().await {
            let result = frame.and_then(|frame| spool.ingest(frame));
            if let Err(e) = result {
                warn!(
                    worker_id = %inbox.worker(),
                    error = %e,
                    "dropping exchange frame"
                );
            }
        }
        debug!(worker_id = %inbox.worker(), "inbox closed");
    })
}

#[derive(Clone)]
/// In-process control-plane adapter for embedded clusters and tests.
pub struct InProcessControlPlane {
    coordinator: Arc<tokio::sync::Mutex<Coordinator>>,
}

impl InProcessControlPlane {
    pub fn new(coordinator: Arc<tokio::sync::Mutex<Coordinator>>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl WorkerControlPlane for InProcessControlPlane {
    async fn get_task(&self, worker_id: &WorkerId, capacity: u32) -> Result<Vec<TaskAssignment>> {
        let mut c = self.coordinator.lock().await;
        c.get_task(worker_id, capacity)
    }

    async fn report_task_status(
        &self,
        worker_id: &WorkerId,
        assignment: &TaskAssignment,
        state: TaskState,
        failure: Option<TaskFailure>,
        message: String,
    ) -> Result<()> {
        let mut c = self.coordinator.lock().await;
        c.report_task_status(
            assignment.query_id,
            assignment.stage_id,
            assignment.task_id,
            assignment.attempt,
            state,
            Some(worker_id),
            failure,
            message,
        )
    }

    async fn register_query_results(
        &self,
        assignment: &TaskAssignment,
        ipc_payload: Vec<u8>,
    ) -> Result<()> {
        let mut c = self.coordinator.lock().await;
        c.register_query_results(
            assignment.query_id,
            assignment.stage_id,
            assignment.task_id,
            assignment.attempt,
            ipc_payload,
        )
    }

    async fn heartbeat(&self, worker_id: &WorkerId, running_tasks: u32) -> Result<HeartbeatAck> {
        let mut c = self.coordinator.lock().await;
        c.heartbeat(worker_id, running_tasks)
    }
}

/// Encode record batches as Arrow IPC stream bytes. The schema is always
/// written, so an empty result still decodes with its columns.
pub fn encode_record_batches_ipc(schema: &SchemaRef, batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let mut out = Vec::<u8>::new();
    {
        let mut writer = arrow::ipc::writer::StreamWriter::try_new(&mut out, schema.as_ref())
            .map_err(|e| QuarryError::Execution(format!("ipc writer init failed: {e}")))?;
        for batch in batches {
            writer
                .write(batch)
                .map_err(|e| QuarryError::Execution(format!("ipc write failed: {e}")))?;
        }
        writer
            .finish()
            .map_err(|e| QuarryError::Execution(format!("ipc finish failed: {e}")))?;
    }
    Ok(out)
}

/// Decode an Arrow IPC stream produced by [`encode_record_batches_ipc`].
pub fn decode_record_batches_ipc(payload: &[u8]) -> Result<(SchemaRef, Vec<RecordBatch>)> {
    let reader = arrow::ipc::reader::StreamReader::try_new(std::io::Cursor::new(payload), None)
        .map_err(|e| QuarryError::Execution(format!("ipc reader init failed: {e}")))?;
    let schema = reader.schema();
    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| QuarryError::Execution(format!("ipc decode failed: {e}")))?;
    Ok((schema, batches))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
