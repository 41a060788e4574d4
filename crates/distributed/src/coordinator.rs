//! Coordinator state machine and scheduling logic.
//!
//! Responsibilities:
//! - decode submitted physical plans and cut stage DAGs;
//! - assign one partition descriptor per shuffled partition to a live worker;
//! - materialize task attempts and serve pull-based task assignment;
//! - track query/task status transitions and aggregate stage metrics;
//! - enforce bounded retries, worker blacklisting and liveness.
//!
//! Query lifecycle: `Planning -> Distributing -> Running ->
//! Completed | Failed | Cancelled`.
//!
//! Retry semantics:
//! - attempts are explicit in task keys and status reports;
//! - reports from an attempt older than the latest one are ignored;
//! - tasks reading shuffled input are pinned to the worker that receives
//!   their partition, so their retries stay on that worker.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use quarry_common::metrics::global_metrics;
use quarry_common::{QuarryError, QueryId, Result, WorkerId};
use quarry_exchange::PartitionMap;
use quarry_planner::{PartitioningSpec, PhysicalPlan};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::stage::{StageInputRef, StageOutput, build_stage_dag};

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Coordinator behavior/configuration knobs.
pub struct CoordinatorConfig {
    /// Consecutive retryable task failures before a worker is blacklisted.
    pub blacklist_failure_threshold: u32,
    /// Max running tasks a worker may own at once.
    pub max_concurrent_tasks_per_worker: u32,
    /// Max running tasks per query across all workers.
    pub max_concurrent_tasks_per_query: u32,
    /// Max attempts before a task, and with it the query, fails.
    pub max_task_attempts: u32,
    /// Base retry backoff in milliseconds, doubled per attempt.
    pub retry_backoff_base_ms: u64,
    /// Silence after which a worker is treated as unreachable. `0` disables.
    pub worker_liveness_timeout_ms: u64,
    /// How long a finished query stays queryable. It is evicted after this
    /// once every live worker was told to release it.
    pub terminal_query_ttl_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            blacklist_failure_threshold: 3,
            max_concurrent_tasks_per_worker: 8,
            max_concurrent_tasks_per_query: 32,
            max_task_attempts: 3,
            retry_backoff_base_ms: 250,
            worker_liveness_timeout_ms: 15_000,
            terminal_query_ttl_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Query lifecycle states tracked by the coordinator.
pub enum QueryState {
    /// Plan is being decoded and cut into stages.
    Planning,
    /// Partition descriptors are being assigned to workers.
    Distributing,
    /// Tasks are being scheduled.
    Running,
    /// Every task succeeded; results are fetchable.
    Completed,
    /// A task failed terminally.
    Failed,
    /// Cancelled by the client.
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Task lifecycle states tracked by the coordinator.
pub enum TaskState {
    /// Task is pending scheduling.
    Queued,
    /// Task is currently executing.
    Running,
    /// Task completed successfully.
    Succeeded,
    /// Task execution failed.
    Failed,
}

/// Why a task attempt, or a whole query, failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskFailure {
    /// Worker or transport trouble; the attempt may be retried.
    Transient(String),
    OutOfMemory {
        requested: usize,
        available: usize,
        scope: String,
    },
    TypeMismatch(String),
    Planning(String),
    Cancelled(String),
    /// A worker holding data the query needs is gone.
    Unreachable(String),
    /// Retries exhausted.
    Exhausted(String),
    Fatal(String),
}

impl TaskFailure {
    pub fn from_error(err: &QuarryError) -> Self {
        match err {
            e if e.is_retryable() => Self::Transient(e.to_string()),
            QuarryError::OutOfMemory {
                requested,
                available,
                scope,
            } => Self::OutOfMemory {
                requested: *requested,
                available: *available,
                scope: scope.clone(),
            },
            QuarryError::TypeMismatch(m) => Self::TypeMismatch(m.clone()),
            QuarryError::Planning(m) => Self::Planning(m.clone()),
            QuarryError::Cancelled(m) => Self::Cancelled(m.clone()),
            QuarryError::QueryFailed(m) => Self::Exhausted(m.clone()),
            other => Self::Fatal(other.to_string()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Error handed back to the client.
    pub fn into_error(self) -> QuarryError {
        match self {
            Self::Transient(m) => QuarryError::TaskFailed(m),
            Self::OutOfMemory {
                requested,
                available,
                scope,
            } => QuarryError::OutOfMemory {
                requested,
                available,
                scope,
            },
            Self::TypeMismatch(m) => QuarryError::TypeMismatch(m),
            Self::Planning(m) => QuarryError::Planning(m),
            Self::Cancelled(m) => QuarryError::Cancelled(m),
            Self::Unreachable(m) => QuarryError::WorkerUnreachable(m),
            Self::Exhausted(m) => QuarryError::QueryFailed(m),
            Self::Fatal(m) => QuarryError::Execution(m),
        }
    }

    pub fn message(&self) -> String {
        self.clone().into_error().to_string()
    }
}

/// Where a task's output goes.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    /// Partition and send to the workers named by `partition_map`.
    Shuffle {
        partitioning: PartitioningSpec,
        partition_map: Arc<PartitionMap>,
    },
    /// Publish result batches to the coordinator.
    Result,
}

#[derive(Debug, Clone)]
/// One schedulable task assignment returned to workers.
pub struct TaskAssignment {
    pub query_id: QueryId,
    /// Stage identifier within query DAG.
    pub stage_id: u64,
    /// Task identifier within stage; equal to the partition it computes.
    pub task_id: u64,
    /// Attempt number for retries, starting at 1.
    pub attempt: u32,
    /// Serialized physical-plan fragment for this stage.
    pub plan_fragment_json: Vec<u8>,
    /// Shuffled inputs the fragment reads through `StageInput` leaves.
    pub inputs: Vec<StageInputRef>,
    pub output: TaskOutput,
}

impl TaskAssignment {
    pub fn partition(&self) -> usize {
        self.task_id as usize
    }
}

/// Instructions piggybacked on a heartbeat response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatAck {
    /// Queries whose running tasks must stop.
    pub cancel: Vec<QueryId>,
    /// Queries whose contexts and spooled data can be dropped.
    pub release: Vec<QueryId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Aggregated per-stage progress.
pub struct StageMetrics {
    pub queued_tasks: u32,
    pub running_tasks: u32,
    pub succeeded_tasks: u32,
    pub failed_tasks: u32,
    /// Attempts scheduled beyond the first.
    pub retries: u32,
}

#[derive(Debug, Clone)]
/// Public query status snapshot returned by control-plane APIs.
pub struct QueryStatus {
    pub query_id: QueryId,
    pub state: QueryState,
    /// Every state the query went through, in order.
    pub transitions: Vec<QueryState>,
    /// Submission timestamp in unix milliseconds.
    pub submitted_at_ms: u64,
    /// First task assignment timestamp, or 0 if not started.
    pub started_at_ms: u64,
    /// Finish timestamp in unix milliseconds, or 0 if unfinished.
    pub finished_at_ms: u64,
    pub message: String,
    /// Set once the query failed or was cancelled.
    pub failure: Option<TaskFailure>,
    /// Total number of task attempts tracked for the query.
    pub total_tasks: u32,
    pub queued_tasks: u32,
    pub running_tasks: u32,
    pub succeeded_tasks: u32,
    pub failed_tasks: u32,
    /// Per-stage metrics keyed by stage id.
    pub stage_metrics: HashMap<u64, StageMetrics>,
}

#[derive(Debug, Clone)]
struct StageRuntime {
    parents: Vec<u64>,
    fragment: Vec<u8>,
    inputs: Vec<StageInputRef>,
    output: TaskOutput,
    metrics: StageMetrics,
}

#[derive(Debug, Clone)]
struct TaskRuntime {
    stage_id: u64,
    task_id: u64,
    attempt: u32,
    state: TaskState,
    assigned_worker: Option<WorkerId>,
    pinned_worker: Option<WorkerId>,
    ready_at_ms: u64,
    message: String,
}

#[derive(Debug, Clone, Default)]
struct WorkerHeartbeat {
    last_seen_ms: u64,
}

#[derive(Debug, Clone)]
struct QueryRuntime {
    state: QueryState,
    transitions: Vec<QueryState>,
    submitted_at_ms: u64,
    started_at_ms: u64,
    finished_at_ms: u64,
    message: String,
    failure: Option<TaskFailure>,
    result_stage: u64,
    stages: BTreeMap<u64, StageRuntime>,
    tasks: BTreeMap<(u64, u64, u32), TaskRuntime>,
    results: BTreeMap<u64, Vec<u8>>,
}

impl QueryRuntime {
    fn new(now: u64) -> Self {
        Self {
            state: QueryState::Planning,
            transitions: vec![QueryState::Planning],
            submitted_at_ms: now,
            started_at_ms: 0,
            finished_at_ms: 0,
            message: String::new(),
            failure: None,
            result_stage: 0,
            stages: BTreeMap::new(),
            tasks: BTreeMap::new(),
            results: BTreeMap::new(),
        }
    }

    fn transition(&mut self, query_id: QueryId, next: QueryState, now: u64) {
        if self.state == next {
            return;
        }
        debug!(
            query_id = %query_id,
            from = ?self.state,
            to = ?next,
            operator = "CoordinatorQueryState",
            "query state transition"
        );
        self.state = next;
        self.transitions.push(next);
        if next.is_terminal() {
            self.finished_at_ms = now;
        }
    }

    fn fail(&mut self, query_id: QueryId, failure: TaskFailure, now: u64) {
        if self.state.is_terminal() {
            return;
        }
        self.message = failure.message();
        warn!(
            query_id = %query_id,
            error = %self.message,
            operator = "CoordinatorQueryState",
            "query failed"
        );
        self.failure = Some(failure);
        self.transition(query_id, QueryState::Failed, now);
    }
}

#[derive(Debug, Default)]
/// In-memory coordinator runtime for query/task orchestration.
pub struct Coordinator {
    config: CoordinatorConfig,
    queries: BTreeMap<QueryId, QueryRuntime>,
    blacklisted_workers: HashSet<WorkerId>,
    worker_failures: HashMap<WorkerId, u32>,
    worker_heartbeats: HashMap<WorkerId, WorkerHeartbeat>,
    acked_terminal: HashSet<(WorkerId, QueryId)>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn running_tasks_for_worker(&self, worker_id: &WorkerId) -> u32 {
        self.queries
            .values()
            .flat_map(|q| q.tasks.values())
            .filter(|t| t.state == TaskState::Running && t.assigned_worker.as_ref() == Some(worker_id))
            .count() as u32
    }

    fn touch_worker(&mut self, worker_id: &WorkerId, now: u64) {
        self.worker_heartbeats
            .entry(worker_id.clone())
            .and_modify(|hb| hb.last_seen_ms = now)
            .or_insert(WorkerHeartbeat { last_seen_ms: now });
    }

    fn is_live(&self, hb: &WorkerHeartbeat, now: u64) -> bool {
        self.config.worker_liveness_timeout_ms == 0
            || now.saturating_sub(hb.last_seen_ms) <= self.config.worker_liveness_timeout_ms
    }

    /// Workers heard from within the liveness window and not blacklisted,
    /// sorted by id.
    pub fn live_workers(&self) -> Result<Vec<WorkerId>> {
        let now = now_ms()?;
        Ok(self.live_workers_at(now))
    }

    fn live_workers_at(&self, now: u64) -> Vec<WorkerId> {
        let mut live = self
            .worker_heartbeats
            .iter()
            .filter(|(w, hb)| !self.blacklisted_workers.contains(*w) && self.is_live(hb, now))
            .map(|(w, _)| w.clone())
            .collect::<Vec<_>>();
        live.sort();
        live
    }

    fn requeue_stale_workers(&mut self, now: u64) -> Result<()> {
        if self.config.worker_liveness_timeout_ms == 0 {
            return Ok(());
        }
        let stale_workers = self
            .worker_heartbeats
            .iter()
            .filter(|(_, hb)| !self.is_live(hb, now))
            .map(|(w, _)| w.clone())
            .collect::<Vec<_>>();

        for worker in stale_workers {
            warn!(
                worker_id = %worker,
                operator = "CoordinatorRequeue",
                "worker considered stale; requeueing running tasks"
            );
            self.worker_heartbeats.remove(&worker);
            self.fail_queries_pinned_to(&worker, now);
            self.requeue_worker_tasks(&worker, now)?;
        }
        Ok(())
    }

    /// Fail every live query with unfinished work pinned to `worker`; the
    /// shuffled partitions it received are gone with it.
    fn fail_queries_pinned_to(&mut self, worker: &WorkerId, now: u64) {
        for (query_id, query) in self.queries.iter_mut() {
            if query.state.is_terminal() {
                continue;
            }
            let latest = latest_attempt_map(query);
            let pinned = query.tasks.values().any(|t| {
                latest.get(&(t.stage_id, t.task_id)) == Some(&t.attempt)
                    && t.state != TaskState::Succeeded
                    && t.pinned_worker.as_ref() == Some(worker)
            });
            if pinned {
                query.fail(
                    *query_id,
                    TaskFailure::Unreachable(format!(
                        "{worker} hosts shuffled partitions of unfinished tasks"
                    )),
                    now,
                );
            }
        }
    }

    fn requeue_worker_tasks(&mut self, worker_id: &WorkerId, now: u64) -> Result<()> {
        let max_attempts = self.config.max_task_attempts;
        let backoff_base = self.config.retry_backoff_base_ms;
        for (query_id, query) in self.queries.iter_mut() {
            if query.state != QueryState::Running {
                continue;
            }
            let latest = latest_attempt_map(query);
            let lost = query
                .tasks
                .values()
                .filter(|t| {
                    t.state == TaskState::Running
                        && t.assigned_worker.as_ref() == Some(worker_id)
                        && latest.get(&(t.stage_id, t.task_id)) == Some(&t.attempt)
                })
                .map(|t| (t.stage_id, t.task_id, t.attempt))
                .collect::<Vec<_>>();
            for key in lost {
                mark_task(query, key, TaskState::Failed, "worker lost heartbeat".to_string())?;
                schedule_retry(
                    *query_id,
                    query,
                    key,
                    TaskFailure::Transient(format!("{worker_id} lost heartbeat")),
                    max_attempts,
                    backoff_base,
                    now,
                )?;
            }
        }
        Ok(())
    }

    /// Submit a physical plan and initialize query runtime/task attempts.
    ///
    /// # Errors
    /// `Planning` for malformed plans or duplicate ids, `WorkerUnreachable`
    /// when no live worker can host the query. In the latter case the query
    /// is recorded as failed.
    pub fn submit_query(&mut self, query_id: QueryId, physical_plan_json: &[u8]) -> Result<QueryState> {
        if self.queries.contains_key(&query_id) {
            return Err(QuarryError::Planning(format!("query {query_id} already exists")));
        }
        let now = now_ms()?;
        let mut query = QueryRuntime::new(now);

        let plan: PhysicalPlan = serde_json::from_slice(physical_plan_json)
            .map_err(|e| QuarryError::Planning(format!("invalid physical plan json: {e}")))?;
        let dag = build_stage_dag(&plan)?;
        info!(
            query_id = %query_id,
            stages = dag.stages.len(),
            operator = "CoordinatorSubmit",
            "query submitted"
        );

        query.transition(query_id, QueryState::Distributing, now);
        let workers = self.live_workers_at(now);
        let mut maps = HashMap::<u64, Arc<PartitionMap>>::new();
        for node in &dag.stages {
            if let StageOutput::Shuffle(partitioning) = &node.output {
                match PartitionMap::assign(query_id, node.id.0, partitioning, &workers) {
                    Ok(map) => {
                        maps.insert(node.id.0, Arc::new(map));
                    }
                    Err(e) => {
                        query.fail(query_id, TaskFailure::from_error(&e), now);
                        self.queries.insert(query_id, query);
                        return Err(e);
                    }
                }
            }
        }

        for node in &dag.stages {
            let sid = node.id.0;
            let fragment = serde_json::to_vec(&node.plan)
                .map_err(|e| QuarryError::Planning(format!("encode stage fragment failed: {e}")))?;
            let output = match &node.output {
                StageOutput::Shuffle(partitioning) => TaskOutput::Shuffle {
                    partitioning: partitioning.clone(),
                    partition_map: maps.get(&sid).cloned().ok_or_else(|| {
                        QuarryError::Planning(format!("stage {sid} has no partition map"))
                    })?,
                },
                StageOutput::Result => TaskOutput::Result,
            };
            for task_id in 0..node.task_count {
                let pinned_worker = pinned_worker_for(&node.inputs, &maps, task_id)?;
                query.tasks.insert(
                    (sid, task_id as u64, 1),
                    TaskRuntime {
                        stage_id: sid,
                        task_id: task_id as u64,
                        attempt: 1,
                        state: TaskState::Queued,
                        assigned_worker: None,
                        pinned_worker,
                        ready_at_ms: now,
                        message: String::new(),
                    },
                );
            }
            let stage = StageRuntime {
                parents: node.parents.iter().map(|p| p.0).collect(),
                fragment,
                inputs: node.inputs.clone(),
                output,
                metrics: StageMetrics {
                    queued_tasks: node.task_count as u32,
                    ..StageMetrics::default()
                },
            };
            update_scheduler_metrics(query_id, sid, &stage.metrics);
            query.stages.insert(sid, stage);
        }
        query.result_stage = dag.root_id().map(|s| s.0).unwrap_or(0);
        query.transition(query_id, QueryState::Running, now);
        if query.tasks.is_empty() {
            query.transition(query_id, QueryState::Completed, now);
        }
        let state = query.state;
        self.queries.insert(query_id, query);
        Ok(state)
    }

    /// Worker pull-scheduling API.
    ///
    /// Returns up to `capacity` runnable task attempts for the requesting
    /// worker, skipping blacklisted workers. A stage is runnable once all its
    /// producer stages succeeded.
    pub fn get_task(&mut self, worker_id: &WorkerId, capacity: u32) -> Result<Vec<TaskAssignment>> {
        let now = now_ms()?;
        self.requeue_stale_workers(now)?;

        if self.blacklisted_workers.contains(worker_id) || capacity == 0 {
            debug!(
                worker_id = %worker_id,
                capacity,
                operator = "CoordinatorGetTask",
                "no tasks assigned (blacklisted or no capacity)"
            );
            return Ok(Vec::new());
        }
        self.touch_worker(worker_id, now);
        let running_for_worker = self.running_tasks_for_worker(worker_id);
        let worker_budget = self
            .config
            .max_concurrent_tasks_per_worker
            .saturating_sub(running_for_worker);
        let mut remaining = capacity.min(worker_budget);
        let mut out = Vec::new();
        if remaining == 0 {
            return Ok(out);
        }

        for (query_id, query) in self.queries.iter_mut() {
            if query.state != QueryState::Running {
                continue;
            }
            let latest_states = latest_task_states(query);
            let running_for_query = latest_states
                .values()
                .filter(|s| **s == TaskState::Running)
                .count() as u32;
            let mut query_budget = self
                .config
                .max_concurrent_tasks_per_query
                .saturating_sub(running_for_query);
            let latest_attempts = latest_attempt_map(query);

            for stage_id in runnable_stages(query, &latest_states) {
                let candidates = query
                    .tasks
                    .iter()
                    .filter(|(_, t)| {
                        t.stage_id == stage_id
                            && t.state == TaskState::Queued
                            && t.ready_at_ms <= now
                            && latest_attempts.get(&(t.stage_id, t.task_id)) == Some(&t.attempt)
                            && t.pinned_worker.as_ref().is_none_or(|w| w == worker_id)
                    })
                    .map(|(k, _)| *k)
                    .collect::<Vec<_>>();
                for key in candidates {
                    if remaining == 0 || query_budget == 0 {
                        return Ok(out);
                    }
                    if let Some(task) = query.tasks.get_mut(&key) {
                        task.state = TaskState::Running;
                        task.assigned_worker = Some(worker_id.clone());
                    }
                    if query.started_at_ms == 0 {
                        query.started_at_ms = now;
                    }
                    let stage = query.stages.get_mut(&stage_id).ok_or_else(|| {
                        QuarryError::Execution("task stage not found".to_string())
                    })?;
                    stage.metrics.queued_tasks = stage.metrics.queued_tasks.saturating_sub(1);
                    stage.metrics.running_tasks += 1;
                    update_scheduler_metrics(*query_id, stage_id, &stage.metrics);

                    let (_, task_id, attempt) = key;
                    out.push(TaskAssignment {
                        query_id: *query_id,
                        stage_id,
                        task_id,
                        attempt,
                        plan_fragment_json: stage.fragment.clone(),
                        inputs: stage.inputs.clone(),
                        output: stage.output.clone(),
                    });
                    remaining = remaining.saturating_sub(1);
                    query_budget = query_budget.saturating_sub(1);
                    debug!(
                        worker_id = %worker_id,
                        query_id = %query_id,
                        stage_id,
                        task_id,
                        attempt,
                        operator = "CoordinatorGetTask",
                        "assigned task"
                    );
                }
            }
        }

        Ok(out)
    }

    /// Record a task attempt status transition and update query/stage metrics.
    ///
    /// A failed attempt is retried with exponential backoff while
    /// `attempt < max_task_attempts` and the failure is retryable; otherwise
    /// the query fails.
    #[allow(clippy::too_many_arguments)]
    pub fn report_task_status(
        &mut self,
        query_id: QueryId,
        stage_id: u64,
        task_id: u64,
        attempt: u32,
        state: TaskState,
        worker_id: Option<&WorkerId>,
        failure: Option<TaskFailure>,
        message: String,
    ) -> Result<()> {
        let now = now_ms()?;
        self.requeue_stale_workers(now)?;
        let max_attempts = self.config.max_task_attempts;
        let backoff_base = self.config.retry_backoff_base_ms;
        let query = self
            .queries
            .get_mut(&query_id)
            .ok_or_else(|| QuarryError::Planning(format!("unknown query: {query_id}")))?;
        if query.state.is_terminal() {
            debug!(
                query_id = %query_id,
                stage_id,
                task_id,
                attempt,
                operator = "CoordinatorReportTaskStatus",
                "ignoring status report for finished query"
            );
            return Ok(());
        }
        let latest_attempt = latest_attempt_map(query)
            .get(&(stage_id, task_id))
            .copied()
            .unwrap_or(attempt);
        if attempt < latest_attempt {
            debug!(
                query_id = %query_id,
                stage_id,
                task_id,
                attempt,
                operator = "CoordinatorReportTaskStatus",
                "ignoring stale status report from old attempt"
            );
            return Ok(());
        }
        let key = (stage_id, task_id, attempt);
        let Some(task) = query.tasks.get(&key) else {
            debug!(
                query_id = %query_id,
                stage_id,
                task_id,
                attempt,
                operator = "CoordinatorReportTaskStatus",
                "ignoring status report for unknown task attempt"
            );
            return Ok(());
        };
        if task.state == state {
            return Ok(());
        }
        let assigned_worker = worker_id.cloned().or_else(|| task.assigned_worker.clone());
        mark_task(query, key, state, message.clone())?;

        match state {
            TaskState::Queued | TaskState::Running => {}
            TaskState::Succeeded => {
                if let Some(worker) = &assigned_worker {
                    self.worker_failures.remove(worker);
                }
                debug!(
                    query_id = %query_id,
                    stage_id,
                    task_id,
                    attempt,
                    operator = "CoordinatorReportTaskStatus",
                    "task succeeded"
                );
                if latest_task_states(query)
                    .values()
                    .all(|s| *s == TaskState::Succeeded)
                {
                    query.transition(query_id, QueryState::Completed, now);
                    info!(
                        query_id = %query_id,
                        operator = "CoordinatorReportTaskStatus",
                        "query reached completed state"
                    );
                }
            }
            TaskState::Failed => {
                let failure = failure.unwrap_or(TaskFailure::Transient(message));
                warn!(
                    query_id = %query_id,
                    stage_id,
                    task_id,
                    attempt,
                    error = %failure.message(),
                    operator = "CoordinatorReportTaskStatus",
                    "task attempt failed"
                );
                if failure.is_retryable() {
                    schedule_retry(query_id, query, key, failure, max_attempts, backoff_base, now)?;
                    if let Some(worker) = assigned_worker {
                        self.record_worker_failure(&worker, now);
                    }
                } else {
                    query.fail(query_id, failure, now);
                }
            }
        }
        Ok(())
    }

    fn record_worker_failure(&mut self, worker: &WorkerId, now: u64) {
        let failures = self.worker_failures.entry(worker.clone()).or_default();
        *failures += 1;
        if *failures >= self.config.blacklist_failure_threshold
            && self.blacklisted_workers.insert(worker.clone())
        {
            warn!(
                worker_id = %worker,
                failures = *failures,
                threshold = self.config.blacklist_failure_threshold,
                operator = "CoordinatorReportTaskStatus",
                "worker blacklisted due to repeated failures"
            );
            self.fail_queries_pinned_to(worker, now);
        }
    }

    /// Record worker liveness and return the queries it must cancel or
    /// release. Each terminal query is acknowledged once per worker.
    pub fn heartbeat(&mut self, worker_id: &WorkerId, running_tasks: u32) -> Result<HeartbeatAck> {
        let now = now_ms()?;
        debug!(
            worker_id = %worker_id,
            running_tasks,
            operator = "CoordinatorHeartbeat",
            "worker heartbeat"
        );
        self.worker_heartbeats
            .insert(worker_id.clone(), WorkerHeartbeat { last_seen_ms: now });
        let mut ack = HeartbeatAck::default();
        for (query_id, query) in &self.queries {
            if !query.state.is_terminal()
                || !self.acked_terminal.insert((worker_id.clone(), *query_id))
            {
                continue;
            }
            if query.state != QueryState::Completed {
                ack.cancel.push(*query_id);
            }
            ack.release.push(*query_id);
        }
        self.evict_finished_queries(now);
        Ok(ack)
    }

    /// Drop terminal queries older than `terminal_query_ttl_ms` that every
    /// live worker has been told to release.
    fn evict_finished_queries(&mut self, now: u64) {
        let ttl = self.config.terminal_query_ttl_ms;
        let live = self.live_workers_at(now);
        let expired = self
            .queries
            .iter()
            .filter(|(query_id, query)| {
                query.state.is_terminal()
                    && now.saturating_sub(query.finished_at_ms) >= ttl
                    && live
                        .iter()
                        .all(|w| self.acked_terminal.contains(&(w.clone(), **query_id)))
            })
            .map(|(query_id, _)| *query_id)
            .collect::<Vec<_>>();
        for query_id in expired {
            self.queries.remove(&query_id);
            self.acked_terminal.retain(|(_, q)| *q != query_id);
            debug!(
                query_id = %query_id,
                operator = "CoordinatorEvict",
                "finished query evicted"
            );
        }
    }

    /// Cancel a running query. Finished queries keep their final state.
    pub fn cancel_query(&mut self, query_id: QueryId, reason: &str) -> Result<QueryState> {
        let now = now_ms()?;
        let query = self
            .queries
            .get_mut(&query_id)
            .ok_or_else(|| QuarryError::Planning(format!("unknown query: {query_id}")))?;
        if query.state.is_terminal() {
            return Ok(query.state);
        }
        info!(
            query_id = %query_id,
            reason,
            operator = "CoordinatorCancel",
            "query cancelled"
        );
        query.message = reason.to_string();
        query.failure = Some(TaskFailure::Cancelled(format!("query {query_id}: {reason}")));
        query.transition(query_id, QueryState::Cancelled, now);
        Ok(QueryState::Cancelled)
    }

    /// Read current query status snapshot.
    pub fn get_query_status(&self, query_id: QueryId) -> Result<QueryStatus> {
        let query = self
            .queries
            .get(&query_id)
            .ok_or_else(|| QuarryError::Planning(format!("unknown query: {query_id}")))?;
        Ok(build_query_status(query_id, query))
    }

    /// Store one result-stage task's output (Arrow IPC bytes).
    pub fn register_query_results(
        &mut self,
        query_id: QueryId,
        stage_id: u64,
        task_id: u64,
        attempt: u32,
        ipc_payload: Vec<u8>,
    ) -> Result<()> {
        let query = self
            .queries
            .get_mut(&query_id)
            .ok_or_else(|| QuarryError::Planning(format!("unknown query: {query_id}")))?;
        if stage_id != query.result_stage {
            return Err(QuarryError::Planning(format!(
                "stage {stage_id} of query {query_id} does not produce results"
            )));
        }
        let latest = latest_attempt_map(query)
            .get(&(stage_id, task_id))
            .copied()
            .unwrap_or(attempt);
        if attempt < latest {
            return Ok(());
        }
        query.results.insert(task_id, ipc_payload);
        Ok(())
    }

    /// Result payloads in partition order, once the query completed.
    pub fn fetch_query_results(&self, query_id: QueryId) -> Result<Vec<Vec<u8>>> {
        let query = self
            .queries
            .get(&query_id)
            .ok_or_else(|| QuarryError::Planning(format!("unknown query: {query_id}")))?;
        if query.state != QueryState::Completed {
            return Err(QuarryError::Execution(format!(
                "query {query_id} results not ready ({:?})",
                query.state
            )));
        }
        Ok(query.results.values().cloned().collect())
    }

    /// Returns whether worker is currently blacklisted.
    pub fn is_worker_blacklisted(&self, worker_id: &WorkerId) -> bool {
        self.blacklisted_workers.contains(worker_id)
    }
}

fn pinned_worker_for(
    inputs: &[StageInputRef],
    maps: &HashMap<u64, Arc<PartitionMap>>,
    task_id: usize,
) -> Result<Option<WorkerId>> {
    let mut pinned: Option<WorkerId> = None;
    for input in inputs {
        let map = maps.get(&input.stage_id).ok_or_else(|| {
            QuarryError::Planning(format!("stage {} has no partition map", input.stage_id))
        })?;
        let worker = map.worker_for(task_id)?;
        match &pinned {
            Some(existing) if existing != worker => {
                return Err(QuarryError::Planning(format!(
                    "partition {task_id} is split across {existing} and {worker}"
                )));
            }
            Some(_) => {}
            None => pinned = Some(worker.clone()),
        }
    }
    Ok(pinned)
}

fn mark_task(
    query: &mut QueryRuntime,
    key: (u64, u64, u32),
    state: TaskState,
    message: String,
) -> Result<()> {
    let task = query
        .tasks
        .get_mut(&key)
        .ok_or_else(|| QuarryError::Planning("unknown task status report".to_string()))?;
    let prev = task.state;
    task.state = state;
    task.message = message;
    let stage = query
        .stages
        .get_mut(&key.0)
        .ok_or_else(|| QuarryError::Execution("task stage not found".to_string()))?;
    match prev {
        TaskState::Queued => stage.metrics.queued_tasks = stage.metrics.queued_tasks.saturating_sub(1),
        TaskState::Running => {
            stage.metrics.running_tasks = stage.metrics.running_tasks.saturating_sub(1)
        }
        TaskState::Succeeded | TaskState::Failed => {}
    }
    match state {
        TaskState::Queued => stage.metrics.queued_tasks += 1,
        TaskState::Running => stage.metrics.running_tasks += 1,
        TaskState::Succeeded => stage.metrics.succeeded_tasks += 1,
        TaskState::Failed => stage.metrics.failed_tasks += 1,
    }
    Ok(())
}

fn schedule_retry(
    query_id: QueryId,
    query: &mut QueryRuntime,
    key: (u64, u64, u32),
    failure: TaskFailure,
    max_attempts: u32,
    backoff_base_ms: u64,
    now: u64,
) -> Result<()> {
    let (stage_id, task_id, attempt) = key;
    if attempt >= max_attempts {
        query.fail(
            query_id,
            TaskFailure::Exhausted(format!(
                "stage {stage_id} task {task_id} failed after {attempt} attempts: {}",
                failure.message()
            )),
            now,
        );
        return Ok(());
    }
    let pinned_worker = query.tasks.get(&key).and_then(|t| t.pinned_worker.clone());
    let next_attempt = attempt + 1;
    let backoff_ms = backoff_base_ms.saturating_mul(1_u64 << (attempt.saturating_sub(1).min(10)));
    query.tasks.insert(
        (stage_id, task_id, next_attempt),
        TaskRuntime {
            stage_id,
            task_id,
            attempt: next_attempt,
            state: TaskState::Queued,
            assigned_worker: None,
            pinned_worker,
            ready_at_ms: now.saturating_add(backoff_ms),
            message: format!("retry scheduled after failure: {}", failure.message()),
        },
    );
    let stage = query
        .stages
        .get_mut(&stage_id)
        .ok_or_else(|| QuarryError::Execution("task stage not found".to_string()))?;
    stage.metrics.queued_tasks += 1;
    stage.metrics.retries += 1;
    update_scheduler_metrics(query_id, stage_id, &stage.metrics);
    global_metrics().inc_scheduler_retries(&query_id.to_string(), stage_id);
    query.message = format!("retrying failed task stage={stage_id} task={task_id}");
    info!(
        query_id = %query_id,
        stage_id,
        task_id,
        attempt = next_attempt,
        backoff_ms,
        operator = "CoordinatorRetry",
        "task retry scheduled"
    );
    Ok(())
}

fn runnable_stages(query: &QueryRuntime, latest_states: &HashMap<(u64, u64), TaskState>) -> Vec<u64> {
    query
        .stages
        .iter()
        .filter(|(_, stage)| {
            stage.parents.iter().all(|parent| {
                latest_states
                    .iter()
                    .filter(|((sid, _), _)| sid == parent)
                    .all(|(_, s)| *s == TaskState::Succeeded)
            })
        })
        .map(|(sid, _)| *sid)
        .collect()
}

fn latest_task_states(query: &QueryRuntime) -> HashMap<(u64, u64), TaskState> {
    let mut out = HashMap::<(u64, u64), (u32, TaskState)>::new();
    for t in query.tasks.values() {
        let key = (t.stage_id, t.task_id);
        match out.get(&key) {
            Some((existing_attempt, _)) if *existing_attempt >= t.attempt => {}
            _ => {
                out.insert(key, (t.attempt, t.state));
            }
        }
    }
    out.into_iter().map(|(k, (_, s))| (k, s)).collect()
}

fn latest_attempt_map(query: &QueryRuntime) -> HashMap<(u64, u64), u32> {
    let mut out = HashMap::<(u64, u64), u32>::new();
    for t in query.tasks.values() {
        out.entry((t.stage_id, t.task_id))
            .and_modify(|a| *a = (*a).max(t.attempt))
            .or_insert(t.attempt);
    }
    out
}

fn build_query_status(query_id: QueryId, q: &QueryRuntime) -> QueryStatus {
    let mut queued = 0_u32;
    let mut running = 0_u32;
    let mut succeeded = 0_u32;
    let mut failed = 0_u32;
    for t in q.tasks.values() {
        match t.state {
            TaskState::Queued => queued += 1,
            TaskState::Running => running += 1,
            TaskState::Succeeded => succeeded += 1,
            TaskState::Failed => failed += 1,
        }
    }

    QueryStatus {
        query_id,
        state: q.state,
        transitions: q.transitions.clone(),
        submitted_at_ms: q.submitted_at_ms,
        started_at_ms: q.started_at_ms,
        finished_at_ms: q.finished_at_ms,
        message: q.message.clone(),
        failure: q.failure.clone(),
        total_tasks: q.tasks.len() as u32,
        queued_tasks: queued,
        running_tasks: running,
        succeeded_tasks: succeeded,
        failed_tasks: failed,
        stage_metrics: q
            .stages
            .iter()
            .map(|(sid, s)| (*sid, s.metrics.clone()))
            .collect(),
    }
}

fn update_scheduler_metrics(query_id: QueryId, stage_id: u64, m: &StageMetrics) {
    let query_id = query_id.to_string();
    global_metrics().set_scheduler_queued_tasks(&query_id, stage_id, m.queued_tasks as u64);
    global_metrics().set_scheduler_running_tasks(&query_id, stage_id, m.running_tasks as u64);
}

fn now_ms() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| QuarryError::Execution(format!("clock error: {e}")))?
        .as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use quarry_planner::{
        AggExpr, AggregateMode, ExchangeExec, HashAggregateExec, ScanExec, ShuffleReadExchange,
        ShuffleWriteExchange, col,
    };

    fn w(id: &str) -> WorkerId {
        WorkerId::new(id)
    }

    fn shuffle_plan(scan_partitions: usize, partitions: usize) -> Vec<u8> {
        let partitioning = PartitioningSpec::HashKeys {
            keys: vec!["k".to_string()],
            partitions,
        };
        let partial = PhysicalPlan::HashAggregate(HashAggregateExec {
            mode: AggregateMode::Partial,
            group_exprs: vec![col("k")],
            aggr_exprs: vec![(AggExpr::Count(col("k")), "c".to_string())],
            input: Box::new(PhysicalPlan::Scan(ScanExec {
                table: "t".to_string(),
                projection: None,
                partitions: scan_partitions,
            })),
        });
        let plan = PhysicalPlan::HashAggregate(HashAggregateExec {
            mode: AggregateMode::Final,
            group_exprs: vec![col("k")],
            aggr_exprs: vec![(AggExpr::Count(col("k")), "c".to_string())],
            input: Box::new(PhysicalPlan::Exchange(ExchangeExec::ShuffleRead(
                ShuffleReadExchange {
                    input: Box::new(PhysicalPlan::Exchange(ExchangeExec::ShuffleWrite(
                        ShuffleWriteExchange {
                            input: Box::new(partial),
                            partitioning: partitioning.clone(),
                        },
                    ))),
                    partitioning,
                },
            ))),
        });
        serde_json::to_vec(&plan).unwrap()
    }

    fn scan_plan(partitions: usize) -> Vec<u8> {
        serde_json::to_vec(&PhysicalPlan::Scan(ScanExec {
            table: "t".to_string(),
            projection: None,
            partitions,
        }))
        .unwrap()
    }

    fn coordinator(config: CoordinatorConfig, workers: &[&str]) -> Coordinator {
        let mut c = Coordinator::new(config);
        for id in workers {
            c.heartbeat(&w(id), 0).unwrap();
        }
        c
    }

    fn fast_retry() -> CoordinatorConfig {
        CoordinatorConfig {
            retry_backoff_base_ms: 0,
            ..CoordinatorConfig::default()
        }
    }

    fn succeed(c: &mut Coordinator, worker: &WorkerId, a: &TaskAssignment) {
        c.report_task_status(
            a.query_id,
            a.stage_id,
            a.task_id,
            a.attempt,
            TaskState::Succeeded,
            Some(worker),
            None,
            "ok".to_string(),
        )
        .unwrap();
    }

    fn fail(c: &mut Coordinator, worker: &WorkerId, a: &TaskAssignment, failure: TaskFailure) {
        c.report_task_status(
            a.query_id,
            a.stage_id,
            a.task_id,
            a.attempt,
            TaskState::Failed,
            Some(worker),
            Some(failure),
            "boom".to_string(),
        )
        .unwrap();
    }

    #[test]
    fn submit_walks_planning_distributing_running() {
        let mut c = coordinator(CoordinatorConfig::default(), &["w1", "w2"]);
        let state = c.submit_query(QueryId(1), &shuffle_plan(2, 4)).unwrap();
        assert_eq!(state, QueryState::Running);
        let status = c.get_query_status(QueryId(1)).unwrap();
        assert_eq!(
            status.transitions,
            vec![QueryState::Planning, QueryState::Distributing, QueryState::Running]
        );
        assert_eq!(status.total_tasks, 6);
        assert!(c.submit_query(QueryId(1), &scan_plan(1)).is_err());
    }

    #[test]
    fn submit_without_live_workers_fails_unreachable() {
        let mut c = Coordinator::new(CoordinatorConfig::default());
        let err = c.submit_query(QueryId(1), &shuffle_plan(1, 2)).unwrap_err();
        assert!(matches!(err, QuarryError::WorkerUnreachable(_)));
        let status = c.get_query_status(QueryId(1)).unwrap();
        assert_eq!(status.state, QueryState::Failed);
    }

    #[test]
    fn malformed_plan_is_a_planning_error() {
        let mut c = coordinator(CoordinatorConfig::default(), &["w1"]);
        let err = c.submit_query(QueryId(1), b"{not json").unwrap_err();
        assert!(matches!(err, QuarryError::Planning(_)));
    }

    #[test]
    fn consumer_stage_waits_for_producers_and_is_pinned() {
        let mut c = coordinator(CoordinatorConfig::default(), &["w1", "w2"]);
        c.submit_query(QueryId(1), &shuffle_plan(2, 4)).unwrap();
        let (w1, w2) = (w("w1"), w("w2"));

        let producers = c.get_task(&w1, 10).unwrap();
        assert_eq!(producers.len(), 2);
        assert!(producers.iter().all(|a| a.stage_id == 1));
        assert!(matches!(producers[0].output, TaskOutput::Shuffle { .. }));
        assert!(c.get_task(&w2, 10).unwrap().is_empty());

        for a in &producers {
            succeed(&mut c, &w1, a);
        }
        let on_w1 = c.get_task(&w1, 10).unwrap();
        let on_w2 = c.get_task(&w2, 10).unwrap();
        let ids = |v: &[TaskAssignment]| v.iter().map(|a| a.task_id).collect::<Vec<_>>();
        assert_eq!(ids(&on_w1), vec![0, 2]);
        assert_eq!(ids(&on_w2), vec![1, 3]);
        assert_eq!(on_w1[0].inputs[0].producers, 2);

        for a in &on_w1 {
            succeed(&mut c, &w1, a);
        }
        for a in &on_w2 {
            succeed(&mut c, &w2, a);
        }
        let status = c.get_query_status(QueryId(1)).unwrap();
        assert_eq!(status.state, QueryState::Completed);
        assert_eq!(status.transitions.last(), Some(&QueryState::Completed));
    }

    #[test]
    fn failed_attempt_is_retried_then_query_completes() {
        let mut c = coordinator(fast_retry(), &["w1"]);
        c.submit_query(QueryId(1), &scan_plan(1)).unwrap();
        let worker = w("w1");

        let first = c.get_task(&worker, 1).unwrap().remove(0);
        fail(&mut c, &worker, &first, TaskFailure::Transient("flaky".to_string()));
        let status = c.get_query_status(QueryId(1)).unwrap();
        assert_eq!(status.state, QueryState::Running);
        assert_eq!(status.stage_metrics[&0].retries, 1);

        let second = c.get_task(&worker, 1).unwrap().remove(0);
        assert_eq!(second.attempt, 2);
        succeed(&mut c, &worker, &second);
        assert_eq!(c.get_query_status(QueryId(1)).unwrap().state, QueryState::Completed);
    }

    #[test]
    fn exhausted_attempts_fail_query() {
        let mut c = coordinator(
            CoordinatorConfig {
                max_task_attempts: 2,
                blacklist_failure_threshold: 10,
                ..fast_retry()
            },
            &["w1"],
        );
        c.submit_query(QueryId(1), &scan_plan(1)).unwrap();
        let worker = w("w1");
        for _ in 0..2 {
            let a = c.get_task(&worker, 1).unwrap().remove(0);
            fail(&mut c, &worker, &a, TaskFailure::Transient("down".to_string()));
        }
        let status = c.get_query_status(QueryId(1)).unwrap();
        assert_eq!(status.state, QueryState::Failed);
        let err = status.failure.unwrap().into_error();
        assert!(matches!(err, QuarryError::QueryFailed(msg) if msg.contains("2 attempts")));
    }

    #[test]
    fn non_retryable_failure_fails_immediately() {
        let mut c = coordinator(fast_retry(), &["w1"]);
        c.submit_query(QueryId(1), &scan_plan(1)).unwrap();
        let worker = w("w1");
        let a = c.get_task(&worker, 1).unwrap().remove(0);
        fail(&mut c, &worker, &a, TaskFailure::TypeMismatch("Utf8 + Int64".to_string()));
        let status = c.get_query_status(QueryId(1)).unwrap();
        assert_eq!(status.state, QueryState::Failed);
        assert!(matches!(
            status.failure.unwrap().into_error(),
            QuarryError::TypeMismatch(_)
        ));
    }

    #[test]
    fn stale_attempt_reports_are_ignored() {
        let mut c = coordinator(fast_retry(), &["w1"]);
        c.submit_query(QueryId(1), &scan_plan(1)).unwrap();
        let worker = w("w1");
        let first = c.get_task(&worker, 1).unwrap().remove(0);
        fail(&mut c, &worker, &first, TaskFailure::Transient("x".to_string()));
        succeed(&mut c, &worker, &first);
        let status = c.get_query_status(QueryId(1)).unwrap();
        assert_eq!(status.state, QueryState::Running);
        assert_eq!(status.queued_tasks, 1);
    }

    #[test]
    fn repeated_failures_blacklist_worker() {
        let mut c = coordinator(
            CoordinatorConfig {
                blacklist_failure_threshold: 2,
                max_task_attempts: 5,
                ..fast_retry()
            },
            &["w1", "w2"],
        );
        c.submit_query(QueryId(1), &scan_plan(1)).unwrap();
        let bad = w("w1");
        for _ in 0..2 {
            let a = c.get_task(&bad, 1).unwrap().remove(0);
            fail(&mut c, &bad, &a, TaskFailure::Transient("disk".to_string()));
        }
        assert!(c.is_worker_blacklisted(&bad));
        assert!(c.get_task(&bad, 1).unwrap().is_empty());
        let a = c.get_task(&w("w2"), 1).unwrap().remove(0);
        assert_eq!(a.attempt, 3);
    }

    #[test]
    fn stale_worker_tasks_are_requeued() {
        let mut c = coordinator(
            CoordinatorConfig {
                worker_liveness_timeout_ms: 5,
                ..fast_retry()
            },
            &["w1"],
        );
        c.submit_query(QueryId(1), &scan_plan(1)).unwrap();
        let first = c.get_task(&w("w1"), 1).unwrap().remove(0);
        thread::sleep(Duration::from_millis(20));
        let retried = c.get_task(&w("w2"), 1).unwrap();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].attempt, first.attempt + 1);
    }

    #[test]
    fn losing_a_pinned_worker_fails_query() {
        let mut c = coordinator(
            CoordinatorConfig {
                worker_liveness_timeout_ms: 5,
                ..fast_retry()
            },
            &["w1", "w2"],
        );
        c.submit_query(QueryId(1), &shuffle_plan(1, 2)).unwrap();
        thread::sleep(Duration::from_millis(20));
        c.heartbeat(&w("w1"), 0).unwrap();
        let _ = c.get_task(&w("w1"), 1).unwrap();
        let status = c.get_query_status(QueryId(1)).unwrap();
        assert_eq!(status.state, QueryState::Failed);
        assert!(matches!(status.failure, Some(TaskFailure::Unreachable(_))));
    }

    #[test]
    fn cancel_is_acknowledged_once_per_worker() {
        let mut c = coordinator(CoordinatorConfig::default(), &["w1"]);
        c.submit_query(QueryId(7), &scan_plan(2)).unwrap();
        assert_eq!(
            c.cancel_query(QueryId(7), "client request").unwrap(),
            QueryState::Cancelled
        );
        assert!(c.get_task(&w("w1"), 4).unwrap().is_empty());

        let ack = c.heartbeat(&w("w1"), 0).unwrap();
        assert_eq!(ack.cancel, vec![QueryId(7)]);
        assert_eq!(ack.release, vec![QueryId(7)]);
        assert_eq!(c.heartbeat(&w("w1"), 0).unwrap(), HeartbeatAck::default());
        assert_eq!(
            c.cancel_query(QueryId(7), "again").unwrap(),
            QueryState::Cancelled
        );
    }

    #[test]
    fn results_are_fetchable_only_after_completion() {
        let mut c = coordinator(CoordinatorConfig::default(), &["w1"]);
        c.submit_query(QueryId(1), &scan_plan(2)).unwrap();
        let worker = w("w1");
        let tasks = c.get_task(&worker, 2).unwrap();
        assert!(c.fetch_query_results(QueryId(1)).is_err());
        for a in tasks.iter().rev() {
            c.register_query_results(a.query_id, a.stage_id, a.task_id, a.attempt, vec![a.task_id as u8])
                .unwrap();
            succeed(&mut c, &worker, a);
        }
        assert_eq!(c.fetch_query_results(QueryId(1)).unwrap(), vec![vec![0], vec![1]]);
        assert!(
            c.register_query_results(QueryId(1), 5, 0, 1, Vec::new())
                .is_err()
        );
    }

    #[test]
    fn finished_queries_are_evicted_after_every_worker_releases_them() {
        let mut c = coordinator(
            CoordinatorConfig {
                terminal_query_ttl_ms: 10,
                ..CoordinatorConfig::default()
            },
            &["w1", "w2"],
        );
        c.submit_query(QueryId(3), &scan_plan(1)).unwrap();
        c.cancel_query(QueryId(3), "done").unwrap();
        thread::sleep(Duration::from_millis(20));

        // w2 has not heard about the release yet, so the query stays.
        let ack = c.heartbeat(&w("w1"), 0).unwrap();
        assert_eq!(ack.release, vec![QueryId(3)]);
        assert!(c.get_query_status(QueryId(3)).is_ok());

        let ack = c.heartbeat(&w("w2"), 0).unwrap();
        assert_eq!(ack.release, vec![QueryId(3)]);
        assert!(c.get_query_status(QueryId(3)).is_err());
        assert!(c.acked_terminal.is_empty());
        assert_eq!(c.heartbeat(&w("w1"), 0).unwrap(), HeartbeatAck::default());
    }

    #[test]
    fn finished_queries_stay_queryable_within_ttl() {
        let mut c = coordinator(CoordinatorConfig::default(), &["w1"]);
        c.submit_query(QueryId(4), &scan_plan(1)).unwrap();
        c.cancel_query(QueryId(4), "done").unwrap();
        c.heartbeat(&w("w1"), 0).unwrap();
        assert_eq!(
            c.get_query_status(QueryId(4)).unwrap().state,
            QueryState::Cancelled
        );
    }
}
