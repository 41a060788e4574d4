use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use quarry_common::{BufferPool, QuarryError, QueryId, QueryMemory, Result};

/// Per-query resource limits.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Upper bound on bytes the query may hold in the buffer pool.
    pub mem_limit_bytes: usize,
    /// Preferred rows per emitted batch.
    pub batch_size_rows: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            mem_limit_bytes: 256 * 1024 * 1024,
            batch_size_rows: 8192,
        }
    }
}

/// State shared by every operator of one query on one process.
#[derive(Debug)]
pub struct ExecutionContext {
    query_id: QueryId,
    limits: ResourceLimits,
    memory: Arc<QueryMemory>,
    cancelled: AtomicBool,
}

impl ExecutionContext {
    /// Register `query_id` with `pool` and build its context.
    pub fn new(query_id: QueryId, limits: ResourceLimits, pool: &Arc<BufferPool>) -> Arc<Self> {
        let memory = pool.register_query(query_id, limits.mem_limit_bytes);
        Arc::new(Self {
            query_id,
            limits,
            memory,
            cancelled: AtomicBool::new(false),
        })
    }

    /// Query this context belongs to.
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Limits the query was submitted with.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Memory tracker for this query.
    pub fn memory(&self) -> &Arc<QueryMemory> {
        &self.memory
    }

    /// Target batch size, reduced when the pool is under pressure.
    pub fn batch_size_rows(&self) -> usize {
        let suggested = self.memory.pool().pressure().suggested_batch_size_rows;
        self.limits.batch_size_rows.min(suggested).max(1)
    }

    /// Set the cancellation flag. Operators observe it at their next batch
    /// boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether [`ExecutionContext::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is set.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(QuarryError::Cancelled(format!("query {}", self.query_id)))
        } else {
            Ok(())
        }
    }
}

/// Identity of one running task attempt plus its query context.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Owning query.
    pub query: Arc<ExecutionContext>,
    /// Stage being executed (0 for local execution).
    pub stage_id: u64,
    /// Task id (0 for local execution).
    pub task_id: u64,
    /// Partition this task computes.
    pub partition: usize,
    /// Attempt number, starting at 1.
    pub attempt: u32,
}

impl TaskContext {
    /// Context for local, non-distributed execution of one partition.
    pub fn local(query: Arc<ExecutionContext>, partition: usize) -> Arc<Self> {
        Arc::new(Self {
            query,
            stage_id: 0,
            task_id: 0,
            partition,
            attempt: 1,
        })
    }

    /// Memory tracker of the owning query.
    pub fn memory(&self) -> &Arc<QueryMemory> {
        self.query.memory()
    }

    /// Target batch size for operators that split output.
    pub fn batch_size_rows(&self) -> usize {
        self.query.batch_size_rows()
    }
}

/// Shared task context handle passed to every operator.
pub type SharedTaskContext = Arc<TaskContext>;
