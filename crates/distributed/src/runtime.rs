//! Embedded cluster: one coordinator plus N workers connected by an
//! in-process exchange hub.
//!
//! The cluster is the client-facing entry point: submit a physical plan,
//! wait for its result batches, poll status or cancel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use quarry_common::{BufferPool, EngineConfig, QuarryError, QueryId, Result, WorkerId};
use quarry_exchange::{ExchangeConfig, ExchangeHub, FrameTransport, PartitionSpool};
use quarry_execution::TableSource;
use quarry_planner::PhysicalPlan;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::coordinator::{
    Coordinator, CoordinatorConfig, QueryState, QueryStatus, TaskFailure,
};
use crate::worker::{
    DefaultTaskExecutor, ExchangeInput, InProcessControlPlane, SpoolInput, TaskExecutor, Worker,
    WorkerConfig, WorkerResources, decode_record_batches_ipc, spawn_inbox_pump,
};

/// Shape and tuning of an embedded cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalClusterConfig {
    pub workers: usize,
    pub coordinator: CoordinatorConfig,
    /// Template for every worker; `worker_id` is replaced by `worker-<n>`.
    pub worker: WorkerConfig,
    pub exchange: ExchangeConfig,
    /// Delay between worker poll cycles.
    pub poll_interval_ms: u64,
    /// How long [`LocalCluster::wait`] waits for a terminal state.
    pub query_timeout_ms: u64,
}

impl Default for LocalClusterConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            coordinator: CoordinatorConfig::default(),
            worker: WorkerConfig::default(),
            exchange: ExchangeConfig::default(),
            poll_interval_ms: 5,
            query_timeout_ms: 60_000,
        }
    }
}

impl LocalClusterConfig {
    /// Default cluster whose workers follow `engine`.
    pub fn from_engine(engine: &EngineConfig) -> Self {
        let defaults = Self::default();
        Self {
            worker: WorkerConfig::from_engine(
                defaults.worker.worker_id.clone(),
                defaults.worker.cpu_slots,
                engine,
            ),
            ..defaults
        }
    }

    /// [`LocalClusterConfig::from_engine`] over the defaults with `QUARRY_*`
    /// environment overrides applied.
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_engine(&EngineConfig::default().with_env_overrides()?))
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(QuarryError::InvalidConfig(
                "cluster needs at least one worker".to_string(),
            ));
        }
        if self.coordinator.max_task_attempts == 0 {
            return Err(QuarryError::InvalidConfig(
                "max_task_attempts must be > 0".to_string(),
            ));
        }
        self.exchange.validate()
    }
}

type ClusterWorker = Worker<InProcessControlPlane, dyn TaskExecutor>;

/// Running embedded cluster.
pub struct LocalCluster {
    config: LocalClusterConfig,
    coordinator: Arc<Mutex<Coordinator>>,
    hub: Arc<ExchangeHub>,
    worker_ids: Vec<WorkerId>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    pumps: Vec<JoinHandle<()>>,
    next_query_id: AtomicU64,
}

impl LocalCluster {
    /// Start a cluster running [`DefaultTaskExecutor`] on every worker.
    pub async fn start(config: LocalClusterConfig, tables: Arc<dyn TableSource>) -> Result<Self> {
        Self::start_with_executor(config, tables, |resources| {
            Arc::new(DefaultTaskExecutor::new(resources)) as Arc<dyn TaskExecutor>
        })
        .await
    }

    /// Start a cluster whose workers run the executor built by `make_executor`.
    pub async fn start_with_executor<F>(
        config: LocalClusterConfig,
        tables: Arc<dyn TableSource>,
        make_executor: F,
    ) -> Result<Self>
    where
        F: Fn(WorkerResources) -> Arc<dyn TaskExecutor>,
    {
        config.validate()?;
        let coordinator = Arc::new(Mutex::new(Coordinator::new(config.coordinator.clone())));
        let hub = ExchangeHub::new();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let poll_interval = Duration::from_millis(config.poll_interval_ms.max(1));

        let mut worker_ids = Vec::with_capacity(config.workers);
        let mut workers = Vec::with_capacity(config.workers);
        let mut pumps = Vec::with_capacity(config.workers);
        for n in 1..=config.workers {
            let worker_id = WorkerId::new(format!("worker-{n}"));
            let worker_config = WorkerConfig {
                worker_id: worker_id.clone(),
                ..config.worker.clone()
            };
            let pool = BufferPool::new(
                worker_config.engine_memory_budget_bytes,
                worker_config.batch_size_rows,
                worker_config.min_batch_size_rows,
            );
            let spool = PartitionSpool::new(
                Arc::clone(&pool),
                config.exchange.spool_query_limit_bytes,
            );
            let inbox = hub.register_worker(worker_id.clone(), config.exchange.inbox_capacity)?;
            pumps.push(spawn_inbox_pump(inbox, Arc::clone(&spool)));

            let input: Arc<dyn ExchangeInput> = Arc::new(SpoolInput::new(
                Arc::clone(&spool),
                Duration::from_millis(config.exchange.receive_timeout_ms),
            ));
            let transport: Arc<dyn FrameTransport> = hub.clone();
            let executor = make_executor(WorkerResources {
                worker_id: worker_id.clone(),
                tables: Arc::clone(&tables),
                transport,
                input,
                exchange: config.exchange.clone(),
            });
            let worker: ClusterWorker = Worker::new(
                worker_config,
                Arc::new(InProcessControlPlane::new(Arc::clone(&coordinator))),
                executor,
                pool,
                spool,
            );
            worker.heartbeat().await?;
            let rx = shutdown_rx.clone();
            workers.push(tokio::spawn(async move {
                worker.run(rx, poll_interval).await;
            }));
            worker_ids.push(worker_id);
        }
        info!(
            workers = config.workers,
            operator = "LocalCluster",
            "cluster started"
        );

        Ok(Self {
            config,
            coordinator,
            hub,
            worker_ids,
            shutdown,
            workers,
            pumps,
            next_query_id: AtomicU64::new(1),
        })
    }

    pub fn coordinator(&self) -> &Arc<Mutex<Coordinator>> {
        &self.coordinator
    }

    pub fn hub(&self) -> &Arc<ExchangeHub> {
        &self.hub
    }

    pub fn worker_ids(&self) -> &[WorkerId] {
        &self.worker_ids
    }

    /// Submit `plan` and return its id without waiting.
    pub async fn submit(&self, plan: &PhysicalPlan) -> Result<QueryId> {
        let query_id = QueryId(self.next_query_id.fetch_add(1, Ordering::SeqCst));
        let bytes = serde_json::to_vec(plan)
            .map_err(|e| QuarryError::Planning(format!("encode physical plan failed: {e}")))?;
        self.coordinator
            .lock()
            .await
            .submit_query(query_id, &bytes)?;
        Ok(query_id)
    }

    /// Wait for `query_id` to finish and return its batches in partition
    /// order.
    ///
    /// # Errors
    /// The failure that ended the query, `Cancelled` after
    /// [`LocalCluster::cancel`], or `QueryFailed` after `query_timeout_ms`,
    /// in which case the query is cancelled so workers stop running it.
    pub async fn wait(&self, query_id: QueryId) -> Result<Vec<RecordBatch>> {
        let deadline = Instant::now() + Duration::from_millis(self.config.query_timeout_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        loop {
            let status = self.status(query_id).await?;
            match status.state {
                QueryState::Completed => {
                    let payloads = self
                        .coordinator
                        .lock()
                        .await
                        .fetch_query_results(query_id)?;
                    let mut out = Vec::new();
                    for payload in payloads {
                        out.extend(decode_record_batches_ipc(&payload)?.1);
                    }
                    return Ok(out);
                }
                QueryState::Failed => {
                    return Err(status.failure.map(TaskFailure::into_error).unwrap_or_else(|| {
                        QuarryError::QueryFailed(format!("query {query_id}: {}", status.message))
                    }));
                }
                QueryState::Cancelled => {
                    return Err(QuarryError::Cancelled(format!("query {query_id}")));
                }
                QueryState::Planning | QueryState::Distributing | QueryState::Running => {}
            }
            if Instant::now() >= deadline {
                warn!(query_id = %query_id, operator = "LocalCluster", "query timed out");
                self.coordinator
                    .lock()
                    .await
                    .cancel_query(query_id, "query timed out")?;
                return Err(QuarryError::QueryFailed(format!(
                    "query {query_id} did not finish within {} ms",
                    self.config.query_timeout_ms
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Submit `plan` and wait for its results.
    pub async fn execute(&self, plan: &PhysicalPlan) -> Result<Vec<RecordBatch>> {
        let query_id = self.submit(plan).await?;
        self.wait(query_id).await
    }

    pub async fn cancel(&self, query_id: QueryId) -> Result<QueryState> {
        self.coordinator
            .lock()
            .await
            .cancel_query(query_id, "cancelled by client")
    }

    pub async fn status(&self, query_id: QueryId) -> Result<QueryStatus> {
        self.coordinator.lock().await.get_query_status(query_id)
    }

    /// Stop every worker, cancelling running tasks, and close the exchange.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.workers {
            if let Err(e) = handle.await {
                warn!(error = %e, operator = "LocalCluster", "worker task panicked");
            }
        }
        for worker in &self.worker_ids {
            self.hub.disconnect(worker);
        }
        for pump in self.pumps {
            let _ = pump.await;
        }
        info!(operator = "LocalCluster", "cluster stopped");
    }
}
