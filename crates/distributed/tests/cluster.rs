use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::array::{Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use quarry_common::{BufferPool, QuarryError, QueryId, Result, WorkerId};
use quarry_distributed::{
    DefaultTaskExecutor, LocalCluster, LocalClusterConfig, QueryState, TaskAssignment,
    TaskExecutionResult, TaskExecutor, WorkerResources,
};
use quarry_exchange::{ExchangeFrame, FrameKind, FrameTransport};
use quarry_execution::{ExecEnv, ExecutionContext, ResourceLimits, TaskContext, execute_plan};
use quarry_planner::{
    AggExpr, JoinType, LogicalPlanBuilder, PhysicalPlan, PhysicalPlannerConfig, SortExpr, col,
    create_physical_plan, lit,
};
use quarry_storage::{Catalog, MemTable};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn sales_batch(offset: i64, rows: i64) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("region", DataType::Utf8, false),
        Field::new("cust_id", DataType::Int64, false),
        Field::new("amount", DataType::Int64, false),
    ]));
    let regions = ["north", "south", "east", "west", "central"];
    let ids = (offset..offset + rows).collect::<Vec<_>>();
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(
                ids.iter()
                    .map(|i| regions[(*i as usize) % regions.len()])
                    .collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(ids.iter().map(|i| i % 7).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(ids.iter().map(|i| i * 3 + 1).collect::<Vec<_>>())),
        ],
    )
    .unwrap()
}

fn customers_batch() -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new("c_id", DataType::Int64, false),
        Field::new("tier", DataType::Utf8, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(vec![0, 1, 2, 3, 4, 5])),
            Arc::new(StringArray::from(vec![
                "gold", "silver", "gold", "bronze", "silver", "gold",
            ])),
        ],
    )
    .unwrap()
}

fn catalog(rows_per_batch: i64) -> Arc<Catalog> {
    let sales = (0..6)
        .map(|i| sales_batch(i * rows_per_batch, rows_per_batch))
        .collect::<Vec<_>>();
    let mut catalog = Catalog::new();
    catalog.register_table(
        "sales",
        Arc::new(MemTable::round_robin(sales[0].schema(), sales, 3).unwrap()),
    );
    let customers = customers_batch();
    catalog.register_table(
        "customers",
        Arc::new(MemTable::round_robin(customers.schema(), vec![customers], 2).unwrap()),
    );
    Arc::new(catalog)
}

fn physical(catalog: &Catalog, builder: LogicalPlanBuilder, partitions: usize) -> PhysicalPlan {
    create_physical_plan(
        &builder.build(),
        &PhysicalPlannerConfig {
            shuffle_partitions: partitions,
        },
        catalog,
    )
    .unwrap()
}

fn aggregate_plan(catalog: &Catalog) -> PhysicalPlan {
    physical(
        catalog,
        LogicalPlanBuilder::scan("sales")
            .filter(col("amount").gt(lit(10_i64)))
            .aggregate(
                vec![col("region")],
                vec![
                    (AggExpr::Sum(col("amount")), "total"),
                    (AggExpr::Count(col("amount")), "n"),
                ],
            ),
        4,
    )
}

fn join_plan(catalog: &Catalog) -> PhysicalPlan {
    physical(
        catalog,
        LogicalPlanBuilder::scan("sales").join(
            LogicalPlanBuilder::scan("customers"),
            &[("cust_id", "c_id")],
            JoinType::Inner,
        ),
        3,
    )
}

async fn run_local(catalog: Arc<Catalog>, plan: &PhysicalPlan) -> Vec<RecordBatch> {
    let pool = BufferPool::unbounded();
    let ctx = ExecutionContext::new(QueryId(u64::MAX), ResourceLimits::default(), &pool);
    execute_plan(plan, ctx, &ExecEnv::new(catalog)).await.unwrap()
}

fn rows(batches: &[RecordBatch]) -> Vec<String> {
    let mut out = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            let cells = batch
                .columns()
                .iter()
                .map(|c| array_value_to_string(c.as_ref(), row).unwrap())
                .collect::<Vec<_>>();
            out.push(cells.join("|"));
        }
    }
    out
}

fn sorted_rows(batches: &[RecordBatch]) -> Vec<String> {
    let mut out = rows(batches);
    out.sort();
    out
}

fn config(workers: usize) -> LocalClusterConfig {
    let mut config = LocalClusterConfig {
        workers,
        query_timeout_ms: 20_000,
        ..LocalClusterConfig::default()
    };
    config.coordinator.retry_backoff_base_ms = 10;
    config.exchange.receive_timeout_ms = 10_000;
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distributed_aggregate_matches_local_execution() {
    init_tracing();
    let catalog = catalog(50);
    let plan = aggregate_plan(&catalog);
    let expected = sorted_rows(&run_local(Arc::clone(&catalog), &plan).await);
    assert_eq!(expected.len(), 5);

    let cluster = LocalCluster::start(config(3), catalog).await.unwrap();
    let query_id = cluster.submit(&plan).await.unwrap();
    let batches = cluster.wait(query_id).await.unwrap();
    assert_eq!(sorted_rows(&batches), expected);

    let status = cluster.status(query_id).await.unwrap();
    assert_eq!(
        status.transitions,
        vec![
            QueryState::Planning,
            QueryState::Distributing,
            QueryState::Running,
            QueryState::Completed
        ]
    );
    assert_eq!(status.stage_metrics.len(), 2);
    assert_eq!(status.stage_metrics[&0].succeeded_tasks, 4);
    assert_eq!(status.stage_metrics[&1].succeeded_tasks, 3);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distributed_join_matches_local_execution() {
    init_tracing();
    let catalog = catalog(20);
    let plan = join_plan(&catalog);
    let expected = sorted_rows(&run_local(Arc::clone(&catalog), &plan).await);
    assert!(!expected.is_empty());

    let cluster = LocalCluster::start(config(2), catalog).await.unwrap();
    let batches = cluster.execute(&plan).await.unwrap();
    assert_eq!(sorted_rows(&batches), expected);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gathered_sort_with_limit_keeps_order() {
    init_tracing();
    let catalog = catalog(10);
    let plan = physical(
        &catalog,
        LogicalPlanBuilder::scan("sales")
            .sort(vec![SortExpr::desc(col("amount"))])
            .limit(4),
        2,
    );
    let expected = rows(&run_local(Arc::clone(&catalog), &plan).await);
    assert_eq!(expected.len(), 4);

    let cluster = LocalCluster::start(config(2), catalog).await.unwrap();
    let batches = cluster.execute(&plan).await.unwrap();
    assert_eq!(rows(&batches), expected);
    cluster.shutdown().await;
}

/// Delivers every frame twice.
struct DuplicatingTransport {
    inner: Arc<dyn FrameTransport>,
    duplicates: Arc<AtomicU32>,
}

#[async_trait]
impl FrameTransport for DuplicatingTransport {
    async fn deliver(&self, dest: &WorkerId, bytes: Vec<u8>) -> Result<()> {
        self.inner.deliver(dest, bytes.clone()).await?;
        self.duplicates.fetch_add(1, Ordering::SeqCst);
        self.inner.deliver(dest, bytes).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicated_frames_are_dropped_by_receivers() {
    init_tracing();
    let catalog = catalog(30);
    let plan = aggregate_plan(&catalog);
    let expected = sorted_rows(&run_local(Arc::clone(&catalog), &plan).await);

    let duplicates = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&duplicates);
    let cluster = LocalCluster::start_with_executor(config(2), catalog, move |resources| {
        let transport: Arc<dyn FrameTransport> = Arc::new(DuplicatingTransport {
            inner: resources.transport.clone(),
            duplicates: Arc::clone(&counter),
        });
        Arc::new(DefaultTaskExecutor::new(WorkerResources {
            transport,
            ..resources
        })) as Arc<dyn TaskExecutor>
    })
    .await
    .unwrap();

    let batches = cluster.execute(&plan).await.unwrap();
    assert_eq!(sorted_rows(&batches), expected);
    assert!(duplicates.load(Ordering::SeqCst) > 0);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_frame_window_still_completes() {
    init_tracing();
    let catalog = catalog(40);
    let plan = aggregate_plan(&catalog);
    let expected = sorted_rows(&run_local(Arc::clone(&catalog), &plan).await);

    let mut config = config(2);
    config.exchange.inbox_capacity = 1;
    let cluster = LocalCluster::start(config, catalog).await.unwrap();
    let batches = cluster.execute(&plan).await.unwrap();
    assert_eq!(sorted_rows(&batches), expected);
    cluster.shutdown().await;
}

/// Runs the real executor, then reports failure for the first `failures`
/// attempts of `stage_id` after all their output was already shipped.
struct FlakyExecutor {
    inner: DefaultTaskExecutor,
    stage_id: u64,
    failures: Arc<AtomicU32>,
}

#[async_trait]
impl TaskExecutor for FlakyExecutor {
    async fn execute(
        &self,
        assignment: &TaskAssignment,
        ctx: Arc<TaskContext>,
    ) -> Result<TaskExecutionResult> {
        let result = self.inner.execute(assignment, ctx).await?;
        if assignment.stage_id == self.stage_id
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(QuarryError::TaskFailed(format!(
                "injected failure for stage {} task {} attempt {}",
                assignment.stage_id, assignment.task_id, assignment.attempt
            )));
        }
        Ok(result)
    }
}

async fn flaky_cluster(
    config: LocalClusterConfig,
    catalog: Arc<Catalog>,
    failures: u32,
) -> LocalCluster {
    let failures = Arc::new(AtomicU32::new(failures));
    LocalCluster::start_with_executor(config, catalog, move |resources| {
        Arc::new(FlakyExecutor {
            inner: DefaultTaskExecutor::new(resources),
            stage_id: 1,
            failures: Arc::clone(&failures),
        }) as Arc<dyn TaskExecutor>
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retried_producer_lets_query_complete_without_duplicates() {
    init_tracing();
    let catalog = catalog(30);
    let plan = aggregate_plan(&catalog);
    let expected = sorted_rows(&run_local(Arc::clone(&catalog), &plan).await);

    let mut config = config(2);
    config.coordinator.blacklist_failure_threshold = 10;
    let cluster = flaky_cluster(config, catalog, 2).await;
    let query_id = cluster.submit(&plan).await.unwrap();
    let batches = cluster.wait(query_id).await.unwrap();
    assert_eq!(sorted_rows(&batches), expected);

    let status = cluster.status(query_id).await.unwrap();
    assert_eq!(status.state, QueryState::Completed);
    assert_eq!(status.stage_metrics[&1].retries, 2);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_fail_query() {
    init_tracing();
    let catalog = catalog(10);
    let plan = aggregate_plan(&catalog);

    let mut config = config(2);
    config.coordinator.max_task_attempts = 2;
    config.coordinator.blacklist_failure_threshold = 100;
    let cluster = flaky_cluster(config, catalog, u32::MAX).await;
    let err = cluster.execute(&plan).await.unwrap_err();
    assert!(matches!(err, QuarryError::QueryFailed(ref m) if m.contains("2 attempts")), "{err}");
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn type_mismatch_fails_query_without_retry() {
    init_tracing();
    let catalog = catalog(10);
    let plan = physical(
        &catalog,
        LogicalPlanBuilder::scan("sales").filter(col("region").plus(lit(1_i64)).gt(lit(0_i64))),
        2,
    );
    let cluster = LocalCluster::start(config(2), catalog).await.unwrap();
    let query_id = cluster.submit(&plan).await.unwrap();
    let err = cluster.wait(query_id).await.unwrap_err();
    assert!(matches!(err, QuarryError::TypeMismatch(_)), "{err}");
    let status = cluster.status(query_id).await.unwrap();
    assert!(status.stage_metrics.values().all(|m| m.retries == 0));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn query_over_memory_limit_fails_out_of_memory() {
    init_tracing();
    let catalog = catalog(500);
    let plan = physical(
        &catalog,
        LogicalPlanBuilder::scan("sales")
            .aggregate(vec![col("amount")], vec![(AggExpr::Count(col("region")), "n")]),
        2,
    );

    let mut config = config(2);
    config.worker.query_mem_limit_bytes = 1024;
    config.exchange.spool_query_limit_bytes = 1024;
    let cluster = LocalCluster::start(config, catalog).await.unwrap();
    let err = cluster.execute(&plan).await.unwrap_err();
    assert!(matches!(err, QuarryError::OutOfMemory { .. }), "{err}");
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_destination_fails_query_after_retries() {
    init_tracing();
    let catalog = catalog(10);
    let plan = aggregate_plan(&catalog);

    let mut config = config(2);
    config.coordinator.max_task_attempts = 2;
    config.coordinator.blacklist_failure_threshold = 100;
    config.exchange.max_send_attempts = 2;
    config.exchange.retry_backoff_ms = 1;
    let cluster = LocalCluster::start(config, catalog).await.unwrap();
    cluster.hub().disconnect(&cluster.worker_ids()[1]);

    let err = cluster.execute(&plan).await.unwrap_err();
    assert!(
        matches!(err, QuarryError::QueryFailed(ref m) if m.contains("worker unreachable")),
        "{err}"
    );
    cluster.shutdown().await;
}

/// Blocks result-stage tasks until their query is cancelled.
struct BlockingExecutor {
    inner: DefaultTaskExecutor,
    observed_cancel: Arc<AtomicBool>,
}

#[async_trait]
impl TaskExecutor for BlockingExecutor {
    async fn execute(
        &self,
        assignment: &TaskAssignment,
        ctx: Arc<TaskContext>,
    ) -> Result<TaskExecutionResult> {
        if assignment.stage_id == 0 {
            loop {
                if let Err(e) = ctx.query.check_cancelled() {
                    self.observed_cancel.store(true, Ordering::SeqCst);
                    return Err(e);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        }
        self.inner.execute(assignment, ctx).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_reaches_running_tasks() {
    init_tracing();
    let catalog = catalog(10);
    let plan = aggregate_plan(&catalog);
    let observed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&observed);
    let cluster = LocalCluster::start_with_executor(config(2), catalog, move |resources| {
        Arc::new(BlockingExecutor {
            inner: DefaultTaskExecutor::new(resources),
            observed_cancel: Arc::clone(&flag),
        }) as Arc<dyn TaskExecutor>
    })
    .await
    .unwrap();

    let query_id = cluster.submit(&plan).await.unwrap();
    for _ in 0..2_000 {
        let status = cluster.status(query_id).await.unwrap();
        if status.stage_metrics[&0].running_tasks > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(cluster.cancel(query_id).await.unwrap(), QueryState::Cancelled);
    let err = cluster.wait(query_id).await.unwrap_err();
    assert!(matches!(err, QuarryError::Cancelled(_)));

    for _ in 0..1_000 {
        if observed.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(observed.load(Ordering::SeqCst));
    let status = cluster.status(query_id).await.unwrap();
    assert_eq!(status.transitions.last(), Some(&QueryState::Cancelled));
    cluster.shutdown().await;
}

/// Fails every frame of the first producer task that ships three data
/// frames on its first attempt.
struct MidStreamFailure {
    inner: Arc<dyn FrameTransport>,
    shipped: Arc<AtomicU32>,
    victim: Arc<Mutex<Option<u64>>>,
}

#[async_trait]
impl FrameTransport for MidStreamFailure {
    async fn deliver(&self, dest: &WorkerId, bytes: Vec<u8>) -> Result<()> {
        let header = ExchangeFrame::decode(&bytes)?.header;
        if header.attempt == 1 {
            let mut victim = self.victim.lock().unwrap();
            if *victim == Some(header.producer_task) {
                return Err(QuarryError::WorkerUnreachable(format!(
                    "{dest} dropped producer {}",
                    header.producer_task
                )));
            }
            if victim.is_none()
                && header.kind == FrameKind::Data
                && self.shipped.fetch_add(1, Ordering::SeqCst) + 1 == 3
            {
                *victim = Some(header.producer_task);
            }
        }
        self.inner.deliver(dest, bytes).await
    }
}

/// Runs first attempts with 2-row batches so retries slice differently.
struct SmallFirstAttempt {
    inner: DefaultTaskExecutor,
}

#[async_trait]
impl TaskExecutor for SmallFirstAttempt {
    async fn execute(
        &self,
        assignment: &TaskAssignment,
        ctx: Arc<TaskContext>,
    ) -> Result<TaskExecutionResult> {
        if assignment.attempt > 1 {
            return self.inner.execute(assignment, ctx).await;
        }
        let limits = ResourceLimits {
            batch_size_rows: 2,
            ..ctx.query.limits().clone()
        };
        let query = ExecutionContext::new(ctx.query.query_id(), limits, ctx.memory().pool());
        let small = Arc::new(TaskContext {
            query,
            ..(*ctx).clone()
        });
        self.inner.execute(assignment, small).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn producer_failing_mid_stream_is_retried_with_different_batches() {
    init_tracing();
    let catalog = catalog(20);
    let plan = physical(
        &catalog,
        LogicalPlanBuilder::scan("sales")
            .aggregate(vec![col("amount")], vec![(AggExpr::Count(col("region")), "n")]),
        3,
    );
    let expected = sorted_rows(&run_local(Arc::clone(&catalog), &plan).await);
    assert_eq!(expected.len(), 120);

    let mut config = config(2);
    config.worker.batch_size_rows = 8;
    config.worker.min_batch_size_rows = 1;
    config.exchange.max_send_attempts = 2;
    config.exchange.retry_backoff_ms = 1;
    let shipped = Arc::new(AtomicU32::new(0));
    let victim = Arc::new(Mutex::new(None));
    let (shipped_ref, victim_ref) = (Arc::clone(&shipped), Arc::clone(&victim));
    let cluster = LocalCluster::start_with_executor(config, catalog, move |resources| {
        let transport: Arc<dyn FrameTransport> = Arc::new(MidStreamFailure {
            inner: resources.transport.clone(),
            shipped: Arc::clone(&shipped_ref),
            victim: Arc::clone(&victim_ref),
        });
        Arc::new(SmallFirstAttempt {
            inner: DefaultTaskExecutor::new(WorkerResources {
                transport,
                ..resources
            }),
        }) as Arc<dyn TaskExecutor>
    })
    .await
    .unwrap();

    let query_id = cluster.submit(&plan).await.unwrap();
    let batches = cluster.wait(query_id).await.unwrap();
    assert_eq!(sorted_rows(&batches), expected);
    assert!(victim.lock().unwrap().is_some());
    let status = cluster.status(query_id).await.unwrap();
    assert_eq!(status.stage_metrics[&1].retries, 1);
    cluster.shutdown().await;
}

fn wide_catalog(rows_per_partition: i64) -> Arc<Catalog> {
    let batches = (0..3)
        .map(|p| sales_batch(p * rows_per_partition, rows_per_partition))
        .collect::<Vec<_>>();
    let mut catalog = Catalog::new();
    catalog.register_table(
        "sales",
        Arc::new(MemTable::round_robin(batches[0].schema(), batches, 3).unwrap()),
    );
    Arc::new(catalog)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_stops_scan_and_aggregate_mid_run() {
    init_tracing();
    let catalog = wide_catalog(100_000);
    let plan = physical(
        &catalog,
        LogicalPlanBuilder::scan("sales")
            .aggregate(vec![col("cust_id")], vec![(AggExpr::Sum(col("amount")), "total")]),
        2,
    );

    let mut config = config(2);
    config.worker.batch_size_rows = 1;
    config.worker.min_batch_size_rows = 1;
    let cluster = LocalCluster::start(config, catalog).await.unwrap();
    let query_id = cluster.submit(&plan).await.unwrap();
    for _ in 0..2_000 {
        let status = cluster.status(query_id).await.unwrap();
        if status.stage_metrics[&1].running_tasks > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(cluster.cancel(query_id).await.unwrap(), QueryState::Cancelled);
    let err = cluster.wait(query_id).await.unwrap_err();
    assert!(matches!(err, QuarryError::Cancelled(_)), "{err}");

    // Workers drop the cancelled tasks instead of running them to the end.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = cluster.status(query_id).await.unwrap();
    assert!(status.stage_metrics[&1].succeeded_tasks < 3);
    assert_eq!(status.stage_metrics[&0].succeeded_tasks, 0);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_query_is_cancelled() {
    init_tracing();
    let catalog = wide_catalog(100_000);
    let plan = physical(
        &catalog,
        LogicalPlanBuilder::scan("sales")
            .aggregate(vec![col("cust_id")], vec![(AggExpr::Sum(col("amount")), "total")]),
        2,
    );

    let mut config = config(2);
    config.worker.batch_size_rows = 1;
    config.worker.min_batch_size_rows = 1;
    config.query_timeout_ms = 50;
    let cluster = LocalCluster::start(config, catalog).await.unwrap();
    let query_id = cluster.submit(&plan).await.unwrap();
    let err = cluster.wait(query_id).await.unwrap_err();
    assert!(matches!(err, QuarryError::QueryFailed(ref m) if m.contains("50 ms")), "{err}");
    let status = cluster.status(query_id).await.unwrap();
    assert_eq!(status.state, QueryState::Cancelled);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn count_distinct_runs_in_one_phase_across_workers() {
    init_tracing();
    let catalog = catalog(25);
    let plan = physical(
        &catalog,
        LogicalPlanBuilder::scan("sales").aggregate(
            vec![col("region")],
            vec![(AggExpr::CountDistinct(col("cust_id")), "customers")],
        ),
        3,
    );
    let expected = sorted_rows(&run_local(Arc::clone(&catalog), &plan).await);
    assert_eq!(expected.len(), 5);

    let cluster = LocalCluster::start(config(2), catalog).await.unwrap();
    let batches = cluster.execute(&plan).await.unwrap();
    assert_eq!(sorted_rows(&batches), expected);
    cluster.shutdown().await;
}
