//! Receiver-side buffering, dedup and completion tracking for shuffled
//! partitions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use quarry_common::metrics::global_metrics;
use quarry_common::{BufferPool, MemoryReservation, QuarryError, QueryId, QueryMemory, Result};
use quarry_execution::ExecutionContext;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::frame::{ExchangeFrame, FrameKind};

/// Upper bound between cancellation checks while waiting for a partition.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Address of one shuffled partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpoolKey {
    pub query_id: QueryId,
    pub stage_id: u64,
    pub partition: usize,
}

impl SpoolKey {
    pub fn new(query_id: QueryId, stage_id: u64, partition: usize) -> Self {
        Self {
            query_id,
            stage_id,
            partition,
        }
    }
}

/// Result of handing one frame to the spool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// Already seen `(producer_task, attempt, seq)`, or sent by an attempt
    /// older than the newest one seen; dropped.
    Duplicate,
    /// The query was released; dropped without buffering.
    Released,
}

#[derive(Default)]
struct ProducerState {
    attempt: u32,
    batches: BTreeMap<u64, RecordBatch>,
    expected: Option<u64>,
}

impl ProducerState {
    /// Forget everything an older attempt sent. Returns the bytes freed.
    fn restart(&mut self, attempt: u32) -> usize {
        let freed = self.batches.values().map(RecordBatch::get_array_memory_size).sum();
        self.attempt = attempt;
        self.batches.clear();
        self.expected = None;
        freed
    }

    fn is_complete(&self) -> bool {
        match self.expected {
            Some(n) => self.batches.len() as u64 == n && self.batches.keys().all(|seq| *seq < n),
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
enum SpoolFailure {
    OutOfMemory {
        requested: usize,
        available: usize,
        scope: String,
    },
    Other(String),
}

impl SpoolFailure {
    fn from_error(err: &QuarryError) -> Self {
        match err {
            QuarryError::OutOfMemory {
                requested,
                available,
                scope,
            } => Self::OutOfMemory {
                requested: *requested,
                available: *available,
                scope: scope.clone(),
            },
            other => Self::Other(other.to_string()),
        }
    }

    fn to_error(&self) -> QuarryError {
        match self {
            Self::OutOfMemory {
                requested,
                available,
                scope,
            } => QuarryError::OutOfMemory {
                requested: *requested,
                available: *available,
                scope: scope.clone(),
            },
            Self::Other(msg) => QuarryError::Execution(format!("exchange partition failed: {msg}")),
        }
    }
}

struct PartitionState {
    producers: BTreeMap<u64, ProducerState>,
    schema: Option<SchemaRef>,
    reservation: MemoryReservation,
    failed: Option<SpoolFailure>,
}

impl PartitionState {
    fn is_complete(&self, producers: usize) -> bool {
        self.producers.len() == producers && self.producers.values().all(ProducerState::is_complete)
    }
}

#[derive(Default)]
struct SpoolInner {
    partitions: HashMap<SpoolKey, PartitionState>,
    // Holds each query's tracker alive while its frames are buffered.
    queries: HashMap<QueryId, Arc<QueryMemory>>,
    released: HashSet<QueryId>,
}

/// Buffers received frames per `(query, stage, partition)`.
pub struct PartitionSpool {
    pool: Arc<BufferPool>,
    query_limit_bytes: usize,
    inner: Mutex<SpoolInner>,
    notify: Notify,
}

impl PartitionSpool {
    /// Spool charging buffered batches to `pool`, at most
    /// `query_limit_bytes` per query unless the query already has a tracker
    /// on this pool.
    pub fn new(pool: Arc<BufferPool>, query_limit_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            pool,
            query_limit_bytes,
            inner: Mutex::new(SpoolInner::default()),
            notify: Notify::new(),
        })
    }

    /// Store one frame.
    ///
    /// # Errors
    /// Decode failures, and `OutOfMemory` when the batch cannot be charged;
    /// the partition is then marked failed and its waiters see the error.
    pub fn ingest(&self, frame: ExchangeFrame) -> Result<IngestOutcome> {
        let header = frame.header.clone();
        let key = SpoolKey::new(header.query_id, header.stage_id, header.partition);
        let outcome = {
            let mut guard = lock(&self.inner);
            let inner = &mut *guard;
            if inner.released.contains(&header.query_id) {
                debug!(
                    query_id = %header.query_id,
                    stage_id = header.stage_id,
                    producer_task = header.producer_task,
                    "dropping exchange frame for released query"
                );
                return Ok(IngestOutcome::Released);
            }
            let memory = Arc::clone(inner.queries.entry(header.query_id).or_insert_with(|| {
                self.pool
                    .register_query(header.query_id, self.query_limit_bytes)
            }));
            let state = inner.partitions.entry(key).or_insert_with(|| PartitionState {
                producers: BTreeMap::new(),
                schema: None,
                reservation: memory.empty_reservation(),
                failed: None,
            });
            let result = Self::apply(state, &frame);
            if let Err(e) = &result {
                warn!(
                    query_id = %header.query_id,
                    stage_id = header.stage_id,
                    partition = header.partition,
                    error = %e,
                    "exchange partition failed"
                );
                state.failed = Some(SpoolFailure::from_error(e));
                state.producers.clear();
                state.reservation.free();
            }
            result
        };
        self.notify.notify_waiters();
        let outcome = outcome?;
        global_metrics().record_exchange_receive(
            &header.query_id.to_string(),
            header.stage_id,
            outcome != IngestOutcome::Accepted,
        );
        Ok(outcome)
    }

    fn apply(state: &mut PartitionState, frame: &ExchangeFrame) -> Result<IngestOutcome> {
        if state.failed.is_some() {
            return Ok(IngestOutcome::Duplicate);
        }
        let header = &frame.header;
        let producer = state.producers.entry(header.producer_task).or_default();
        if header.attempt < producer.attempt {
            debug!(
                producer_task = header.producer_task,
                attempt = header.attempt,
                current = producer.attempt,
                "dropping exchange frame from superseded attempt"
            );
            return Ok(IngestOutcome::Duplicate);
        }
        if header.attempt > producer.attempt {
            let freed = producer.restart(header.attempt);
            state.reservation.shrink(freed);
            if freed > 0 {
                debug!(
                    producer_task = header.producer_task,
                    attempt = header.attempt,
                    freed,
                    "exchange producer restarted; discarded earlier attempt"
                );
            }
        }
        match header.kind {
            FrameKind::Data => {
                if producer.batches.contains_key(&header.seq) {
                    debug!(
                        producer_task = header.producer_task,
                        seq = header.seq,
                        "dropping duplicate exchange frame"
                    );
                    return Ok(IngestOutcome::Duplicate);
                }
                let mut batches = frame.batches()?;
                let batch = match (batches.pop(), batches.is_empty()) {
                    (Some(batch), true) => batch,
                    _ => {
                        return Err(QuarryError::Execution(
                            "data frame must carry exactly one batch".to_string(),
                        ))
                    }
                };
                state.reservation.try_grow(batch.get_array_memory_size())?;
                if state.schema.is_none() {
                    state.schema = Some(batch.schema());
                }
                producer.batches.insert(header.seq, batch);
                Ok(IngestOutcome::Accepted)
            }
            FrameKind::End { batches } => {
                if producer.expected.is_some() {
                    return Ok(IngestOutcome::Duplicate);
                }
                producer.expected = Some(batches);
                if state.schema.is_none() {
                    state.schema = Some(frame.schema()?);
                }
                Ok(IngestOutcome::Accepted)
            }
        }
    }

    /// Whether `producers` producers have each delivered `End` and all their
    /// sequence numbers.
    pub fn is_complete(&self, key: SpoolKey, producers: usize) -> bool {
        lock(&self.inner)
            .partitions
            .get(&key)
            .is_some_and(|s| s.failed.is_none() && s.is_complete(producers))
    }

    /// Buffered batches ordered by `(producer_task, seq)`, plus the schema.
    ///
    /// Non-destructive, so a retried consumer task can read the partition
    /// again. Returns `None` before any frame arrived.
    pub fn read_partition(&self, key: SpoolKey) -> Result<Option<(SchemaRef, Vec<RecordBatch>)>> {
        let inner = lock(&self.inner);
        let Some(state) = inner.partitions.get(&key) else {
            return Ok(None);
        };
        if let Some(failure) = &state.failed {
            return Err(failure.to_error());
        }
        let Some(schema) = state.schema.clone() else {
            return Ok(None);
        };
        let batches = state
            .producers
            .values()
            .flat_map(|p| p.batches.values().cloned())
            .collect();
        Ok(Some((schema, batches)))
    }

    /// Wait until the partition is complete, then read it.
    ///
    /// # Errors
    /// `Cancelled` when `ctx` is cancelled, `TaskFailed` after `timeout`, or
    /// the failure recorded by [`PartitionSpool::ingest`].
    pub async fn wait_partition(
        &self,
        key: SpoolKey,
        producers: usize,
        timeout: Duration,
        ctx: &ExecutionContext,
    ) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            ctx.check_cancelled()?;
            {
                let inner = lock(&self.inner);
                if let Some(state) = inner.partitions.get(&key) {
                    if let Some(failure) = &state.failed {
                        return Err(failure.to_error());
                    }
                }
            }
            if self.is_complete(key, producers) {
                if let Some(found) = self.read_partition(key)? {
                    return Ok(found);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(QuarryError::TaskFailed(format!(
                    "timed out waiting for stage {} partition {} of query {}",
                    key.stage_id, key.partition, key.query_id
                )));
            }
            let wake = (deadline - now).min(WAIT_POLL_INTERVAL);
            let _ = tokio::time::timeout(wake, notified).await;
        }
    }

    /// Bytes currently buffered for `query_id`.
    pub fn buffered_bytes(&self, query_id: QueryId) -> usize {
        lock(&self.inner)
            .partitions
            .iter()
            .filter(|(k, _)| k.query_id == query_id)
            .map(|(_, s)| s.reservation.size())
            .sum()
    }

    /// Drop everything buffered for `query_id` and return its memory.
    /// Frames for the query that arrive afterwards are dropped.
    pub fn release_query(&self, query_id: QueryId) {
        let mut inner = lock(&self.inner);
        inner.partitions.retain(|k, _| k.query_id != query_id);
        inner.queries.remove(&query_id);
        inner.released.insert(query_id);
        debug!(query_id = %query_id, "exchange spool released");
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
