//! Columnar buffer pool accounting.
//!
//! Every batch an operator builds or holds is charged to a [`QueryMemory`]
//! tracker, which draws from one shared [`BufferPool`]. A reservation that
//! would cross either the per-query limit or the pool ceiling fails with
//! [`QuarryError::OutOfMemory`] and leaves all counters untouched; the caller
//! decides whether to spill or reject.
//!
//! The pool also derives a [`MemoryPressureSignal`] from its fill level so
//! producers can shrink batch sizes before reservations start failing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{QuarryError, Result};
use crate::ids::QueryId;
use crate::metrics::global_metrics;

/// Pressure level derived from pool usage vs ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    /// Plenty of budget available.
    Normal,
    /// Budget is tight; prefer smaller batches.
    Elevated,
    /// Budget is heavily constrained.
    Critical,
}

/// Runtime hints derived from memory pressure.
#[derive(Debug, Clone, Copy)]
pub struct MemoryPressureSignal {
    /// Pressure classification.
    pub pressure: MemoryPressure,
    /// Bytes still available in the pool.
    pub available_bytes: usize,
    /// Recommended target batch size.
    pub suggested_batch_size_rows: usize,
}

/// Shared engine-level buffer pool with a hard ceiling.
#[derive(Debug)]
pub struct BufferPool {
    ceiling_bytes: usize,
    in_use_bytes: AtomicUsize,
    base_batch_size_rows: usize,
    min_batch_size_rows: usize,
    queries: Mutex<HashMap<QueryId, Weak<QueryMemory>>>,
}

impl BufferPool {
    /// Create a pool with a ceiling and batch-size bounds.
    #[must_use]
    pub fn new(
        ceiling_bytes: usize,
        base_batch_size_rows: usize,
        min_batch_size_rows: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            ceiling_bytes,
            in_use_bytes: AtomicUsize::new(0),
            base_batch_size_rows: base_batch_size_rows.max(1),
            min_batch_size_rows: min_batch_size_rows.max(1),
            queries: Mutex::new(HashMap::new()),
        })
    }

    /// Pool without a ceiling. Query limits still apply.
    #[must_use]
    pub fn unbounded() -> Arc<Self> {
        Self::new(usize::MAX, 8192, 1024)
    }

    pub fn ceiling_bytes(&self) -> usize {
        self.ceiling_bytes
    }

    /// Bytes currently reserved across all queries.
    pub fn in_use(&self) -> usize {
        self.in_use_bytes.load(Ordering::Acquire)
    }

    /// Register a tracker for one query.
    ///
    /// Registering the same query twice returns the live tracker, so every
    /// task of a query on one worker shares a single limit.
    pub fn register_query(self: &Arc<Self>, query_id: QueryId, limit_bytes: usize) -> Arc<QueryMemory> {
        let mut queries = lock_queries(&self.queries);
        if let Some(existing) = queries.get(&query_id).and_then(Weak::upgrade) {
            return existing;
        }
        queries.retain(|_, tracker| tracker.strong_count() > 0);
        let tracker = Arc::new(QueryMemory {
            pool: Arc::clone(self),
            query_id,
            limit_bytes,
            in_use_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
        });
        queries.insert(query_id, Arc::downgrade(&tracker));
        tracker
    }

    /// Outstanding bytes of one query, or `None` when it holds no tracker.
    pub fn query_in_use(&self, query_id: QueryId) -> Option<usize> {
        lock_queries(&self.queries)
            .get(&query_id)
            .and_then(Weak::upgrade)
            .map(|q| q.in_use())
    }

    /// Current pressure guidance.
    pub fn pressure(&self) -> MemoryPressureSignal {
        let in_use = self.in_use();
        let available = self.ceiling_bytes.saturating_sub(in_use);
        if self.ceiling_bytes == usize::MAX || self.ceiling_bytes == 0 {
            return MemoryPressureSignal {
                pressure: MemoryPressure::Normal,
                available_bytes: available,
                suggested_batch_size_rows: self.base_batch_size_rows,
            };
        }
        let ratio = in_use as f64 / self.ceiling_bytes as f64;
        if ratio < 0.60 {
            MemoryPressureSignal {
                pressure: MemoryPressure::Normal,
                available_bytes: available,
                suggested_batch_size_rows: self.base_batch_size_rows,
            }
        } else if ratio < 0.85 {
            MemoryPressureSignal {
                pressure: MemoryPressure::Elevated,
                available_bytes: available,
                suggested_batch_size_rows: (self.base_batch_size_rows / 2)
                    .max(self.min_batch_size_rows),
            }
        } else {
            MemoryPressureSignal {
                pressure: MemoryPressure::Critical,
                available_bytes: available,
                suggested_batch_size_rows: (self.base_batch_size_rows / 4)
                    .max(self.min_batch_size_rows),
            }
        }
    }

    fn try_acquire(&self, bytes: usize) -> Result<()> {
        loop {
            let current = self.in_use_bytes.load(Ordering::Acquire);
            let available = self.ceiling_bytes.saturating_sub(current);
            if bytes > available {
                return Err(QuarryError::OutOfMemory {
                    requested: bytes,
                    available,
                    scope: "pool".to_string(),
                });
            }
            if self
                .in_use_bytes
                .compare_exchange(current, current + bytes, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                global_metrics().set_pool_bytes_in_use(current + bytes);
                return Ok(());
            }
        }
    }

    fn release(&self, bytes: usize) {
        let prev = self.in_use_bytes.fetch_sub(bytes, Ordering::AcqRel);
        global_metrics().set_pool_bytes_in_use(prev.saturating_sub(bytes));
    }
}

fn lock_queries(
    queries: &Mutex<HashMap<QueryId, Weak<QueryMemory>>>,
) -> std::sync::MutexGuard<'_, HashMap<QueryId, Weak<QueryMemory>>> {
    queries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-query memory tracker drawing from a [`BufferPool`].
#[derive(Debug)]
pub struct QueryMemory {
    pool: Arc<BufferPool>,
    query_id: QueryId,
    limit_bytes: usize,
    in_use_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
}

impl QueryMemory {
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    pub fn in_use(&self) -> usize {
        self.in_use_bytes.load(Ordering::Acquire)
    }

    /// Highest `in_use` observed so far.
    pub fn peak(&self) -> usize {
        self.peak_bytes.load(Ordering::Acquire)
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Reserve `bytes`, returning an RAII guard that releases them on drop.
    pub fn try_reserve(self: &Arc<Self>, bytes: usize) -> Result<MemoryReservation> {
        self.try_acquire(bytes)?;
        Ok(MemoryReservation {
            query: Arc::clone(self),
            size: bytes,
        })
    }

    /// Empty reservation to be grown incrementally.
    pub fn empty_reservation(self: &Arc<Self>) -> MemoryReservation {
        MemoryReservation {
            query: Arc::clone(self),
            size: 0,
        }
    }

    fn try_acquire(&self, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let next = loop {
            let current = self.in_use_bytes.load(Ordering::Acquire);
            let available = self.limit_bytes.saturating_sub(current);
            if bytes > available {
                return Err(QuarryError::OutOfMemory {
                    requested: bytes,
                    available,
                    scope: format!("query {}", self.query_id),
                });
            }
            if self
                .in_use_bytes
                .compare_exchange(current, current + bytes, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break current + bytes;
            }
        };
        if let Err(e) = self.pool.try_acquire(bytes) {
            self.in_use_bytes.fetch_sub(bytes, Ordering::AcqRel);
            return Err(e);
        }
        self.peak_bytes.fetch_max(next, Ordering::AcqRel);
        Ok(())
    }

    fn release(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.in_use_bytes.fetch_sub(bytes, Ordering::AcqRel);
        self.pool.release(bytes);
    }
}

/// RAII reservation that releases its bytes on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    query: Arc<QueryMemory>,
    size: usize,
}

impl MemoryReservation {
    pub fn size(&self) -> usize {
        self.size
    }

    /// Grow the reservation. On failure the size is unchanged.
    pub fn try_grow(&mut self, bytes: usize) -> Result<()> {
        self.query.try_acquire(bytes)?;
        self.size += bytes;
        Ok(())
    }

    /// Release up to `bytes` early.
    pub fn shrink(&mut self, bytes: usize) {
        let bytes = bytes.min(self.size);
        self.query.release(bytes);
        self.size -= bytes;
    }

    /// Resize to exactly `bytes`, growing or shrinking as needed.
    pub fn try_resize(&mut self, bytes: usize) -> Result<()> {
        if bytes > self.size {
            self.try_grow(bytes - self.size)
        } else {
            self.shrink(self.size - bytes);
            Ok(())
        }
    }

    /// Absorb `other`, which must belong to the same query, without touching
    /// the pool.
    pub fn merge(&mut self, mut other: MemoryReservation) {
        debug_assert!(Arc::ptr_eq(&self.query, &other.query));
        self.size += other.size;
        other.size = 0;
    }

    /// Release everything held so far.
    pub fn free(&mut self) {
        self.shrink(self.size);
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.free();
    }
}
