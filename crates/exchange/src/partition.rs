//! Partition descriptors: which worker hosts each consumer partition.

use quarry_common::{QuarryError, QueryId, Result, WorkerId};
use quarry_planner::PartitioningSpec;
use serde::{Deserialize, Serialize};

/// Rows routed to one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionRange {
    /// `hash(key) % of == bucket`.
    HashBucket { bucket: usize, of: usize },
    /// Keys in `[low, high)`; `None` is unbounded. Partition 0 also owns
    /// NULL keys.
    KeyRange { low: Option<i64>, high: Option<i64> },
    /// Every row.
    All,
}

/// Maps one consumer partition to the worker that receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub partition: usize,
    pub range: PartitionRange,
    pub worker: WorkerId,
}

/// Immutable descriptor table for one stage's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMap {
    query_id: QueryId,
    stage_id: u64,
    descriptors: Vec<PartitionDescriptor>,
}

impl PartitionMap {
    /// Assign every partition of `spec` to `workers` round robin.
    ///
    /// # Errors
    /// `WorkerUnreachable` when there is no worker to assign to.
    pub fn assign(
        query_id: QueryId,
        stage_id: u64,
        spec: &PartitioningSpec,
        workers: &[WorkerId],
    ) -> Result<Self> {
        if workers.is_empty() {
            return Err(QuarryError::WorkerUnreachable(format!(
                "no live worker to host stage {stage_id} of query {query_id}"
            )));
        }
        let count = spec.partition_count();
        let descriptors = (0..count)
            .map(|partition| PartitionDescriptor {
                partition,
                range: range_of(spec, partition),
                worker: workers[partition % workers.len()].clone(),
            })
            .collect();
        Ok(Self {
            query_id,
            stage_id,
            descriptors,
        })
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn stage_id(&self) -> u64 {
        self.stage_id
    }

    pub fn partition_count(&self) -> usize {
        self.descriptors.len()
    }

    pub fn descriptors(&self) -> &[PartitionDescriptor] {
        &self.descriptors
    }

    /// Worker hosting `partition`.
    pub fn worker_for(&self, partition: usize) -> Result<&WorkerId> {
        self.descriptors
            .get(partition)
            .map(|d| &d.worker)
            .ok_or_else(|| {
                QuarryError::Execution(format!(
                    "stage {} has no partition {partition}",
                    self.stage_id
                ))
            })
    }

    /// Partitions hosted by `worker`.
    pub fn partitions_on(&self, worker: &WorkerId) -> Vec<usize> {
        self.descriptors
            .iter()
            .filter(|d| &d.worker == worker)
            .map(|d| d.partition)
            .collect()
    }
}

fn range_of(spec: &PartitioningSpec, partition: usize) -> PartitionRange {
    match spec {
        PartitioningSpec::HashKeys { .. } => PartitionRange::HashBucket {
            bucket: partition,
            of: spec.partition_count(),
        },
        PartitioningSpec::Range { bounds, .. } => PartitionRange::KeyRange {
            low: partition.checked_sub(1).and_then(|i| bounds.get(i).copied()),
            high: bounds.get(partition).copied(),
        },
        PartitioningSpec::Single => PartitionRange::All,
    }
}
