use std::sync::Arc;

use arrow_schema::SchemaRef;
use quarry_common::Result;
use quarry_execution::ExecNode;
use serde::{Deserialize, Serialize};

/// Lightweight table statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    /// Row count, if known.
    pub rows: Option<u64>,
    /// Buffer bytes, if known.
    pub bytes: Option<u64>,
}

/// A partitioned table that can be scanned one partition at a time.
pub trait TableProvider: Send + Sync {
    /// Full table schema.
    fn schema(&self) -> SchemaRef;

    /// Number of partitions; each one is scanned by a separate task.
    fn partition_count(&self) -> usize;

    /// Best-effort statistics.
    fn statistics(&self) -> TableStats {
        TableStats::default()
    }

    /// Build the leaf operator for `partition`, keeping only `projection`
    /// columns when given.
    ///
    /// # Errors
    /// Returns an error for an out-of-range partition or unknown projected
    /// column.
    fn scan(&self, partition: usize, projection: Option<&[String]>) -> Result<Arc<dyn ExecNode>>;
}
