//! Exchange layer: moves shuffled batches between workers.
//!
//! Architecture role:
//! - [`partition`] fixes which worker hosts each consumer partition
//! - [`frame`] is the wire codec (JSON header plus Arrow IPC payload)
//! - [`hub`] delivers frames with a bounded in-flight window per destination
//! - [`sender`] numbers and retries producer frames
//! - [`spool`] dedups, buffers and completes partitions on the receiver
//!
//! Delivery is at-least-once; `(producer_task, seq)` makes resends idempotent.

pub mod frame;
pub mod hub;
pub mod partition;
pub mod sender;
pub mod spool;

use serde::{Deserialize, Serialize};

use quarry_common::{QuarryError, Result};

pub use frame::{ExchangeFrame, FrameHeader, FrameKind};
pub use hub::{ExchangeHub, FrameTransport, WorkerInbox};
pub use partition::{PartitionDescriptor, PartitionMap, PartitionRange};
pub use sender::{ExchangeSender, SendSummary};
pub use spool::{IngestOutcome, PartitionSpool, SpoolKey};

/// Exchange tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Frames that may be queued for one destination before senders wait.
    pub inbox_capacity: usize,
    /// Delivery attempts per frame before `WorkerUnreachable`.
    pub max_send_attempts: u32,
    /// Base delay between attempts, doubled each retry.
    pub retry_backoff_ms: u64,
    /// How long a consumer task waits for its partition to complete.
    pub receive_timeout_ms: u64,
    /// Per-query cap on spooled bytes when the query has no tracker yet.
    pub spool_query_limit_bytes: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 16,
            max_send_attempts: 3,
            retry_backoff_ms: 10,
            receive_timeout_ms: 30_000,
            spool_query_limit_bytes: 256 * 1024 * 1024,
        }
    }
}

impl ExchangeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.inbox_capacity == 0 {
            return Err(QuarryError::InvalidConfig(
                "exchange inbox_capacity must be > 0".to_string(),
            ));
        }
        if self.max_send_attempts == 0 {
            return Err(QuarryError::InvalidConfig(
                "exchange max_send_attempts must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
