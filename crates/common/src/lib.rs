//! Shared configuration, error types, IDs, memory accounting and metrics for Quarry crates.
//!
//! Architecture role:
//! - defines engine configuration passed across layers
//! - provides common [`QuarryError`] / [`Result`] contracts
//! - owns the columnar buffer pool every query draws memory from
//! - hosts the prometheus metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod memory;
pub mod metrics;

pub use config::EngineConfig;
pub use error::{QuarryError, Result};
pub use ids::*;
pub use memory::{BufferPool, MemoryPressure, MemoryPressureSignal, MemoryReservation, QueryMemory};
pub use metrics::MetricsRegistry;
