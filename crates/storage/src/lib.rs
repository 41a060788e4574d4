//! Table sources for Quarry: the provider contract, an in-memory
//! partitioned table and the catalog that resolves names for the planner and
//! the executor.

pub mod catalog;
pub mod mem_table;
pub mod provider;

pub use catalog::Catalog;
pub use mem_table::MemTable;
pub use provider::{TableProvider, TableStats};
