//! Query plan representation.
//!
//! - [`logical_plan`]: expression trees and relational operators as built by a client
//! - [`physical_plan`]: executable operator tree with explicit exchange boundaries
//! - [`physical_planner`]: lowers logical plans and inserts exchanges
//! - [`explain`]: human-readable plan rendering

pub mod explain;
pub mod logical_plan;
pub mod physical_plan;
pub mod physical_planner;

pub use explain::{explain_logical, explain_physical};
pub use logical_plan::*;
pub use physical_plan::*;
pub use physical_planner::{PhysicalPlannerConfig, PlanningContext, create_physical_plan};
