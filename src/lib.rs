//! Cohort – instruction extensions for a tick-driven logic runtime
//!
//! This crate extends a per-entity, register-based logic VM with:
//! - Named value stacks shared across program instances, with timeout expiry
//! - A nested-call instruction that drives an independently compiled program
//!   as a depth- and budget-bounded sub-interpreter
//! - Group pools that let many program instances claim, share, and release a
//!   bounded set of controllable units under named or per-owner scopes
//! - A low-frequency reclamation task that reaps stale stack slots and
//!   abandoned pool claims

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Per-instance VM layer: values, programs, processors, nested calls
pub mod logic;
/// Shared services: unit world, stacks, pools, reclamation, orchestration
pub mod runtime;

// Re-export key types for convenience
pub use logic::{LValue, Processor, Program};
pub use runtime::{Runtime, RuntimeConfig};

/// Current version of the Cohort runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
