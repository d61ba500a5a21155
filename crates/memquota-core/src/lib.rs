#![forbid(unsafe_code)]
//! memquota-core: shared vocabulary for the memory quota engine.
//!
//! Responsibilities:
//! - The editable program representation (`ast`) and a mutable visitor over
//!   it (`visit`). The planner rewrites this tree, the exec crate runs it.
//! - The allocation counter *interface* (`counter`). Implementations live in
//!   `memquota-mem`.
//! - Strongly-typed thread ids, quota configuration, hashing and run reports.
//!
//! **No allocator hooks, no interpreter** here.

pub mod ast;
pub mod config;
pub mod counter;
pub mod error;
pub mod hash;
pub mod id;
pub mod manifest;
pub mod visit;

/// Engine version stamped into run reports.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
