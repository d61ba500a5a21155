//! memquota: per-thread memory allocation quotas for interpreted scripts.
//!
//! Facade over the workspace crates. A host installs [`CountingAllocator`] as
//! its `#[global_allocator]`, builds an [`Engine`] and runs programs through it:
//!
//! ```no_run
//! use std::sync::Arc;
//! use memquota::{Engine, EngineConfig, HandlerRegistry, ThreadAllocCounter};
//!
//! let yaml = std::fs::read_to_string("script.yaml").unwrap();
//! let parsed = memquota::planner::parse_yaml_program(&yaml).unwrap();
//! let engine = Engine::new(
//!     EngineConfig::default(),
//!     HandlerRegistry::builtin(),
//!     Arc::new(ThreadAllocCounter),
//! );
//! let (value, report) = engine.execute(parsed.program).unwrap();
//! println!("{value} after {} checks", report.quota.map_or(0, |q| q.checks));
//! ```

pub use memquota_exec as exec;
pub use memquota_mem as mem;
pub use memquota_planner as planner;

pub use memquota_core::ast::Program;
pub use memquota_core::config::{EngineConfig, QuotaConfig};
pub use memquota_core::manifest::{QuotaSnapshot, RunOutcome, RunReport};
pub use memquota_exec::{Engine, ExecError, HandlerRegistry, Value};
pub use memquota_mem::{CountingAllocator, QuotaWatchdog, ThreadAllocCounter};
