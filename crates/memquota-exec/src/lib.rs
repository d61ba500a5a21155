#![forbid(unsafe_code)]
//! memquota-exec: run instrumented programs and report on them.
//!
//! - `handlers`: (type, method) → infringement handler registry.
//! - `interp`: tree-walking interpreter; executes `QuotaInit`/`QuotaCheck`
//!   against a per-run `QuotaWatchdog`.
//! - `runtime`: `Engine` = resolve handler, instrument, hash, run, report.
//!
//! A run executes on a thread of its own, sized by `EngineConfig::stack_size`,
//! and the caller blocks until it finishes. A quota stop is an error that
//! surfaces from `Engine::run` unmodified.

pub mod handlers;
pub mod interp;
pub mod metrics;
pub mod runtime;
pub mod value;

pub use handlers::{HandlerFn, HandlerRegistry, Visibility};
pub use interp::Interpreter;
pub use runtime::{Engine, ExecError, PreparedScript};
pub use value::Value;
