#![forbid(unsafe_code)]
//! memquota-planner: from (YAML) programs → instrumented programs.
//!
//! Design:
//! - We reuse `memquota-core::ast::Program` as the editable tree.
//! - This crate adds:
//!     * a tiny YAML front end → `Program` (+ the quota declaration)
//!     * the injection pass (`inject`) that places watchdog init/check
//!       statements so no loop, method or closure can allocate without
//!       reaching a check
//!     * an `InjectionReport` describing every point it inserted
//!
//! The pass runs once per compiled unit, before execution.

pub mod dsl;
pub mod inject;
pub mod points;

pub use dsl::yaml::{parse_yaml_program, to_yaml_program, ParsedProgram, QuotaSection};
pub use inject::{
    instrument, strip_instrumentation, EntryRef, InjectionPlanner, InstrumentedProgram, PlanError,
};
pub use points::{InjectionKind, InjectionPoint, InjectionReport};
