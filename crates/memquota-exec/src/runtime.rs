//! Runtime: prepare a program (resolve handler, instrument, hash) and run it,
//! emitting a `RunReport`.
//!
//! Setup errors (bad quota, unknown or private handler, no accounting) come
//! out of `prepare`. Run errors, including a handler stopping the script,
//! come out of `run` exactly as raised.
//!
//! Each run gets its own thread with `EngineConfig::stack_size` of stack, so
//! the interpreter's depth limits hold regardless of the caller's stack. The
//! quota then applies to that thread's allocations.

use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use memquota_core::ast::Program;
use memquota_core::config::EngineConfig;
use memquota_core::counter::AllocationCounter;
use memquota_core::hash::{hash_serde, Hash256};
use memquota_core::manifest::{QuotaSnapshot, RunOutcome, RunReport};

use memquota_mem::{resolve_handler, HandlerError};
use memquota_planner::{EntryRef, InjectionPlanner, InjectionReport, PlanError};

use crate::handlers::HandlerRegistry;
use crate::interp::Interpreter;
use crate::metrics;
use crate::value::Value;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid configuration: {0}")]
    Config(#[from] memquota_core::error::Error),
    #[error("planning: {0}")]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Quota(#[from] memquota_mem::Error),
    #[error("script threw: {0}")]
    Thrown(String),
    #[error("no entry routine '{0}' without parameters on a script class")]
    NoEntry(String),
    #[error("undefined variable '{0}'")]
    Undefined(String),
    #[error("no method '{class}::{method}' taking {arity} argument(s)")]
    NoMethod {
        class: String,
        method: String,
        arity: usize,
    },
    #[error("type error: {0}")]
    Type(String),
    #[error("arithmetic: {0}")]
    Arithmetic(String),
    #[error("index {index} out of bounds for length {len}")]
    OutOfBounds { index: i64, len: usize },
    #[error("call depth exceeded {0}")]
    StackOverflow(usize),
    #[error("statement nesting exceeded {0}")]
    NestingTooDeep(usize),
    #[error("run thread: {0}")]
    Worker(String),
    #[error("'{0}' outside of a loop")]
    StrayJump(&'static str),
    #[error("hashing error: {0}")]
    Hash(String),
}

impl ExecError {
    /// The infringement handler raised its stop signal.
    pub fn is_quota_stop(&self) -> bool {
        matches!(
            self,
            ExecError::Quota(memquota_mem::Error::Handler(HandlerError::Stop { .. }))
        )
    }

    fn outcome(&self) -> RunOutcome {
        if self.is_quota_stop() {
            RunOutcome::Stopped {
                reason: self.to_string(),
            }
        } else {
            RunOutcome::Failed {
                reason: self.to_string(),
            }
        }
    }
}

/// An instrumented program ready to run, plus what the planner did to it.
#[derive(Debug, Clone)]
pub struct PreparedScript {
    pub program: Program,
    pub report: InjectionReport,
    pub entry: EntryRef,
    pub hash: Hash256,
}

/// Engine owns the configuration, handler registry and allocation counter.
pub struct Engine {
    cfg: EngineConfig,
    registry: HandlerRegistry,
    counter: Arc<dyn AllocationCounter>,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        registry: HandlerRegistry,
        counter: Arc<dyn AllocationCounter>,
    ) -> Self {
        Self {
            cfg,
            registry,
            counter,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Validate, resolve the declared handler and instrument `program`.
    pub fn prepare(&self, program: Program) -> Result<PreparedScript, ExecError> {
        self.cfg.validate()?;
        let quota = &self.cfg.quota;
        resolve_handler(&self.registry, &quota.handler_type, &quota.handler_method)?;

        let instrumented = InjectionPlanner::new(quota.clone())
            .with_entry_method(self.cfg.entry_method.clone())
            .instrument(program, self.counter.as_ref())?;
        let entry = instrumented
            .entry
            .ok_or_else(|| ExecError::NoEntry(self.cfg.entry_method.clone()))?;
        let hash =
            hash_serde(&instrumented.program).map_err(|e| ExecError::Hash(e.to_string()))?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            program = %hash,
            points = instrumented.report.len(),
            entry = %format!("{}::{}", entry.class, entry.method),
            "prepared script"
        );

        Ok(PreparedScript {
            program: instrumented.program,
            report: instrumented.report,
            entry,
            hash,
        })
    }

    /// Run and return the script's value with its report.
    pub fn run(&self, prepared: &PreparedScript) -> Result<(Value, RunReport), ExecError> {
        let (result, report) = self.run_with_report(prepared);
        result.map(|v| (v, report))
    }

    /// Run and always produce a report, even when the script is stopped.
    pub fn run_with_report(
        &self,
        prepared: &PreparedScript,
    ) -> (Result<Value, ExecError>, RunReport) {
        let report = RunReport::new(prepared.hash, prepared.report.len(), now_millis());

        let (result, snapshot) = match self.cfg.stack_size {
            Some(stack_size) => self.interpret_on_thread(prepared, stack_size),
            None => self.interpret(prepared),
        };
        let outcome = match &result {
            Ok(_) => RunOutcome::Completed,
            Err(e) => e.outcome(),
        };
        let report = report.finish(now_millis(), outcome, snapshot);

        metrics::emit_run_report(&report);
        (result, report)
    }

    fn interpret(
        &self,
        prepared: &PreparedScript,
    ) -> (Result<Value, ExecError>, Option<QuotaSnapshot>) {
        let mut interp = Interpreter::new(
            &prepared.program,
            Arc::clone(&self.counter),
            &self.registry,
        );
        let result = interp.run_entry(&prepared.entry.class, &prepared.entry.method);
        (result, interp.quota_snapshot())
    }

    fn interpret_on_thread(
        &self,
        prepared: &PreparedScript,
        stack_size: usize,
    ) -> (Result<Value, ExecError>, Option<QuotaSnapshot>) {
        thread::scope(|scope| {
            let spawned = thread::Builder::new()
                .name("memquota-run".into())
                .stack_size(stack_size)
                .spawn_scoped(scope, || self.interpret(prepared));
            let handle = match spawned {
                Ok(handle) => handle,
                Err(e) => return (Err(ExecError::Worker(e.to_string())), None),
            };
            match handle.join() {
                Ok(out) => out,
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "panicked".to_string());
                    (Err(ExecError::Worker(reason)), None)
                }
            }
        })
    }

    /// `prepare` then `run`.
    pub fn execute(&self, program: Program) -> Result<(Value, RunReport), ExecError> {
        let prepared = self.prepare(program)?;
        self.run(&prepared)
    }
}

// --- helpers ---

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
