//! Quota check injection.
//!
//! Placement rules, applied to every class of the unit:
//! - entry routine (`run`, no parameters, script class): prepend the
//!   watchdog init sequence, never a plain check;
//! - every loop body at any depth: prepend a check, so it runs per iteration;
//! - every other method that is not static, not synthetic and has a body:
//!   prepend a check; static and synthetic methods are not descended into;
//! - every closure body: prepend a check, unconditionally;
//! - fields, properties and annotations are never visited.
//!
//! A unit that already carries `QuotaInit` or `QuotaCheck` anywhere, fields
//! and static methods included, is refused. Rendered output of an earlier
//! pass goes through `reinstrument`, which strips it first.
//!
//! Each qualifying construct is wrapped exactly once, independently of the
//! others, so nested constructs each get their own check.

use std::sync::Arc;

use memquota_core::ast::{
    wrap_stmt, Annotation, Block, ClassDecl, Closure, FieldDecl, MethodDecl, Program, Stmt,
};
use memquota_core::config::{QuotaConfig, DEFAULT_ENTRY_METHOD};
use memquota_core::counter::AllocationCounter;
use memquota_core::visit::{
    walk_block, walk_class, walk_closure, walk_field, walk_method, walk_stmt, VisitMut,
};
use memquota_mem::ensure_accounting;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::points::{InjectionKind, InjectionReport};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("allocation accounting: {0}")]
    Accounting(#[from] memquota_mem::Error),

    #[error(transparent)]
    Config(#[from] memquota_core::error::Error),

    /// Quota statements are placed by the planner only. A unit that already
    /// carries one could replace the host's watchdog.
    #[error("program already contains quota statements (in {site})")]
    AlreadyInstrumented { site: String },
}

/// Where the init sequence went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRef {
    pub class: String,
    pub method: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentedProgram {
    pub program: Program,
    pub report: InjectionReport,
    /// `None` when the unit has no entry routine; its checks then fail with
    /// `InvalidState` unless a host initializes a watchdog some other way.
    pub entry: Option<EntryRef>,
}

/// Instrument `program` with the default entry routine name.
pub fn instrument(
    program: Program,
    quota: &QuotaConfig,
    counter: &dyn AllocationCounter,
) -> Result<InstrumentedProgram, PlanError> {
    InjectionPlanner::new(quota.clone()).instrument(program, counter)
}

#[derive(Debug, Clone)]
pub struct InjectionPlanner {
    quota: QuotaConfig,
    entry_method: String,
}

impl InjectionPlanner {
    pub fn new(quota: QuotaConfig) -> Self {
        Self {
            quota,
            entry_method: DEFAULT_ENTRY_METHOD.to_string(),
        }
    }

    pub fn with_entry_method(mut self, entry_method: impl Into<String>) -> Self {
        self.entry_method = entry_method.into();
        self
    }

    /// Probe the counter, validate the quota, then rewrite the tree.
    ///
    /// Setup problems fail the whole pass; nothing is partially instrumented.
    pub fn instrument(
        &self,
        mut program: Program,
        counter: &dyn AllocationCounter,
    ) -> Result<InstrumentedProgram, PlanError> {
        ensure_accounting(counter)?;
        self.quota.validate()?;
        if let Some(site) = find_quota_statement(&mut program) {
            return Err(PlanError::AlreadyInstrumented { site });
        }

        let mut injector = QuotaInjector::new(&self.quota, &self.entry_method);
        injector.visit_program(&mut program);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            points = injector.report.len(),
            checks = injector.report.check_count(),
            entry = ?injector.entry,
            "instrumented program"
        );

        Ok(InstrumentedProgram {
            program,
            report: injector.report,
            entry: injector.entry,
        })
    }

    /// Instrument a program that was rendered after an earlier pass (for
    /// example by `explain --emit`). Every quota statement it carries is
    /// dropped first, so the limit and handler always come from this planner.
    pub fn reinstrument(
        &self,
        mut program: Program,
        counter: &dyn AllocationCounter,
    ) -> Result<InstrumentedProgram, PlanError> {
        strip_instrumentation(&mut program);
        self.instrument(program, counter)
    }
}

/// Remove every `QuotaInit` and `QuotaCheck`, undoing the loop body wrappers
/// `instrument` adds. Returns the number of statements removed.
pub fn strip_instrumentation(program: &mut Program) -> usize {
    let mut stripper = QuotaStripper(0);
    stripper.visit_program(program);
    stripper.0
}

fn is_quota_stmt(stmt: &Stmt) -> bool {
    matches!(stmt, Stmt::QuotaInit(_) | Stmt::QuotaCheck)
}

/// First place a quota statement appears, searching every member including
/// fields, annotations and static methods.
fn find_quota_statement(program: &mut Program) -> Option<String> {
    let mut scan = QuotaScan::default();
    scan.visit_program(program);
    scan.found
}

#[derive(Default)]
struct QuotaScan {
    class: String,
    member: String,
    found: Option<String>,
}

impl QuotaScan {
    fn site(&self) -> String {
        format!("{}::{}", self.class, self.member)
    }
}

impl VisitMut for QuotaScan {
    fn visit_class(&mut self, class: &mut ClassDecl) {
        self.class = class.name.clone();
        self.member.clear();
        walk_class(self, class);
    }

    fn visit_field(&mut self, field: &mut FieldDecl) {
        self.member = field.name.clone();
        walk_field(self, field);
    }

    fn visit_property(&mut self, property: &mut FieldDecl) {
        self.member = property.name.clone();
        walk_field(self, property);
    }

    fn visit_method(&mut self, method: &mut MethodDecl) {
        self.member = method.name.clone();
        walk_method(self, method);
    }

    fn visit_stmt(&mut self, stmt: &mut Stmt) {
        if self.found.is_none() && is_quota_stmt(stmt) {
            self.found = Some(self.site());
        }
        walk_stmt(self, stmt);
    }
}

struct QuotaStripper(usize);

impl VisitMut for QuotaStripper {
    fn visit_block(&mut self, block: &mut Block) {
        let before = block.stmts.len();
        block.stmts.retain(|s| !is_quota_stmt(s));
        self.0 += before - block.stmts.len();
        walk_block(self, block);
    }

    fn visit_stmt(&mut self, stmt: &mut Stmt) {
        // `{ check; body }` as produced by `wrap_stmt`.
        if let Stmt::Block(b) = stmt {
            if b.stmts.len() == 2 && b.stmts[0] == Stmt::QuotaCheck {
                if let Some(inner) = b.stmts.pop() {
                    *stmt = inner;
                    self.0 += 1;
                    return self.visit_stmt(stmt);
                }
            }
        }
        if is_quota_stmt(stmt) {
            // A loop body that is a bare quota statement.
            *stmt = Stmt::Block(Block::default());
            self.0 += 1;
            return;
        }
        walk_stmt(self, stmt);
    }
}

struct QuotaInjector<'a> {
    quota: &'a QuotaConfig,
    entry_method: &'a str,
    current_class: Option<(String, bool)>,
    /// Site path segments, e.g. ["Script::run", "for#0"].
    path: Vec<String>,
    /// Per-method sequence for naming loops and closures.
    seq: usize,
    report: InjectionReport,
    entry: Option<EntryRef>,
}

impl<'a> QuotaInjector<'a> {
    fn new(quota: &'a QuotaConfig, entry_method: &'a str) -> Self {
        Self {
            quota,
            entry_method,
            current_class: None,
            path: Vec::new(),
            seq: 0,
            report: InjectionReport::default(),
            entry: None,
        }
    }

    fn is_entry(&self, method: &MethodDecl) -> bool {
        let in_script = matches!(self.current_class, Some((_, true)));
        in_script && method.name == self.entry_method && method.params.is_empty()
    }

    fn class_name(&self) -> &str {
        self.current_class
            .as_ref()
            .map(|(name, _)| name.as_str())
            .unwrap_or("<unit>")
    }

    fn site(&self) -> String {
        self.path.join("/")
    }

    fn next_segment(&mut self, label: &str) -> String {
        let segment = format!("{}#{}", label, self.seq);
        self.seq += 1;
        segment
    }

    fn enter_method(&mut self, method: &MethodDecl) {
        self.seq = 0;
        self.path.clear();
        self.path
            .push(format!("{}::{}", self.class_name(), method.name));
    }
}

impl VisitMut for QuotaInjector<'_> {
    fn visit_class(&mut self, class: &mut ClassDecl) {
        self.current_class = Some((class.name.clone(), class.script));
        walk_class(self, class);
        self.current_class = None;
    }

    fn visit_annotations(&mut self, _annotations: &mut Vec<Annotation>) {}

    fn visit_field(&mut self, _field: &mut FieldDecl) {}

    fn visit_property(&mut self, _property: &mut FieldDecl) {}

    fn visit_method(&mut self, method: &mut MethodDecl) {
        self.enter_method(method);

        if self.is_entry(method) {
            let body = method.body.get_or_insert_with(Block::default);
            body.prepend(Stmt::QuotaInit(self.quota.clone()));
            self.report.push(InjectionKind::EntryInit, self.site());
            self.entry = Some(EntryRef {
                class: self.class_name().to_string(),
                method: method.name.clone(),
            });
            walk_method(self, method);
            return;
        }

        let m = method.modifiers;
        if m.is_synthetic || m.is_static {
            return;
        }
        if !m.is_abstract {
            if let Some(body) = &mut method.body {
                body.prepend(Stmt::QuotaCheck);
                self.report.push(InjectionKind::MethodEntry, self.site());
            }
        }
        walk_method(self, method);
    }

    fn visit_stmt(&mut self, stmt: &mut Stmt) {
        let Some((loop_kind, body)) = stmt.loop_body_mut() else {
            walk_stmt(self, stmt);
            return;
        };

        wrap_stmt(body, Stmt::QuotaCheck);
        let segment = self.next_segment(loop_kind.as_str());
        self.path.push(segment);
        self.report
            .push(InjectionKind::LoopBody { loop_kind }, self.site());
        walk_stmt(self, stmt);
        self.path.pop();
    }

    fn visit_closure(&mut self, closure: &mut Closure) {
        Arc::make_mut(&mut closure.body).prepend(Stmt::QuotaCheck);
        let segment = self.next_segment("closure");
        self.path.push(segment);
        self.report.push(InjectionKind::ClosureBody, self.site());
        walk_closure(self, closure);
        self.path.pop();
    }
}
