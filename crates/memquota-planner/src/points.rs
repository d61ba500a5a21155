//! Injection points: where the planner put watchdog calls.
//!
//! Compile-time only. The report exists for `explain` output and tests; the
//! interpreter never sees it.

use std::fmt;

use memquota_core::ast::LoopKind;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum InjectionKind {
    /// Watchdog construction + `init()` at the entry routine.
    EntryInit,
    /// `check()` at the start of a method body.
    MethodEntry,
    /// `check()` at the start of every iteration.
    LoopBody { loop_kind: LoopKind },
    /// `check()` at the start of a closure body.
    ClosureBody,
}

impl InjectionKind {
    pub fn is_check(self) -> bool {
        !matches!(self, InjectionKind::EntryInit)
    }
}

impl fmt::Display for InjectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InjectionKind::EntryInit => f.write_str("init"),
            InjectionKind::MethodEntry => f.write_str("method entry check"),
            InjectionKind::LoopBody { loop_kind } => {
                write!(f, "{} body check", loop_kind.as_str())
            }
            InjectionKind::ClosureBody => f.write_str("closure body check"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionPoint {
    pub kind: InjectionKind,
    /// Path to the construct, e.g. `Script::run/for#0/closure#1`.
    pub site: String,
}

impl fmt::Display for InjectionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<24} {}", self.kind.to_string(), self.site)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionReport {
    pub points: Vec<InjectionPoint>,
}

impl InjectionReport {
    pub fn push(&mut self, kind: InjectionKind, site: String) {
        self.points.push(InjectionPoint { kind, site });
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InjectionPoint> {
        self.points.iter()
    }

    /// Number of `check()` call sites (everything but the init sequence).
    pub fn check_count(&self) -> usize {
        self.points.iter().filter(|p| p.kind.is_check()).count()
    }

    pub fn count(&self, kind: InjectionKind) -> usize {
        self.points.iter().filter(|p| p.kind == kind).count()
    }

    pub fn sites(&self, kind: InjectionKind) -> Vec<&str> {
        self.points
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.site.as_str())
            .collect()
    }
}
