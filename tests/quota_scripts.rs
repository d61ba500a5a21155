//! End-to-end quota enforcement with real allocation accounting.
//!
//! Each test runs on its own thread, so per-thread counts don't interfere.

use memquota::planner::parse_yaml_program;
use memquota::planner::PlanError;
use memquota::{
    CountingAllocator, Engine, EngineConfig, ExecError, HandlerRegistry, QuotaConfig, RunOutcome,
    RunReport, ThreadAllocCounter, Value,
};
use std::sync::Arc;

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator::system();

const MIB: i64 = 1024 * 1024;

fn engine(limit: i64, handler_method: &str) -> Engine {
    let cfg = EngineConfig {
        quota: QuotaConfig::new(limit, "QuotaInfringementHandler", handler_method),
        ..EngineConfig::default()
    };
    Engine::new(cfg, HandlerRegistry::builtin(), Arc::new(ThreadAllocCounter))
}

fn run_script(src: &str, limit: i64) -> (Result<Value, ExecError>, RunReport) {
    let parsed = parse_yaml_program(src).expect("parse");
    let engine = engine(limit, "handle");
    let prepared = engine.prepare(parsed.program).expect("prepare");
    engine.run_with_report(&prepared)
}

fn assert_stopped(result: Result<Value, ExecError>, report: &RunReport, limit: i64) {
    let err = result.expect_err("quota should have been exceeded");
    assert!(err.is_quota_stop(), "unexpected error: {err}");
    assert!(err
        .to_string()
        .starts_with("memory quota exceeded: Memory quota exceeded, current memory use"));
    assert!(matches!(report.outcome, RunOutcome::Stopped { .. }));
    let quota = report.quota.expect("watchdog snapshot");
    assert!(quota.last_sample > limit);
    assert_eq!(quota.limit, limit);
}

fn assert_five(result: Result<Value, ExecError>) {
    assert_eq!(result.expect("script should complete"), Value::Int(5));
}

const FOR_LOOP: &str = r#"
program:
  classes:
    - name: Script
      script: true
      methods:
        - name: run
          body:
            - let: { name: garbage, init: { new_bytes: { int: 67108864 } } }
            - for:
                init: { let: { name: i, init: { int: 0 } } }
                cond: { binary: { op: lt, lhs: { var: i }, rhs: { int: 1 } } }
                update: { assign: { name: i, value: { binary: { op: add, lhs: { var: i }, rhs: { int: 1 } } } } }
                body:
                  block:
                    - index_assign: { target: { var: garbage }, index: { var: i }, value: { var: i } }
            - return: { int: 5 }
"#;

const WHILE_LOOP: &str = r#"
program:
  classes:
    - name: Script
      script: true
      methods:
        - name: run
          body:
            - let: { name: garbage, init: { new_bytes: { int: 67108864 } } }
            - assign: { name: i, value: { int: 0 } }
            - while:
                cond: { binary: { op: lt, lhs: { var: i }, rhs: { int: 1 } } }
                body:
                  block:
                    - index_assign: { target: { var: garbage }, index: { var: i }, value: { var: i } }
                    - assign: { name: i, value: { binary: { op: add, lhs: { var: i }, rhs: { int: 1 } } } }
            - return: { int: 5 }
"#;

const METHOD_THROWS: &str = r#"
program:
  classes:
    - name: Script
      script: true
      methods:
        - name: run
          body:
            - let: { name: garbage, init: { new_bytes: { int: 67108864 } } }
            - expr: { call: { method: method } }
            - return: { int: 5 }
        - name: method
          body:
            - throw: { str: Failure }
"#;

const METHOD_NOOP: &str = r#"
program:
  classes:
    - name: Script
      script: true
      methods:
        - name: run
          body:
            - let: { name: garbage, init: { new_bytes: { int: 67108864 } } }
            - expr: { call: { method: method } }
            - return: { int: 5 }
        - name: method
          body: []
"#;

const CLOSURE_CALL: &str = r#"
program:
  classes:
    - name: Script
      script: true
      methods:
        - name: run
          body:
            - let: { name: garbage, init: { new_bytes: { int: 67108864 } } }
            - let: { name: c, init: { closure: { body: [] } } }
            - expr: { call_value: { callee: { var: c } } }
            - return: { int: 5 }
"#;

const MEGABYTE_PER_ITERATION: &str = r#"
program:
  classes:
    - name: Script
      script: true
      methods:
        - name: run
          body:
            - let: { name: keep, init: nil }
            - for:
                init: { let: { name: i, init: { int: 0 } } }
                cond: { binary: { op: lt, lhs: { var: i }, rhs: { int: 70 } } }
                update: { assign: { name: i, value: { binary: { op: add, lhs: { var: i }, rhs: { int: 1 } } } } }
                body:
                  block:
                    - assign: { name: keep, value: { new_bytes: { int: 1048576 } } }
            - return: { int: 5 }
"#;

#[test]
fn for_loop_exceeds_quota() {
    let (result, report) = run_script(FOR_LOOP, 64 * MIB);
    assert_stopped(result, &report, 64 * MIB);
}

#[test]
fn for_loop_within_quota() {
    let (result, report) = run_script(FOR_LOOP, 65 * MIB);
    assert_five(result);
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.quota.map(|q| q.checks), Some(1));
}

#[test]
fn while_loop_exceeds_quota() {
    let (result, report) = run_script(WHILE_LOOP, 64 * MIB);
    assert_stopped(result, &report, 64 * MIB);
}

#[test]
fn while_loop_within_quota() {
    let (result, _) = run_script(WHILE_LOOP, 65 * MIB);
    assert_five(result);
}

#[test]
fn method_entry_check_runs_before_its_body() {
    // The handler fires on entry, so the body's throw is never reached.
    let (result, report) = run_script(METHOD_THROWS, 64 * MIB);
    assert_stopped(result, &report, 64 * MIB);
}

#[test]
fn method_call_within_quota() {
    let (result, _) = run_script(METHOD_NOOP, 65 * MIB);
    assert_five(result);
}

#[test]
fn method_body_error_propagates_when_under_quota() {
    let (result, report) = run_script(METHOD_THROWS, 65 * MIB);
    assert!(matches!(result, Err(ExecError::Thrown(m)) if m == "Failure"));
    assert!(matches!(report.outcome, RunOutcome::Failed { .. }));
}

#[test]
fn closure_call_exceeds_quota() {
    let (result, report) = run_script(CLOSURE_CALL, 64 * MIB);
    assert_stopped(result, &report, 64 * MIB);
}

#[test]
fn closure_call_within_quota() {
    let (result, _) = run_script(CLOSURE_CALL, 65 * MIB);
    assert_five(result);
}

#[test]
fn gradual_allocation_stops_inside_the_loop() {
    let (result, report) = run_script(MEGABYTE_PER_ITERATION, 64 * MIB);
    assert_stopped(result, &report, 64 * MIB);
    let quota = report.quota.expect("snapshot");
    assert!(quota.checks > 64 && quota.checks < 70, "checks = {}", quota.checks);
}

#[test]
fn gradual_allocation_within_quota() {
    let (result, report) = run_script(MEGABYTE_PER_ITERATION, 71 * MIB);
    assert_five(result);
    let quota = report.quota.expect("snapshot");
    assert_eq!(quota.checks, 70);
    assert!(quota.maximum >= 69 * MIB);
    assert!(quota.average <= quota.maximum);
}

#[test]
fn report_handler_stops_with_statistics() {
    let parsed = parse_yaml_program(FOR_LOOP).expect("parse");
    let engine = engine(64 * MIB, "report");
    let (result, _) = engine.run_with_report(&engine.prepare(parsed.program).expect("prepare"));
    let err = result.expect_err("stopped");
    assert!(err.is_quota_stop());
    assert!(err.to_string().contains("over limit 67108864"));
}

#[test]
fn program_quota_section_drives_the_engine() {
    // Limit comes from the document; the engine config only supplies defaults.
    let src = format!("quota: {{ limit: {} }}\n{}", 65 * MIB, FOR_LOOP.trim_start());
    let parsed = parse_yaml_program(&src).expect("parse");
    let mut cfg = EngineConfig::default();
    parsed.quota.apply(&mut cfg.quota);
    let engine = Engine::new(cfg, HandlerRegistry::builtin(), Arc::new(ThreadAllocCounter));
    let (value, _) = engine.execute(parsed.program).expect("run");
    assert_eq!(value, Value::Int(5));
}

const RAISES_OWN_LIMIT: &str = r#"
program:
  classes:
    - name: Script
      script: true
      methods:
        - name: run
          body:
            - quota_init:
                limit_bytes: 9000000000000
                handler_type: QuotaInfringementHandler
                handler_method: handle
            - let: { name: garbage, init: { new_bytes: { int: 67108864 } } }
            - while:
                cond: { bool: false }
                body: { block: [] }
            - return: { int: 5 }
"#;

#[test]
fn script_cannot_install_its_own_watchdog() {
    let parsed = parse_yaml_program(RAISES_OWN_LIMIT).expect("parse");
    let err = engine(MIB, "handle")
        .prepare(parsed.program)
        .expect_err("quota statements in the source");
    assert!(
        matches!(
            err,
            ExecError::Plan(PlanError::AlreadyInstrumented { ref site }) if site == "Script::run"
        ),
        "unexpected error: {err}"
    );
}

#[test]
fn run_report_serializes_for_consumers() {
    let (result, report) = run_script(MEGABYTE_PER_ITERATION, 64 * MIB);
    assert!(result.expect_err("stopped").is_quota_stop());

    let json = serde_json::to_value(&report).expect("serialize");
    assert!(json["outcome"]["stopped"]["reason"]
        .as_str()
        .expect("reason")
        .starts_with("memory quota exceeded"));
    assert_eq!(json["quota"]["limit"], 64 * MIB);
    assert_eq!(json["injection_points"], report.injection_points);

    let back: RunReport = serde_json::from_value(json).expect("deserialize");
    assert_eq!(back.outcome, report.outcome);
    assert_eq!(back.quota, report.quota);
}

