//! Metrics/tracing hooks.
//!
//! Nothing here pulls a telemetry stack; the binary decides where events go.

use memquota_core::manifest::{RunOutcome, RunReport};

#[cfg(feature = "tracing")]
pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::trace_span!("memquota", event);
    let _entered = span.enter();
    for (k, v) in key_values {
        tracing::trace!(%event, %k, %v, "metric");
    }
}

#[cfg(not(feature = "tracing"))]
pub fn emit_span(_event: &str, _key_values: &[(&str, String)]) {}

/// One event per finished run, carrying the watchdog's final statistics.
pub fn emit_run_report(report: &RunReport) {
    let outcome = match &report.outcome {
        RunOutcome::Completed => "completed",
        RunOutcome::Stopped { .. } => "stopped",
        RunOutcome::Failed { .. } => "failed",
    };
    let mut kv = vec![
        ("run_id", report.id.0.to_string()),
        ("outcome", outcome.to_string()),
        ("duration_ms", report.duration_ms().to_string()),
        ("injection_points", report.injection_points.to_string()),
    ];
    if let Some(q) = &report.quota {
        kv.push(("checks", q.checks.to_string()));
        kv.push(("maximum", q.maximum.to_string()));
        kv.push(("average", q.average.to_string()));
        kv.push(("limit", q.limit.to_string()));
    }
    emit_span("run_finished", &kv);
}
