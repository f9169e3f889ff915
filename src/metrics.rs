//! Renders an [`aggregator::MetricsSnapshot`] as Prometheus exposition text.
//! Counters are copied out from behind the aggregator's lock by the caller;
//! formatting itself never touches the lock.

use crate::aggregator::MetricsSnapshot;
use std::fmt::Write as _;

pub const CONTENT_TYPE: &str = "text/plain;version=0.0.4;charset=utf-8";

pub fn render(snapshot: &MetricsSnapshot) -> String {
    let mut out = String::new();

    write_metric(&mut out, "collector_jobs_total", "Jobs observed since startup.", snapshot.jobs_total);
    write_metric(&mut out, "collector_jobs_active", "Jobs neither complete nor timed out.", snapshot.jobs_active);
    write_metric(&mut out, "collector_jobs_complete", "Jobs all target minions returned for.", snapshot.jobs_complete);
    write_metric(&mut out, "collector_jobs_timed_out", "Jobs that exceeded the completion timeout.", snapshot.jobs_timed_out);
    write_metric(&mut out, "collector_state_successes_total", "State runs that returned a true result.", snapshot.successes_total);
    write_metric(&mut out, "collector_state_failures_total", "State runs that returned a false result.", snapshot.failures_total);
    write_metric(&mut out, "collector_state_warnings_total", "State runs with no definite result or explicit warnings.", snapshot.warnings_total);
    write_metric(&mut out, "collector_state_changes_total", "State runs that reported non-empty changes.", snapshot.changes_total);
    write_metric(&mut out, "collector_state_errors_total", "State runs whose comment indicated an error.", snapshot.errors_total);
    write_metric(&mut out, "collector_minions_down_total", "Minions reported missing from a job's target set.", snapshot.minions_down_total);
    write_metric(&mut out, "collector_jobs_offline_total", "Jobs with at least one minion detected offline over SSH.", snapshot.jobs_offline_total);

    let _ = writeln!(out, "# HELP collector_metrics_epoch Monotonic counter bumped on every aggregator mutation.");
    let _ = writeln!(out, "# TYPE collector_metrics_epoch counter");
    let _ = writeln!(out, "collector_metrics_epoch {}", snapshot.epoch);

    out
}

fn write_metric(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}
