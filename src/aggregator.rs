//! Per-job, per-minion aggregation. A single coarse `RwLock` guards the whole
//! job table, mirroring the connection manager's one-lock-per-table shape;
//! every observable mutation bumps a monotonic epoch so the metrics publisher
//! can tell "nothing changed" from "changed but stale" without diffing state.

use crate::event::{JobId, ParsedEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default)]
pub struct JobState {
    pub jid: JobId,
    pub fun: Option<String>,
    pub user: Option<String>,
    pub target_minions: Vec<String>,
    pub returned_minions: Vec<String>,
    pub down_minions: Vec<String>,
    pub successes: u64,
    pub failures: u64,
    pub warnings: u64,
    pub changes: u64,
    pub errors: u64,
    pub duration_ms: f64,
    pub offline: bool,
    pub started_at: i64,
    pub last_update_at: i64,
    pub complete: bool,
    pub timed_out: bool,
}

impl Default for JobId {
    fn default() -> Self {
        JobId::Str(String::new())
    }
}

/// A point-in-time rollup suitable for rendering into scrape text. Carries
/// its own epoch so the caller can apply the staleness rule without a second
/// lock acquisition.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub epoch: u64,
    pub jobs_total: u64,
    pub jobs_active: u64,
    pub jobs_timed_out: u64,
    pub jobs_complete: u64,
    pub successes_total: u64,
    pub failures_total: u64,
    pub warnings_total: u64,
    pub changes_total: u64,
    pub errors_total: u64,
    pub minions_down_total: u64,
    pub jobs_offline_total: u64,
    pub per_job: Vec<JobState>,
}

struct Inner {
    jobs: HashMap<JobId, JobState>,
    completed_jids: Vec<(JobId, Instant)>,
}

/// The "data merger": single-writer aggregation of parsed events into
/// per-job rollups, plus the three independent maintenance sweeps the
/// reference implementation runs on its own cadence.
pub struct Aggregator {
    inner: RwLock<Inner>,
    epoch: AtomicU64,
}

impl Aggregator {
    pub fn new() -> Self {
        Aggregator {
            inner: RwLock::new(Inner { jobs: HashMap::new(), completed_jids: Vec::new() }),
            epoch: AtomicU64::new(0),
        }
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Fold a parsed event into the job table, creating the job entry on
    /// first sight of a `jid`. Events without a `jid` (e.g. `salt/key`) are
    /// observed but never create a job row.
    pub fn add(&self, event: &ParsedEvent) {
        let Some(jid) = &event.jid else { return };

        let mut inner = self.inner.write().expect("aggregator lock poisoned");
        let job = inner.jobs.entry(jid.clone()).or_insert_with(|| JobState {
            jid: jid.clone(),
            started_at: event.ts,
            ..Default::default()
        });

        job.last_update_at = event.ts;
        if job.fun.is_none() {
            job.fun = event.fun.clone();
        }
        if job.user.is_none() {
            job.user = event.user.clone();
        }
        if let Some(minions) = &event.minions {
            job.target_minions = minions.clone();
        }
        if let Some(id) = &event.id {
            if event.tag_sub == crate::tags::well_known::SALT_JOB_RET && !job.returned_minions.contains(id) {
                job.returned_minions.push(id.clone());
            }
        }
        if let Some(down) = &event.down_minions {
            job.down_minions = down.clone();
        }
        job.successes += event.successes.unwrap_or(0);
        job.failures += event.failures.unwrap_or(0);
        job.warnings += event.warnings.unwrap_or(0);
        job.changes += event.changes.unwrap_or(0);
        job.errors += event.errors.unwrap_or(0);
        if let Some(duration) = event.duration {
            job.duration_ms += duration;
        }
        if event.offline == Some(true) {
            job.offline = true;
        }
        if event.tag_sub == crate::tags::well_known::SALT_JOB_RET
            && !job.target_minions.is_empty()
            && job.returned_minions.len() >= job.target_minions.len()
        {
            job.complete = true;
        }

        drop(inner);
        self.bump_epoch();
    }

    /// Mark jobs that haven't seen an update within `timeout` as timed out,
    /// instead of complete. Runs on `job_timeout_check_interval`.
    pub fn complete_with_timeout(&self, timeout_secs: u64) -> u64 {
        let now = now_epoch_secs();
        let mut inner = self.inner.write().expect("aggregator lock poisoned");
        let mut marked = 0u64;
        for job in inner.jobs.values_mut() {
            if !job.complete && !job.timed_out && now.saturating_sub(job.last_update_at) as u64 > timeout_secs {
                job.timed_out = true;
                marked += 1;
            }
        }
        drop(inner);
        if marked > 0 {
            self.bump_epoch();
        }
        marked
    }

    /// Recompute nothing by itself — this is the cadence hook the publisher
    /// uses to decide whether the 110s staleness window has lapsed even with
    /// an unchanged epoch. Returns the current snapshot.
    pub fn jobs_metrics_update(&self) -> MetricsSnapshot {
        let inner = self.inner.read().expect("aggregator lock poisoned");
        let per_job: Vec<JobState> = inner.jobs.values().cloned().collect();
        drop(inner);

        let mut snapshot = MetricsSnapshot {
            epoch: self.get_metrics_epoch(),
            jobs_total: per_job.len() as u64,
            jobs_active: 0,
            jobs_timed_out: 0,
            jobs_complete: 0,
            successes_total: 0,
            failures_total: 0,
            warnings_total: 0,
            changes_total: 0,
            errors_total: 0,
            minions_down_total: 0,
            jobs_offline_total: 0,
            per_job,
        };

        for job in &snapshot.per_job {
            if job.timed_out {
                snapshot.jobs_timed_out += 1;
            } else if job.complete {
                snapshot.jobs_complete += 1;
            } else {
                snapshot.jobs_active += 1;
            }
            snapshot.successes_total += job.successes;
            snapshot.failures_total += job.failures;
            snapshot.warnings_total += job.warnings;
            snapshot.changes_total += job.changes;
            snapshot.errors_total += job.errors;
            snapshot.minions_down_total += job.down_minions.len() as u64;
            if job.offline {
                snapshot.jobs_offline_total += 1;
            }
        }

        snapshot
    }

    /// Drop completed/timed-out job rows once they're older than
    /// `retention_secs`, on `job_jids_cleanup_interval`.
    pub fn cleanup_job_jids(&self, retention_secs: u64) -> u64 {
        let mut inner = self.inner.write().expect("aggregator lock poisoned");
        let cutoff = now_epoch_secs().saturating_sub(retention_secs as i64);
        let before = inner.jobs.len();
        inner.jobs.retain(|_, job| !(job.complete || job.timed_out) || job.last_update_at > cutoff);
        let removed = (before - inner.jobs.len()) as u64;
        inner.completed_jids.retain(|(_, at)| at.elapsed().as_secs() < retention_secs);
        drop(inner);
        if removed > 0 {
            self.bump_epoch();
        }
        removed
    }

    #[cfg(test)]
    pub fn job_count(&self) -> usize {
        self.inner.read().unwrap().jobs.len()
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn now_epoch_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ParsedEvent;

    fn event(jid: &str, tag_sub: &str, ts: i64) -> ParsedEvent {
        let mut e = ParsedEvent::new("salt/job".to_string(), "salt/job/{jid}".to_string(), "job".to_string(), tag_sub.to_string(), ts);
        e.jid = Some(JobId::parse(jid));
        e
    }

    #[test]
    fn add_creates_job_on_first_sight() {
        let agg = Aggregator::new();
        let epoch_before = agg.get_metrics_epoch();
        agg.add(&event("1", "new", 1000));
        assert_eq!(agg.job_count(), 1);
        assert!(agg.get_metrics_epoch() > epoch_before);
    }

    #[test]
    fn events_without_jid_are_ignored() {
        let agg = Aggregator::new();
        let mut e = ParsedEvent::new("salt/key".to_string(), "salt/key".to_string(), "key".to_string(), "".to_string(), 1000);
        e.jid = None;
        agg.add(&e);
        assert_eq!(agg.job_count(), 0);
    }

    #[test]
    fn job_completes_when_all_targets_return() {
        let agg = Aggregator::new();
        let mut new_event = event("1", "new", 1000);
        new_event.minions = Some(vec!["a".to_string(), "b".to_string()]);
        agg.add(&new_event);

        let mut ret_a = event("1", "ret", 1001);
        ret_a.id = Some("a".to_string());
        agg.add(&ret_a);
        let snapshot = agg.jobs_metrics_update();
        assert_eq!(snapshot.jobs_active, 1);

        let mut ret_b = event("1", "ret", 1002);
        ret_b.id = Some("b".to_string());
        agg.add(&ret_b);
        let snapshot = agg.jobs_metrics_update();
        assert_eq!(snapshot.jobs_complete, 1);
    }

    #[test]
    fn offline_signal_folds_into_job_and_snapshot() {
        let agg = Aggregator::new();
        let mut ret = event("1", "ret", 1000);
        ret.offline = Some(true);
        agg.add(&ret);
        let snapshot = agg.jobs_metrics_update();
        assert_eq!(snapshot.jobs_offline_total, 1);
        assert!(snapshot.per_job[0].offline);
    }

    #[test]
    fn timeout_marks_stale_jobs() {
        let agg = Aggregator::new();
        agg.add(&event("1", "new", 0));
        let marked = agg.complete_with_timeout(10);
        assert_eq!(marked, 1);
        let snapshot = agg.jobs_metrics_update();
        assert_eq!(snapshot.jobs_timed_out, 1);
    }

    #[test]
    fn cleanup_removes_old_completed_jobs() {
        let agg = Aggregator::new();
        agg.add(&event("1", "new", 0));
        agg.complete_with_timeout(0);
        let removed = agg.cleanup_job_jids(0);
        assert_eq!(removed, 1);
        assert_eq!(agg.job_count(), 0);
    }
}
