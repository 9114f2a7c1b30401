//! Persistent cron scheduler.
//!
//! Job *definitions* (name, cron expression, message) are written to
//! `jobs.json` after every change and survive restarts. The executable
//! task is never persisted: after a restart the owning process calls
//! [`Scheduler::add_job`] again with the same name to re-attach behavior.
//! Definitions restored from disk but not yet re-attached stay dormant.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tracing::{error, info, warn};

use crate::error::StoreError;
use crate::store;

pub type TaskResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
pub type JobTask = Arc<dyn Fn() -> BoxFuture<'static, TaskResult> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("job not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persisted job definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJobRecord {
    pub name: String,
    pub cron_expression: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Cancels future firings of one job. In-flight firings are not affected.
#[derive(Debug, Clone)]
pub struct JobHandle {
    name: String,
    abort: AbortHandle,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.abort.is_finished()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub record: CronJobRecord,
    /// `false` for definitions restored from disk without a task, or jobs
    /// added without starting
    pub running: bool,
}

struct ScheduledJob {
    record: CronJobRecord,
    schedule: cron::Schedule,
    task: Option<JobTask>,
    handle: Option<JobHandle>,
}

pub struct Scheduler {
    path: PathBuf,
    jobs: Mutex<BTreeMap<String, ScheduledJob>>,
}

/// Parse a 5-field (minute first) or 6/7-field (seconds first) expression.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, SchedulerError> {
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expr.trim()),
        6 | 7 => expr.trim().to_string(),
        n => {
            return Err(SchedulerError::InvalidCron {
                expr: expr.to_string(),
                reason: format!("expected 5 to 7 fields, got {}", n),
            })
        }
    };
    cron::Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

impl Scheduler {
    /// Open the scheduler, restoring persisted definitions as dormant jobs.
    pub fn open(state_dir: &Path) -> Self {
        let path = state_dir.join("jobs.json");
        let mut jobs = BTreeMap::new();
        match store::read_json::<Vec<CronJobRecord>>(&path) {
            Ok(Some(records)) => {
                for record in records {
                    match parse_cron(&record.cron_expression) {
                        Ok(schedule) => {
                            jobs.insert(
                                record.name.clone(),
                                ScheduledJob {
                                    record,
                                    schedule,
                                    task: None,
                                    handle: None,
                                },
                            );
                        }
                        Err(e) => warn!(job = %record.name, error = %e, "dropping unparseable job"),
                    }
                }
                info!(count = jobs.len(), "job definitions restored");
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "job definitions unreadable, starting empty"),
        }
        Self {
            path,
            jobs: Mutex::new(jobs),
        }
    }

    /// Read the persisted definitions without touching live jobs.
    pub fn load_definitions(&self) -> Result<Vec<CronJobRecord>, StoreError> {
        Ok(store::read_json(&self.path)?.unwrap_or_default())
    }

    /// Register `task` under `name`, replacing (and stopping) any job with the
    /// same name. With `start_immediately` false the job is persisted but not
    /// armed until [`Scheduler::start_job`].
    pub fn add_job(
        &self,
        name: &str,
        cron_expression: &str,
        task: JobTask,
        start_immediately: bool,
        message: &str,
    ) -> Result<Option<JobHandle>, SchedulerError> {
        let schedule = parse_cron(cron_expression)?;
        let mut jobs = self.lock();

        // re-attaching a restored definition keeps its creation time
        let created_at = match jobs.get(name) {
            Some(existing) if existing.record.cron_expression == cron_expression => {
                existing.record.created_at
            }
            _ => Utc::now(),
        };
        let record = CronJobRecord {
            name: name.to_string(),
            cron_expression: cron_expression.to_string(),
            message: message.to_string(),
            created_at,
        };

        // Disk first: a failed write leaves the previous job untouched and
        // nothing new armed.
        let mut records: Vec<&CronJobRecord> = jobs
            .values()
            .map(|j| &j.record)
            .filter(|r| r.name != name)
            .collect();
        records.push(&record);
        records.sort_by(|a, b| a.name.cmp(&b.name));
        store::write_json_atomic(&self.path, &records)?;

        if let Some(handle) = jobs.remove(name).and_then(|existing| existing.handle) {
            info!(job = %name, "replacing running job");
            handle.cancel();
        }

        let mut job = ScheduledJob {
            record,
            schedule,
            task: Some(task),
            handle: None,
        };
        if start_immediately {
            job.handle = Some(arm(&job));
        }
        let handle = job.handle.clone();
        info!(job = %name, cron = %cron_expression, started = start_immediately, "job added");
        jobs.insert(name.to_string(), job);
        Ok(handle)
    }

    /// Arm a job that was added without starting.
    pub fn start_job(&self, name: &str) -> Result<JobHandle, SchedulerError> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(name)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;
        if let Some(handle) = &job.handle {
            return Ok(handle.clone());
        }
        if job.task.is_none() {
            return Err(SchedulerError::NotFound(format!("{} (no task attached)", name)));
        }
        let handle = arm(job);
        job.handle = Some(handle.clone());
        info!(job = %name, "job started");
        Ok(handle)
    }

    /// Cancel future firings and forget the job, in memory and on disk.
    pub fn stop_job(&self, name: &str) -> Result<bool, SchedulerError> {
        let mut jobs = self.lock();
        let removed = match jobs.remove(name) {
            Some(job) => {
                if let Some(handle) = job.handle {
                    handle.cancel();
                }
                info!(job = %name, "job stopped");
                true
            }
            None => false,
        };
        if removed {
            self.persist(&jobs)?;
        }
        Ok(removed)
    }

    pub fn stop_all_jobs(&self) -> Result<usize, SchedulerError> {
        let mut jobs = self.lock();
        let count = jobs.len();
        for (_, job) in std::mem::take(&mut *jobs) {
            if let Some(handle) = job.handle {
                handle.cancel();
            }
        }
        info!(count, "all jobs stopped");
        self.persist(&jobs)?;
        Ok(count)
    }

    pub fn list_jobs(&self) -> Vec<JobInfo> {
        self.lock()
            .values()
            .map(|job| JobInfo {
                record: job.record.clone(),
                running: job.handle.is_some(),
            })
            .collect()
    }

    pub fn job_count(&self) -> usize {
        self.lock().len()
    }

    fn persist(&self, jobs: &BTreeMap<String, ScheduledJob>) -> Result<(), StoreError> {
        let records: Vec<&CronJobRecord> = jobs.values().map(|j| &j.record).collect();
        store::write_json_atomic(&self.path, &records)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ScheduledJob>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for job in self.lock().values() {
            if let Some(handle) = &job.handle {
                handle.cancel();
            }
        }
    }
}

fn arm(job: &ScheduledJob) -> JobHandle {
    let name = job.record.name.clone();
    let schedule = job.schedule.clone();
    let task = job.task.clone();
    let join = tokio::spawn(run_timer(name.clone(), schedule, task));
    JobHandle {
        name,
        abort: join.abort_handle(),
    }
}

async fn run_timer(name: String, schedule: cron::Schedule, task: Option<JobTask>) {
    let task = match task {
        Some(t) => t,
        None => return,
    };
    let mut cursor = Utc::now();
    loop {
        let next = match schedule.after(&cursor).next() {
            Some(next) => next,
            None => {
                warn!(job = %name, "schedule has no upcoming firings");
                return;
            }
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;
        cursor = next.max(Utc::now());

        // Spawned so that cancelling the timer leaves this firing running
        let task = task.clone();
        let name = name.clone();
        tokio::spawn(async move { fire(&name, task).await });
    }
}

async fn fire(name: &str, task: JobTask) {
    info!(job = %name, "job firing");
    let started = Instant::now();
    match task().await {
        Ok(()) => info!(
            job = %name,
            duration_ms = started.elapsed().as_millis() as u64,
            "job completed"
        ),
        Err(e) => error!(job = %name, error = %e, "job failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    fn counting_task(counter: Arc<AtomicU32>) -> JobTask {
        Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        })
    }

    fn noop_task() -> JobTask {
        Arc::new(|| async { Ok(()) }.boxed())
    }

    #[test]
    fn test_parse_cron_field_counts() {
        assert!(parse_cron("0 * * * *").is_ok());
        assert!(parse_cron("*/5 * * * * *").is_ok());
        assert!(matches!(
            parse_cron("* *"),
            Err(SchedulerError::InvalidCron { .. })
        ));
        assert!(matches!(
            parse_cron("61 * * * *"),
            Err(SchedulerError::InvalidCron { .. })
        ));
    }

    #[tokio::test]
    async fn test_definitions_survive_restart() {
        let dir = tempdir().unwrap();
        {
            let s = Scheduler::open(dir.path());
            s.add_job("x", "0 * * * *", noop_task(), true, "msg").unwrap();
        }

        let s = Scheduler::open(dir.path());
        let defs = s.load_definitions().unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "x");
        assert_eq!(defs[0].cron_expression, "0 * * * *");
        assert_eq!(defs[0].message, "msg");

        // restored but dormant until the task is re-supplied
        let jobs = s.list_jobs();
        assert_eq!(jobs.len(), 1);
        assert!(!jobs[0].running);

        s.add_job("x", "0 * * * *", noop_task(), true, "msg").unwrap();
        let jobs = s.list_jobs();
        assert!(jobs[0].running);
        assert_eq!(jobs[0].record.created_at, defs[0].created_at);
    }

    #[tokio::test]
    async fn test_dormant_definitions_are_not_lost_on_add() {
        let dir = tempdir().unwrap();
        {
            let s = Scheduler::open(dir.path());
            s.add_job("a", "0 * * * *", noop_task(), true, "").unwrap();
            s.add_job("b", "0 0 * * *", noop_task(), true, "").unwrap();
        }
        let s = Scheduler::open(dir.path());
        s.add_job("a", "0 * * * *", noop_task(), true, "").unwrap();
        let names: Vec<String> = s.load_definitions().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_same_name_replaces() {
        let dir = tempdir().unwrap();
        let s = Scheduler::open(dir.path());
        let first = s
            .add_job("sync", "0 * * * *", noop_task(), true, "v1")
            .unwrap()
            .unwrap();
        s.add_job("sync", "*/10 * * * *", noop_task(), true, "v2").unwrap();

        for _ in 0..100 {
            if first.is_cancelled() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(first.is_cancelled());
        assert_eq!(s.job_count(), 1);
        let defs = s.load_definitions().unwrap();
        assert_eq!(defs[0].cron_expression, "*/10 * * * *");
        assert_eq!(defs[0].message, "v2");
    }

    #[tokio::test]
    async fn test_stop_job_removes_from_disk() {
        let dir = tempdir().unwrap();
        let s = Scheduler::open(dir.path());
        s.add_job("a", "0 * * * *", noop_task(), true, "").unwrap();
        s.add_job("b", "0 * * * *", noop_task(), false, "").unwrap();

        assert!(s.stop_job("a").unwrap());
        assert!(!s.stop_job("a").unwrap());
        assert_eq!(s.load_definitions().unwrap().len(), 1);

        assert_eq!(s.stop_all_jobs().unwrap(), 1);
        assert!(s.load_definitions().unwrap().is_empty());
        assert_eq!(s.job_count(), 0);
    }

    #[tokio::test]
    async fn test_unstarted_job_can_be_started() {
        let dir = tempdir().unwrap();
        let s = Scheduler::open(dir.path());
        let handle = s.add_job("later", "0 * * * *", noop_task(), false, "").unwrap();
        assert!(handle.is_none());
        assert!(!s.list_jobs()[0].running);

        s.start_job("later").unwrap();
        assert!(s.list_jobs()[0].running);
        assert!(matches!(s.start_job("missing"), Err(SchedulerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_job_fires() {
        let dir = tempdir().unwrap();
        let s = Scheduler::open(dir.path());
        let counter = Arc::new(AtomicU32::new(0));
        s.add_job("tick", "* * * * * *", counting_task(counter.clone()), true, "")
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while counter.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(counter.load(Ordering::SeqCst) >= 1);
        s.stop_all_jobs().unwrap();
    }

    #[tokio::test]
    async fn test_stop_job_lets_in_flight_firing_finish() {
        let dir = tempdir().unwrap();
        let s = Scheduler::open(dir.path());
        let started = Arc::new(AtomicU32::new(0));
        let finished = Arc::new(AtomicU32::new(0));
        let release = Arc::new(tokio::sync::Notify::new());
        let task: JobTask = {
            let started = started.clone();
            let finished = finished.clone();
            let release = release.clone();
            Arc::new(move || {
                let started = started.clone();
                let finished = finished.clone();
                let release = release.clone();
                async move {
                    if started.fetch_add(1, Ordering::SeqCst) == 0 {
                        release.notified().await;
                        finished.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
                .boxed()
            })
        };
        s.add_job("slow", "* * * * * *", task, true, "").unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while started.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(started.load(Ordering::SeqCst), 1);

        assert!(s.stop_job("slow").unwrap());
        release.notify_one();
        let deadline = Instant::now() + Duration::from_secs(1);
        while finished.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        // no further firings once stopped
        let after_stop = started.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(started.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_failed_persist_arms_nothing() {
        let dir = tempdir().unwrap();
        // state dir path is a regular file, so jobs.json cannot be written
        let not_a_dir = dir.path().join("state");
        std::fs::write(&not_a_dir, b"").unwrap();
        let s = Scheduler::open(&not_a_dir);
        let counter = Arc::new(AtomicU32::new(0));

        let result = s.add_job("tick", "* * * * * *", counting_task(counter.clone()), true, "");
        assert!(matches!(result, Err(SchedulerError::Store(_))));
        assert_eq!(s.job_count(), 0);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected_and_not_persisted() {
        let dir = tempdir().unwrap();
        let s = Scheduler::open(dir.path());
        assert!(s.add_job("bad", "not a cron", noop_task(), true, "").is_err());
        assert!(s.load_definitions().unwrap().is_empty());
    }
}
