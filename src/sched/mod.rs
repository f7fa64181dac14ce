//! Cron-driven recurring job launches.
//!
//! Each scheduled job gets its own timer task that sleeps until the next
//! fire time, asks the lifecycle to start the job, then reschedules.
//! Five-field expressions are accepted by prepending a seconds field.
//!
//! Misfire policy: when registration finds a persisted `next_run` in the
//! past (the process was down when it should have fired), the job fires
//! once immediately and then falls back onto its cadence. Missed fires
//! are never replayed one-by-one.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, ScrapeError};
use crate::job::JobSupervisor;
use crate::model::{Job, JobId};
use crate::store::Store;

/// Parse a cron expression, accepting the five-field form.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(ScrapeError::Schedule("empty expression".into()));
    }
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| ScrapeError::Schedule(e.to_string()))
}

pub struct Scheduler {
    store: Arc<Store>,
    supervisor: Arc<JobSupervisor>,
    timers: DashMap<JobId, CancellationToken>,
    root: CancellationToken,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, supervisor: Arc<JobSupervisor>) -> Self {
        Self {
            store,
            supervisor,
            timers: DashMap::new(),
            root: CancellationToken::new(),
        }
    }

    /// Register (or re-register) a job's timer. A job without a schedule
    /// is deregistered. Double registration replaces the previous timer,
    /// leaving exactly one active.
    pub fn schedule_job(self: &Arc<Self>, job: &Job) -> Result<()> {
        let Some(expr) = job.schedule.as_deref().filter(|s| !s.trim().is_empty()) else {
            self.remove_job(&job.id);
            return Ok(());
        };
        let schedule = parse_schedule(expr)?;

        // A persisted fire time that already passed means the process was
        // down for it; owe exactly one fire.
        let misfire = job.next_run.is_some_and(|t| t <= Utc::now());

        let token = self.root.child_token();
        if let Some(previous) = self.timers.insert(job.id.clone(), token.clone()) {
            previous.cancel();
        }

        let scheduler = Arc::clone(self);
        let job_id = job.id.clone();
        tokio::spawn(async move {
            scheduler.timer_loop(job_id, schedule, misfire, token).await;
        });
        Ok(())
    }

    /// Deregister a job's timer. Idempotent; after return the timer will
    /// not fire again.
    pub fn remove_job(&self, job_id: &str) {
        if let Some((_, token)) = self.timers.remove(job_id) {
            token.cancel();
            debug!(job_id, "Schedule removed");
        }
    }

    /// Re-register every stored job that carries a schedule. Called once
    /// at startup, after the store has loaded.
    pub fn register_all(self: &Arc<Self>) {
        for job in self.store.list_jobs() {
            if job.schedule.as_deref().is_some_and(|s| !s.trim().is_empty()) {
                if let Err(e) = self.schedule_job(&job) {
                    warn!(job_id = %job.id, error = %e, "Failed to register schedule");
                }
            }
        }
    }

    pub fn registered_count(&self) -> usize {
        self.timers.len()
    }

    /// Stop all timers; no fire happens after this returns.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.timers.clear();
    }

    async fn timer_loop(
        &self,
        job_id: JobId,
        schedule: Schedule,
        misfire: bool,
        token: CancellationToken,
    ) {
        if misfire {
            info!(job_id = %job_id, "Firing missed schedule once after restart");
            self.fire(&job_id).await;
        }

        loop {
            let now = Utc::now();
            let Some(next) = schedule.after(&now).next() else {
                debug!(job_id = %job_id, "Schedule has no future fire times");
                break;
            };
            self.persist_next_run(&job_id, next);

            let delay = (next - now).to_std().unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => break,
            }
            if token.is_cancelled() {
                break;
            }

            self.fire(&job_id).await;
        }
    }

    async fn fire(&self, job_id: &str) {
        if self.store.get_job(job_id).is_none() {
            // Job was deleted; the timer goes with it.
            self.remove_job(job_id);
            return;
        }
        match self.supervisor.start(job_id).await {
            Ok(()) => info!(job_id, "Scheduled run started"),
            // Already running (or mid-edit invalid): skip this fire.
            Err(e) => debug!(job_id, error = %e, "Scheduled fire skipped"),
        }
    }

    fn persist_next_run(&self, job_id: &str, next: DateTime<Utc>) {
        let Some(entry) = self.store.get_job(job_id) else {
            return;
        };
        {
            let mut state = entry.lock();
            state.job.next_run = Some(next);
        }
        if let Err(e) = self.store.persist_job(&entry) {
            warn!(job_id, error = %e, "Failed to persist next_run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::CrawlEngine;
    use crate::download::{Downloader, NoopThumbnailer};
    use crate::fetch::Fetcher;
    use crate::model::{Selector, SelectorPurpose, Settings};
    use crate::observability::Metrics;
    use crate::pool::WorkerPool;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn five_field_expressions_parse() {
        assert!(parse_schedule("*/5 * * * *").is_ok());
        assert!(parse_schedule("0 3 * * 1-5").is_ok());
        // Six-field form passes through.
        assert!(parse_schedule("0 */5 * * * *").is_ok());
        assert!(parse_schedule("every tuesday").is_err());
        assert!(parse_schedule("").is_err());
    }

    #[test]
    fn next_fire_time_is_in_the_future() {
        let schedule = parse_schedule("*/5 * * * *").unwrap();
        let now = Utc::now();
        let next = schedule.after(&now).next().unwrap();
        assert!(next > now);
        assert!(next - now <= ChronoDuration::minutes(5));
        assert_eq!(next.timestamp() % 300, 0);
    }

    fn harness(temp: &TempDir) -> (Arc<Store>, Arc<Scheduler>, Arc<Metrics>) {
        let mut settings = Settings::default();
        settings.storage_path = temp.path().join("storage");
        settings.thumbnails_path = temp.path().join("thumbs");
        settings.log_file = temp.path().join("logs");
        settings.data_path = temp.path().to_path_buf();

        let store = Arc::new(Store::open(temp.path().join("ledger"), settings).unwrap());
        let fetcher = Arc::new(Fetcher::new(store.clone()));
        let metrics = Arc::new(Metrics::new());
        let downloader = Arc::new(Downloader::new(
            store.clone(),
            fetcher.clone(),
            Arc::new(NoopThumbnailer),
            metrics.clone(),
        ));
        let pool = Arc::new(WorkerPool::new(2));
        let engine = Arc::new(CrawlEngine::new(
            store.clone(),
            fetcher.clone(),
            downloader,
            pool,
            metrics.clone(),
        ));
        let supervisor = Arc::new(JobSupervisor::new(
            store.clone(),
            engine,
            fetcher,
            metrics.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(store.clone(), supervisor));
        (store, scheduler, metrics)
    }

    fn scheduled_job(schedule: &str) -> Job {
        let mut job = Job::new("cron", "http://127.0.0.1:9/never");
        job.schedule = Some(schedule.to_string());
        job.selectors = vec![
            Selector {
                id: "links".into(),
                name: String::new(),
                value: "a[href]".into(),
                attribute: String::new(),
                purpose: SelectorPurpose::Links,
                priority: 0,
                optional: false,
                url_pattern: None,
            },
            Selector {
                id: "imgs".into(),
                name: String::new(),
                value: "img".into(),
                attribute: String::new(),
                purpose: SelectorPurpose::Assets,
                priority: 0,
                optional: false,
                url_pattern: None,
            },
        ];
        job
    }

    #[tokio::test]
    async fn register_then_remove_leaves_no_timer() {
        let temp = TempDir::new().unwrap();
        let (store, scheduler, _metrics) = harness(&temp);
        let job = scheduled_job("*/5 * * * *");
        store.add_job(job.clone()).unwrap();

        scheduler.schedule_job(&job).unwrap();
        assert_eq!(scheduler.registered_count(), 1);

        scheduler.remove_job(&job.id);
        assert_eq!(scheduler.registered_count(), 0);
        // Removing again is harmless.
        scheduler.remove_job(&job.id);
    }

    #[tokio::test]
    async fn double_register_keeps_one_timer() {
        let temp = TempDir::new().unwrap();
        let (store, scheduler, _metrics) = harness(&temp);
        let job = scheduled_job("*/5 * * * *");
        store.add_job(job.clone()).unwrap();

        scheduler.schedule_job(&job).unwrap();
        scheduler.schedule_job(&job).unwrap();
        assert_eq!(scheduler.registered_count(), 1);
    }

    #[tokio::test]
    async fn registration_persists_next_run() {
        let temp = TempDir::new().unwrap();
        let (store, scheduler, _metrics) = harness(&temp);
        let job = scheduled_job("*/5 * * * *");
        let job_id = job.id.clone();
        store.add_job(job.clone()).unwrap();

        scheduler.schedule_job(&job).unwrap();
        // The timer task persists next_run before its first sleep.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            if store.get_job(&job_id).unwrap().job_snapshot().next_run.is_some() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "next_run never persisted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let next = store
            .get_job(&job_id)
            .unwrap()
            .job_snapshot()
            .next_run
            .unwrap();
        assert!(next > Utc::now() - ChronoDuration::seconds(1));
    }

    #[tokio::test]
    async fn stale_next_run_fires_exactly_once_on_registration() {
        let temp = TempDir::new().unwrap();
        let (store, scheduler, metrics) = harness(&temp);

        // Down from 00:00 to now: three fires were missed, one is owed.
        let mut job = scheduled_job("*/5 * * * *");
        job.next_run = Some(Utc::now() - ChronoDuration::minutes(12));
        let job_id = job.id.clone();
        store.add_job(job.clone()).unwrap();

        scheduler.schedule_job(&job).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if metrics.snapshot().jobs_started >= 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "missed fire never happened");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // The engine run fails fast (unreachable seed), so a catch-up
        // storm would show extra starts; give it a moment to not happen.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(metrics.snapshot().jobs_started, 1);

        // And the cadence is restored: next_run is back in the future.
        let next = store
            .get_job(&job_id)
            .unwrap()
            .job_snapshot()
            .next_run
            .unwrap();
        assert!(next > Utc::now());
    }

    #[tokio::test]
    async fn jobs_without_schedule_are_not_registered() {
        let temp = TempDir::new().unwrap();
        let (store, scheduler, _metrics) = harness(&temp);
        let mut job = scheduled_job("*/5 * * * *");
        job.schedule = None;
        store.add_job(job.clone()).unwrap();

        scheduler.schedule_job(&job).unwrap();
        assert_eq!(scheduler.registered_count(), 0);

        scheduler.register_all();
        assert_eq!(scheduler.registered_count(), 0);
    }
}
