//! Job lifecycle: guarded state transitions and cancellation wiring.
//!
//! Transitions:
//!
//! ```text
//! idle/stopped/completed/failed --start--> starting --engine ack--> running
//! running                       --stop-->  stopping --cancel------> stopped
//! running                       --engine ok-->                      completed
//! running                       --engine err-->                     failed
//! any                           --delete--> (removed; stop first if running)
//! ```
//!
//! A stop captures the run tokens under the job lock, null-clears them so a
//! second stop cannot double-cancel, then cancels outside the lock. The
//! logical token is always cancelled; the bridge task propagates to the
//! detached token only because the stop was explicit, which is what makes
//! in-flight downloads unwind on stop yet survive ordinary completion.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::crawl::CrawlEngine;
use crate::error::{Result, ScrapeError};
use crate::fetch::Fetcher;
use crate::model::JobStatus;
use crate::observability::Metrics;
use crate::store::{RunTokens, Store};

pub struct JobSupervisor {
    store: Arc<Store>,
    engine: Arc<CrawlEngine>,
    fetcher: Arc<Fetcher>,
    metrics: Arc<Metrics>,
}

impl JobSupervisor {
    pub fn new(
        store: Arc<Store>,
        engine: Arc<CrawlEngine>,
        fetcher: Arc<Fetcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            engine,
            fetcher,
            metrics,
        }
    }

    /// Begin a run: validate, move to `Starting`, install fresh tokens and
    /// hand the job to the engine. Fails when the job is missing, invalid
    /// or already active.
    pub async fn start(&self, job_id: &str) -> Result<()> {
        let entry = self
            .store
            .get_job(job_id)
            .ok_or_else(|| ScrapeError::Validation(format!("job {job_id} not found")))?;

        let tokens = {
            let mut state = entry.lock();
            if !state.job.status.can_start() {
                return Err(ScrapeError::Validation(format!(
                    "job {job_id} is already running"
                )));
            }
            state.job.validate()?;
            state.job.status = JobStatus::Starting;
            state.job.updated_at = Utc::now();
            let tokens = RunTokens::new();
            state.run = Some(tokens.clone());
            tokens
        };

        if let Err(e) = self.store.persist_job(&entry) {
            warn!(job_id, error = %e, "Failed to persist start transition");
        }

        // Bridge: an explicit stop cancels the detached scope too; a
        // logical deadline leaves running downloads alone.
        {
            let tokens = tokens.clone();
            tokio::spawn(async move {
                tokens.logical.cancelled().await;
                if tokens.is_explicit() {
                    tokens.detached.cancel();
                }
            });
        }

        let engine = Arc::clone(&self.engine);
        let entry_for_run = Arc::clone(&entry);
        tokio::spawn(async move {
            engine.run(entry_for_run, tokens).await;
        });

        debug!(job_id, "Job start accepted");
        Ok(())
    }

    /// Explicit operator stop. Returns once the job reads `Stopped`;
    /// in-flight downloads are cancelled through the detached token and
    /// drain in the background.
    pub async fn stop(&self, job_id: &str) -> Result<()> {
        let entry = self
            .store
            .get_job(job_id)
            .ok_or_else(|| ScrapeError::Validation(format!("job {job_id} not found")))?;

        let tokens = {
            let mut state = entry.lock();
            if !matches!(state.job.status, JobStatus::Starting | JobStatus::Running) {
                return Err(ScrapeError::Validation(format!(
                    "job {job_id} is not running"
                )));
            }
            state.job.status = JobStatus::Stopping;
            // Null-clear so nothing can cancel twice.
            state.run.take()
        };

        if let Some(tokens) = tokens {
            tokens.mark_explicit();
            tokens.logical.cancel();
        }

        {
            let mut state = entry.lock();
            state.job.status = JobStatus::Stopped;
            state.job.updated_at = Utc::now();
        }
        entry.mark_dirty();
        if let Err(e) = self.store.persist_job(&entry) {
            warn!(job_id, error = %e, "Failed to persist stop transition");
        }
        self.metrics.job_stopped();
        info!(job_id, "Job stopped");
        Ok(())
    }

    /// Remove a job entirely, stopping it first when active. Downloaded
    /// files and thumbnails go with it, best-effort.
    pub async fn delete(&self, job_id: &str) -> Result<bool> {
        let Some(entry) = self.store.get_job(job_id) else {
            return Ok(false);
        };

        let active = entry.job_snapshot().status.is_active();
        if active {
            // A concurrent terminal transition turns this into a no-op.
            if let Err(e) = self.stop(job_id).await {
                debug!(job_id, error = %e, "Stop during delete was a no-op");
            }
        }

        let settings = self.store.settings_snapshot();
        for root in [&settings.storage_path, &settings.thumbnails_path] {
            let dir = root.join(job_id);
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(job_id, path = %dir.display(), error = %e, "Failed to remove job files");
                }
            }
        }

        self.fetcher.forget_job(job_id);
        let removed = self.store.delete_job(job_id)?;
        info!(job_id, "Job deleted");
        Ok(removed)
    }
}
