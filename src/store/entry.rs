use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::model::{Asset, Job, JobId};

/// Cancellation scopes for one job run.
///
/// `logical` governs traversal and extraction; `detached` governs downloads
/// already in flight. An explicit operator stop cancels both (via the
/// bridge task in the lifecycle module); the engine finishing its frontier
/// cancels neither, which is what lets late downloads run to their own
/// deadline.
#[derive(Clone)]
pub struct RunTokens {
    pub logical: CancellationToken,
    pub detached: CancellationToken,
    explicit: Arc<AtomicBool>,
}

impl RunTokens {
    pub fn new() -> Self {
        Self {
            logical: CancellationToken::new(),
            detached: CancellationToken::new(),
            explicit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Record that the upcoming logical cancellation is an operator stop,
    /// not a deadline.
    pub fn mark_explicit(&self) {
        self.explicit.store(true, Ordering::SeqCst);
    }

    pub fn is_explicit(&self) -> bool {
        self.explicit.load(Ordering::SeqCst)
    }
}

impl Default for RunTokens {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a job guards under its own mutex.
pub struct JobState {
    pub job: Job,
    pub assets: HashMap<String, Asset>,
    /// URLs already enqueued or finished in the current run; exists only to
    /// prevent re-enqueue within that run.
    pub completed: HashSet<String>,
    /// Present while a run is active; cleared on every terminal transition.
    pub run: Option<RunTokens>,
}

/// A cached job plus its runtime-only state.
///
/// The mutex is job-scoped: it guards status flips, asset mutation and
/// dedup inserts. Lock windows stay short and never span I/O or awaits;
/// callers copy what they need out and release.
pub struct JobEntry {
    pub id: JobId,
    state: Mutex<JobState>,
    downloads_tx: watch::Sender<usize>,
    completed_since_flush: AtomicUsize,
    dirty: AtomicBool,
}

impl JobEntry {
    pub fn new(job: Job) -> Self {
        Self::from_parts(job, HashMap::new())
    }

    pub fn from_parts(job: Job, assets: HashMap<String, Asset>) -> Self {
        let (downloads_tx, _) = watch::channel(0usize);
        Self {
            id: job.id.clone(),
            state: Mutex::new(JobState {
                job,
                assets,
                completed: HashSet::new(),
                run: None,
            }),
            downloads_tx,
            completed_since_flush: AtomicUsize::new(0),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().expect("job mutex poisoned")
    }

    /// Copy of the job record, taken under the lock.
    pub fn job_snapshot(&self) -> Job {
        self.lock().job.clone()
    }

    /// Copy of the asset list in creation order.
    pub fn assets_snapshot(&self) -> Vec<Asset> {
        let mut assets: Vec<Asset> = self.lock().assets.values().cloned().collect();
        assets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        assets
    }

    pub fn run_tokens(&self) -> Option<RunTokens> {
        self.lock().run.clone()
    }

    pub fn downloads_in_progress(&self) -> usize {
        *self.downloads_tx.borrow()
    }

    pub fn download_started(&self) {
        self.downloads_tx.send_modify(|v| *v += 1);
    }

    pub fn download_finished(&self) {
        self.downloads_tx.send_modify(|v| *v = v.saturating_sub(1));
    }

    /// Block until no downloads remain in flight.
    pub async fn wait_downloads_idle(&self) {
        let mut rx = self.downloads_tx.subscribe();
        // wait_for checks the current value first, so no wakeup is missed.
        let _ = rx.wait_for(|v| *v == 0).await;
    }

    /// Count a finished asset toward the batched-flush cadence; returns
    /// true every `batch`th call.
    pub fn count_toward_flush(&self, batch: usize) -> bool {
        let n = self.completed_since_flush.fetch_add(1, Ordering::SeqCst) + 1;
        n % batch == 0
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Clears and returns the dirty flag; snapshot uses this to skip
    /// unchanged jobs.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }
}
