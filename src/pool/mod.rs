//! Bounded worker pool shared by crawl and download tasks.
//!
//! Tasks are boxed futures consumed from a single bounded queue. When the
//! queue is full, `submit` runs the task inline in the caller instead of
//! growing memory: the producer slows down to the consumer's pace. Each
//! task runs inside its own spawn so a panic is contained and counted
//! rather than taking a worker down.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Queue capacity per worker.
const QUEUE_FACTOR: usize = 10;

#[derive(Debug, Default)]
struct Counters {
    running: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

pub struct WorkerPool {
    tx: mpsc::Sender<Task>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    token: CancellationToken,
    counters: Arc<Counters>,
    size: usize,
    shutdown: AtomicBool,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub running_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub is_shutdown: bool,
}

impl WorkerPool {
    /// Spawn `size` workers over a queue of `10 * size` slots.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<Task>(size * QUEUE_FACTOR);
        let rx = Arc::new(Mutex::new(rx));
        let token = CancellationToken::new();
        let counters = Arc::new(Counters::default());

        let mut workers = Vec::with_capacity(size);
        for worker_id in 0..size {
            let rx = rx.clone();
            let token = token.child_token();
            let counters = counters.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, rx, token, counters).await;
            }));
        }

        Self {
            tx,
            workers: std::sync::Mutex::new(workers),
            token,
            counters,
            size,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Enqueue a task; on a full queue, run it inline in the caller.
    /// Either way the task executes — nothing is dropped silently.
    pub async fn submit<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task: Task = Box::pin(fut);
        if self.shutdown.load(Ordering::SeqCst) {
            debug!("Pool is shut down, running task inline");
            run_one(task, &self.counters).await;
            return;
        }

        match self.tx.try_send(task) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                debug!("Pool queue full, running task inline");
                run_one(task, &self.counters).await;
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                run_one(task, &self.counters).await;
            }
        }
    }

    /// Stop accepting queued execution and tell workers to drain. Safe to
    /// call more than once.
    pub fn stop(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            self.token.cancel();
        }
    }

    /// Block until every worker has drained and exited. Call after
    /// [`WorkerPool::stop`].
    pub async fn wait(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("worker list poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Bounded variant of [`WorkerPool::wait`]; false when the deadline
    /// passes first.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            running_tasks: self.counters.running.load(Ordering::SeqCst),
            completed_tasks: self.counters.completed.load(Ordering::SeqCst),
            failed_tasks: self.counters.failed.load(Ordering::SeqCst),
            is_shutdown: self.shutdown.load(Ordering::SeqCst),
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    token: CancellationToken,
    counters: Arc<Counters>,
) {
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                task = rx.recv() => task,
                _ = token.cancelled() => None,
            }
        };

        match next {
            Some(task) => run_one(task, &counters).await,
            None => break,
        }
    }

    // Drain whatever was queued before the stop so no task is lost.
    loop {
        let leftover = { rx.lock().await.try_recv().ok() };
        match leftover {
            Some(task) => run_one(task, &counters).await,
            None => break,
        }
    }

    debug!(worker_id, "Worker exited");
}

/// Run a single task in its own spawn so a panic is counted, not fatal.
async fn run_one(task: Task, counters: &Counters) {
    counters.running.fetch_add(1, Ordering::SeqCst);
    let result = tokio::spawn(task).await;
    counters.running.fetch_sub(1, Ordering::SeqCst);

    match result {
        Ok(()) => {
            counters.completed.fetch_add(1, Ordering::SeqCst);
        }
        Err(e) if e.is_panic() => {
            warn!("Task panicked");
            counters.failed.fetch_add(1, Ordering::SeqCst);
        }
        Err(_) => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn tasks_execute_and_are_counted() {
        let pool = WorkerPool::new(2);
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let hits = hits.clone();
            pool.submit(async move {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }

        pool.stop();
        pool.wait().await;

        assert_eq!(hits.load(Ordering::SeqCst), 20);
        let stats = pool.stats();
        assert_eq!(stats.completed_tasks + stats.failed_tasks, 20);
        assert_eq!(stats.failed_tasks, 0);
        assert!(stats.is_shutdown);
    }

    #[tokio::test]
    async fn panics_increment_failed_counter() {
        let pool = WorkerPool::new(1);

        pool.submit(async {
            panic!("worker task exploded");
        })
        .await;
        pool.submit(async {}).await;

        pool.stop();
        pool.wait().await;

        let stats = pool.stats();
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.completed_tasks, 1);
    }

    #[tokio::test]
    async fn full_queue_overflows_inline() {
        // One worker blocked forever on a gate; queue of 10 fills; the
        // next submit must run inline instead of being lost.
        let pool = Arc::new(WorkerPool::new(1));
        let gate = Arc::new(tokio::sync::Notify::new());

        {
            let gate = gate.clone();
            pool.submit(async move {
                gate.notified().await;
            })
            .await;
        }
        // Give the worker a chance to pick up the blocker.
        tokio::task::yield_now().await;

        for _ in 0..10 {
            pool.submit(async {}).await;
        }

        let inline_ran = Arc::new(AtomicUsize::new(0));
        {
            let inline_ran = inline_ran.clone();
            // Queue is full now; this runs inline and completes.
            pool.submit(async move {
                inline_ran.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }
        assert_eq!(inline_ran.load(Ordering::SeqCst), 1);

        gate.notify_one();
        pool.stop();
        pool.wait().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_drains() {
        let pool = WorkerPool::new(2);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let hits = hits.clone();
            pool.submit(async move {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }

        pool.stop();
        pool.stop();
        assert!(pool.wait_timeout(Duration::from_secs(2)).await);
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }
}
