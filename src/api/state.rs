use std::sync::Arc;

use crate::download::Downloader;
use crate::job::JobSupervisor;
use crate::observability::Metrics;
use crate::pool::WorkerPool;
use crate::sched::Scheduler;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub supervisor: Arc<JobSupervisor>,
    pub scheduler: Arc<Scheduler>,
    pub downloader: Arc<Downloader>,
    pub pool: Arc<WorkerPool>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        supervisor: Arc<JobSupervisor>,
        scheduler: Arc<Scheduler>,
        downloader: Arc<Downloader>,
        pool: Arc<WorkerPool>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            supervisor,
            scheduler,
            downloader,
            pool,
            metrics,
        }
    }
}
