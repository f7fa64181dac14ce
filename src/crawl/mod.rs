//! Per-job crawl engine: frontier traversal, selector extraction, dedup
//! and download dispatch.
//!
//! One engine run drives one job. Page fetch-and-extract tasks go through
//! the shared worker pool; every surviving asset candidate is handed to
//! the download subsystem under the run's detached context. The run is
//! logically complete when the frontier drains (or the logical token is
//! cancelled); the engine then waits for in-flight downloads to reach
//! zero before the terminal status transition.

mod extract;

pub use extract::{AssetCandidate, Extraction, PageMeta, extract, same_host};

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use crate::classify;
use crate::download::Downloader;
use crate::error::{ErrorReport, ErrorSink, ScrapeError, Stage};
use crate::fetch::{FetchScope, Fetcher};
use crate::model::{Asset, Job, JobStatus};
use crate::observability::Metrics;
use crate::pool::WorkerPool;
use crate::store::{ASSET_FLUSH_BATCH, JobEntry, RunTokens, Store};

pub struct CrawlEngine {
    store: Arc<Store>,
    fetcher: Arc<Fetcher>,
    downloader: Arc<Downloader>,
    pool: Arc<WorkerPool>,
    metrics: Arc<Metrics>,
    error_sink: ErrorSink,
}

/// What one page task reports back to the frontier loop.
struct PageOutcome {
    depth: u32,
    is_seed: bool,
    links: Vec<Url>,
    next_page: Option<Url>,
    new_assets: usize,
    error: Option<ScrapeError>,
}

impl CrawlEngine {
    pub fn new(
        store: Arc<Store>,
        fetcher: Arc<Fetcher>,
        downloader: Arc<Downloader>,
        pool: Arc<WorkerPool>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let error_sink = ErrorSink::new(store.settings_snapshot().log_file);
        Self {
            store,
            fetcher,
            downloader,
            pool,
            metrics,
            error_sink,
        }
    }

    /// Execute one run of `entry`. The lifecycle has already placed the
    /// job in `Starting` and installed `tokens`; the first thing the run
    /// does is acknowledge to `Running`.
    pub async fn run(self: &Arc<Self>, entry: Arc<JobEntry>, tokens: RunTokens) {
        let Some(job) = self.prepare(&entry) else {
            return;
        };
        let job = Arc::new(job);
        self.metrics.job_started();
        info!(job_id = %job.id, url = %job.base_url, "Crawl starting");

        let seed_error = self.drive_frontier(&entry, &job, &tokens).await;

        // Logical crawl is done; let in-flight downloads finish. An
        // explicit stop cancels them through the detached token, so this
        // wait is bounded either way.
        entry.wait_downloads_idle().await;

        self.finish(&entry, &tokens, seed_error);
    }

    /// Transition `Starting` -> `Running` and reset the per-run state.
    /// Returns the job snapshot the run operates on, or `None` when the
    /// job was stopped before the engine picked it up.
    fn prepare(&self, entry: &JobEntry) -> Option<Job> {
        let mut state = entry.lock();
        if state.job.status != JobStatus::Starting {
            debug!(job_id = %entry.id, status = ?state.job.status, "Run aborted before start");
            state.run = None;
            return None;
        }
        state.completed.clear();
        state.job.last_error.clear();
        state.job.status = JobStatus::Running;
        state.job.last_run = Some(Utc::now());
        let job = state.job.clone();
        drop(state);

        if let Err(e) = self.store.persist_job(entry) {
            warn!(job_id = %entry.id, error = %e, "Failed to persist run start");
        }
        Some(job)
    }

    /// Pump the frontier until it drains or the logical token fires.
    /// Returns the seed failure, if any.
    async fn drive_frontier(
        self: &Arc<Self>,
        entry: &Arc<JobEntry>,
        job: &Arc<Job>,
        tokens: &RunTokens,
    ) -> Option<ScrapeError> {
        let settings = self.store.settings_snapshot();
        let scope = FetchScope::for_job(job, &settings);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<PageOutcome>();

        let seed = match job.paginated_url() {
            Ok(url) => url,
            Err(e) => return Some(e),
        };

        let mut visited: HashSet<String> = HashSet::new();
        let mut pending: usize = 0;
        let mut seed_error: Option<ScrapeError> = None;

        visited.insert(seed.to_string());
        self.submit_page(entry, job, &scope, tokens, &out_tx, seed, 0, true)
            .await;
        pending += 1;

        while pending > 0 {
            let Some(outcome) = out_rx.recv().await else {
                break;
            };
            pending -= 1;

            let PageOutcome {
                depth,
                is_seed,
                links,
                next_page,
                new_assets,
                error,
            } = outcome;

            if let Some(error) = error {
                if is_seed && seed_error.is_none() {
                    seed_error = Some(error);
                }
                continue;
            }

            // Cancellation: drain what is pending, accept nothing new.
            if tokens.logical.is_cancelled() || seed_error.is_some() {
                continue;
            }

            let next_depth = depth + 1;
            if next_depth <= job.rules.max_depth {
                for link in links {
                    if visited.insert(link.to_string()) {
                        self.submit_page(
                            entry, job, &scope, tokens, &out_tx, link, next_depth, false,
                        )
                        .await;
                        pending += 1;
                    }
                }
            }

            if is_seed {
                if let Some(next) = self.next_seed_page(entry, job, next_page, new_assets) {
                    if visited.insert(next.to_string()) {
                        self.submit_page(entry, job, &scope, tokens, &out_tx, next, depth, true)
                            .await;
                        pending += 1;
                    }
                }
            }
        }

        seed_error
    }

    /// Pagination: a `pagination` selector match wins; otherwise a seed
    /// URL carrying a `page=` query advances the cursor, as long as the
    /// page just crawled still produced new assets.
    fn next_seed_page(
        &self,
        entry: &JobEntry,
        job: &Job,
        next_page: Option<Url>,
        new_assets: usize,
    ) -> Option<Url> {
        if let Some(next) = next_page {
            return Some(next);
        }

        if new_assets == 0 {
            return None;
        }
        let base = Url::parse(&job.base_url).ok()?;
        if !base.query_pairs().any(|(k, _)| k == "page") {
            return None;
        }

        let page = {
            let mut state = entry.lock();
            state.job.current_page += 1;
            state.job.current_page
        };
        if let Err(e) = self.store.persist_job(entry) {
            warn!(job_id = %entry.id, error = %e, "Failed to persist page cursor");
        }
        Some(crate::model::with_page_param(&base, page))
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_page(
        self: &Arc<Self>,
        entry: &Arc<JobEntry>,
        job: &Arc<Job>,
        scope: &FetchScope,
        tokens: &RunTokens,
        out_tx: &mpsc::UnboundedSender<PageOutcome>,
        url: Url,
        depth: u32,
        is_seed: bool,
    ) {
        let engine = Arc::clone(self);
        let entry = Arc::clone(entry);
        let job = Arc::clone(job);
        let scope = scope.clone();
        let tokens = tokens.clone();
        let out_tx = out_tx.clone();

        self.pool
            .submit(async move {
                let outcome = engine
                    .process_page(&entry, &job, &scope, &tokens, url, depth, is_seed)
                    .await;
                let _ = out_tx.send(outcome);
            })
            .await;
    }

    /// Fetch one page, extract, dedup and dispatch downloads.
    #[allow(clippy::too_many_arguments)]
    async fn process_page(
        self: &Arc<Self>,
        entry: &Arc<JobEntry>,
        job: &Arc<Job>,
        scope: &FetchScope,
        tokens: &RunTokens,
        url: Url,
        depth: u32,
        is_seed: bool,
    ) -> PageOutcome {
        let mut outcome = PageOutcome {
            depth,
            is_seed,
            links: Vec::new(),
            next_page: None,
            new_assets: 0,
            error: None,
        };

        if job.rules.request_delay_ms > 0 {
            let delay = std::time::Duration::from_millis(job.rules.request_delay_ms);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tokens.logical.cancelled() => return outcome,
            }
        }
        if tokens.logical.is_cancelled() {
            return outcome;
        }

        let page = match self.fetcher.page(scope, &url, &tokens.logical).await {
            Ok(page) => page,
            Err(ScrapeError::Cancelled) => return outcome,
            Err(error) => {
                let stage = if is_seed { Stage::Seed } else { Stage::Page };
                let report = ErrorReport::new(&job.id, stage, &error)
                    .with_url(url.as_str())
                    .with_retries(crate::fetch::MAX_ATTEMPTS - 1);
                if let Err(e) = self.store.record_error(&report) {
                    warn!(error = %e, "Failed to persist page error");
                }
                self.error_sink.record(&report).await;
                outcome.error = Some(error);
                return outcome;
            }
        };
        self.metrics.page_fetched();

        // The parsed document stays inside this block; only owned data
        // crosses the awaits below.
        let extraction = extract(&page.body, &page.final_url, job);
        outcome.links = extraction.links;
        outcome.next_page = extraction.next_page;

        for candidate in extraction.assets {
            // A stop that lands mid-extraction starts no new downloads.
            if tokens.logical.is_cancelled() {
                break;
            }
            let url_key = candidate.url.to_string();
            let duplicate = {
                let mut state = entry.lock();
                !state.completed.insert(url_key.clone())
            };
            if duplicate {
                continue;
            }

            let classification = classify::classify(&candidate.url, None);
            let mut asset = Asset::new(&job.id, url_key, classification.kind);
            asset.title = extraction.meta.title.clone();
            asset.description = extraction.meta.description.clone();
            asset.author = extraction.meta.author.clone();
            asset.date = extraction.meta.date.clone();
            asset.source = candidate.selector_id.clone();
            asset
                .metadata
                .insert("original_url".to_string(), candidate.url.to_string());
            if let Some(hint) = classify::content_type_hint(&candidate.url) {
                asset.metadata.insert("content_type".to_string(), hint);
            }

            if let Err(e) = self.store.record_asset(entry, asset.clone()) {
                warn!(asset_id = %asset.id, error = %e, "Failed to record asset");
            }
            outcome.new_assets += 1;
            if entry.count_toward_flush(ASSET_FLUSH_BATCH) {
                if let Err(e) = self.store.snapshot() {
                    warn!(error = %e, "Batched flush failed");
                }
            }

            entry.download_started();
            let downloader = Arc::clone(&self.downloader);
            let entry_for_download = Arc::clone(entry);
            let scope_for_download = scope.clone();
            let tokens_for_download = tokens.clone();
            self.pool
                .submit(async move {
                    downloader
                        .run(
                            entry_for_download,
                            scope_for_download,
                            asset,
                            tokens_for_download,
                        )
                        .await;
                })
                .await;
        }

        outcome
    }

    /// Terminal transition once the frontier is empty and downloads are
    /// drained. An explicit stop owns the `Stopped` transition; the engine
    /// only claims `Completed` or `Failed` from `Running`.
    fn finish(&self, entry: &JobEntry, tokens: &RunTokens, seed_error: Option<ScrapeError>) {
        let final_status = {
            let mut state = entry.lock();
            if state.job.status == JobStatus::Running {
                match &seed_error {
                    Some(error) => {
                        state.job.status = JobStatus::Failed;
                        state.job.last_error = error.to_string();
                    }
                    None => {
                        state.job.status = JobStatus::Completed;
                    }
                }
            }
            state.run = None;
            state.job.updated_at = Utc::now();
            state.job.status
        };
        entry.mark_dirty();

        match final_status {
            JobStatus::Completed => self.metrics.job_completed(),
            JobStatus::Failed => self.metrics.job_failed(),
            _ => {}
        }

        if let Err(e) = self.store.snapshot() {
            warn!(job_id = %entry.id, error = %e, "Final snapshot failed");
        }

        // Downloads are drained, so this only releases the run's bridge
        // task; it is not an explicit stop and cancels nothing detached.
        tokens.logical.cancel();
        info!(job_id = %entry.id, status = ?final_status, "Crawl finished");
    }
}
