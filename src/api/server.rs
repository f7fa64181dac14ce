use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::services;
use super::state::AppState;
use crate::config::AppConfig;
use crate::crawl::CrawlEngine;
use crate::download::{Downloader, NoopThumbnailer, ThumbnailGenerator};
use crate::fetch::Fetcher;
use crate::job::JobSupervisor;
use crate::model::JobStatus;
use crate::observability::Metrics;
use crate::pool::WorkerPool;
use crate::sched::Scheduler;
use crate::store::Store;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// How long the shutdown sequence waits for the pool to drain.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(15);

/// Snapshot cadence for the background flush ticker.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", post(services::create_job).get(services::list_jobs))
        .route(
            "/api/jobs/{job_id}",
            get(services::get_job)
                .put(services::update_job)
                .delete(services::delete_job),
        )
        .route("/api/jobs/{job_id}/start", post(services::start_job))
        .route("/api/jobs/{job_id}/stop", post(services::stop_job))
        .route("/api/jobs/{job_id}/assets", get(services::job_assets))
        .route("/api/jobs/{job_id}/statistics", get(services::job_statistics))
        .route("/api/jobs/{job_id}/errors", get(services::job_errors))
        .route("/api/assets", get(services::list_assets))
        .route(
            "/api/assets/{asset_id}",
            get(services::get_asset).delete(services::delete_asset),
        )
        .route(
            "/api/assets/{asset_id}/regenerate-thumbnail",
            post(services::regenerate_thumbnail),
        )
        .route(
            "/api/templates",
            post(services::create_template).get(services::list_templates),
        )
        .route(
            "/api/templates/{template_id}",
            get(services::get_template).delete(services::delete_template),
        )
        .route(
            "/api/templates/{template_id}/instantiate",
            post(services::instantiate_template),
        )
        .route(
            "/api/settings",
            get(services::get_settings).put(services::update_settings),
        )
        .route("/api/storage/info", get(services::storage_info))
        .route("/api/cache/clear", post(services::cache_clear))
        .route("/health", get(services::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Wire the whole service together and build its shared state.
pub fn build_state(config: &AppConfig) -> Result<AppState, AnyError> {
    build_state_with_thumbnailer(config, Arc::new(NoopThumbnailer))
}

pub fn build_state_with_thumbnailer(
    config: &AppConfig,
    thumbs: Arc<dyn ThumbnailGenerator>,
) -> Result<AppState, AnyError> {
    let settings = config.initial_settings();
    for dir in [
        &settings.data_path,
        &settings.storage_path,
        &settings.thumbnails_path,
        &settings.log_file,
    ] {
        std::fs::create_dir_all(dir)?;
    }

    let ledger_path = settings.data_path.join("ledger");
    info!(path = %ledger_path.display(), "Opening store");
    let store = Arc::new(Store::open(&ledger_path, settings)?);

    let settings = store.settings_snapshot();
    let metrics = Arc::new(Metrics::new());
    let fetcher = Arc::new(Fetcher::new(store.clone()));
    let downloader = Arc::new(Downloader::new(
        store.clone(),
        fetcher.clone(),
        thumbs,
        metrics.clone(),
    ));
    let pool = Arc::new(WorkerPool::new(settings.max_concurrent));
    let engine = Arc::new(CrawlEngine::new(
        store.clone(),
        fetcher.clone(),
        downloader.clone(),
        pool.clone(),
        metrics.clone(),
    ));
    let supervisor = Arc::new(JobSupervisor::new(
        store.clone(),
        engine,
        fetcher,
        metrics.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(store.clone(), supervisor.clone()));

    Ok(AppState::new(
        store, supervisor, scheduler, downloader, pool, metrics,
    ))
}

pub async fn run(address: Option<SocketAddr>) -> Result<(), AnyError> {
    info!("Loading configuration");
    let config = AppConfig::load().map_err(|e| format!("failed to load config: {e}"))?;
    let state = build_state(&config)?;

    // Recurring jobs resume; a fire missed while the process was down
    // happens once now.
    state.scheduler.register_all();

    // Periodic flush of dirty jobs.
    {
        let store = state.store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = store.snapshot() {
                    warn!(error = %e, "Periodic snapshot failed");
                }
            }
        });
    }

    let address = address.unwrap_or(config.server.bind_addr);
    let app = build_router(state.clone());
    let listener = TcpListener::bind(address).await?;
    info!(%address, "mediagrab API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown(&state).await;
    Ok(())
}

/// Ordered teardown: stop firing schedules, logically cancel running
/// jobs, drain the pool with a bounded wait, take a final snapshot.
async fn shutdown(state: &AppState) {
    info!("Shutting down");
    state.scheduler.shutdown();

    for job in state.store.list_jobs() {
        if matches!(job.status, JobStatus::Starting | JobStatus::Running) {
            if let Err(e) = state.supervisor.stop(&job.id).await {
                warn!(job_id = %job.id, error = %e, "Failed to stop job during shutdown");
            }
        }
    }

    state.pool.stop();
    if !state.pool.wait_timeout(SHUTDOWN_DRAIN).await {
        warn!("Worker pool did not drain before the deadline");
    }

    if let Err(e) = state.store.snapshot() {
        warn!(error = %e, "Final snapshot failed");
    }
    info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("failed to install signal handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
