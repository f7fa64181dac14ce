use std::collections::HashMap;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::warn;

use super::error::ApiError;
use super::models::{
    Ack, HealthResponse, InstantiateRequest, JobRequest, JobStatistics, StorageInfo,
    TemplateRequest,
};
use super::state::AppState;
use crate::humanize::ByteSize;
use crate::model::{Job, Settings};

type ApiResult<T> = Result<T, ApiError>;

// ---- jobs ----

/// POST /api/jobs
///
/// Accepts an inline job definition or a `template_id` reference. The job
/// is validated, persisted, and registered with the scheduler when it
/// carries a cron expression.
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> ApiResult<impl IntoResponse> {
    let template = match &request.template_id {
        Some(id) => Some(
            state
                .store
                .get_template(id)
                .ok_or_else(|| ApiError::NotFound(format!("template {id}")))?,
        ),
        None => None,
    };

    let job = request.into_job(template.as_ref());
    job.validate()?;

    let entry = state.store.add_job(job)?;
    let job = entry.job_snapshot();
    if job.schedule.is_some() {
        state.scheduler.schedule_job(&job)?;
    }

    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /api/jobs
pub async fn list_jobs(State(state): State<AppState>) -> Json<Vec<Job>> {
    Json(state.store.list_jobs())
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Job>> {
    let entry = state
        .store
        .get_job(&job_id)
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;
    Ok(Json(entry.job_snapshot()))
}

/// PUT /api/jobs/{id} — update a non-running job's definition.
pub async fn update_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<JobRequest>,
) -> ApiResult<Json<Job>> {
    let entry = state
        .store
        .get_job(&job_id)
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;

    let mut job = entry.job_snapshot();
    if job.status.is_active() {
        return Err(ApiError::BadRequest(format!(
            "job {job_id} is running; stop it before updating"
        )));
    }
    request.apply_to(&mut job);
    job.validate()?;

    state.store.update_job(job.clone())?;
    // Schedule changes take effect immediately; an emptied schedule
    // deregisters the timer.
    state.scheduler.schedule_job(&job)?;

    Ok(Json(entry.job_snapshot()))
}

/// DELETE /api/jobs/{id} — cancels first when running.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Ack>> {
    state.scheduler.remove_job(&job_id);
    let removed = state.supervisor.delete(&job_id).await?;
    if !removed {
        return Err(ApiError::NotFound(format!("job {job_id}")));
    }
    Ok(Json(Ack::ok()))
}

/// POST /api/jobs/{id}/start — 400 when already running.
pub async fn start_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Ack>> {
    state.supervisor.start(&job_id).await?;
    Ok(Json(Ack::ok()))
}

/// POST /api/jobs/{id}/stop — 400 when not running.
pub async fn stop_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Ack>> {
    state.supervisor.stop(&job_id).await?;
    Ok(Json(Ack::ok()))
}

/// GET /api/jobs/{id}/assets
pub async fn job_assets(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Vec<crate::model::Asset>>> {
    state
        .store
        .list_assets(&job_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))
}

/// GET /api/jobs/{id}/statistics
pub async fn job_statistics(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatistics>> {
    let entry = state
        .store
        .get_job(&job_id)
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;

    let job = entry.job_snapshot();
    let assets = entry.assets_snapshot();

    let total = assets.len();
    let downloaded = assets.iter().filter(|a| a.downloaded).count();
    let failed = assets
        .iter()
        .filter(|a| !a.downloaded && !a.error.is_empty())
        .count();
    let mut by_kind: HashMap<String, usize> = HashMap::new();
    for asset in &assets {
        *by_kind.entry(asset.kind.as_str().to_string()).or_default() += 1;
    }

    let progress_percent = if total == 0 {
        0.0
    } else {
        (downloaded + failed) as f64 * 100.0 / total as f64
    };

    let duration_seconds = job.last_run.map(|started| {
        let end = if job.status.is_active() {
            chrono::Utc::now()
        } else {
            job.updated_at
        };
        (end - started).num_seconds().max(0)
    });

    Ok(Json(JobStatistics {
        job_id: job.id.clone(),
        status: job.status,
        total_assets: total,
        downloaded_assets: downloaded,
        failed_assets: failed,
        downloads_in_progress: entry.downloads_in_progress(),
        by_kind,
        progress_percent,
        duration_seconds,
        current_page: job.current_page,
        last_run: job.last_run,
        next_run: job.next_run,
    }))
}

/// GET /api/jobs/{id}/errors — the persisted error log for a job.
pub async fn job_errors(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Vec<crate::error::ErrorReport>>> {
    if state.store.get_job(&job_id).is_none() {
        return Err(ApiError::NotFound(format!("job {job_id}")));
    }
    let reports = state.store.list_errors(&job_id)?;
    Ok(Json(reports))
}

// ---- assets ----

/// GET /api/assets
pub async fn list_assets(State(state): State<AppState>) -> Json<Vec<crate::model::Asset>> {
    Json(state.store.list_all_assets())
}

/// GET /api/assets/{id}
pub async fn get_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> ApiResult<Json<crate::model::Asset>> {
    state
        .store
        .find_asset(&asset_id)
        .map(|(_, asset)| Json(asset))
        .ok_or_else(|| ApiError::NotFound(format!("asset {asset_id}")))
}

/// DELETE /api/assets/{id} — removes the record and its files.
pub async fn delete_asset(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> ApiResult<Json<Ack>> {
    let asset = state
        .store
        .delete_asset(&asset_id)?
        .ok_or_else(|| ApiError::NotFound(format!("asset {asset_id}")))?;

    let settings = state.store.settings_snapshot();
    for (root, rel) in [
        (&settings.storage_path, &asset.local_path),
        (&settings.thumbnails_path, &asset.thumbnail_path),
    ] {
        if rel.is_empty() {
            continue;
        }
        let path = root.join(rel);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove asset file");
            }
        }
    }

    Ok(Json(Ack::ok()))
}

/// POST /api/assets/{id}/regenerate-thumbnail
pub async fn regenerate_thumbnail(
    State(state): State<AppState>,
    Path(asset_id): Path<String>,
) -> ApiResult<Json<crate::model::Asset>> {
    let (_, mut asset) = state
        .store
        .find_asset(&asset_id)
        .ok_or_else(|| ApiError::NotFound(format!("asset {asset_id}")))?;

    state.downloader.regenerate_thumbnail(&mut asset).await?;
    Ok(Json(asset))
}

// ---- templates ----

/// POST /api/templates
pub async fn create_template(
    State(state): State<AppState>,
    Json(request): Json<TemplateRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("template name is required".into()));
    }
    let template = request.into_template();
    state.store.add_template(template.clone())?;
    Ok((StatusCode::CREATED, Json(template)))
}

/// GET /api/templates
pub async fn list_templates(State(state): State<AppState>) -> Json<Vec<crate::model::Template>> {
    Json(state.store.list_templates())
}

/// GET /api/templates/{id}
pub async fn get_template(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
) -> ApiResult<Json<crate::model::Template>> {
    state
        .store
        .get_template(&template_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("template {template_id}")))
}

/// DELETE /api/templates/{id}
pub async fn delete_template(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
) -> ApiResult<Json<Ack>> {
    if !state.store.delete_template(&template_id)? {
        return Err(ApiError::NotFound(format!("template {template_id}")));
    }
    Ok(Json(Ack::ok()))
}

/// POST /api/templates/{id}/instantiate — build and persist a job from a
/// stored template.
pub async fn instantiate_template(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
    Json(request): Json<InstantiateRequest>,
) -> ApiResult<impl IntoResponse> {
    let template = state
        .store
        .get_template(&template_id)
        .ok_or_else(|| ApiError::NotFound(format!("template {template_id}")))?;

    let name = if request.name.trim().is_empty() {
        template.name.clone()
    } else {
        request.name
    };
    let job = template.instantiate(name, request.base_url);
    job.validate()?;
    let entry = state.store.add_job(job)?;

    Ok((StatusCode::CREATED, Json(entry.job_snapshot())))
}

// ---- settings ----

/// GET /api/settings
pub async fn get_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.store.settings_snapshot())
}

/// PUT /api/settings
pub async fn update_settings(
    State(state): State<AppState>,
    Json(settings): Json<Settings>,
) -> ApiResult<Json<Settings>> {
    state.store.update_settings(settings)?;
    let settings = state.store.settings_snapshot();
    for dir in [
        &settings.storage_path,
        &settings.thumbnails_path,
        &settings.data_path,
        &settings.log_file,
    ] {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(path = %dir.display(), error = %e, "Failed to create configured directory");
        }
    }
    Ok(Json(settings))
}

// ---- storage / cache / health ----

/// GET /api/storage/info — disk usage of the asset and thumbnail roots.
pub async fn storage_info(State(state): State<AppState>) -> ApiResult<Json<StorageInfo>> {
    let settings = state.store.settings_snapshot();
    let storage_root = settings.storage_path.clone();
    let thumbs_root = settings.thumbnails_path.clone();

    let (storage, thumbs) = tokio::task::spawn_blocking(move || {
        (dir_stats(&storage_root), dir_stats(&thumbs_root))
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(StorageInfo {
        storage_path: settings.storage_path.display().to_string(),
        storage_bytes: ByteSize(storage.0),
        storage_human: ByteSize(storage.0).human(),
        asset_files: storage.1,
        thumbnails_bytes: ByteSize(thumbs.0),
        thumbnail_files: thumbs.1,
    }))
}

/// Recursive (bytes, files) tally; unreadable entries are skipped.
fn dir_stats(root: &std::path::Path) -> (u64, u64) {
    let mut bytes = 0;
    let mut files = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if let Ok(meta) = entry.metadata() {
                bytes += meta.len();
                files += 1;
            }
        }
    }
    (bytes, files)
}

/// POST /api/cache/clear — drop in-memory caches and reload from disk.
pub async fn cache_clear(State(state): State<AppState>) -> ApiResult<Json<Ack>> {
    state.store.clear_caches()?;
    Ok(Json(Ack::ok()))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut components = HashMap::new();
    components.insert(
        "store".to_string(),
        if state.store.persist().is_ok() {
            "healthy".to_string()
        } else {
            "unhealthy".to_string()
        },
    );
    let pool = state.pool.stats();
    components.insert(
        "worker_pool".to_string(),
        if pool.is_shutdown {
            "shutdown".to_string()
        } else {
            "healthy".to_string()
        },
    );
    components.insert(
        "scheduler".to_string(),
        format!("{} registered", state.scheduler.registered_count()),
    );

    let unhealthy = components.values().any(|v| v == "unhealthy");
    let status_code = if unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let response = HealthResponse {
        status: if unhealthy { "unhealthy" } else { "healthy" }.to_string(),
        components,
        version: env!("CARGO_PKG_VERSION").to_string(),
        metrics: state.metrics.snapshot(),
        pool,
    };

    (status_code, Json(response))
}
