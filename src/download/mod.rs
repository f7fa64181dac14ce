//! Streams assets to local disk under a detached cancellation scope.
//!
//! Downloads run under the job's detached token, not the logical one: a
//! crawl that finishes its frontier leaves in-flight downloads to run out
//! their own budget, while an operator stop cancels them promptly (the
//! lifecycle bridge cancels the detached token only for explicit stops).
//!
//! Policy for an explicit stop mid-stream: the partial file stays on disk,
//! `downloaded` stays false and the asset error reads "cancelled".

mod thumbs;

pub use thumbs::{NoopThumbnailer, ThumbnailGenerator};

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::classify;
use crate::error::{ErrorReport, Result, ScrapeError, Stage};
use crate::fetch::{FetchScope, Fetcher};
use crate::model::{Asset, AssetKind};
use crate::observability::Metrics;
use crate::store::{ASSET_FLUSH_BATCH, JobEntry, RunTokens, Store};

/// Upper bound for a single download, independent of the job run.
pub const DOWNLOAD_BUDGET: Duration = Duration::from_secs(60 * 60);

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Bodies at or under this size count as "tiny" for the content-type
/// reinspection.
const SMALL_TEXTUAL_LIMIT: u64 = 32 * 1024;

pub struct Downloader {
    store: Arc<Store>,
    fetcher: Arc<Fetcher>,
    thumbs: Arc<dyn ThumbnailGenerator>,
    metrics: Arc<Metrics>,
    error_sink: crate::error::ErrorSink,
}

impl Downloader {
    pub fn new(
        store: Arc<Store>,
        fetcher: Arc<Fetcher>,
        thumbs: Arc<dyn ThumbnailGenerator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let error_sink = crate::error::ErrorSink::new(store.settings_snapshot().log_file);
        Self {
            store,
            fetcher,
            thumbs,
            metrics,
            error_sink,
        }
    }

    /// Drive one asset to a terminal state. The caller has already
    /// recorded the asset and incremented the job's in-flight counter;
    /// this always decrements it exactly once.
    pub async fn run(
        &self,
        entry: Arc<JobEntry>,
        scope: FetchScope,
        mut asset: Asset,
        tokens: RunTokens,
    ) {
        let outcome = tokio::time::timeout(
            DOWNLOAD_BUDGET,
            self.fetch_to_disk(&scope, &mut asset, &tokens),
        )
        .await
        .unwrap_or_else(|_| {
            Err(ScrapeError::fetch_permanent(
                "download budget exceeded",
                None,
            ))
        });

        match outcome {
            Ok(()) => {
                self.metrics.asset_downloaded();
            }
            Err(ScrapeError::Cancelled) => {
                asset.downloaded = false;
                asset.error = "cancelled".to_string();
                debug!(asset_id = %asset.id, "Download cancelled");
            }
            Err(e) => {
                asset.downloaded = false;
                asset.error = e.to_string();
                self.metrics.asset_failed();
                let report = ErrorReport::new(&asset.job_id, Stage::Asset, &e)
                    .with_url(&asset.url)
                    .with_retries(crate::fetch::MAX_ATTEMPTS - 1);
                if let Err(store_err) = self.store.record_error(&report) {
                    warn!(error = %store_err, "Failed to persist asset error");
                }
                self.error_sink.record(&report).await;
            }
        }

        if let Err(e) = self.store.update_asset(&asset) {
            warn!(asset_id = %asset.id, error = %e, "Failed to persist asset state");
        }
        entry.download_finished();

        if entry.count_toward_flush(ASSET_FLUSH_BATCH) {
            if let Err(e) = self.store.snapshot() {
                warn!(error = %e, "Batched flush failed");
            }
        }
    }

    async fn fetch_to_disk(
        &self,
        scope: &FetchScope,
        asset: &mut Asset,
        tokens: &RunTokens,
    ) -> Result<()> {
        let token = tokens.detached.child_token();

        let url = Url::parse(&asset.url)
            .map_err(|e| ScrapeError::InvalidUrl(format!("{}: {e}", asset.url)))?;
        let fetch_url = classify::strip_hint(&url);

        let mut response = self
            .fetcher
            .begin_download(scope, &fetch_url, &token, DOWNLOAD_BUDGET)
            .await?;
        let actual_content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(ct) = &actual_content_type {
            asset
                .metadata
                .insert("actual_content_type".to_string(), ct.clone());
        }

        let settings = self.store.settings_snapshot();
        let extension = classify::extension_for(&url, asset.kind);
        let file_name = format!("{}{}", asset.id, extension);
        let dir = settings.storage_path.join(&asset.job_id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(&file_name);
        asset.local_path = format!("{}/{}", asset.job_id, file_name);

        let mut file = tokio::fs::File::create(&path).await?;
        let mut written: u64 = 0;
        let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
        progress.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        progress.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                chunk = response.chunk() => {
                    match chunk.map_err(|e| {
                        ScrapeError::fetch_temporary(format!("stream failed: {e}"), None)
                    })? {
                        Some(bytes) => {
                            file.write_all(&bytes).await?;
                            written += bytes.len() as u64;
                        }
                        None => break,
                    }
                }
                _ = progress.tick() => {
                    info!(asset_id = %asset.id, url = %asset.url, written, "Download in progress");
                }
                _ = token.cancelled() => {
                    let _ = file.flush().await;
                    asset.size = written;
                    return Err(ScrapeError::Cancelled);
                }
            }
        }

        file.flush().await?;
        asset.size = written;
        asset.downloaded = true;
        debug!(asset_id = %asset.id, written, "Download finished");

        self.reinspect(asset, actual_content_type.as_deref(), &path, written)
            .await?;

        if asset.downloaded && asset.error.is_empty() {
            match self
                .thumbs
                .generate(asset, &path, &settings.thumbnails_path)
                .await
            {
                Ok(Some(rel)) => asset.thumbnail_path = rel,
                Ok(None) => {}
                Err(e) => warn!(asset_id = %asset.id, error = %e, "Thumbnail hook failed"),
            }
        }

        Ok(())
    }

    /// Compare the served content type against the URL-inferred kind.
    /// A tiny textual payload where media was expected is reclassified to
    /// a document and flagged, keeping the file under a truthful extension.
    async fn reinspect(
        &self,
        asset: &mut Asset,
        actual_content_type: Option<&str>,
        path: &std::path::Path,
        written: u64,
    ) -> Result<()> {
        let Some(ct) = actual_content_type else {
            return Ok(());
        };
        let Some(actual_kind) = classify::kind_from_content_type(ct) else {
            return Ok(());
        };

        let expected_media = matches!(
            asset.kind,
            AssetKind::Video | AssetKind::Audio | AssetKind::Image
        );
        if !expected_media || actual_kind != AssetKind::Document {
            return Ok(());
        }
        if written > SMALL_TEXTUAL_LIMIT {
            return Ok(());
        }

        asset.kind = AssetKind::Document;
        asset.error = "Downloaded API response instead of video content".to_string();

        let new_extension = if ct.contains("json") { ".json" } else { ".txt" };
        if let Some(parent) = path.parent() {
            let renamed = parent.join(format!("{}{}", asset.id, new_extension));
            if tokio::fs::rename(path, &renamed).await.is_ok() {
                asset.local_path = format!("{}/{}{}", asset.job_id, asset.id, new_extension);
            }
        }
        Ok(())
    }

    /// Re-run the thumbnail hook for a finished asset.
    pub async fn regenerate_thumbnail(&self, asset: &mut Asset) -> Result<()> {
        if asset.local_path.is_empty() {
            return Err(ScrapeError::Validation(
                "asset has no downloaded file".into(),
            ));
        }
        let settings = self.store.settings_snapshot();
        let source = settings.storage_path.join(&asset.local_path);
        if !source.exists() {
            return Err(ScrapeError::Validation(format!(
                "file missing: {}",
                source.display()
            )));
        }

        match self
            .thumbs
            .generate(asset, &source, &settings.thumbnails_path)
            .await?
        {
            Some(rel) => asset.thumbnail_path = rel,
            None => asset.thumbnail_path.clear(),
        }
        self.store.update_asset(asset)?;
        Ok(())
    }
}
