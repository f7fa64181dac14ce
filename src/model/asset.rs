use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Media category inferred for a candidate URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Image,
    Video,
    Audio,
    Document,
    #[default]
    Unknown,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetKind::Image => "image",
            AssetKind::Video => "video",
            AssetKind::Audio => "audio",
            AssetKind::Document => "document",
            AssetKind::Unknown => "unknown",
        }
    }
}

/// A single media item discovered during a crawl.
///
/// Created the moment a candidate URL passes dedup; updated again on every
/// terminal transition (downloaded, failed, thumbnail generated). References
/// its job by id only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub job_id: super::JobId,
    pub url: String,
    pub kind: AssetKind,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub date: String,
    /// Path relative to the storage root, `<job_id>/<asset_id><ext>`.
    #[serde(default)]
    pub local_path: String,
    /// Path relative to the thumbnails root, set by the thumbnail hook.
    #[serde(default)]
    pub thumbnail_path: String,
    /// Size on disk in bytes, once downloaded.
    #[serde(default)]
    pub size: u64,
    /// Free-form string metadata (original_url, content_type,
    /// actual_content_type, selector provenance).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub downloaded: bool,
    /// Empty when the asset is healthy.
    #[serde(default)]
    pub error: String,
    /// Which stage produced the asset (selector id or "pagination").
    #[serde(default)]
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Asset {
    pub fn new(job_id: impl Into<String>, url: impl Into<String>, kind: AssetKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            url: url.into(),
            kind,
            title: String::new(),
            description: String::new(),
            author: String::new(),
            date: String::new(),
            local_path: String::new(),
            thumbnail_path: String::new(),
            size: 0,
            metadata: BTreeMap::new(),
            downloaded: false,
            error: String::new(),
            source: String::new(),
            created_at: Utc::now(),
        }
    }
}
