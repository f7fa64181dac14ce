//! Request and response bodies for the REST surface.
//!
//! Entities (jobs, assets, templates, settings) serialize directly from
//! the model types; the shapes here are the inputs and the computed
//! read-only views.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::humanize::ByteSize;
use crate::model::{Job, Rules, Selector, Template};

/// Body of `POST /api/jobs` and `PUT /api/jobs/{id}`.
///
/// Either an inline definition (name, seed URL, selectors) or a
/// `template_id` reference that copies the template's selectors and rules.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub selectors: Vec<Selector>,
    #[serde(default)]
    pub rules: Option<Rules>,
    #[serde(default)]
    pub schedule: Option<String>,
    /// Opaque serialized plan, stored as-is.
    #[serde(default)]
    pub pipeline: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub template_id: Option<String>,
}

impl JobRequest {
    /// Build a fresh job from this request; `template` is the resolved
    /// template when `template_id` was given.
    pub fn into_job(self, template: Option<&Template>) -> Job {
        let mut job = match template {
            Some(template) => template.instantiate(self.name, self.base_url),
            None => Job::new(self.name, self.base_url),
        };
        if !self.selectors.is_empty() {
            job.selectors = self.selectors;
        }
        if let Some(rules) = self.rules {
            job.rules = rules;
        }
        job.schedule = self.schedule.filter(|s| !s.trim().is_empty());
        job.pipeline = self.pipeline;
        if let Some(metadata) = self.metadata {
            job.metadata.extend(metadata);
        }
        job
    }

    /// Apply this request onto an existing job, keeping identity and run
    /// history.
    pub fn apply_to(self, job: &mut Job) {
        if !self.name.trim().is_empty() {
            job.name = self.name;
        }
        if !self.base_url.trim().is_empty() {
            job.base_url = self.base_url;
        }
        if !self.selectors.is_empty() {
            job.selectors = self.selectors;
        }
        if let Some(rules) = self.rules {
            job.rules = rules;
        }
        job.schedule = self.schedule.filter(|s| !s.trim().is_empty());
        if self.pipeline.is_some() {
            job.pipeline = self.pipeline;
        }
        if let Some(metadata) = self.metadata {
            job.metadata.extend(metadata);
        }
    }
}

/// Body of `POST /api/templates`.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub selectors: Vec<Selector>,
    #[serde(default)]
    pub rules: Option<Rules>,
}

impl TemplateRequest {
    pub fn into_template(self) -> Template {
        let mut template = Template::new(self.name);
        template.description = self.description;
        template.selectors = self.selectors;
        if let Some(rules) = self.rules {
            template.rules = rules;
        }
        template
    }
}

/// Body of `POST /api/templates/{id}/instantiate`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstantiateRequest {
    #[serde(default)]
    pub name: String,
    pub base_url: String,
}

/// `GET /api/jobs/{id}/statistics`.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatistics {
    pub job_id: String,
    pub status: crate::model::JobStatus,
    pub total_assets: usize,
    pub downloaded_assets: usize,
    pub failed_assets: usize,
    pub downloads_in_progress: usize,
    /// Histogram keyed by asset kind.
    pub by_kind: HashMap<String, usize>,
    pub progress_percent: f64,
    /// Seconds since the run started; settles once the run ends.
    pub duration_seconds: Option<i64>,
    pub current_page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<chrono::DateTime<chrono::Utc>>,
}

/// `GET /api/storage/info`.
#[derive(Debug, Clone, Serialize)]
pub struct StorageInfo {
    pub storage_path: String,
    pub storage_bytes: ByteSize,
    pub storage_human: String,
    pub asset_files: u64,
    pub thumbnails_bytes: ByteSize,
    pub thumbnail_files: u64,
}

/// `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: HashMap<String, String>,
    pub version: String,
    pub metrics: crate::observability::MetricsSnapshot,
    pub pool: crate::pool::PoolStats,
}

/// Generic acknowledgement for mutating endpoints.
#[derive(Debug, Serialize)]
pub struct Ack {
    pub success: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { success: true }
    }
}
