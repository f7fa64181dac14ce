use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ScrapeError;

/// A user-defined scraping pipeline: seed URL, selectors, crawl rules and
/// an optional recurring schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: super::JobId,
    pub name: String,
    /// Seed URL the crawl starts from.
    pub base_url: String,
    pub selectors: Vec<Selector>,
    #[serde(default)]
    pub rules: Rules,
    /// Opaque serialized plan; an external interpreter may expand it into
    /// selectors before the job reaches this crate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<serde_json::Value>,
    /// Five-field cron expression for recurring launches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default)]
    pub status: JobStatus,
    /// Current pagination cursor, starting at 1.
    #[serde(default = "default_current_page")]
    pub current_page: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub last_error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_current_page() -> u32 {
    1
}

impl Job {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            name: name.into(),
            base_url: base_url.into(),
            selectors: Vec::new(),
            rules: Rules::default(),
            pipeline: None,
            schedule: None,
            status: JobStatus::Idle,
            current_page: 1,
            last_run: None,
            next_run: None,
            metadata: BTreeMap::new(),
            last_error: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate invariants that must hold before a job is accepted:
    /// a parseable seed URL, at least one required `links` selector and at
    /// least one required `assets` selector, and a parseable schedule.
    pub fn validate(&self) -> Result<(), ScrapeError> {
        if self.name.trim().is_empty() {
            return Err(ScrapeError::Validation("job name is required".into()));
        }
        Url::parse(&self.base_url)
            .map_err(|e| ScrapeError::Validation(format!("invalid base_url: {e}")))?;
        if self.current_page == 0 {
            return Err(ScrapeError::Validation("current_page must be >= 1".into()));
        }

        let has_required = |purpose: SelectorPurpose| {
            self.selectors
                .iter()
                .any(|s| s.purpose == purpose && !s.optional)
        };
        if !has_required(SelectorPurpose::Links) {
            return Err(ScrapeError::Validation(
                "at least one required links selector is needed".into(),
            ));
        }
        if !has_required(SelectorPurpose::Assets) {
            return Err(ScrapeError::Validation(
                "at least one required assets selector is needed".into(),
            ));
        }

        for selector in &self.selectors {
            if selector.value.trim().is_empty() {
                return Err(ScrapeError::Validation(format!(
                    "selector {} has an empty value",
                    selector.id
                )));
            }
        }

        if let Some(expr) = &self.schedule {
            crate::sched::parse_schedule(expr)
                .map_err(|e| ScrapeError::Validation(format!("invalid schedule: {e}")))?;
        }

        Ok(())
    }

    /// Seed URL with the pagination cursor applied to a `page=` query
    /// parameter, when one is present.
    pub fn paginated_url(&self) -> Result<Url, ScrapeError> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| ScrapeError::Validation(format!("invalid base_url: {e}")))?;
        if self.current_page <= 1 {
            return Ok(url);
        }
        Ok(with_page_param(&url, self.current_page))
    }

    pub fn selectors_for(&self, purpose: SelectorPurpose) -> impl Iterator<Item = &Selector> {
        let mut matching: Vec<&Selector> = self
            .selectors
            .iter()
            .filter(move |s| s.purpose == purpose)
            .collect();
        matching.sort_by_key(|s| s.priority);
        matching.into_iter()
    }
}

/// Rebuild `url` with `page=<page>` replacing any existing `page` parameter.
pub fn with_page_param(url: &Url, page: u32) -> Url {
    let mut next = url.clone();
    let others: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    next.query_pairs_mut()
        .clear()
        .extend_pairs(others)
        .append_pair("page", &page.to_string());
    next
}

/// Lifecycle states of a job.
///
/// `Starting` closes the window between the start request and the engine
/// picking the job up; everything after `Running` is terminal except
/// `Stopping`, which is the drain phase of an explicit stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Idle,
    Starting,
    Stopping,
    Running,
    Stopped,
    Completed,
    Failed,
}

impl JobStatus {
    /// States from which a new run may be started.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            JobStatus::Idle | JobStatus::Stopped | JobStatus::Completed | JobStatus::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Starting | JobStatus::Running | JobStatus::Stopping
        )
    }
}

/// What a selector's matches are used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorPurpose {
    Links,
    Assets,
    Pagination,
    Metadata,
}

/// A CSS selector plus routing information for its matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selector {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// CSS expression evaluated against each fetched page.
    pub value: String,
    /// Preferred attribute to read the match value from. When empty, the
    /// extractor falls back to `src`, `href` and the `data-*` carriers.
    #[serde(default)]
    pub attribute: String,
    pub purpose: SelectorPurpose,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub optional: bool,
    /// Substring filter applied to matched URLs, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
}

/// Per-job crawl policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rules {
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Link-following depth limit; the seed page is depth 0.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Overrides the rotated User-Agent pool when set.
    #[serde(default)]
    pub user_agent: String,
    /// Politeness delay between page fetches, in milliseconds.
    #[serde(default)]
    pub request_delay_ms: u64,
    /// Follow links onto other hosts. Off by default.
    #[serde(default)]
    pub follow_external: bool,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_depth() -> u32 {
    2
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_depth: default_max_depth(),
            user_agent: String::new(),
            request_delay_ms: 0,
            follow_external: false,
        }
    }
}
