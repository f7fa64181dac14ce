use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ScrapeError;

/// HTML snippets attached to reports are truncated to this many bytes.
pub const MAX_SNIPPET_BYTES: usize = 10 * 1024;

/// Which part of a run produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Seed,
    Page,
    Asset,
    Store,
    Scheduler,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Seed => "seed",
            Stage::Page => "page",
            Stage::Asset => "asset",
            Stage::Store => "store",
            Stage::Scheduler => "scheduler",
        }
    }
}

/// A structured error record, persisted to the error log and optionally
/// mirrored as a JSON debug bundle on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub id: String,
    pub message: String,
    #[serde(default)]
    pub url: String,
    pub job_id: String,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Truncated page source for debugging selector mismatches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_snippet: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub temporary: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
}

impl ErrorReport {
    pub fn new(job_id: impl Into<String>, stage: Stage, error: &ScrapeError) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            message: error.to_string(),
            url: String::new(),
            job_id: job_id.into(),
            stage,
            status_code: error.status(),
            html_snippet: None,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
            temporary: error.is_temporary(),
            retry_count: 0,
            max_retries: crate::fetch::MAX_ATTEMPTS - 1,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Attach a page snippet, truncated at a UTF-8 boundary near
    /// [`MAX_SNIPPET_BYTES`].
    pub fn with_snippet(mut self, html: &str) -> Self {
        let snippet = if html.len() > MAX_SNIPPET_BYTES {
            let mut end = MAX_SNIPPET_BYTES;
            while !html.is_char_boundary(end) {
                end -= 1;
            }
            &html[..end]
        } else {
            html
        };
        self.html_snippet = Some(snippet.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_captures_classification() {
        let err = ScrapeError::fetch_temporary("gateway timeout", Some(504));
        let report = ErrorReport::new("job-1", Stage::Page, &err).with_url("https://x.test/p");
        assert!(report.temporary);
        assert_eq!(report.status_code, Some(504));
        assert_eq!(report.stage, Stage::Page);
        assert_eq!(report.url, "https://x.test/p");
    }

    #[test]
    fn snippet_is_truncated_on_char_boundary() {
        let err = ScrapeError::Validation("selector".into());
        let big = "é".repeat(MAX_SNIPPET_BYTES); // 2 bytes per char
        let report = ErrorReport::new("job-1", Stage::Page, &err).with_snippet(&big);
        let snippet = report.html_snippet.unwrap();
        assert!(snippet.len() <= MAX_SNIPPET_BYTES);
        assert!(snippet.chars().all(|c| c == 'é'));
    }
}
