use std::path::PathBuf;

use tracing::warn;

use super::ErrorReport;

/// Writes per-error debug bundles under
/// `<log_root>/error_details/<job_id>/<error_id>.json`, with the HTML
/// snippet split into a sibling `.html` file when present.
///
/// Failures to write a bundle are logged and swallowed; the persisted
/// error log in the store remains the authoritative record.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    root: PathBuf,
}

impl ErrorSink {
    pub fn new(log_root: impl Into<PathBuf>) -> Self {
        Self {
            root: log_root.into(),
        }
    }

    pub async fn record(&self, report: &ErrorReport) {
        if let Err(e) = self.write_bundle(report).await {
            warn!(error_id = %report.id, job_id = %report.job_id, error = %e,
                "Failed to write error bundle");
        }
    }

    async fn write_bundle(&self, report: &ErrorReport) -> std::io::Result<()> {
        let dir = self.root.join("error_details").join(&report.job_id);
        tokio::fs::create_dir_all(&dir).await?;

        let json = serde_json::to_vec_pretty(report)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(dir.join(format!("{}.json", report.id)), json).await?;

        if let Some(snippet) = &report.html_snippet {
            tokio::fs::write(dir.join(format!("{}.html", report.id)), snippet).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ScrapeError, Stage};
    use tempfile::TempDir;

    #[tokio::test]
    async fn bundle_lands_under_job_directory() {
        let temp = TempDir::new().unwrap();
        let sink = ErrorSink::new(temp.path());

        let err = ScrapeError::fetch_permanent("boom", Some(404));
        let report = ErrorReport::new("job-9", Stage::Asset, &err).with_snippet("<html></html>");
        sink.record(&report).await;

        let dir = temp.path().join("error_details").join("job-9");
        assert!(dir.join(format!("{}.json", report.id)).exists());
        assert!(dir.join(format!("{}.html", report.id)).exists());
    }
}
