//! HTTP fetching with browser-shaped headers, per-job cookie jars and a
//! bounded retry policy.
//!
//! Client errors (status < 500) are permanent and never retried; transport
//! failures and 5xx responses back off `(attempt + 1) * 2s` between
//! attempts. The request is rebuilt from scratch on every attempt.

use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Result, ScrapeError};
use crate::model::{Job, JobId};
use crate::store::Store;

/// Total attempts per request, first try included.
pub const MAX_ATTEMPTS: u32 = 3;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Per-job request parameters, copied out of the job once per run.
#[derive(Debug, Clone)]
pub struct FetchScope {
    pub job_id: JobId,
    /// Sent as Referer on every request of the run.
    pub referer: String,
    pub timeout: Duration,
    /// Overrides the rotated pool when non-empty.
    pub user_agent: String,
    pub verify_tls: bool,
}

impl FetchScope {
    pub fn for_job(job: &Job, settings: &crate::model::Settings) -> Self {
        Self {
            job_id: job.id.clone(),
            referer: job.base_url.clone(),
            timeout: Duration::from_millis(if job.rules.timeout_ms > 0 {
                job.rules.timeout_ms
            } else {
                settings.default_timeout_ms
            }),
            user_agent: job.rules.user_agent.clone(),
            verify_tls: settings.verify_tls,
        }
    }
}

/// A fetched page, body fully read.
#[derive(Debug)]
pub struct PageResponse {
    /// URL after redirects.
    pub final_url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

pub struct Fetcher {
    store: Arc<Store>,
    /// One client per job so each job gets its own cookie jar.
    clients: DashMap<JobId, Client>,
    ua_cursor: AtomicUsize,
}

impl Fetcher {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            clients: DashMap::new(),
            ua_cursor: AtomicUsize::new(0),
        }
    }

    /// Fetch an HTML page, reading the whole body.
    pub async fn page(
        &self,
        scope: &FetchScope,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<PageResponse> {
        let response = self
            .send_with_retry(scope, url, token, scope.timeout)
            .await?;
        let final_url = response.url().clone();
        let status = response.status().as_u16();
        let content_type = header_string(&response, reqwest::header::CONTENT_TYPE);
        let body = response
            .text()
            .await
            .map_err(|e| ScrapeError::fetch_temporary(format!("failed to read body: {e}"), None))?;

        Ok(PageResponse {
            final_url,
            status,
            content_type,
            body,
        })
    }

    /// Fetch until response headers arrive, leaving the body unread for
    /// streaming. The reqwest timeout runs until the body is drained, so
    /// downloads get their own `budget` instead of the page timeout.
    pub async fn begin_download(
        &self,
        scope: &FetchScope,
        url: &Url,
        token: &CancellationToken,
        budget: Duration,
    ) -> Result<reqwest::Response> {
        self.send_with_retry(scope, url, token, budget).await
    }

    /// Drop a job's client (and with it the cookie jar).
    pub fn forget_job(&self, job_id: &str) {
        self.clients.remove(job_id);
    }

    async fn send_with_retry(
        &self,
        scope: &FetchScope,
        url: &Url,
        token: &CancellationToken,
        request_timeout: Duration,
    ) -> Result<reqwest::Response> {
        let client = self.client_for(scope)?;
        let mut last_error = ScrapeError::fetch_temporary("no attempt made", None);

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                // Attempt i failing waits (i + 1) * 2s; at this point the
                // previous attempt is `attempt - 1`.
                let backoff = Duration::from_secs(u64::from(attempt) * 2);
                debug!(url = %url, attempt, ?backoff, "Retrying after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = token.cancelled() => return Err(ScrapeError::Cancelled),
                }
            }
            if token.is_cancelled() {
                return Err(ScrapeError::Cancelled);
            }

            // A fresh request every attempt; builders are not reusable
            // once a body stream has been consumed.
            let request = self.build_request(&client, scope, url, request_timeout);
            let outcome = tokio::select! {
                result = request.send() => result,
                _ = token.cancelled() => return Err(ScrapeError::Cancelled),
            };

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        if attempt > 0 {
                            debug!(url = %url, attempt, "Fetch succeeded after retry");
                        }
                        return Ok(response);
                    }
                    if status.is_server_error() {
                        last_error = ScrapeError::fetch_temporary(
                            format!("HTTP {status}"),
                            Some(status.as_u16()),
                        );
                        continue;
                    }
                    // Client errors are final; retrying cannot help.
                    return Err(ScrapeError::fetch_permanent(
                        format!("HTTP {status}"),
                        Some(status.as_u16()),
                    ));
                }
                Err(e) => {
                    last_error = ScrapeError::fetch_temporary(
                        if e.is_timeout() {
                            format!("request timed out: {e}")
                        } else {
                            format!("request failed: {e}")
                        },
                        None,
                    );
                }
            }
        }

        warn!(url = %url, attempts = MAX_ATTEMPTS, error = %last_error, "Fetch gave up");
        Err(last_error)
    }

    fn build_request(
        &self,
        client: &Client,
        scope: &FetchScope,
        url: &Url,
        request_timeout: Duration,
    ) -> reqwest::RequestBuilder {
        client
            .get(url.clone())
            .timeout(request_timeout)
            .header(reqwest::header::USER_AGENT, self.user_agent_for(scope))
            .header(reqwest::header::ACCEPT, ACCEPT)
            .header(reqwest::header::ACCEPT_LANGUAGE, ACCEPT_LANGUAGE)
            .header(reqwest::header::REFERER, scope.referer.clone())
            .header(reqwest::header::CONNECTION, "keep-alive")
            .header("Upgrade-Insecure-Requests", "1")
    }

    /// Job override when set, else round-robin over the configured pool.
    fn user_agent_for(&self, scope: &FetchScope) -> String {
        if !scope.user_agent.is_empty() {
            return scope.user_agent.clone();
        }
        let agents = self.store.settings_snapshot().user_agents;
        if agents.is_empty() {
            return format!("mediagrab/{}", env!("CARGO_PKG_VERSION"));
        }
        let index = self.ua_cursor.fetch_add(1, Ordering::Relaxed) % agents.len();
        agents[index].clone()
    }

    fn client_for(&self, scope: &FetchScope) -> Result<Client> {
        if let Some(client) = self.clients.get(&scope.job_id) {
            return Ok(client.clone());
        }

        let client = Client::builder()
            .cookie_store(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .danger_accept_invalid_certs(!scope.verify_tls)
            .build()
            .map_err(|e| ScrapeError::fetch_permanent(format!("client build failed: {e}"), None))?;

        self.clients.insert(scope.job_id.clone(), client.clone());
        Ok(client)
    }
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
