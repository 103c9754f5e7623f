//! Async HTTP client shared by catalog, chapter, and image fetches.
//!
//! Every attempt passes the process-wide request budget gate before it is
//! issued, so catalog reads, content fetches, and image fetches all count
//! toward the same anti-abuse threshold. Transient failures (timeout,
//! connection errors, HTTP 5xx, HTTP 429) are retried with backoff; mirror
//! domains are tried in order when the primary keeps failing.

use std::sync::Arc;
use std::time::Duration;

use crate::remote::{is_source_host, RemoteError, SOURCE_DOMAINS};
use crate::sync::scheduler::RequestBudget;
use reqwest::Url;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/96.0.4664.97 Safari/537.36";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_REDIRECTS: usize = 10;

/// Default number of attempts per URL (initial plus retries).
const DEFAULT_RETRY_COUNT: u32 = 3;
/// Default backoff delays in seconds after each failed attempt.
const DEFAULT_BACKOFF_SECS: [u64; 2] = [1, 2];
/// Backoff for HTTP 429 (rate limit): wait longer so the server can recover.
const BACKOFF_429_SECS: [u64; 4] = [30, 60, 90, 120];

/// Shared async client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BudgetedClient {
    inner: reqwest::Client,
    budget: Arc<RequestBudget>,
    retry_count: u32,
    backoff_secs: Vec<u64>,
}

impl BudgetedClient {
    /// Builder for custom User-Agent, timeout, and retry settings.
    pub fn builder(budget: Arc<RequestBudget>) -> BudgetedClientBuilder {
        BudgetedClientBuilder {
            budget,
            user_agent: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_backoff_secs: DEFAULT_BACKOFF_SECS.to_vec(),
        }
    }

    /// GET a page and return its body as text. Retries transients; rotates
    /// through mirror domains when the URL points at a source host.
    pub async fn get_html(&self, url: &str) -> Result<String, RemoteError> {
        let response = self.get_checked(url).await?;
        let final_url = response.url().to_string();
        response.text().await.map_err(|e| RemoteError::BodyRead {
            url: final_url,
            reason: e.to_string(),
        })
    }

    /// GET a binary blob (image). Returns the bytes plus a file extension
    /// derived from the Content-Type header.
    pub async fn get_bytes(&self, url: &str) -> Result<(Vec<u8>, String), RemoteError> {
        let response = self.get_checked(url).await?;
        let final_url = response.url().to_string();
        let ext = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|ct| {
                if ct.contains("jpeg") || ct.contains("jpg") {
                    "jpg"
                } else if ct.contains("gif") {
                    "gif"
                } else if ct.contains("webp") {
                    "webp"
                } else {
                    "png"
                }
            })
            .unwrap_or("png")
            .to_string();
        let bytes = response.bytes().await.map_err(|e| RemoteError::BodyRead {
            url: final_url,
            reason: e.to_string(),
        })?;
        Ok((bytes.to_vec(), ext))
    }

    /// GET with retry, budget accounting, and mirror fallback; returns the
    /// response only when the status is 2xx.
    async fn get_checked(&self, url: &str) -> Result<reqwest::Response, RemoteError> {
        let candidates = mirror_candidates(url);
        let mut last_err: Option<RemoteError> = None;
        for candidate in &candidates {
            match self.get_one_host(candidate).await {
                Ok(response) => return Ok(response),
                // A 404 on one mirror may just mean it lags behind; try the next.
                Err(e @ RemoteError::NotFound { .. }) if candidates.len() > 1 => {
                    last_err = Some(e);
                }
                Err(e) if e.is_transient() => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| RemoteError::Transient {
            url: url.to_string(),
            reason: "no source domain responded".to_string(),
        }))
    }

    /// Retry loop against a single host.
    async fn get_one_host(&self, url: &str) -> Result<reqwest::Response, RemoteError> {
        let referer = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| format!("https://{}", h)));
        let max_attempts = self.retry_count.max(1);
        let mut last_err: Option<RemoteError> = None;
        for attempt in 0..max_attempts {
            self.budget.acquire().await;
            let mut request = self.inner.get(url);
            if let Some(ref referer) = referer {
                request = request.header("Referer", referer);
            }
            let err = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    classify_status(status.as_u16(), url)
                }
                Err(e) => classify_request_error(e, url),
            };
            if err.is_transient() && attempt < max_attempts - 1 {
                let rate_limited =
                    matches!(&err, RemoteError::Transient { reason, .. } if reason.contains("429"));
                let backoff = if rate_limited {
                    backoff_at(&BACKOFF_429_SECS, attempt)
                } else {
                    backoff_at(&self.backoff_secs, attempt)
                };
                last_err = Some(err);
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            } else {
                return Err(err);
            }
        }
        Err(last_err.unwrap_or_else(|| RemoteError::Transient {
            url: url.to_string(),
            reason: "exhausted retries".to_string(),
        }))
    }
}

/// Builder for [BudgetedClient].
#[derive(Debug)]
pub struct BudgetedClientBuilder {
    budget: Arc<RequestBudget>,
    user_agent: Option<String>,
    timeout_secs: u64,
    retry_count: u32,
    retry_backoff_secs: Vec<u64>,
}

impl BudgetedClientBuilder {
    /// Set a custom User-Agent. If not set, a browser-like default is used.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Set request timeout in seconds. Default 30.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set number of HTTP attempts for transient failures (default 3).
    pub fn retry_count(mut self, n: u32) -> Self {
        self.retry_count = n.max(1);
        self
    }

    /// Set backoff delays in seconds before each retry. Length should be
    /// retry_count - 1; if shorter, the last value is reused.
    pub fn retry_backoff_secs(mut self, secs: Vec<u64>) -> Self {
        self.retry_backoff_secs = secs;
        self
    }

    /// Build the async client.
    pub fn build(self) -> Result<BudgetedClient, RemoteError> {
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let inner = reqwest::Client::builder()
            .cookie_store(true)
            .user_agent(user_agent)
            .timeout(Duration::from_secs(self.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| RemoteError::Transient {
                url: String::new(),
                reason: format!("failed to build HTTP client: {}", e),
            })?;
        let backoff_secs = if self.retry_backoff_secs.is_empty() {
            DEFAULT_BACKOFF_SECS.to_vec()
        } else {
            self.retry_backoff_secs
        };
        Ok(BudgetedClient {
            inner,
            budget: self.budget,
            retry_count: self.retry_count,
            backoff_secs,
        })
    }
}

fn backoff_at(table: &[u64], attempt: u32) -> u64 {
    table
        .get(attempt as usize)
        .copied()
        .unwrap_or_else(|| table.last().copied().unwrap_or(1))
}

fn classify_status(status: u16, url: &str) -> RemoteError {
    match status {
        404 => RemoteError::NotFound {
            url: url.to_string(),
        },
        429 => RemoteError::Transient {
            url: url.to_string(),
            reason: "HTTP 429".to_string(),
        },
        s if s >= 500 => RemoteError::Transient {
            url: url.to_string(),
            reason: format!("HTTP {}", s),
        },
        s => RemoteError::Permanent {
            status: s,
            url: url.to_string(),
        },
    }
}

fn classify_request_error(e: reqwest::Error, url: &str) -> RemoteError {
    if e.is_timeout() || e.is_connect() {
        RemoteError::Transient {
            url: url.to_string(),
            reason: e.to_string(),
        }
    } else {
        RemoteError::BodyRead {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Rewrite a source-host URL across the known mirror domains, keeping the
/// original host first. Non-source URLs (e.g. image CDNs) get no fallback.
fn mirror_candidates(url: &str) -> Vec<String> {
    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(_) => return vec![url.to_string()],
    };
    let host = match parsed.host_str() {
        Some(h) if is_source_host(h) => h.to_string(),
        _ => return vec![url.to_string()],
    };
    let mut candidates = vec![url.to_string()];
    let path_and_query = &url[url.find(&host).map(|i| i + host.len()).unwrap_or(url.len())..];
    for domain in SOURCE_DOMAINS {
        if host == domain {
            continue;
        }
        candidates.push(format!("https://{}{}", domain, path_and_query));
    }
    candidates
}
