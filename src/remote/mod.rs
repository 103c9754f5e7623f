//! Remote collaborators: catalog/content reader traits, the shared budgeted
//! client, the ln.hako.vn adapter, and the shared error taxonomy.

mod client;
mod error;

pub mod hako;

pub use client::{BudgetedClient, BudgetedClientBuilder};
pub use error::RemoteError;

use crate::model::{Catalog, Chapter, ChapterBody, FetchedImage};
use async_trait::async_trait;
use reqwest::Url;

/// Source domains. The first is canonical; the rest are mirrors serving the
/// same paths, tried in order when a request fails.
pub const SOURCE_DOMAINS: [&str; 3] = ["ln.hako.vn", "docln.net", "docln.sbs"];

/// Reads a title's metadata and ordered volume/chapter catalog.
#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn fetch_catalog(&self, title_url: &str) -> Result<Catalog, RemoteError>;
}

/// Reads chapter bodies and image blobs. Every call counts against the
/// process-wide request budget.
#[async_trait]
pub trait ContentReader: Send + Sync {
    async fn fetch_chapter_body(&self, chapter: &Chapter) -> Result<ChapterBody, RemoteError>;

    async fn fetch_image(&self, url: &str) -> Result<FetchedImage, RemoteError>;
}

/// True when `host` is a source domain or a subdomain of one. Matches on
/// label boundaries only, so `xln.hako.vn` does not pass for `ln.hako.vn`.
pub(crate) fn is_source_host(host: &str) -> bool {
    SOURCE_DOMAINS.iter().any(|d| {
        host.strip_suffix(d)
            .map_or(false, |prefix| prefix.is_empty() || prefix.ends_with('.'))
    })
}

/// Validate a title URL: parseable, host is a known source domain. Returns
/// the URL normalized without a trailing slash.
pub fn validate_title_url(input: &str) -> Result<String, RemoteError> {
    let url = Url::parse(input).map_err(|e| RemoteError::InvalidUrl {
        input: input.to_string(),
        reason: e.to_string(),
    })?;
    let host = url.host_str().ok_or_else(|| RemoteError::InvalidUrl {
        input: input.to_string(),
        reason: "URL has no host".to_string(),
    })?;
    if !is_source_host(host) {
        return Err(RemoteError::InvalidUrl {
            input: input.to_string(),
            reason: format!(
                "unsupported host '{}'; expected one of {}",
                host,
                SOURCE_DOMAINS.join(", ")
            ),
        });
    }
    Ok(input.trim_end_matches('/').to_string())
}
