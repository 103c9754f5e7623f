//! Canonical data model for a remote light novel catalog.
//!
//! The site adapter validates raw HTML into these types at the boundary;
//! the resolver, scheduler, and EPUB assembler only ever see this shape.

use serde::{Deserialize, Serialize};

/// Title metadata. Identity is `url` (the source page), never `name` —
/// display names change upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Title {
    pub url: String,
    pub name: String,
    pub author: String,
    pub description: Option<String>,
    #[serde(rename = "coverUrl")]
    pub cover_url: Option<String>,
}

/// The currently observed remote structure of a title: ordered volumes, each
/// with ordered chapters. Position in these vectors is the ordering key for
/// navigation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub title: Title,
    pub volumes: Vec<Volume>,
}

/// One published volume. `id` is the URL path slug and is stable across
/// renames; `title` is display-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(rename = "coverUrl")]
    pub cover_url: Option<String>,
    pub chapters: Vec<Chapter>,
}

/// Smallest fetchable unit, ordered within its volume. `id` is the URL path
/// slug; insertions shift positions but never ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub title: String,
    pub url: String,
}

/// Parsed chapter page: minimal HTML (block elements only) plus the remote
/// image URLs referenced from it, in document order.
#[derive(Debug, Clone)]
pub struct ChapterBody {
    pub title: String,
    pub html: String,
    pub image_urls: Vec<String>,
}

/// An image fetched for a chapter, still keyed by its remote URL. The
/// assembler renames it by content fingerprint when embedding.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub url: String,
    pub data: Vec<u8>,
    pub ext: String,
}

/// One pending chapter-body fetch. `seq` orders scheduler output and is
/// assigned by the resolver in (volume position, chapter position) order;
/// it is not identity.
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub seq: u64,
    pub volume_id: String,
    pub chapter: Chapter,
}

/// A fully fetched chapter ready for the assembler: normalized body plus the
/// image blobs it references.
#[derive(Debug, Clone)]
pub struct FetchedChapter {
    pub volume_id: String,
    pub chapter: Chapter,
    pub body: ChapterBody,
    pub images: Vec<FetchedImage>,
}

/// Derive the stable identifier for a volume or chapter from its URL: the
/// last non-empty path segment, lowercased. Query and fragment are ignored.
pub fn slug_from_url(url: &str) -> String {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or(without_scheme);
    path.rsplit('/')
        .find(|seg| !seg.is_empty())
        .unwrap_or(path)
        .to_ascii_lowercase()
}
