//! ln.hako.vn adapter. Fetches the title page (metadata plus volume list),
//! each volume page (cover plus chapter list), and chapter pages; produces
//! the canonical catalog and chapter body types.
//!
//! HTML parsing happens in plain sync helpers so no parsed document is held
//! across an await.

use async_trait::async_trait;
use reqwest::Url;
use scraper::{Html, Selector};

use crate::model::{slug_from_url, Catalog, Chapter, ChapterBody, FetchedImage, Title, Volume};
use crate::remote::{BudgetedClient, CatalogReader, ContentReader, RemoteError};

/// Site reader over the shared budgeted client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct HakoReader {
    client: BudgetedClient,
}

impl HakoReader {
    pub fn new(client: BudgetedClient) -> Self {
        HakoReader { client }
    }
}

#[async_trait]
impl CatalogReader for HakoReader {
    async fn fetch_catalog(&self, title_url: &str) -> Result<Catalog, RemoteError> {
        let html = self.client.get_html(title_url).await?;
        let (title, stubs) = parse_title_page(&html, title_url)?;

        let mut volumes = Vec::with_capacity(stubs.len());
        for stub in stubs {
            let volume_html = self.client.get_html(&stub.url).await?;
            let (cover_url, chapters) = parse_volume_page(&volume_html, &stub.url)?;
            volumes.push(Volume {
                id: slug_from_url(&stub.url),
                title: stub.title,
                url: stub.url,
                cover_url,
                chapters,
            });
        }
        Ok(Catalog { title, volumes })
    }
}

#[async_trait]
impl ContentReader for HakoReader {
    async fn fetch_chapter_body(&self, chapter: &Chapter) -> Result<ChapterBody, RemoteError> {
        let html = self.client.get_html(&chapter.url).await?;
        parse_chapter_page(&html, chapter)
    }

    async fn fetch_image(&self, url: &str) -> Result<FetchedImage, RemoteError> {
        let (data, ext) = self.client.get_bytes(url).await?;
        Ok(FetchedImage {
            url: url.to_string(),
            data,
            ext,
        })
    }
}

/// A volume heading on the title page, before its own page has been read.
struct VolumeStub {
    title: String,
    url: String,
}

/// Parse a CSS selector or return a parse error (avoids panics from
/// Selector::parse).
fn catalog_selector(sel: &str, url: &str) -> Result<Selector, RemoteError> {
    Selector::parse(sel).map_err(|e| RemoteError::ParseCatalog {
        url: url.to_string(),
        message: format!("invalid selector {:?}: {}", sel, e),
    })
}

fn chapter_selector(sel: &str, url: &str) -> Result<Selector, RemoteError> {
    Selector::parse(sel).map_err(|e| RemoteError::ParseChapter {
        url: url.to_string(),
        message: format!("invalid selector {:?}: {}", sel, e),
    })
}

/// Collapse whitespace in element text the way the site renders it.
fn format_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve a possibly relative href against the page it appeared on.
fn resolve_url(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    base.join(href).ok().map(|u| {
        let mut s = u.to_string();
        while s.ends_with('/') {
            s.pop();
        }
        s
    })
}

/// Extract the image URL from an inline `background-image: url('...')` style.
fn cover_from_style(style: &str) -> Option<String> {
    let start = style.find("url(")? + 4;
    let rest = &style[start..];
    let end = rest.find(')')?;
    let url = rest[..end].trim_matches(|c| c == '\'' || c == '"').trim();
    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

/// Title page: series name, author, summary, cover, and the volume headings.
fn parse_title_page(html: &str, url: &str) -> Result<(Title, Vec<VolumeStub>), RemoteError> {
    let doc = Html::parse_document(html);

    let name_sel = catalog_selector("span.series-name", url)?;
    let name = doc
        .select(&name_sel)
        .next()
        .map(|e| format_text(&e.text().collect::<String>()))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RemoteError::ParseCatalog {
            url: url.to_string(),
            message: "series name not found; page layout may have changed".to_string(),
        })?;

    // Author is the first linked info item, with the second as fallback.
    let info_sel = catalog_selector("div.series-information div.info-item a", url)?;
    let author = doc
        .select(&info_sel)
        .next()
        .map(|e| format_text(&e.text().collect::<String>()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Unknown".to_string());

    let summary_sel = catalog_selector("div.summary-content", url)?;
    let description = doc
        .select(&summary_sel)
        .next()
        .map(|e| format_text(&e.text().collect::<String>()))
        .filter(|s| !s.is_empty());

    let cover_sel = catalog_selector("div.series-cover div.img-in-ratio", url)?;
    let cover_url = doc
        .select(&cover_sel)
        .next()
        .and_then(|e| e.value().attr("style"))
        .and_then(cover_from_style)
        .and_then(|u| resolve_url(url, &u));

    let section_sel = catalog_selector("section.volume-list", url)?;
    let sect_title_sel = catalog_selector("span.sect-title", url)?;
    let volume_link_sel = catalog_selector("div.volume-cover a", url)?;
    let mut stubs = Vec::new();
    for section in doc.select(&section_sel) {
        let title = section
            .select(&sect_title_sel)
            .next()
            .map(|e| format_text(&e.text().collect::<String>()))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "Unknown Volume".to_string());
        let href = section
            .select(&volume_link_sel)
            .next()
            .and_then(|a| a.value().attr("href"));
        // A section without a volume link is decorative; skip it.
        if let Some(volume_url) = href.and_then(|h| resolve_url(url, h)) {
            stubs.push(VolumeStub {
                title,
                url: volume_url,
            });
        }
    }

    Ok((
        Title {
            url: url.trim_end_matches('/').to_string(),
            name,
            author,
            description,
            cover_url,
        },
        stubs,
    ))
}

/// Volume page: volume cover and the ordered chapter list.
fn parse_volume_page(
    html: &str,
    url: &str,
) -> Result<(Option<String>, Vec<Chapter>), RemoteError> {
    let doc = Html::parse_document(html);

    let cover_sel = catalog_selector("div.series-cover div.img-in-ratio", url)?;
    let cover_url = doc
        .select(&cover_sel)
        .next()
        .and_then(|e| e.value().attr("style"))
        .and_then(cover_from_style)
        .and_then(|u| resolve_url(url, &u));

    let link_sel = catalog_selector("ul.list-chapters li a", url)?;
    let mut chapters = Vec::new();
    for a in doc.select(&link_sel) {
        let href = match a.value().attr("href") {
            Some(h) => h,
            None => continue,
        };
        let chapter_url = match resolve_url(url, href) {
            Some(u) => u,
            None => continue,
        };
        let title = format_text(&a.text().collect::<String>());
        chapters.push(Chapter {
            id: slug_from_url(&chapter_url),
            title,
            url: chapter_url,
        });
    }
    if chapters.is_empty() {
        return Err(RemoteError::ParseCatalog {
            url: url.to_string(),
            message: "no chapters found on volume page".to_string(),
        });
    }
    Ok((cover_url, chapters))
}

/// Chapter page: heading, cleaned content HTML, and the image URLs it
/// references. Translator footnotes are folded inline; chapter banner images
/// and share links are dropped.
fn parse_chapter_page(html: &str, chapter: &Chapter) -> Result<ChapterBody, RemoteError> {
    let url = &chapter.url;
    let doc = Html::parse_document(html);

    let title_sel = chapter_selector("div.title-top h4", url)?;
    let title = doc
        .select(&title_sel)
        .next()
        .map(|e| format_text(&e.text().collect::<String>()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| chapter.title.clone());

    let content_sel = chapter_selector("div#chapter-content", url)?;
    let content = doc
        .select(&content_sel)
        .next()
        .ok_or_else(|| RemoteError::ParseChapter {
            url: url.to_string(),
            message: "chapter content not found; page layout may have changed".to_string(),
        })?;
    let mut body = content.inner_html();

    // Share/source paragraphs the site injects into the content.
    let blank_sel = chapter_selector(r#"p[target="__blank"]"#, url)?;
    for p in content.select(&blank_sel) {
        body = body.replace(&p.html(), "");
    }

    // Images: drop chapter banners, absolutize the rest so the assembler can
    // key replacements by the exact src value.
    let img_sel = chapter_selector("img", url)?;
    let mut image_urls = Vec::new();
    for img in content.select(&img_sel) {
        let src = match img.value().attr("src") {
            Some(s) => s,
            None => continue,
        };
        if src.contains("chapter-banners") {
            body = body.replace(&img.html(), "");
            continue;
        }
        let absolute = match resolve_url(url, src) {
            Some(u) => u,
            None => continue,
        };
        if absolute != src {
            body = body.replace(
                &format!("src=\"{}\"", src),
                &format!("src=\"{}\"", absolute),
            );
        }
        if !image_urls.contains(&absolute) {
            image_urls.push(absolute);
        }
    }

    // Translator footnotes live outside the content div as div#noteNN blocks
    // referenced by [noteNN] markers in the text.
    let note_sel = chapter_selector(r#"div[id^="note"]"#, url)?;
    let note_text_sel = chapter_selector("span.note-content_real", url)?;
    for note in doc.select(&note_sel) {
        let id = match note.value().attr("id") {
            Some(id) => id,
            None => continue,
        };
        if let Some(span) = note.select(&note_text_sel).next() {
            let text = format_text(&span.text().collect::<String>());
            body = body.replace(&format!("[{}]", id), &format!("(Note: {})", text));
        }
    }

    Ok(ChapterBody {
        title,
        html: body.trim().to_string(),
        image_urls,
    })
}
