//! EPUB archive assembler. Merges newly fetched chapters into a title's
//! archive: carries forward everything already materialized from the
//! previous file, normalizes new bodies, dedups images by content
//! fingerprint, regenerates navigation wholesale from record order, and
//! replaces the archive atomically. A failure anywhere during the build
//! leaves the previous file untouched.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use zip::read::ZipArchive;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::model::{FetchedChapter, FetchedImage, Title};
use crate::state::LocalRecord;

const CONTAINER_XML: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n  <rootfiles>\n    <rootfile full-path=\"OEBPS/content.opf\" media-type=\"application/oebps-package+xml\"/>\n  </rootfiles>\n</container>";

const MIMETYPE: &[u8] = b"application/epub+zip";
const OEBPS_PREFIX: &str = "OEBPS/";
const TEXT_PREFIX: &str = "OEBPS/text/";
const IMAGES_PREFIX: &str = "OEBPS/images/";

/// Errors from the assembler. Any error aborts the merge with the previous
/// archive preserved.
#[derive(Debug, Error)]
pub enum EpubError {
    #[error("Cannot write archive: title name is empty.")]
    EmptyTitle,

    #[error("Cannot read previous archive {path}: {message}")]
    ReadExisting { path: PathBuf, message: String },

    #[error("Cannot write archive {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to assemble archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Failed to write archive contents: {0}")]
    WriteIo(#[from] std::io::Error),
}

/// What a merge did: chapters now embedded in the archive, and fetched
/// chapters that were rejected as malformed (excluded, not materialized).
#[derive(Debug, Default)]
pub struct MergeReport {
    /// (volume id, chapter id) pairs whose bodies this merge newly embedded.
    pub embedded: Vec<(String, String)>,
    /// (chapter id, reason) for fetched bodies excluded from the merge.
    pub rejected: Vec<(String, String)>,
    /// (volume id, chapter id) pairs the record claims materialized but
    /// whose documents the previous archive does not hold. Their content is
    /// gone; the caller must drop the claim so they are fetched again.
    pub missing: Vec<(String, String)>,
}

/// Cover for the intro page: absent, title-only (fetch failed upstream), or
/// an image blob.
#[derive(Debug)]
pub enum Cover {
    None,
    TitleOnly,
    Image(FetchedImage),
}

/// Merge `fetched` (already in catalog order) into the archive at `path`.
///
/// `record` must already be aligned to the current catalog; its volume and
/// chapter order is the navigation order. Chapters marked materialized are
/// carried forward byte-for-byte from the previous archive; `fetched`
/// chapters are normalized and added. The new archive is built in a
/// temporary file beside `path` and only replaces it after a fully
/// successful build.
pub fn merge(
    path: &Path,
    title: &Title,
    record: &LocalRecord,
    fetched: &[FetchedChapter],
    cover: Cover,
) -> Result<MergeReport, EpubError> {
    if title.name.trim().is_empty() {
        return Err(EpubError::EmptyTitle);
    }

    let mut report = MergeReport::default();

    // Previous archive contents to carry forward: chapter documents for
    // materialized chapters, plus every embedded image.
    let mut carried_docs: BTreeMap<String, String> = BTreeMap::new();
    let mut carried_images: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    if path.exists() {
        read_existing(path, record, &mut carried_docs, &mut carried_images)?;
    }

    // Normalize the newly fetched bodies. Malformed ones are excluded from
    // this merge and reported; the rest of the title proceeds.
    let mut new_docs: BTreeMap<String, String> = BTreeMap::new();
    let mut new_images: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for chapter in fetched {
        match normalize_chapter(chapter, &mut new_images) {
            Ok(document) => {
                new_docs.insert(doc_name(&chapter.volume_id, &chapter.chapter.id), document);
                report
                    .embedded
                    .push((chapter.volume_id.clone(), chapter.chapter.id.clone()));
            }
            Err(reason) => report.rejected.push((chapter.chapter.id.clone(), reason)),
        }
    }

    // Final chapter document list in record (navigation) order.
    let mut entries: Vec<NavEntry> = Vec::new();
    for volume in &record.volumes {
        let mut nav_volume = NavEntry {
            title: volume.title.clone(),
            chapters: Vec::new(),
        };
        for chapter in &volume.chapters {
            let name = doc_name(&volume.id, &chapter.id);
            let content = if let Some(doc) = new_docs.get(&name) {
                doc.clone()
            } else if chapter.materialized {
                match carried_docs.get(&name) {
                    Some(doc) => doc.clone(),
                    // Record claims it but the old archive lacks it (e.g. a
                    // gutted or replaced file). Report it so the claim gets
                    // dropped and the chapter is fetched again.
                    None => {
                        report
                            .missing
                            .push((volume.id.clone(), chapter.id.clone()));
                        continue;
                    }
                }
            } else {
                continue;
            };
            nav_volume
                .chapters
                .push((name, chapter.title.clone(), content));
        }
        if !nav_volume.chapters.is_empty() {
            entries.push(nav_volume);
        }
    }

    write_archive(path, title, &entries, &carried_images, &new_images, &cover)?;
    Ok(report)
}

struct NavEntry {
    title: String,
    /// (document name, display title, xhtml content)
    chapters: Vec<(String, String, String)>,
}

/// Read carried-forward chapter documents and all images from the previous
/// archive. Any zip or IO failure here aborts the merge.
fn read_existing(
    path: &Path,
    record: &LocalRecord,
    docs: &mut BTreeMap<String, String>,
    images: &mut BTreeMap<String, Vec<u8>>,
) -> Result<(), EpubError> {
    let read_err = |message: String| EpubError::ReadExisting {
        path: path.to_path_buf(),
        message,
    };
    let file = std::fs::File::open(path).map_err(|e| read_err(e.to_string()))?;
    let mut zip = ZipArchive::new(file).map_err(|e| read_err(e.to_string()))?;

    let wanted: Vec<String> = record
        .volumes
        .iter()
        .flat_map(|v| {
            v.chapters
                .iter()
                .filter(|c| c.materialized)
                .map(|c| doc_name(&v.id, &c.id))
        })
        .collect();

    let names: Vec<String> = zip.file_names().map(String::from).collect();
    for name in names {
        if name.starts_with(IMAGES_PREFIX) {
            // The cover is rewritten from the current fetch on every merge;
            // carrying an old one forward accumulates stale files.
            if name
                .trim_start_matches(IMAGES_PREFIX)
                .starts_with("cover.")
            {
                continue;
            }
            let mut entry = zip.by_name(&name).map_err(|e| read_err(e.to_string()))?;
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut data)
                .map_err(|e| read_err(e.to_string()))?;
            images.insert(name, data);
        } else if wanted.contains(&name) {
            let mut entry = zip.by_name(&name).map_err(|e| read_err(e.to_string()))?;
            let mut content = String::new();
            entry
                .read_to_string(&mut content)
                .map_err(|e| read_err(e.to_string()))?;
            docs.insert(name, content);
        }
    }
    Ok(())
}

/// Normalize one fetched chapter into a full XHTML document, embedding its
/// images under fingerprint-derived names. Returns Err with a reason when the
/// body is unusable.
fn normalize_chapter(
    chapter: &FetchedChapter,
    images: &mut BTreeMap<String, Vec<u8>>,
) -> Result<String, String> {
    let mut html = chapter.body.html.trim().to_string();
    if html.is_empty() {
        return Err("empty chapter body".to_string());
    }

    for image in &chapter.images {
        if image.data.is_empty() {
            continue;
        }
        // Content-derived name: identical decorative images referenced many
        // times in one chapter collapse to a single stored file.
        let name = format!(
            "{}{}.{}",
            IMAGES_PREFIX,
            fingerprint(&image.data),
            image.ext
        );
        images
            .entry(name.clone())
            .or_insert_with(|| image.data.clone());
        let href = format!("../{}", name.trim_start_matches(OEBPS_PREFIX));
        html = html.replace(
            &format!("src=\"{}\"", image.url),
            &format!("src=\"{}\"", href),
        );
    }

    let heading = if chapter.body.title.is_empty() {
        chapter.chapter.title.clone()
    } else {
        chapter.body.title.clone()
    };
    Ok(format!(
        r#"<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
  <meta charset="UTF-8"/>
  <title>{title}</title>
</head>
<body>
  <h2>{title}</h2>
{body}
</body>
</html>
"#,
        title = html_escape_attr(&heading),
        body = html,
    ))
}

fn fingerprint(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..8])
}

/// Document name for a chapter, stable across syncs and insertions: derived
/// from ids, never from position.
fn doc_name(volume_id: &str, chapter_id: &str) -> String {
    format!(
        "{}{}--{}.xhtml",
        TEXT_PREFIX,
        sanitize_name(volume_id),
        sanitize_name(chapter_id)
    )
}

fn sanitize_name(id: &str) -> String {
    let mut s: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    while s.contains("--") {
        s = s.replace("--", "-");
    }
    let s = s.trim_matches('-');
    if s.is_empty() {
        "item".to_string()
    } else {
        s.to_string()
    }
}

/// Build the full archive in a temp file beside `path` and atomically
/// replace the previous one.
fn write_archive(
    path: &Path,
    title: &Title,
    entries: &[NavEntry],
    carried_images: &BTreeMap<String, Vec<u8>>,
    new_images: &BTreeMap<String, Vec<u8>>,
    cover: &Cover,
) -> Result<(), EpubError> {
    let io_err = |source| EpubError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    let mut zip = ZipWriter::new(tmp);

    let options_stored = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    let options_deflate = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    // Mimetype first, uncompressed (required by the container format).
    zip.start_file("mimetype", options_stored)?;
    zip.write_all(MIMETYPE)?;
    zip.start_file("META-INF/container.xml", options_deflate)?;
    zip.write_all(CONTAINER_XML)?;

    let cover_name = match cover {
        Cover::Image(image) => {
            let name = format!("{}cover.{}", IMAGES_PREFIX, image.ext);
            zip.start_file(&name, options_deflate)?;
            zip.write_all(&image.data)?;
            Some(name)
        }
        _ => None,
    };

    write_opf(
        title,
        entries,
        carried_images,
        new_images,
        cover_name.as_deref(),
        &mut zip,
        options_deflate,
    )?;
    write_nav(entries, &mut zip, options_deflate)?;
    write_intro(title, cover, cover_name.as_deref(), &mut zip, options_deflate)?;

    for volume in entries {
        for (name, _, content) in &volume.chapters {
            zip.start_file(name.as_str(), options_deflate)?;
            zip.write_all(content.as_bytes())?;
        }
    }
    for (name, data) in carried_images.iter().chain(new_images.iter()) {
        if cover_name.as_deref() == Some(name.as_str()) {
            continue;
        }
        zip.start_file(name.as_str(), options_deflate)?;
        zip.write_all(data)?;
    }

    let tmp = zip.finish()?;
    tmp.persist(path).map_err(|e| io_err(e.error)).map(|_| ())
}

#[allow(clippy::too_many_arguments)]
fn write_opf(
    title: &Title,
    entries: &[NavEntry],
    carried_images: &BTreeMap<String, Vec<u8>>,
    new_images: &BTreeMap<String, Vec<u8>>,
    cover_name: Option<&str>,
    zip: &mut ZipWriter<tempfile::NamedTempFile>,
    options: SimpleFileOptions,
) -> Result<(), EpubError> {
    let mut manifest = String::from(
        r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
  <item id="intro" href="intro.xhtml" media-type="application/xhtml+xml"/>
"#,
    );
    if let Some(name) = cover_name {
        manifest.push_str(&format!(
            "  <item id=\"cover-img\" href=\"{}\" media-type=\"{}\" properties=\"cover-image\"/>\n",
            href_of(name),
            media_type_of(name)
        ));
    }
    let mut spine = String::from("  <itemref idref=\"intro\"/>\n");
    let mut index = 0usize;
    for volume in entries {
        for (name, _, _) in &volume.chapters {
            index += 1;
            manifest.push_str(&format!(
                "  <item id=\"chapter-{}\" href=\"{}\" media-type=\"application/xhtml+xml\"/>\n",
                index,
                href_of(name)
            ));
            spine.push_str(&format!("  <itemref idref=\"chapter-{}\"/>\n", index));
        }
    }
    let mut image_index = 0usize;
    for name in carried_images.keys().chain(new_images.keys()) {
        if cover_name == Some(name.as_str()) {
            continue;
        }
        image_index += 1;
        manifest.push_str(&format!(
            "  <item id=\"img-{}\" href=\"{}\" media-type=\"{}\"/>\n",
            image_index,
            href_of(name),
            media_type_of(name)
        ));
    }

    let description = title
        .description
        .as_deref()
        .map(|d| format!("    <dc:description>{}</dc:description>\n", xml_escape(d)))
        .unwrap_or_default();
    let opf = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="book-id" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="book-id">{id}</dc:identifier>
    <dc:title>{name}</dc:title>
    <dc:creator>{author}</dc:creator>
    <dc:language>vi</dc:language>
{description}  </metadata>
  <manifest>
  {manifest}</manifest>
  <spine>
{spine}  </spine>
</package>
"#,
        id = xml_escape(&title.url),
        name = xml_escape(&title.name),
        author = xml_escape(&title.author),
        description = description,
        manifest = manifest,
        spine = spine,
    );
    zip.start_file(format!("{}content.opf", OEBPS_PREFIX), options)?;
    zip.write_all(opf.as_bytes())?;
    Ok(())
}

/// Navigation is regenerated wholesale on every merge: one section per
/// volume, chapters nested in record order. It is never patched in place.
fn write_nav(
    entries: &[NavEntry],
    zip: &mut ZipWriter<tempfile::NamedTempFile>,
    options: SimpleFileOptions,
) -> Result<(), EpubError> {
    let mut items = String::new();
    for volume in entries {
        items.push_str(&format!(
            "      <li><span>{}</span>\n        <ol>\n",
            html_escape_attr(&volume.title)
        ));
        for (name, chapter_title, _) in &volume.chapters {
            items.push_str(&format!(
                "          <li><a href=\"{}\">{}</a></li>\n",
                href_of(name),
                html_escape_attr(chapter_title)
            ));
        }
        items.push_str("        </ol>\n      </li>\n");
    }
    let nav = format!(
        r#"<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<head>
  <meta charset="UTF-8"/>
  <title>Table of Contents</title>
</head>
<body>
  <nav epub:type="toc">
    <h1>Contents</h1>
    <ol>
{}    </ol>
  </nav>
</body>
</html>
"#,
        items
    );
    zip.start_file(format!("{}nav.xhtml", OEBPS_PREFIX), options)?;
    zip.write_all(nav.as_bytes())?;
    Ok(())
}

/// Intro page: cover image (or title-only fallback), name, author, summary.
fn write_intro(
    title: &Title,
    cover: &Cover,
    cover_name: Option<&str>,
    zip: &mut ZipWriter<tempfile::NamedTempFile>,
    options: SimpleFileOptions,
) -> Result<(), EpubError> {
    let cover_html = match (cover, cover_name) {
        (Cover::Image(_), Some(name)) => format!(
            "  <img src=\"{}\" alt=\"Cover\" style=\"max-width: 100%; height: auto;\"/>\n",
            href_of(name)
        ),
        _ => String::new(),
    };
    let description = title
        .description
        .as_deref()
        .map(|d| format!("  <div>{}</div>\n", html_escape_attr(d)))
        .unwrap_or_default();
    let intro = format!(
        r#"<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml">
<head>
  <meta charset="UTF-8"/>
  <title>{name}</title>
</head>
<body style="text-align: center;">
{cover}  <h1>{name}</h1>
  <h3>{author}</h3>
{description}</body>
</html>
"#,
        name = html_escape_attr(&title.name),
        author = html_escape_attr(&title.author),
        cover = cover_html,
        description = description,
    );
    zip.start_file(format!("{}intro.xhtml", OEBPS_PREFIX), options)?;
    zip.write_all(intro.as_bytes())?;
    Ok(())
}

/// Path of an OEBPS entry relative to the OPF.
fn href_of(name: &str) -> String {
    name.trim_start_matches(OEBPS_PREFIX).to_string()
}

fn media_type_of(name: &str) -> &'static str {
    if name.ends_with(".jpg") || name.ends_with(".jpeg") {
        "image/jpeg"
    } else if name.ends_with(".gif") {
        "image/gif"
    } else if name.ends_with(".webp") {
        "image/webp"
    } else {
        "image/png"
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn html_escape_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Catalog, Chapter, ChapterBody, Volume};
    use crate::state::LocalRecord;

    fn title() -> Title {
        Title {
            url: "https://ln.hako.vn/truyen/1-t".to_string(),
            name: "Test Novel".to_string(),
            author: "Author".to_string(),
            description: Some("A story.".to_string()),
            cover_url: None,
        }
    }

    fn chapter(volume: &str, n: u32) -> Chapter {
        Chapter {
            id: format!("chuong-{}", n),
            title: format!("Chương {}", n),
            url: format!("https://ln.hako.vn/truyen/1-t/{}/chuong-{}", volume, n),
        }
    }

    fn catalog(volume_chapter_counts: &[(&str, u32)]) -> Catalog {
        Catalog {
            title: title(),
            volumes: volume_chapter_counts
                .iter()
                .map(|(id, n)| Volume {
                    id: id.to_string(),
                    title: format!("Volume {}", id),
                    url: format!("https://ln.hako.vn/truyen/1-t/{}", id),
                    cover_url: None,
                    chapters: (1..=*n).map(|i| chapter(id, i)).collect(),
                })
                .collect(),
        }
    }

    fn fetched(volume: &str, n: u32) -> FetchedChapter {
        FetchedChapter {
            volume_id: volume.to_string(),
            chapter: chapter(volume, n),
            body: ChapterBody {
                title: format!("Chương {}", n),
                html: format!("<p>Body of chapter {} in {}.</p>", n, volume),
                image_urls: vec![],
            },
            images: vec![],
        }
    }

    fn archive_names(path: &Path) -> Vec<String> {
        let file = std::fs::File::open(path).unwrap();
        let zip = ZipArchive::new(file).unwrap();
        zip.file_names().map(String::from).collect()
    }

    fn read_entry(path: &Path, name: &str) -> String {
        let file = std::fs::File::open(path).unwrap();
        let mut zip = ZipArchive::new(file).unwrap();
        let mut entry = zip.by_name(name).unwrap();
        let mut s = String::new();
        entry.read_to_string(&mut s).unwrap();
        s
    }

    #[test]
    fn first_merge_writes_complete_archive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-novel.epub");
        let catalog = catalog(&[("tap-1", 2)]);
        let record = LocalRecord::from_catalog(&catalog, "test-novel.epub");

        let report = merge(
            &path,
            &title(),
            &record,
            &[fetched("tap-1", 1), fetched("tap-1", 2)],
            Cover::None,
        )
        .unwrap();

        assert_eq!(report.embedded.len(), 2);
        assert!(report.rejected.is_empty());
        let names = archive_names(&path);
        assert!(names.contains(&"mimetype".to_string()));
        assert!(names.contains(&"META-INF/container.xml".to_string()));
        assert!(names.contains(&"OEBPS/content.opf".to_string()));
        assert!(names.contains(&"OEBPS/nav.xhtml".to_string()));
        assert!(names.contains(&"OEBPS/intro.xhtml".to_string()));
        assert!(names.contains(&"OEBPS/text/tap-1--chuong-1.xhtml".to_string()));
        assert!(names.contains(&"OEBPS/text/tap-1--chuong-2.xhtml".to_string()));
    }

    #[test]
    fn incremental_merge_preserves_existing_chapters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-novel.epub");
        let mut catalog = catalog(&[("tap-1", 1)]);
        let mut record = LocalRecord::from_catalog(&catalog, "test-novel.epub");

        merge(&path, &title(), &record, &[fetched("tap-1", 1)], Cover::None).unwrap();
        record.mark_materialized("tap-1", &catalog.volumes[0].chapters[0]);
        let original_doc = read_entry(&path, "OEBPS/text/tap-1--chuong-1.xhtml");

        catalog.volumes[0].chapters.push(chapter("tap-1", 2));
        record.align_to_catalog(&catalog);
        merge(&path, &title(), &record, &[fetched("tap-1", 2)], Cover::None).unwrap();

        assert_eq!(
            read_entry(&path, "OEBPS/text/tap-1--chuong-1.xhtml"),
            original_doc
        );
        assert!(read_entry(&path, "OEBPS/text/tap-1--chuong-2.xhtml").contains("chapter 2"));
    }

    #[test]
    fn nav_is_regenerated_in_record_order_after_insertion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-novel.epub");
        let mut catalog = catalog(&[("tap-1", 2)]);
        let mut record = LocalRecord::from_catalog(&catalog, "test-novel.epub");

        merge(
            &path,
            &title(),
            &record,
            &[fetched("tap-1", 1), fetched("tap-1", 2)],
            Cover::None,
        )
        .unwrap();
        for c in &catalog.volumes[0].chapters {
            record.mark_materialized("tap-1", c);
        }

        // Insert chapter 9 between 1 and 2 upstream.
        catalog.volumes[0].chapters.insert(1, chapter("tap-1", 9));
        record.align_to_catalog(&catalog);
        merge(&path, &title(), &record, &[fetched("tap-1", 9)], Cover::None).unwrap();

        let nav = read_entry(&path, "OEBPS/nav.xhtml");
        let first = nav.find("chuong-1.xhtml").unwrap();
        let ninth = nav.find("chuong-9.xhtml").unwrap();
        let second = nav.find("chuong-2.xhtml").unwrap();
        assert!(first < ninth && ninth < second);

        // Spine follows the same order.
        let opf = read_entry(&path, "OEBPS/content.opf");
        let first = opf.find("chuong-1.xhtml").unwrap();
        let ninth = opf.find("chuong-9.xhtml").unwrap();
        let second = opf.find("chuong-2.xhtml").unwrap();
        assert!(first < ninth && ninth < second);
    }

    #[test]
    fn duplicate_decorative_image_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-novel.epub");
        let catalog = catalog(&[("tap-1", 1)]);
        let record = LocalRecord::from_catalog(&catalog, "test-novel.epub");

        let data = vec![7u8; 32];
        let mut chapter = fetched("tap-1", 1);
        chapter.body.html = "<p>a</p><img src=\"https://i.hako.vn/d.png\"/><p>b</p><img src=\"https://i.hako.vn/d2.png\"/>".to_string();
        chapter.body.image_urls = vec![
            "https://i.hako.vn/d.png".to_string(),
            "https://i.hako.vn/d2.png".to_string(),
        ];
        // Two URLs, identical bytes: one stored image.
        chapter.images = vec![
            FetchedImage {
                url: "https://i.hako.vn/d.png".to_string(),
                data: data.clone(),
                ext: "png".to_string(),
            },
            FetchedImage {
                url: "https://i.hako.vn/d2.png".to_string(),
                data,
                ext: "png".to_string(),
            },
        ];

        merge(&path, &title(), &record, &[chapter], Cover::None).unwrap();
        let images: Vec<String> = archive_names(&path)
            .into_iter()
            .filter(|n| n.starts_with("OEBPS/images/"))
            .collect();
        assert_eq!(images.len(), 1);
        let doc = read_entry(&path, "OEBPS/text/tap-1--chuong-1.xhtml");
        assert!(!doc.contains("https://i.hako.vn"));
        assert_eq!(doc.matches("../images/").count(), 2);
    }

    #[test]
    fn malformed_body_is_excluded_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-novel.epub");
        let catalog = catalog(&[("tap-1", 2)]);
        let record = LocalRecord::from_catalog(&catalog, "test-novel.epub");

        let mut bad = fetched("tap-1", 1);
        bad.body.html = "   ".to_string();
        let report = merge(
            &path,
            &title(),
            &record,
            &[bad, fetched("tap-1", 2)],
            Cover::None,
        )
        .unwrap();

        assert_eq!(
            report.embedded,
            [("tap-1".to_string(), "chuong-2".to_string())]
        );
        assert_eq!(report.rejected.len(), 1);
        let names = archive_names(&path);
        assert!(!names.contains(&"OEBPS/text/tap-1--chuong-1.xhtml".to_string()));
        assert!(names.contains(&"OEBPS/text/tap-1--chuong-2.xhtml".to_string()));
    }

    #[test]
    fn corrupt_previous_archive_aborts_and_preserves_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-novel.epub");
        std::fs::write(&path, b"not a zip archive at all").unwrap();

        let catalog = catalog(&[("tap-1", 1)]);
        let mut record = LocalRecord::from_catalog(&catalog, "test-novel.epub");
        record.mark_materialized("tap-1", &catalog.volumes[0].chapters[0]);

        let result = merge(&path, &title(), &record, &[fetched("tap-1", 1)], Cover::None);
        assert!(matches!(result, Err(EpubError::ReadExisting { .. })));
        assert_eq!(
            std::fs::read(&path).unwrap(),
            b"not a zip archive at all".to_vec()
        );
    }

    #[test]
    fn empty_title_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.epub");
        let catalog = catalog(&[("tap-1", 1)]);
        let record = LocalRecord::from_catalog(&catalog, "x.epub");
        let mut bad_title = title();
        bad_title.name = "  ".to_string();
        assert!(matches!(
            merge(&path, &bad_title, &record, &[], Cover::None),
            Err(EpubError::EmptyTitle)
        ));
    }

    #[test]
    fn cover_image_lands_in_manifest_and_intro() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-novel.epub");
        let catalog = catalog(&[("tap-1", 1)]);
        let record = LocalRecord::from_catalog(&catalog, "test-novel.epub");
        let cover = Cover::Image(FetchedImage {
            url: "https://i.hako.vn/cover.jpg".to_string(),
            data: vec![1, 2, 3],
            ext: "jpg".to_string(),
        });

        merge(&path, &title(), &record, &[fetched("tap-1", 1)], cover).unwrap();
        assert!(archive_names(&path).contains(&"OEBPS/images/cover.jpg".to_string()));
        let opf = read_entry(&path, "OEBPS/content.opf");
        assert!(opf.contains("properties=\"cover-image\""));
        assert!(read_entry(&path, "OEBPS/intro.xhtml").contains("images/cover.jpg"));
    }

    #[test]
    fn claimed_chapter_absent_from_archive_is_reported_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-novel.epub");
        let catalog = catalog(&[("tap-1", 2)]);
        let mut record = LocalRecord::from_catalog(&catalog, "test-novel.epub");

        // Only chapter 2 is ever merged, but the record ends up claiming both.
        merge(&path, &title(), &record, &[fetched("tap-1", 2)], Cover::None).unwrap();
        record.mark_materialized("tap-1", &catalog.volumes[0].chapters[0]);
        record.mark_materialized("tap-1", &catalog.volumes[0].chapters[1]);

        let report = merge(&path, &title(), &record, &[], Cover::None).unwrap();
        assert_eq!(
            report.missing,
            [("tap-1".to_string(), "chuong-1".to_string())]
        );
        let names = archive_names(&path);
        assert!(!names.contains(&"OEBPS/text/tap-1--chuong-1.xhtml".to_string()));
        assert!(names.contains(&"OEBPS/text/tap-1--chuong-2.xhtml".to_string()));
    }

    #[test]
    fn stale_cover_is_not_carried_forward() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test-novel.epub");
        let catalog = catalog(&[("tap-1", 1)]);
        let mut record = LocalRecord::from_catalog(&catalog, "test-novel.epub");

        let cover = Cover::Image(FetchedImage {
            url: "https://i.hako.vn/cover.jpg".to_string(),
            data: vec![1, 2, 3],
            ext: "jpg".to_string(),
        });
        merge(&path, &title(), &record, &[fetched("tap-1", 1)], cover).unwrap();
        record.mark_materialized("tap-1", &catalog.volumes[0].chapters[0]);

        // Cover fetch degrades on the next merge: the old jpg must not
        // survive as a regular image.
        merge(&path, &title(), &record, &[], Cover::TitleOnly).unwrap();
        assert!(!archive_names(&path)
            .iter()
            .any(|n| n.starts_with("OEBPS/images/cover.")));

        // A new cover with a different extension replaces it outright.
        let cover = Cover::Image(FetchedImage {
            url: "https://i.hako.vn/cover.png".to_string(),
            data: vec![9, 9, 9],
            ext: "png".to_string(),
        });
        merge(&path, &title(), &record, &[], cover).unwrap();
        let names = archive_names(&path);
        assert!(names.contains(&"OEBPS/images/cover.png".to_string()));
        assert!(!names.contains(&"OEBPS/images/cover.jpg".to_string()));
    }

    #[test]
    fn repeated_merge_of_same_content_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a.epub");
        let path_b = dir.path().join("b.epub");
        let catalog = catalog(&[("tap-1", 2)]);
        let record = LocalRecord::from_catalog(&catalog, "a.epub");
        let chapters = [fetched("tap-1", 1), fetched("tap-1", 2)];

        merge(&path_a, &title(), &record, &chapters, Cover::None).unwrap();
        merge(&path_b, &title(), &record, &chapters, Cover::None).unwrap();

        // Entry contents are deterministic (no wall-clock metadata in docs).
        for name in [
            "OEBPS/content.opf",
            "OEBPS/nav.xhtml",
            "OEBPS/text/tap-1--chuong-1.xhtml",
        ] {
            assert_eq!(read_entry(&path_a, name), read_entry(&path_b, name));
        }
    }
}
