//! Sync orchestration: one title at a time through catalog observation,
//! diff resolution, scheduled fetching, archive merge, and state persist.
//! The archive is always written before the record, so a crash between the
//! two leaves the archive ahead of the record and the next run converges.

pub mod diff;
pub mod scheduler;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::epub::{self, Cover, EpubError};
use crate::model::{Catalog, FetchTask, FetchedChapter};
use crate::remote::{validate_title_url, CatalogReader, ContentReader, RemoteError};
use crate::state::{LocalRecord, StateError, StateStore};
use diff::ResolutionPlan;
use scheduler::{FetchResult, Scheduler};

/// Where a sync run currently is. Reported through the phase callback; also
/// names the failing stage in error output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    CatalogFetching,
    Resolving,
    Fetching,
    Merging,
    Persisting,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncPhase::CatalogFetching => "observing catalog",
            SyncPhase::Resolving => "resolving changes",
            SyncPhase::Fetching => "fetching chapters",
            SyncPhase::Merging => "merging archive",
            SyncPhase::Persisting => "saving state",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Epub(#[from] EpubError),

    #[error("Cannot rename archive {from} to {to}: {source}")]
    ArchiveRename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-run knobs and callbacks. Callbacks fire from the orchestrator task.
#[derive(Default)]
pub struct SyncOptions<'a> {
    /// Only sync chapters whose 1-based position across the whole catalog
    /// falls in this inclusive range. Applied after diff resolution.
    pub chapter_range: Option<(u32, u32)>,
    /// Called with (completed, planned) as chapter outcomes arrive.
    pub progress: Option<&'a (dyn Fn(u64, u64) + Sync)>,
    /// Called when the run enters each phase.
    pub on_phase: Option<&'a (dyn Fn(SyncPhase) + Sync)>,
    /// Stops dispatching new fetches; completed work is still merged.
    pub cancel: Option<CancellationToken>,
}

/// What one title sync did.
#[derive(Debug)]
pub struct TitleReport {
    pub url: String,
    pub name: String,
    pub archive_path: PathBuf,
    /// Chapters the resolver queued for this run (after range filtering).
    pub planned: usize,
    /// Chapters newly embedded in the archive.
    pub embedded: usize,
    /// (chapter id, error) for fetches that failed; retried on the next run.
    pub failed: Vec<(String, String)>,
    /// (chapter id, reason) for fetched bodies the assembler rejected.
    pub rejected: Vec<(String, String)>,
    /// (volume id, chapter id) the record claimed materialized but the
    /// previous archive no longer held. Requeued for the next run.
    pub missing: Vec<(String, String)>,
    /// Volume titles present locally but gone upstream.
    pub removed_volumes: Vec<String>,
    /// Previous display name, when the title was renamed upstream.
    pub renamed_from: Option<String>,
    /// True when the archive had to be rebuilt from scratch because the
    /// record claimed content the disk no longer holds.
    pub rebuilt: bool,
    /// True when nothing needed fetching.
    pub up_to_date: bool,
}

/// The engine: readers, state store, output directory, and worker limits.
/// Identity is the title URL throughout; display names only pick file names.
pub struct SyncEngine {
    catalog_reader: Arc<dyn CatalogReader>,
    content_reader: Arc<dyn ContentReader>,
    store: StateStore,
    output_dir: PathBuf,
    scheduler: Scheduler,
}

impl SyncEngine {
    pub fn new(
        catalog_reader: Arc<dyn CatalogReader>,
        content_reader: Arc<dyn ContentReader>,
        store: StateStore,
        output_dir: impl Into<PathBuf>,
        max_workers: usize,
    ) -> Self {
        SyncEngine {
            catalog_reader,
            content_reader,
            store,
            output_dir: output_dir.into(),
            scheduler: Scheduler::new(max_workers),
        }
    }

    /// Sync one title end to end. Holds the per-title claim for the whole
    /// run; a second concurrent sync of the same URL fails fast.
    pub async fn sync_title(
        &self,
        title_url: &str,
        options: &SyncOptions<'_>,
    ) -> Result<TitleReport, SyncError> {
        let url = validate_title_url(title_url)?;
        let _claim = self.store.claim(&url)?;
        let cancel = options.cancel.clone().unwrap_or_default();
        let phase = |p: SyncPhase| {
            if let Some(cb) = options.on_phase {
                cb(p);
            }
        };

        phase(SyncPhase::CatalogFetching);
        let previous = self.store.load(&url)?;
        let catalog = self.catalog_reader.fetch_catalog(&url).await?;

        phase(SyncPhase::Resolving);
        let archive_file = archive_file_name(&catalog.title.name);
        let archive_path = self.output_dir.join(&archive_file);
        let renamed_from = self.handle_rename(previous.as_ref(), &archive_file, &archive_path)?;

        let mut record = match previous {
            Some(mut r) => {
                r.align_to_catalog(&catalog);
                r.archive_file = archive_file.clone();
                r
            }
            None => LocalRecord::from_catalog(&catalog, &archive_file),
        };

        // The record can claim chapters the disk no longer backs (archive
        // deleted, or a rename that could not be reconciled with the files
        // present). Rebuild fully under the current name instead of guessing.
        let rebuilt = record.materialized_count() > 0 && !archive_path.exists();
        if rebuilt {
            for volume in &mut record.volumes {
                for chapter in &mut volume.chapters {
                    chapter.materialized = false;
                    chapter.fetched_at = None;
                }
            }
        }

        let mut plan = diff::resolve(Some(&record), &catalog);
        if let Some(range) = options.chapter_range {
            filter_to_range(&mut plan, &catalog, range);
        }

        if plan.is_empty() {
            phase(SyncPhase::Persisting);
            self.store.save(&record)?;
            return Ok(TitleReport {
                url,
                name: catalog.title.name,
                archive_path,
                planned: 0,
                embedded: 0,
                failed: Vec::new(),
                rejected: Vec::new(),
                missing: Vec::new(),
                removed_volumes: plan.removed_volumes,
                renamed_from,
                rebuilt,
                up_to_date: true,
            });
        }

        phase(SyncPhase::Fetching);
        let planned = plan.tasks.len();
        let mut fetched: Vec<FetchedChapter> = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();
        let mut rx =
            self.scheduler
                .run(plan.tasks, Arc::clone(&self.content_reader), cancel.clone());
        let mut completed = 0u64;
        while let Some(outcome) = rx.recv().await {
            completed += 1;
            if let Some(cb) = options.progress {
                cb(completed, planned as u64);
            }
            match outcome.result {
                FetchResult::Fetched(chapter) => fetched.push(*chapter),
                FetchResult::Failed(e) => {
                    failed.push((outcome.task.chapter.id.clone(), e.to_string()))
                }
            }
        }

        phase(SyncPhase::Merging);
        let cover = self.fetch_cover(&catalog).await;
        let merge_report = epub::merge(&archive_path, &catalog.title, &record, &fetched, cover)?;

        // Only chapters the assembler actually embedded become materialized;
        // failed and rejected ones stay pending for the next run.
        for chapter in &fetched {
            let key = (chapter.volume_id.clone(), chapter.chapter.id.clone());
            if merge_report.embedded.contains(&key) {
                record.mark_materialized(&chapter.volume_id, &chapter.chapter);
            }
        }

        // The record can also claim chapters the previous archive turned out
        // not to hold (truncated or hand-edited file). Their content is gone;
        // dropping the claim queues them again on the next run.
        for (volume_id, chapter_id) in &merge_report.missing {
            record.clear_materialized(volume_id, chapter_id);
        }

        phase(SyncPhase::Persisting);
        self.store.save(&record)?;

        Ok(TitleReport {
            url,
            name: catalog.title.name,
            archive_path,
            planned,
            embedded: merge_report.embedded.len(),
            failed,
            rejected: merge_report.rejected,
            missing: merge_report.missing,
            removed_volumes: plan.removed_volumes,
            renamed_from,
            rebuilt,
            up_to_date: false,
        })
    }

    /// Sync every recorded title in turn. One title failing never stops the
    /// rest; each result is reported against its URL.
    pub async fn sync_all(
        &self,
        options: &SyncOptions<'_>,
    ) -> Result<Vec<(String, Result<TitleReport, SyncError>)>, SyncError> {
        let records = self.store.list()?;
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            let result = self.sync_title(&record.url, options).await;
            results.push((record.url, result));
            if options
                .cancel
                .as_ref()
                .map(|c| c.is_cancelled())
                .unwrap_or(false)
            {
                break;
            }
        }
        Ok(results)
    }

    /// All titles currently recorded, for listing and update-all.
    pub fn recorded_titles(&self) -> Result<Vec<LocalRecord>, StateError> {
        self.store.list()
    }

    /// Display names change upstream; the archive follows the new name. The
    /// old file is moved so already-materialized content carries over.
    fn handle_rename(
        &self,
        previous: Option<&LocalRecord>,
        new_file: &str,
        new_path: &Path,
    ) -> Result<Option<String>, SyncError> {
        let previous = match previous {
            Some(p) if !p.archive_file.is_empty() && p.archive_file != new_file => p,
            _ => return Ok(None),
        };
        let old_path = self.output_dir.join(&previous.archive_file);
        if old_path.exists() && !new_path.exists() {
            std::fs::rename(&old_path, new_path).map_err(|e| SyncError::ArchiveRename {
                from: old_path.clone(),
                to: new_path.to_path_buf(),
                source: e,
            })?;
        }
        Ok(Some(previous.name.clone()))
    }

    /// Best-effort cover: the series cover first, then the first volume's.
    /// A failed download degrades to a title-only intro page.
    async fn fetch_cover(&self, catalog: &Catalog) -> Cover {
        let url = catalog
            .title
            .cover_url
            .as_deref()
            .or_else(|| catalog.volumes.iter().find_map(|v| v.cover_url.as_deref()));
        match url {
            Some(url) => match self.content_reader.fetch_image(url).await {
                Ok(image) => Cover::Image(image),
                Err(e) => {
                    eprintln!("Warning: could not fetch cover {}: {}", url, e);
                    Cover::TitleOnly
                }
            },
            None => Cover::None,
        }
    }
}

/// Archive file name from a display name: lowercase, dash-separated, `.epub`.
pub fn archive_file_name(name: &str) -> String {
    let mut s: String = name
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
    let base = if s.is_empty() { "title" } else { s };
    format!("{}.epub", base)
}

/// Keep only tasks whose chapter sits at a 1-based position, counted across
/// the whole catalog, inside the inclusive range.
fn filter_to_range(plan: &mut ResolutionPlan, catalog: &Catalog, (from, to): (u32, u32)) {
    let position = |task: &FetchTask| -> Option<u32> {
        let mut index = 0u32;
        for volume in &catalog.volumes {
            for chapter in &volume.chapters {
                index += 1;
                if volume.id == task.volume_id && chapter.id == task.chapter.id {
                    return Some(index);
                }
            }
        }
        None
    };
    plan.tasks.retain(|t| match position(t) {
        Some(p) => p >= from && p <= to,
        None => false,
    });
}
