//! Local state store: one JSON file (`hakosync.json`) recording, per title,
//! the last-seen catalog shape and which chapters are already materialized in
//! the archive. This file is the sole source of truth for "what do we already
//! have" — the archive is never re-read to answer that question.
//!
//! Save is atomic (tempfile + rename) and the orchestrator only calls it
//! after the archive write has succeeded, so a crash between the two leaves
//! the archive ahead of the record, which the next sync resolves as a no-op.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Catalog, Chapter};

/// Errors from loading or saving the state file.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Cannot access state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid state file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("A sync for {url} is already in progress")]
    AlreadySyncing { url: String },
}

/// Per-title snapshot of the last catalog plus materialization status.
/// Unknown fields in the file are ignored and missing optional fields
/// default, so a manually edited file stays loadable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LocalRecord {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub author: String,
    /// Archive file name inside the output directory.
    #[serde(default)]
    pub archive_file: String,
    #[serde(default)]
    pub volumes: Vec<RecordVolume>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecordVolume {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub chapters: Vec<RecordChapter>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecordChapter {
    pub id: String,
    pub title: String,
    /// Whether this chapter's body is embedded in the archive.
    #[serde(default)]
    pub materialized: bool,
    /// Unix seconds of the successful fetch, when materialized.
    #[serde(default)]
    pub fetched_at: Option<u64>,
}

impl LocalRecord {
    /// Build an empty (nothing materialized) record mirroring a catalog.
    pub fn from_catalog(catalog: &Catalog, archive_file: &str) -> Self {
        LocalRecord {
            url: catalog.title.url.clone(),
            name: catalog.title.name.clone(),
            author: catalog.title.author.clone(),
            archive_file: archive_file.to_string(),
            volumes: catalog
                .volumes
                .iter()
                .map(|v| RecordVolume {
                    id: v.id.clone(),
                    title: v.title.clone(),
                    chapters: v
                        .chapters
                        .iter()
                        .map(|c| RecordChapter {
                            id: c.id.clone(),
                            title: c.title.clone(),
                            materialized: false,
                            fetched_at: None,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Reorder and extend this record to mirror a fresh catalog, preserving
    /// materialization status. Volumes/chapters no longer in the catalog are
    /// kept (appended after the catalog-ordered entries) when materialized —
    /// removal upstream never deletes local content — and dropped otherwise.
    pub fn align_to_catalog(&mut self, catalog: &Catalog) {
        self.name = catalog.title.name.clone();
        self.author = catalog.title.author.clone();

        let mut old_volumes: Vec<RecordVolume> = std::mem::take(&mut self.volumes);
        let mut aligned: Vec<RecordVolume> = Vec::with_capacity(catalog.volumes.len());
        for cat_vol in &catalog.volumes {
            let previous = old_volumes
                .iter()
                .position(|v| v.id == cat_vol.id)
                .map(|i| old_volumes.remove(i));
            let mut volume = RecordVolume {
                id: cat_vol.id.clone(),
                title: cat_vol.title.clone(),
                chapters: Vec::with_capacity(cat_vol.chapters.len()),
            };
            let mut old_chapters = previous.map(|v| v.chapters).unwrap_or_default();
            for cat_ch in &cat_vol.chapters {
                let prior = old_chapters
                    .iter()
                    .position(|c| c.id == cat_ch.id)
                    .map(|i| old_chapters.remove(i));
                volume.chapters.push(match prior {
                    Some(mut c) => {
                        c.title = cat_ch.title.clone();
                        c
                    }
                    None => RecordChapter {
                        id: cat_ch.id.clone(),
                        title: cat_ch.title.clone(),
                        materialized: false,
                        fetched_at: None,
                    },
                });
            }
            // Chapters gone upstream stay if we already hold their content.
            volume
                .chapters
                .extend(old_chapters.into_iter().filter(|c| c.materialized));
            aligned.push(volume);
        }
        aligned.extend(
            old_volumes
                .into_iter()
                .filter(|v| v.chapters.iter().any(|c| c.materialized)),
        );
        self.volumes = aligned;
    }

    pub fn volume(&self, id: &str) -> Option<&RecordVolume> {
        self.volumes.iter().find(|v| v.id == id)
    }

    pub fn is_materialized(&self, volume_id: &str, chapter_id: &str) -> bool {
        self.volume(volume_id)
            .map(|v| v.chapters.iter().any(|c| c.id == chapter_id && c.materialized))
            .unwrap_or(false)
    }

    /// Mark one chapter materialized with the current time.
    pub fn mark_materialized(&mut self, volume_id: &str, chapter: &Chapter) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if let Some(volume) = self.volumes.iter_mut().find(|v| v.id == volume_id) {
            if let Some(entry) = volume.chapters.iter_mut().find(|c| c.id == chapter.id) {
                entry.title = chapter.title.clone();
                entry.materialized = true;
                entry.fetched_at = Some(now);
            }
        }
    }

    /// Drop the materialized claim so the chapter is queued again on the
    /// next sync.
    pub fn clear_materialized(&mut self, volume_id: &str, chapter_id: &str) {
        if let Some(volume) = self.volumes.iter_mut().find(|v| v.id == volume_id) {
            if let Some(entry) = volume.chapters.iter_mut().find(|c| c.id == chapter_id) {
                entry.materialized = false;
                entry.fetched_at = None;
            }
        }
    }

    pub fn materialized_count(&self) -> usize {
        self.volumes
            .iter()
            .map(|v| v.chapters.iter().filter(|c| c.materialized).count())
            .sum()
    }
}

/// On-disk shape: one record per title keyed by its source URL.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    titles: BTreeMap<String, LocalRecord>,
}

/// Load/save access to the state file plus the in-process per-title claim
/// that keeps two syncs from writing the same title concurrently.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    claims: Arc<Mutex<HashSet<String>>>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StateStore {
            path: path.into(),
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record for one title. Missing file or missing entry is `None`.
    pub fn load(&self, url: &str) -> Result<Option<LocalRecord>, StateError> {
        Ok(self.read_file()?.titles.remove(url))
    }

    /// All recorded titles, in key order.
    pub fn list(&self) -> Result<Vec<LocalRecord>, StateError> {
        Ok(self.read_file()?.titles.into_values().collect())
    }

    /// Insert or replace one title's record. Read-modify-write with an
    /// atomic replace so a crash never truncates the file.
    pub fn save(&self, record: &LocalRecord) -> Result<(), StateError> {
        let mut file = self.read_file()?;
        file.titles.insert(record.url.clone(), record.clone());
        self.write_file(&file)
    }

    /// Claim exclusive sync access for a title. Released on guard drop.
    pub fn claim(&self, url: &str) -> Result<SyncClaim, StateError> {
        let mut claims = match self.claims.lock() {
            Ok(claims) => claims,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !claims.insert(url.to_string()) {
            return Err(StateError::AlreadySyncing {
                url: url.to_string(),
            });
        }
        Ok(SyncClaim {
            url: url.to_string(),
            claims: Arc::clone(&self.claims),
        })
    }

    fn read_file(&self) -> Result<StateFile, StateError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StateFile::default())
            }
            Err(e) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|e| StateError::Parse {
            path: self.path.clone(),
            source: e,
        })
    }

    fn write_file(&self, file: &StateFile) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(io_err)?;
        let json = serde_json::to_vec_pretty(file).map_err(|e| StateError::Parse {
            path: self.path.clone(),
            source: e,
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.persist(&self.path)
            .map_err(|e| io_err(e.error))
            .map(|_| ())
    }
}

/// Exclusive per-title sync claim; dropping it releases the title.
#[derive(Debug)]
pub struct SyncClaim {
    url: String,
    claims: Arc<Mutex<HashSet<String>>>,
}

impl Drop for SyncClaim {
    fn drop(&mut self) {
        if let Ok(mut claims) = self.claims.lock() {
            claims.remove(&self.url);
        }
    }
}
