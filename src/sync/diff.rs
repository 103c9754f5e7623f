//! Diff resolver: compares the persisted record against a freshly observed
//! catalog and produces the minimal ordered fetch plan. Pure and
//! non-blocking; ordering is always (volume position, chapter position) in
//! the current catalog, so scheduler output and navigation are deterministic.

use crate::model::{Catalog, FetchTask};
use crate::state::LocalRecord;

/// The ordered work a sync run must perform.
#[derive(Debug, Default)]
pub struct ResolutionPlan {
    /// Chapter fetches in catalog order, seq-numbered from 0.
    pub tasks: Vec<FetchTask>,
    /// Volume titles present locally but gone from the catalog. Reported,
    /// never deleted.
    pub removed_volumes: Vec<String>,
}

impl ResolutionPlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Compute the fetch plan. With no previous record every chapter is queued;
/// otherwise only chapters not yet materialized. Already-materialized
/// chapters are never re-fetched.
///
/// Panics on a catalog with an empty title identifier — that is a bug in the
/// reader, not a runtime condition.
pub fn resolve(previous: Option<&LocalRecord>, current: &Catalog) -> ResolutionPlan {
    assert!(
        !current.title.url.is_empty(),
        "catalog has an empty title identifier"
    );

    let mut plan = ResolutionPlan::default();
    let mut seq = 0u64;
    let mut queue = |plan: &mut ResolutionPlan, volume_id: &str, chapter: &crate::model::Chapter| {
        plan.tasks.push(FetchTask {
            seq,
            volume_id: volume_id.to_string(),
            chapter: chapter.clone(),
        });
        seq += 1;
    };

    match previous {
        None => {
            for volume in &current.volumes {
                for chapter in &volume.chapters {
                    queue(&mut plan, &volume.id, chapter);
                }
            }
        }
        Some(record) => {
            for volume in &current.volumes {
                match record.volume(&volume.id) {
                    None => {
                        for chapter in &volume.chapters {
                            queue(&mut plan, &volume.id, chapter);
                        }
                    }
                    Some(_) => {
                        for chapter in &volume.chapters {
                            if !record.is_materialized(&volume.id, &chapter.id) {
                                queue(&mut plan, &volume.id, chapter);
                            }
                        }
                    }
                }
            }
            for known in &record.volumes {
                if !current.volumes.iter().any(|v| v.id == known.id) {
                    plan.removed_volumes.push(known.title.clone());
                }
            }
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chapter, Title, Volume};

    fn chapter(volume: &str, n: u32) -> Chapter {
        Chapter {
            id: format!("chuong-{}", n),
            title: format!("Chương {}", n),
            url: format!("https://ln.hako.vn/truyen/1-t/{}/chuong-{}", volume, n),
        }
    }

    fn volume(id: &str, chapter_count: u32) -> Volume {
        Volume {
            id: id.to_string(),
            title: id.to_string(),
            url: format!("https://ln.hako.vn/truyen/1-t/{}", id),
            cover_url: None,
            chapters: (1..=chapter_count).map(|n| chapter(id, n)).collect(),
        }
    }

    fn catalog(volumes: Vec<Volume>) -> Catalog {
        Catalog {
            title: Title {
                url: "https://ln.hako.vn/truyen/1-t".to_string(),
                name: "T".to_string(),
                author: "A".to_string(),
                description: None,
                cover_url: None,
            },
            volumes,
        }
    }

    fn task_keys(plan: &ResolutionPlan) -> Vec<(String, String)> {
        plan.tasks
            .iter()
            .map(|t| (t.volume_id.clone(), t.chapter.id.clone()))
            .collect()
    }

    #[test]
    fn no_previous_record_queues_everything_in_catalog_order() {
        let current = catalog(vec![volume("tap-1", 2), volume("tap-2", 1)]);
        let plan = resolve(None, &current);
        assert_eq!(
            task_keys(&plan),
            [
                ("tap-1".to_string(), "chuong-1".to_string()),
                ("tap-1".to_string(), "chuong-2".to_string()),
                ("tap-2".to_string(), "chuong-1".to_string()),
            ]
        );
        assert_eq!(
            plan.tasks.iter().map(|t| t.seq).collect::<Vec<_>>(),
            [0, 1, 2]
        );
    }

    #[test]
    fn new_chapter_and_new_volume_queue_in_order() {
        // Previous: volume 1 with chapters 1,2 materialized.
        // Current: volume 1 gains chapter 3, volume 2 appears with chapters 1,2.
        let old = catalog(vec![volume("tap-1", 2)]);
        let mut record = LocalRecord::from_catalog(&old, "t.epub");
        for c in &old.volumes[0].chapters {
            record.mark_materialized("tap-1", c);
        }

        let current = catalog(vec![volume("tap-1", 3), volume("tap-2", 2)]);
        let plan = resolve(Some(&record), &current);
        assert_eq!(
            task_keys(&plan),
            [
                ("tap-1".to_string(), "chuong-3".to_string()),
                ("tap-2".to_string(), "chuong-1".to_string()),
                ("tap-2".to_string(), "chuong-2".to_string()),
            ]
        );
    }

    #[test]
    fn materialized_chapters_are_never_requeued() {
        let current = catalog(vec![volume("tap-1", 2)]);
        let mut record = LocalRecord::from_catalog(&current, "t.epub");
        record.mark_materialized("tap-1", &current.volumes[0].chapters[0]);

        let plan = resolve(Some(&record), &current);
        assert_eq!(
            task_keys(&plan),
            [("tap-1".to_string(), "chuong-2".to_string())]
        );
    }

    #[test]
    fn fully_synced_title_yields_empty_plan() {
        let current = catalog(vec![volume("tap-1", 2)]);
        let mut record = LocalRecord::from_catalog(&current, "t.epub");
        for c in &current.volumes[0].chapters {
            record.mark_materialized("tap-1", c);
        }
        let plan = resolve(Some(&record), &current);
        assert!(plan.is_empty());
        assert!(plan.removed_volumes.is_empty());
    }

    #[test]
    fn known_chapters_missing_remotely_are_not_queued() {
        // A chapter tracked but never fetched disappears upstream: nothing
        // to fetch, nothing removed at volume level.
        let old = catalog(vec![volume("tap-1", 2)]);
        let record = LocalRecord::from_catalog(&old, "t.epub");
        let current = catalog(vec![volume("tap-1", 1)]);
        let plan = resolve(Some(&record), &current);
        assert_eq!(
            task_keys(&plan),
            [("tap-1".to_string(), "chuong-1".to_string())]
        );
    }

    #[test]
    fn removed_volume_is_reported_not_fetched() {
        let old = catalog(vec![volume("tap-1", 1), volume("tap-2", 1)]);
        let record = LocalRecord::from_catalog(&old, "t.epub");
        let current = catalog(vec![volume("tap-1", 1)]);
        let plan = resolve(Some(&record), &current);
        assert_eq!(plan.removed_volumes, ["tap-2".to_string()]);
        assert_eq!(
            task_keys(&plan),
            [("tap-1".to_string(), "chuong-1".to_string())]
        );
    }

    #[test]
    fn insertion_keeps_catalog_position_order() {
        let old = catalog(vec![volume("tap-1", 3)]);
        let mut record = LocalRecord::from_catalog(&old, "t.epub");
        record.mark_materialized("tap-1", &old.volumes[0].chapters[0]);
        record.mark_materialized("tap-1", &old.volumes[0].chapters[2]);

        // chuong-2 missing in the middle: it is queued at its catalog
        // position relative to other pending work.
        let mut current = catalog(vec![volume("tap-1", 3)]);
        current.volumes[0].chapters.push(chapter("tap-1", 4));
        let plan = resolve(Some(&record), &current);
        assert_eq!(
            task_keys(&plan),
            [
                ("tap-1".to_string(), "chuong-2".to_string()),
                ("tap-1".to_string(), "chuong-4".to_string()),
            ]
        );
    }

    #[test]
    #[should_panic(expected = "empty title identifier")]
    fn empty_title_identifier_is_a_programmer_error() {
        let mut current = catalog(vec![]);
        current.title.url.clear();
        resolve(None, &current);
    }
}
