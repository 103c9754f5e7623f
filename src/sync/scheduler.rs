//! Rate-limited fetch scheduler: a bounded worker pool that executes chapter
//! fetches concurrently but emits their outcomes strictly in plan order, so
//! the assembler never sees a later chapter before an earlier sibling.
//!
//! Also owns the process-wide request budget: a hard global throttle that
//! pauses all remote traffic for a cooldown once a fixed number of requests
//! has been issued, then resets and resumes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::model::{FetchTask, FetchedChapter, FetchedImage};
use crate::remote::{ContentReader, RemoteError};

pub const DEFAULT_MAX_WORKERS: usize = 8;
pub const DEFAULT_REQUESTS_BEFORE_COOLDOWN: u32 = 190;
pub const DEFAULT_COOLDOWN_SECS: u64 = 120;

/// Process-wide request counter with a hard cooldown. Every remote request
/// (catalog, chapter, image) passes through [`acquire`](Self::acquire) via
/// the shared client; no other component touches the counter.
#[derive(Debug)]
pub struct RequestBudget {
    threshold: u32,
    cooldown: Duration,
    issued: Mutex<u32>,
}

impl RequestBudget {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        RequestBudget {
            threshold: threshold.max(1),
            cooldown,
            issued: Mutex::new(0),
        }
    }

    /// Count one request. When the counter has reached the threshold, all
    /// callers wait out the cooldown (the lock is held across the sleep on
    /// purpose — this is a global pause, not a per-worker one), then the
    /// counter resets and traffic resumes.
    pub async fn acquire(&self) {
        let mut issued = self.issued.lock().await;
        if *issued >= self.threshold {
            tokio::time::sleep(self.cooldown).await;
            *issued = 0;
        }
        *issued += 1;
    }

    /// Requests issued since the last reset.
    pub async fn issued(&self) -> u32 {
        *self.issued.lock().await
    }
}

impl Default for RequestBudget {
    fn default() -> Self {
        RequestBudget::new(
            DEFAULT_REQUESTS_BEFORE_COOLDOWN,
            Duration::from_secs(DEFAULT_COOLDOWN_SECS),
        )
    }
}

/// Terminal state of one fetch task.
#[derive(Debug)]
pub enum FetchResult {
    Fetched(Box<FetchedChapter>),
    /// Retries exhausted or failure was non-retryable; the run continues.
    Failed(RemoteError),
}

/// One task paired with its terminal result, emitted in plan order.
#[derive(Debug)]
pub struct TaskOutcome {
    pub task: FetchTask,
    pub result: FetchResult,
}

/// Bounded-concurrency executor for an ordered task list.
#[derive(Debug, Clone)]
pub struct Scheduler {
    max_workers: usize,
}

impl Scheduler {
    pub fn new(max_workers: usize) -> Self {
        Scheduler {
            max_workers: max_workers.max(1),
        }
    }

    /// Execute `tasks` against `reader` and stream outcomes back in input
    /// order. Cancellation stops dispatching new tasks; everything already
    /// in flight finishes and is still emitted, so partial progress is never
    /// lost. The channel closes once all dispatched tasks have been emitted.
    pub fn run(
        &self,
        tasks: Vec<FetchTask>,
        reader: Arc<dyn ContentReader>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<TaskOutcome> {
        let (out_tx, out_rx) = mpsc::channel(self.max_workers.max(4));
        let (done_tx, done_rx) = mpsc::unbounded_channel::<(usize, TaskOutcome)>();
        let semaphore = Arc::new(Semaphore::new(self.max_workers));

        tokio::spawn(dispatch(tasks, reader, cancel, semaphore, done_tx));
        tokio::spawn(reorder(done_rx, out_tx));

        out_rx
    }
}

/// Dispatch tasks in order, bounded by the semaphore, until the list is
/// exhausted or cancellation is observed. Keeps the JoinSet alive until all
/// spawned workers have finished.
async fn dispatch(
    tasks: Vec<FetchTask>,
    reader: Arc<dyn ContentReader>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    done_tx: mpsc::UnboundedSender<(usize, TaskOutcome)>,
) {
    let mut workers = JoinSet::new();
    for (index, task) in tasks.into_iter().enumerate() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let reader = Arc::clone(&reader);
        let done_tx = done_tx.clone();
        workers.spawn(async move {
            let _permit = permit;
            let result = execute(reader.as_ref(), &task).await;
            let _ = done_tx.send((index, TaskOutcome { task, result }));
        });
    }
    drop(done_tx);
    while workers.join_next().await.is_some() {}
}

/// Buffer out-of-order completions and release them in index order. Once the
/// completion channel closes, whatever is still buffered is flushed in order
/// (cancellation leaves a contiguous prefix, so this is the completed work).
async fn reorder(
    mut done_rx: mpsc::UnboundedReceiver<(usize, TaskOutcome)>,
    out_tx: mpsc::Sender<TaskOutcome>,
) {
    let mut buffered: BTreeMap<usize, TaskOutcome> = BTreeMap::new();
    let mut next = 0usize;
    while let Some((index, outcome)) = done_rx.recv().await {
        buffered.insert(index, outcome);
        while let Some(ready) = buffered.remove(&next) {
            if out_tx.send(ready).await.is_err() {
                return;
            }
            next += 1;
        }
    }
    for (_, outcome) in buffered {
        if out_tx.send(outcome).await.is_err() {
            return;
        }
    }
}

/// Fetch one chapter body plus the images it references. The shared client
/// has already applied per-request retry and budget accounting; whatever
/// error reaches here is terminal for this task. A failed image fetch drops
/// that image but keeps the chapter.
async fn execute(reader: &dyn ContentReader, task: &FetchTask) -> FetchResult {
    let body = match reader.fetch_chapter_body(&task.chapter).await {
        Ok(body) => body,
        Err(e) => return FetchResult::Failed(e),
    };
    let mut images: Vec<FetchedImage> = Vec::new();
    for url in &body.image_urls {
        if images.iter().any(|i| &i.url == url) {
            continue;
        }
        match reader.fetch_image(url).await {
            Ok(image) => images.push(image),
            Err(e) => {
                eprintln!(
                    "Warning: could not fetch image {} for chapter {}: {}",
                    url, task.chapter.id, e
                );
            }
        }
    }
    FetchResult::Fetched(Box::new(FetchedChapter {
        volume_id: task.volume_id.clone(),
        chapter: task.chapter.clone(),
        body,
        images,
    }))
}
