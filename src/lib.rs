//! hakosync: CLI downloader and incremental updater for ln.hako.vn light
//! novels, keeping one EPUB archive per title in sync with the site.

pub mod cli;
pub mod config;
pub mod epub;
pub mod model;
pub mod remote;
pub mod state;
pub mod sync;

// Re-exports for CLI and consumers.
pub use epub::{Cover, EpubError, MergeReport};
pub use remote::{
    validate_title_url, BudgetedClient, BudgetedClientBuilder, CatalogReader, ContentReader,
    RemoteError,
};
pub use state::{LocalRecord, StateError, StateStore};
pub use sync::scheduler::{FetchResult, RequestBudget, Scheduler, TaskOutcome};
pub use sync::{SyncEngine, SyncError, SyncOptions, SyncPhase, TitleReport};
