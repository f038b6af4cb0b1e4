//! Durable per-project metadata: synchronized version, attachment URL index,
//! last-access timestamps and swap state.
//!
//! The trait is the seam; `SqliteStore` is the durable backend and
//! `MemoryStore` backs tests and ephemeral deployments. A `last_accessed` of
//! `None` on an existing swap record *is* the "swapped" state marker.

pub mod memory;
pub mod sqlite;

use thiserror::Error;

use crate::project::{ProjectName, ProjectState};
use crate::swap::SwapCompression;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("metadata database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("metadata store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt metadata: {0}")]
    Corrupt(String),
}

/// Key/value facts about each project.
///
/// Implementations must be safe under concurrent use from multiple projects;
/// a single project's version and URL-index writes are already serialized by
/// the project lock, and swap-related reads may race benignly (staleness
/// only affects eviction ordering).
pub trait MetadataStore: Send + Sync {
    /// Latest synchronized version, 0 if the project is unknown.
    fn latest_version(&self, project: &ProjectName) -> Result<u64, StoreError>;
    fn set_latest_version(&self, project: &ProjectName, version: u64) -> Result<(), StoreError>;

    /// URL index: `(project, url) -> path`, recorded on first fetch.
    fn path_for_url(&self, project: &ProjectName, url: &str) -> Result<Option<String>, StoreError>;
    fn record_url(&self, project: &ProjectName, url: &str, path: &str) -> Result<(), StoreError>;
    /// Drops index entries whose recorded path is among `paths`.
    fn delete_paths(&self, project: &ProjectName, paths: &[String]) -> Result<(), StoreError>;

    fn project_names(&self) -> Result<Vec<ProjectName>, StoreError>;

    /// Unix-millis last access; `None` means the project is swapped out.
    fn last_accessed(&self, project: &ProjectName) -> Result<Option<i64>, StoreError>;
    fn set_last_accessed(
        &self,
        project: &ProjectName,
        at_millis: Option<i64>,
    ) -> Result<(), StoreError>;

    /// The present project with the oldest last-access time, skipping any
    /// named in `excluding` (candidates the eviction cycle has given up on).
    fn oldest_present_project(
        &self,
        excluding: &[ProjectName],
    ) -> Result<Option<ProjectName>, StoreError>;
    fn present_count(&self) -> Result<u64, StoreError>;
    fn total_count(&self) -> Result<u64, StoreError>;

    fn swap_compression(
        &self,
        project: &ProjectName,
    ) -> Result<Option<SwapCompression>, StoreError>;
    fn set_swap_compression(
        &self,
        project: &ProjectName,
        method: SwapCompression,
    ) -> Result<(), StoreError>;

    fn project_state(&self, project: &ProjectName) -> Result<ProjectState, StoreError>;

    fn delete_project(&self, project: &ProjectName) -> Result<(), StoreError>;
}
