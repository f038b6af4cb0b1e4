//! Repository capability: the narrow interface the sync engine needs from
//! the version-control layer. `GitRepoStore` is the concrete git backend.

pub mod git;

use std::io::Read;
use std::path::PathBuf;

use thiserror::Error;

use crate::data::{CommitAuthor, RawDirectory, RawFile};
use crate::project::ProjectName;

pub use git::GitRepoStore;

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("repository for {project} already exists")]
    AlreadyExists { project: ProjectName },
    #[error("repository for {project} is missing on disk")]
    Missing { project: ProjectName },
    #[error("project {project} contains an embedded git repository at {path}")]
    EmbeddedRepository { project: ProjectName, path: String },
    #[error("non-utf8 path in working tree: {path:?}")]
    NonUtf8Path { path: PathBuf },
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    #[error("repository io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A compressed project archive ready to stream to cold storage.
pub trait ProjectArchive: Read + Send {
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait RepoStore: Send + Sync {
    /// Creates a fresh repository; the directory must not already exist.
    fn init(&self, project: &ProjectName) -> Result<(), RepoError>;

    fn exists(&self, project: &ProjectName) -> bool;

    /// Reads the project's working tree as a flat path → file map.
    fn directory(&self, project: &ProjectName) -> Result<RawDirectory, RepoError>;

    /// Writes `files`, removes previously tracked paths absent from `files`,
    /// and commits. Returns the removed paths so the caller can purge
    /// URL-index entries for them.
    fn commit(
        &self,
        project: &ProjectName,
        files: &[RawFile],
        author: &CommitAuthor,
        timestamp_millis: i64,
        message: &str,
    ) -> Result<Vec<String>, RepoError>;

    /// Compacts the repository, dropping unreachable objects.
    fn garbage_collect(&self, project: &ProjectName) -> Result<(), RepoError>;

    /// Produces a compressed archive of the whole project directory.
    fn archive(&self, project: &ProjectName) -> Result<Box<dyn ProjectArchive>, RepoError>;

    /// Reverses `archive` into a freshly created project directory; fails if
    /// the directory already exists.
    fn restore_from_archive(
        &self,
        project: &ProjectName,
        archive: Box<dyn Read + Send>,
    ) -> Result<(), RepoError>;

    /// Deletes the project directory.
    fn remove(&self, project: &ProjectName) -> Result<(), RepoError>;

    /// Total bytes used by all materialized project directories.
    fn total_size(&self) -> Result<u64, RepoError>;

    /// Scratch area for staged push blobs; lives outside any project dir.
    fn staging_root(&self) -> PathBuf;

    /// Removes on-disk project directories not present in `known`.
    fn purge_nonexistent(&self, known: &[ProjectName]) -> Result<(), RepoError>;
}
