//! Working-tree and snapshot data model.
//!
//! `RawDirectory` is a flat path → file map of a project's working tree.
//! `Snapshot` is one immutable remote version. `CandidateSnapshot` is a
//! locally built, unconfirmed snapshot: it diffs two trees, stages the
//! changed blobs under opaque ids so the remote can fetch them back, and
//! removes the staged blobs again when dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::project::ProjectName;

/// Wall-clock now as unix millis, the timestamp unit used throughout.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A single file: repository-relative path plus contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFile {
    pub path: String,
    pub contents: Bytes,
}

impl RawFile {
    pub fn new(path: impl Into<String>, contents: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }

    pub fn size(&self) -> u64 {
        self.contents.len() as u64
    }

    fn content_id(&self) -> [u8; 32] {
        Sha256::digest(&self.contents).into()
    }
}

/// A flat view of a project's working tree, keyed by path.
#[derive(Clone, Debug, Default)]
pub struct RawDirectory {
    pub files: BTreeMap<String, RawFile>,
}

impl RawDirectory {
    pub fn from_files(files: impl IntoIterator<Item = RawFile>) -> Self {
        Self {
            files: files.into_iter().map(|f| (f.path.clone(), f)).collect(),
        }
    }
}

/// An attachment reference within a snapshot: fetched by URL, stored at path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub path: String,
    pub url: String,
}

/// Author identity applied to commits made from snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

impl CommitAuthor {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// One immutable remote version of a project.
///
/// Consumed once during a pull: converted into a commit, then discarded.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub version_id: u64,
    pub author: CommitAuthor,
    /// Unix millis.
    pub created_at: i64,
    pub comment: String,
    pub srcs: Vec<RawFile>,
    pub atts: Vec<Attachment>,
}

/// Manifest entry for one file of a candidate snapshot.
///
/// `staged_id` is set for changed files only; the blob is staged on disk
/// under that id so the remote can download it during confirmation.
#[derive(Clone, Debug, Serialize)]
pub struct CandidateFile {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_id: Option<String>,
}

/// A locally constructed, not-yet-confirmed snapshot.
///
/// Staged blobs live under a per-push directory inside the staging root and
/// are deleted when the candidate is dropped, on every exit path of a push.
#[derive(Debug)]
pub struct CandidateSnapshot {
    pub project: ProjectName,
    /// The version this candidate is based on (optimistic concurrency token).
    pub based_on: u64,
    pub files: Vec<CandidateFile>,
    pub deleted: Vec<String>,
    staging_dir: Option<PathBuf>,
}

impl CandidateSnapshot {
    /// Diffs `new_tree` against `old_tree` and stages changed blobs under
    /// `staging_root/<scope>/<file-id>`.
    ///
    /// `scope` is the postback key of the push, so the staged-file endpoint
    /// can locate blobs from the authenticated `(project, key)` pair alone.
    /// Every path in `new_tree` appears in the manifest; paths whose content
    /// identity differs from `old_tree` (or which are new) get a staged id.
    /// Paths only in `old_tree` are recorded as deleted.
    pub fn build(
        project: &ProjectName,
        based_on: u64,
        new_tree: &RawDirectory,
        old_tree: &RawDirectory,
        staging_root: &Path,
        scope: &str,
    ) -> io::Result<Self> {
        let staging_dir = staging_root.join(scope);
        fs::create_dir_all(&staging_dir)?;

        let mut candidate = Self {
            project: project.clone(),
            based_on,
            files: Vec::with_capacity(new_tree.files.len()),
            deleted: Vec::new(),
            staging_dir: Some(staging_dir.clone()),
        };

        for (path, file) in &new_tree.files {
            let changed = match old_tree.files.get(path) {
                Some(old) => old.content_id() != file.content_id(),
                None => true,
            };
            let staged_id = if changed {
                let id = Uuid::new_v4().simple().to_string();
                // Blobs are addressed by the opaque id, never by the real
                // path, so colliding basenames cannot clobber each other.
                fs::write(staging_dir.join(&id), &file.contents)?;
                Some(id)
            } else {
                None
            };
            candidate.files.push(CandidateFile {
                path: path.clone(),
                staged_id,
            });
        }

        let new_paths: BTreeSet<&String> = new_tree.files.keys().collect();
        for path in old_tree.files.keys() {
            if !new_paths.contains(path) {
                candidate.deleted.push(path.clone());
            }
        }

        Ok(candidate)
    }

    /// The wire manifest a transport submits to the remote. Changed files
    /// carry their staged id so the remote can download the blobs back.
    pub fn manifest(&self) -> serde_json::Value {
        serde_json::json!({
            "based_on": self.based_on,
            "files": self.files,
            "deleted": self.deleted,
        })
    }

    /// Reads a staged blob back by its opaque id, for serving to the remote.
    pub fn staged_contents(&self, staged_id: &str) -> io::Result<Vec<u8>> {
        let dir = self
            .staging_dir
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "staging already released"))?;
        fs::read(dir.join(staged_id))
    }

    pub fn changed_count(&self) -> usize {
        self.files.iter().filter(|f| f.staged_id.is_some()).count()
    }
}

impl Drop for CandidateSnapshot {
    fn drop(&mut self) {
        if let Some(dir) = self.staging_dir.take() {
            if let Err(err) = fs::remove_dir_all(&dir) {
                tracing::warn!(
                    project = %self.project,
                    dir = %dir.display(),
                    error = %err,
                    "failed to clean staged push files"
                );
            }
        }
    }
}
