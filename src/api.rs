//! Snapshot API capability: what the core needs from the remote document
//! store, expressed as a trait so transports (and test mocks) plug in.

use thiserror::Error;

use crate::data::{CandidateSnapshot, Snapshot};
use crate::project::ProjectName;

#[derive(Error, Debug)]
pub enum ApiError {
    /// The remote does not know the project (never existed, or migrated).
    #[error("project {project} not found on the remote")]
    NotFound { project: ProjectName },
    /// The caller may not access the project. Surfaced, never retried here.
    #[error("access to project {project} is forbidden")]
    Forbidden { project: ProjectName },
    /// Transport-level failure. The caller of the sync engine retries.
    #[error("connection to the snapshot API failed: {0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A response the bridge does not understand. Logged with full detail.
    #[error("unexpected snapshot API response: {0}")]
    Unexpected(String),
}

/// Descriptor of one saved version, as listed by the remote.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub version_id: u64,
    /// Unix millis.
    pub created_at: i64,
    pub comment: String,
}

/// Immediate result of submitting a candidate snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The remote accepted the candidate; a postback will follow.
    Accepted,
    /// The base version is stale; the caller must pull and retry.
    OutOfDate,
}

pub trait SnapshotApi: Send + Sync {
    /// Current latest version on the remote. `Err(NotFound)` if the project
    /// does not exist there.
    fn latest_version(&self, project: &ProjectName) -> Result<u64, ApiError>;

    /// All saved versions of the project, in no guaranteed order.
    fn saved_versions(&self, project: &ProjectName) -> Result<Vec<VersionInfo>, ApiError>;

    /// Full content (sources and attachments) of one version.
    fn snapshot(&self, project: &ProjectName, version_id: u64) -> Result<Snapshot, ApiError>;

    /// Submits a candidate snapshot. The postback key authenticates the
    /// remote's callback and its staged-file downloads.
    fn submit(
        &self,
        project: &ProjectName,
        candidate: &CandidateSnapshot,
        postback_key: &str,
    ) -> Result<SubmitOutcome, ApiError>;
}

/// Fetches all snapshots newer than `after`, in increasing version order.
///
/// Short-circuits to the empty list when the remote's latest version equals
/// what we already have, except when both are 0: a freshly imported project
/// can have saved versions behind a latest version of 0, so the full list
/// must still be fetched.
pub fn snapshots_after(
    api: &dyn SnapshotApi,
    project: &ProjectName,
    after: u64,
) -> Result<Vec<Snapshot>, ApiError> {
    let latest = api.latest_version(project)?;
    if latest == after && latest != 0 {
        return Ok(Vec::new());
    }

    let mut infos: Vec<VersionInfo> = api
        .saved_versions(project)?
        .into_iter()
        .filter(|info| info.version_id > after)
        .collect();
    infos.sort_by_key(|info| info.version_id);

    let mut snapshots = Vec::with_capacity(infos.len());
    for info in infos {
        snapshots.push(api.snapshot(project, info.version_id)?);
    }
    Ok(snapshots)
}
