//! The bridge itself: orchestrates pull and push between the snapshot API
//! and the on-disk repositories.
//!
//! Every project operation runs under the project lock, so pull, push,
//! evict and restore for one project never interleave; operations on
//! different projects are fully concurrent. Pull applies remote snapshots
//! as commits in strictly increasing version order. Push is optimistic: the
//! candidate carries the last observed version, the remote rejects stale
//! bases with out-of-date, and confirmation arrives asynchronously through
//! the postback correlator.

use std::collections::HashMap;
use std::sync::Arc;

use crate::api::{self, SnapshotApi, SubmitOutcome};
use crate::config::BridgeConfig;
use crate::data::{CandidateSnapshot, RawDirectory, Snapshot, now_millis};
use crate::error::Error;
use crate::lock::ProjectLock;
use crate::postback::{PostbackCorrelator, PostbackError, PushRejection};
use crate::project::{ProjectName, ProjectState};
use crate::repo::{RepoError, RepoStore};
use crate::resource::{UrlFetcher, UrlResourceCache};
use crate::store::MetadataStore;
use crate::swap::{SwapJob, SwapStore};

pub struct Bridge {
    lock: Arc<ProjectLock>,
    repos: Arc<dyn RepoStore>,
    db: Arc<dyn MetadataStore>,
    cold: Arc<dyn SwapStore>,
    swap: SwapJob,
    api: Arc<dyn SnapshotApi>,
    resources: UrlResourceCache,
    postbacks: PostbackCorrelator,
    max_file_count: Option<u64>,
    max_file_size: Option<u64>,
    swap_enabled: bool,
}

impl Bridge {
    /// Wires a bridge from its parts. Mock parts plug in for tests; use
    /// [`BridgeConfig::build_swap_store`] and the concrete stores for a
    /// real deployment.
    pub fn new(
        config: &BridgeConfig,
        repos: Arc<dyn RepoStore>,
        db: Arc<dyn MetadataStore>,
        cold: Arc<dyn SwapStore>,
        api: Arc<dyn SnapshotApi>,
        fetcher: Arc<dyn UrlFetcher>,
    ) -> Result<Self, Error> {
        let lock = Arc::new(ProjectLock::new());
        let swap = SwapJob::new(
            config.swap.clone(),
            Arc::clone(&lock),
            Arc::clone(&db),
            Arc::clone(&repos),
            Arc::clone(&cold),
        );
        let resources = UrlResourceCache::new(Arc::clone(&db), fetcher, config.max_file_size);
        let postbacks = PostbackCorrelator::new(config.postback_timeout());

        // Reconcile disk with the metadata store before serving anything:
        // a directory the store has never heard of cannot be synced.
        repos.purge_nonexistent(&db.project_names()?)?;

        Ok(Self {
            lock,
            repos,
            db,
            cold,
            swap,
            api,
            resources,
            postbacks,
            max_file_count: config.max_file_count,
            max_file_size: config.max_file_size,
            swap_enabled: config.swap_enabled,
        })
    }

    /// Starts background work (the swap timer).
    pub fn start(&self) {
        if self.swap_enabled {
            self.swap.start();
        }
    }

    /// Stops background work and drains: returns only when no project
    /// operation is in progress.
    pub fn shutdown(&self) {
        tracing::info!("shutdown received, stopping swap job");
        self.swap.stop();
        tracing::info!("waiting for in-flight project operations");
        self.lock.lock_all();
        tracing::info!("bridge drained");
    }

    /// Synchronizes the local repository with the remote: applies every
    /// snapshot newer than the last synchronized version, one commit per
    /// snapshot, in increasing version order.
    pub fn pull(&self, project: &ProjectName) -> Result<(), Error> {
        let _guard = self.lock.lock(project);
        tracing::debug!(project = %project, "pull: got project lock");

        // Existence/authorization check against the remote before touching
        // anything locally; NotFound and Forbidden surface to the user.
        let remote_latest = self.api.latest_version(project)?;

        match self.db.project_state(project)? {
            ProjectState::NotPresent => {
                tracing::info!(project = %project, "pull: repository not present, creating");
                self.repos.init(project)?;
            }
            ProjectState::Swapped => {
                self.swap.restore_held(project)?;
            }
            ProjectState::Present => {}
        }

        let last = self.db.latest_version(project)?;
        tracing::debug!(project = %project, last, remote_latest, "pull: fetching snapshots");
        let snapshots = api::snapshots_after(self.api.as_ref(), project, last)?;

        for snapshot in &snapshots {
            self.apply_snapshot(project, snapshot)?;
        }

        if let Some(last_snapshot) = snapshots.last() {
            self.db
                .set_latest_version(project, last_snapshot.version_id)?;
            tracing::info!(
                project = %project,
                version = last_snapshot.version_id,
                applied = snapshots.len(),
                "pull: up to date"
            );
        }
        self.db.set_last_accessed(project, Some(now_millis()))?;
        Ok(())
    }

    /// Submits the working tree as a candidate snapshot and blocks until
    /// the remote confirms or rejects it, or the bounded wait expires.
    pub fn push(
        &self,
        project: &ProjectName,
        new_tree: &RawDirectory,
        old_tree: &RawDirectory,
    ) -> Result<(), Error> {
        let _guard = self.lock.lock(project);
        tracing::debug!(project = %project, "push: got project lock");

        if let Some(max) = self.max_file_count {
            let count = new_tree.files.len();
            if count as u64 > max {
                return Err(Error::TooManyFiles { count, max });
            }
        }

        let key = self.postbacks.register(project);
        let result = self.push_in_flight(project, new_tree, old_tree, &key);
        // A key must never outlive its push: the wait path consumes the
        // promise itself, the early-exit paths have not.
        if result.is_err() {
            self.postbacks.deregister(project, &key);
        }
        result
    }

    fn push_in_flight(
        &self,
        project: &ProjectName,
        new_tree: &RawDirectory,
        old_tree: &RawDirectory,
        key: &str,
    ) -> Result<(), Error> {
        let based_on = self.db.latest_version(project)?;
        // Staged blobs are cleaned up when `candidate` drops, on every exit
        // path below.
        let candidate = CandidateSnapshot::build(
            project,
            based_on,
            new_tree,
            old_tree,
            &self.repos.staging_root(),
            key,
        )
        .map_err(RepoError::Io)?;
        tracing::debug!(
            project = %project,
            based_on,
            changed = candidate.changed_count(),
            deleted = candidate.deleted.len(),
            "push: candidate built"
        );

        match self.api.submit(project, &candidate, key)? {
            SubmitOutcome::Accepted => {}
            SubmitOutcome::OutOfDate => {
                tracing::info!(project = %project, "push: rejected as out of date on submit");
                return Err(Error::Rejected(PushRejection::OutOfDate));
            }
        }

        tracing::debug!(project = %project, "push: waiting for confirmation");
        match self.postbacks.wait_for_version(project) {
            Ok(version_id) => {
                self.db.set_latest_version(project, version_id)?;
                self.db.delete_paths(project, &candidate.deleted)?;
                self.db.set_last_accessed(project, Some(now_millis()))?;
                tracing::info!(project = %project, version = version_id, "push: confirmed");
                Ok(())
            }
            Err(PostbackError::Rejected(rejection)) => {
                tracing::info!(project = %project, %rejection, "push: rejected via postback");
                Err(Error::Rejected(rejection))
            }
            Err(PostbackError::Timeout) => {
                tracing::error!(project = %project, "push: no confirmation within timeout");
                Err(Error::PostbackTimeout)
            }
            Err(other) => Err(Error::Postback(other)),
        }
    }

    /// Inbound confirmation from the remote: the push succeeded and was
    /// assigned `version_id`.
    pub fn postback_success(
        &self,
        project: &ProjectName,
        key: &str,
        version_id: u64,
    ) -> Result<(), PostbackError> {
        tracing::debug!(project = %project, version = version_id, "postback received");
        self.postbacks.deliver_success(project, key, version_id)
    }

    /// Inbound rejection from the remote.
    pub fn postback_failure(
        &self,
        project: &ProjectName,
        key: &str,
        rejection: PushRejection,
    ) -> Result<(), PostbackError> {
        tracing::debug!(project = %project, %rejection, "postback rejection received");
        self.postbacks.deliver_failure(project, key, rejection)
    }

    /// Authenticates a staged-file read against the in-flight push's key.
    pub fn check_postback_key(
        &self,
        project: &ProjectName,
        key: &str,
    ) -> Result<(), PostbackError> {
        self.postbacks.verify_key(project, key)
    }

    /// Serves a staged candidate blob to the remote during a push.
    pub fn read_staged_file(
        &self,
        project: &ProjectName,
        key: &str,
        staged_id: &str,
    ) -> Result<Vec<u8>, Error> {
        self.postbacks
            .verify_key(project, key)
            .map_err(Error::Postback)?;
        // Both components were generated here as hex; anything else is a
        // forged request.
        if !is_opaque_id(key) || !is_opaque_id(staged_id) {
            return Err(Error::Postback(PostbackError::KeyMismatch {
                project: project.clone(),
            }));
        }
        let path = self.repos.staging_root().join(key).join(staged_id);
        Ok(std::fs::read(path).map_err(RepoError::Io)?)
    }

    /// Removes every trace of a project: metadata, repository, archive.
    pub fn delete_project(&self, project: &ProjectName) -> Result<(), Error> {
        let _guard = self.lock.lock(project);
        tracing::info!(project = %project, "deleting project");
        self.db.delete_project(project)?;
        if let Err(err) = self.repos.remove(project) {
            tracing::warn!(project = %project, error = %err, "failed to remove repository");
        }
        if let Err(err) = self.cold.remove(project) {
            tracing::warn!(project = %project, error = %err, "failed to remove swapped archive");
        }
        Ok(())
    }

    /// One manual swap cycle; exposed for admin tooling and tests.
    pub fn swap_check(&self) -> Result<(), Error> {
        self.swap.check().map_err(Error::Swap)
    }

    fn apply_snapshot(&self, project: &ProjectName, snapshot: &Snapshot) -> Result<(), Error> {
        if let Some(max) = self.max_file_size {
            for file in &snapshot.srcs {
                if file.size() >= max {
                    return Err(Error::FileTooLarge {
                        path: file.path.clone(),
                        size: file.size(),
                        max,
                    });
                }
            }
        }

        let current = self.repos.directory(project)?;
        let mut files = snapshot.srcs.clone();
        let mut fetched = HashMap::new();
        for att in &snapshot.atts {
            files.push(self.resources.get(
                project,
                &att.url,
                &att.path,
                &current.files,
                &mut fetched,
            )?);
        }

        tracing::debug!(project = %project, version = snapshot.version_id, "committing snapshot");
        let missing = self.repos.commit(
            project,
            &files,
            &snapshot.author,
            snapshot.created_at,
            &snapshot.comment,
        )?;
        // Paths removed by this commit must drop out of the URL index, or a
        // later fetch of the same URL would be short-circuited to a file
        // that no longer exists.
        self.db.delete_paths(project, &missing)?;
        Ok(())
    }
}

/// Lower-cased hex, as produced for postback keys and staged ids.
fn is_opaque_id(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.swap.stop();
    }
}

// The bridge itself is covered by the integration tests in `tests/`.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_id_check() {
        assert!(is_opaque_id("0a1b2c"));
        assert!(!is_opaque_id(""));
        assert!(!is_opaque_id("../escape"));
        assert!(!is_opaque_id("ABCDEF"));
    }
}
