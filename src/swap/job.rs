//! Watermark-driven eviction and restoration.
//!
//! A timer thread re-checks disk usage at a fixed interval. When usage is at
//! or over the high watermark, the oldest-accessed present projects are
//! evicted one by one until usage drops below the low watermark or only
//! `min_projects` remain. A failed eviction is logged, the candidate is
//! abandoned for the rest of the cycle, and the loop moves on to the
//! next-oldest project; errors never kill the loop.
//!
//! Candidate selection and usage reads are separate unsynchronized queries;
//! under churn a slightly stale candidate can be picked. Staleness only
//! affects eviction order, so this race is accepted.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use serde::{Deserialize, Serialize};

use super::store::SwapStore;
use super::{SwapCompression, SwapError};
use crate::data::now_millis;
use crate::lock::ProjectLock;
use crate::project::{ProjectName, ProjectState};
use crate::repo::RepoStore;
use crate::store::MetadataStore;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapJobConfig {
    /// Never evict below this many present projects.
    pub min_projects: u64,
    pub low_watermark_bytes: u64,
    pub high_watermark_bytes: u64,
    pub interval_ms: u64,
    pub compression: SwapCompression,
}

impl Default for SwapJobConfig {
    fn default() -> Self {
        Self {
            min_projects: 50,
            low_watermark_bytes: 128 * (1 << 30),
            high_watermark_bytes: 256 * (1 << 30),
            interval_ms: 3_600_000,
            compression: SwapCompression::Gzip,
        }
    }
}

impl SwapJobConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

struct Inner {
    config: SwapJobConfig,
    lock: Arc<ProjectLock>,
    db: Arc<dyn MetadataStore>,
    repos: Arc<dyn RepoStore>,
    cold: Arc<dyn SwapStore>,
}

pub struct SwapJob {
    inner: Arc<Inner>,
    worker: Mutex<Option<Worker>>,
}

struct Worker {
    stop_tx: Sender<()>,
    handle: thread::JoinHandle<()>,
}

impl SwapJob {
    pub fn new(
        config: SwapJobConfig,
        lock: Arc<ProjectLock>,
        db: Arc<dyn MetadataStore>,
        repos: Arc<dyn RepoStore>,
        cold: Arc<dyn SwapStore>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                lock,
                db,
                repos,
                cold,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Starts the timer thread. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock().expect("swap worker lock poisoned");
        if worker.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = bounded(1);
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("bridge-swap".to_string())
            .spawn(move || run_timer_loop(&inner, &stop_rx))
            .expect("spawn swap worker");
        *worker = Some(Worker { stop_tx, handle });
    }

    /// Stops the timer thread and waits for the current cycle to finish.
    pub fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .expect("swap worker lock poisoned")
            .take();
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(());
            if worker.handle.join().is_err() {
                tracing::error!("swap worker panicked");
            }
        }
    }

    /// One eviction cycle; also callable directly (tests, admin tooling).
    pub fn check(&self) -> Result<(), SwapError> {
        self.inner.check()
    }

    pub fn evict(&self, project: &ProjectName) -> Result<(), SwapError> {
        self.inner.evict(project)
    }

    /// Restores a swapped project, taking the project lock.
    pub fn restore(&self, project: &ProjectName) -> Result<(), SwapError> {
        let _guard = self.inner.lock.lock(project);
        self.inner.restore_held(project)
    }

    /// Restores a swapped project for a caller that already holds the
    /// project lock (the pull path discovers swapped state under its lock).
    pub fn restore_held(&self, project: &ProjectName) -> Result<(), SwapError> {
        self.inner.restore_held(project)
    }
}

fn run_timer_loop(inner: &Inner, stop_rx: &Receiver<()>) {
    tracing::info!(
        interval_ms = inner.config.interval_ms,
        low = inner.config.low_watermark_bytes,
        high = inner.config.high_watermark_bytes,
        "swap job started"
    );
    loop {
        match stop_rx.recv_timeout(inner.config.interval()) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if let Err(err) = inner.check() {
                    tracing::warn!(error = %err, "swap check failed");
                }
            }
        }
    }
    tracing::info!("swap job stopped");
}

impl Inner {
    fn check(&self) -> Result<(), SwapError> {
        let usage = self.repos.total_size()?;
        if usage < self.config.high_watermark_bytes {
            tracing::debug!(usage, "disk usage under high watermark");
            return Ok(());
        }
        tracing::info!(
            usage,
            high = self.config.high_watermark_bytes,
            "disk usage over high watermark, evicting"
        );

        let mut abandoned: Vec<ProjectName> = Vec::new();
        loop {
            if self.repos.total_size()? <= self.config.low_watermark_bytes {
                break;
            }
            if self.db.present_count()? <= self.config.min_projects {
                tracing::info!(
                    min_projects = self.config.min_projects,
                    "not evicting below minimum project count"
                );
                break;
            }
            // A candidate that failed earlier this cycle is skipped, not
            // retried; the loop ends once every present project has failed.
            let Some(candidate) = self.db.oldest_present_project(&abandoned)? else {
                break;
            };
            if let Err(err) = self.evict(&candidate) {
                tracing::warn!(project = %candidate, error = %err, "eviction failed, skipping");
                abandoned.push(candidate);
            }
        }

        let usage = self.repos.total_size()?;
        if usage > self.config.low_watermark_bytes {
            tracing::warn!(
                usage,
                low = self.config.low_watermark_bytes,
                "eviction finished above low watermark"
            );
        }
        Ok(())
    }

    fn evict(&self, project: &ProjectName) -> Result<(), SwapError> {
        let _guard = self.lock.lock(project);
        if self.db.project_state(project)? != ProjectState::Present {
            return Err(SwapError::NotPresent {
                project: project.clone(),
            });
        }
        tracing::info!(project = %project, "evicting project");

        // Compaction shrinks the archive but is not required for
        // correctness; a failure here does not abandon the eviction.
        if let Err(err) = self.repos.garbage_collect(project) {
            tracing::warn!(project = %project, error = %err, "pre-eviction gc failed");
        }

        let archive = self.repos.archive(project)?;
        let len = archive.len();
        self.cold.upload(project, Box::new(archive), len)?;

        self.db
            .set_swap_compression(project, self.config.compression)?;
        self.db.set_last_accessed(project, None)?;
        self.repos.remove(project)?;
        tracing::info!(project = %project, bytes = len, "project evicted");
        Ok(())
    }

    fn restore_held(&self, project: &ProjectName) -> Result<(), SwapError> {
        if self.db.project_state(project)? != ProjectState::Swapped {
            return Err(SwapError::NotSwapped {
                project: project.clone(),
            });
        }
        tracing::info!(project = %project, "restoring project from cold storage");

        let archive = self.cold.download(project)?;
        self.repos.restore_from_archive(project, archive)?;
        self.cold.remove(project)?;
        // Newest access time: the restored project becomes the least likely
        // eviction candidate.
        self.db.set_last_accessed(project, Some(now_millis()))?;
        tracing::info!(project = %project, "project restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CommitAuthor, RawFile};
    use crate::repo::GitRepoStore;
    use crate::store::MemoryStore;
    use crate::swap::store::{InMemorySwapStore, SwapStoreError};

    struct Fixture {
        _dir: tempfile::TempDir,
        job: SwapJob,
        db: Arc<dyn MetadataStore>,
        repos: Arc<GitRepoStore>,
        cold: Arc<InMemorySwapStore>,
    }

    fn fixture(config: SwapJobConfig) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
        let repos = Arc::new(GitRepoStore::new(dir.path().join("repos")).expect("repo store"));
        let cold = Arc::new(InMemorySwapStore::new());
        let job = SwapJob::new(
            config,
            Arc::new(ProjectLock::new()),
            Arc::clone(&db),
            Arc::clone(&repos) as Arc<dyn RepoStore>,
            Arc::clone(&cold) as Arc<dyn SwapStore>,
        );
        Fixture {
            _dir: dir,
            job,
            db,
            repos,
            cold,
        }
    }

    fn name(s: &str) -> ProjectName {
        ProjectName::new(s).expect("valid name")
    }

    fn materialize(
        repos: &GitRepoStore,
        db: &dyn MetadataStore,
        project: &ProjectName,
        accessed: i64,
        bytes: usize,
    ) {
        repos.init(project).expect("init");
        repos
            .commit(
                project,
                &[RawFile::new("blob.bin", vec![0xAB; bytes])],
                &CommitAuthor::new("a", "a@example.com"),
                accessed,
                "seed",
            )
            .expect("commit");
        db.set_last_accessed(project, Some(accessed))
            .expect("set accessed");
    }

    #[test]
    fn evict_restore_round_trip_preserves_content() {
        let fix = fixture(SwapJobConfig::default());
        let p = name("p");
        materialize(&fix.repos, fix.db.as_ref(), &p, 1_000, 64);
        let before = fix.repos.directory(&p).expect("tree before");

        fix.job.evict(&p).expect("evict");
        assert!(!fix.repos.exists(&p));
        assert!(fix.cold.contains(&p));
        assert_eq!(
            fix.db.project_state(&p).expect("state"),
            ProjectState::Swapped
        );
        assert_eq!(
            fix.db.swap_compression(&p).expect("compression"),
            Some(SwapCompression::Gzip)
        );

        fix.job.restore(&p).expect("restore");
        assert!(fix.repos.exists(&p));
        assert!(!fix.cold.contains(&p), "archive removed after restore");
        assert_eq!(
            fix.db.project_state(&p).expect("state"),
            ProjectState::Present
        );
        let restored_at = fix.db.last_accessed(&p).expect("accessed");
        assert!(restored_at.expect("present stamp") > 1_000);

        let after = fix.repos.directory(&p).expect("tree after");
        assert_eq!(before.files, after.files);
    }

    #[test]
    fn evicting_absent_project_fails() {
        let fix = fixture(SwapJobConfig::default());
        assert!(matches!(
            fix.job.evict(&name("ghost")),
            Err(SwapError::NotPresent { .. })
        ));
    }

    #[test]
    fn restoring_present_project_fails() {
        let fix = fixture(SwapJobConfig::default());
        let p = name("p");
        materialize(&fix.repos, fix.db.as_ref(), &p, 1_000, 16);
        assert!(matches!(
            fix.job.restore(&p),
            Err(SwapError::NotSwapped { .. })
        ));
    }

    #[test]
    fn check_evicts_oldest_until_low_watermark() {
        let config = SwapJobConfig {
            min_projects: 1,
            low_watermark_bytes: 1,
            high_watermark_bytes: 1,
            ..SwapJobConfig::default()
        };
        let fix = fixture(config);
        materialize(&fix.repos, fix.db.as_ref(), &name("old"), 100, 4096);
        materialize(&fix.repos, fix.db.as_ref(), &name("mid"), 200, 4096);
        materialize(&fix.repos, fix.db.as_ref(), &name("new"), 300, 4096);

        fix.job.check().expect("check");

        // Oldest two evicted; min_projects keeps the newest present.
        assert_eq!(
            fix.db.project_state(&name("old")).expect("state"),
            ProjectState::Swapped
        );
        assert_eq!(
            fix.db.project_state(&name("mid")).expect("state"),
            ProjectState::Swapped
        );
        assert_eq!(
            fix.db.project_state(&name("new")).expect("state"),
            ProjectState::Present
        );
    }

    #[test]
    fn failed_eviction_moves_on_to_the_next_candidate() {
        struct FlakyUpload {
            inner: InMemorySwapStore,
            fail_for: ProjectName,
        }

        impl SwapStore for FlakyUpload {
            fn upload(
                &self,
                project: &ProjectName,
                data: Box<dyn std::io::Read + Send>,
                content_length: u64,
            ) -> Result<(), SwapStoreError> {
                if *project == self.fail_for {
                    return Err(SwapStoreError::Upload(std::io::Error::other(
                        "upload refused",
                    )));
                }
                self.inner.upload(project, data, content_length)
            }

            fn download(
                &self,
                project: &ProjectName,
            ) -> Result<Box<dyn std::io::Read + Send>, SwapStoreError> {
                self.inner.download(project)
            }

            fn remove(&self, project: &ProjectName) -> Result<(), SwapStoreError> {
                self.inner.remove(project)
            }

            fn is_safe(&self) -> bool {
                false
            }
        }

        let dir = tempfile::tempdir().expect("tempdir");
        let db: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
        let repos = Arc::new(GitRepoStore::new(dir.path().join("repos")).expect("repo store"));
        let cold = Arc::new(FlakyUpload {
            inner: InMemorySwapStore::new(),
            fail_for: name("old"),
        });
        let job = SwapJob::new(
            SwapJobConfig {
                min_projects: 1,
                low_watermark_bytes: 1,
                high_watermark_bytes: 1,
                ..SwapJobConfig::default()
            },
            Arc::new(ProjectLock::new()),
            Arc::clone(&db),
            Arc::clone(&repos) as Arc<dyn RepoStore>,
            cold as Arc<dyn SwapStore>,
        );
        materialize(&repos, db.as_ref(), &name("old"), 100, 4096);
        materialize(&repos, db.as_ref(), &name("mid"), 200, 4096);
        materialize(&repos, db.as_ref(), &name("new"), 300, 4096);

        job.check().expect("check");

        // The oldest project cannot be uploaded; the cycle skips it and
        // keeps evicting the next-oldest candidates instead of stopping.
        assert_eq!(
            db.project_state(&name("old")).expect("state"),
            ProjectState::Present
        );
        assert_eq!(
            db.project_state(&name("mid")).expect("state"),
            ProjectState::Swapped
        );
        assert_eq!(
            db.project_state(&name("new")).expect("state"),
            ProjectState::Swapped
        );
    }

    #[test]
    fn check_is_a_no_op_under_high_watermark() {
        let config = SwapJobConfig {
            min_projects: 0,
            low_watermark_bytes: 1 << 30,
            high_watermark_bytes: 1 << 31,
            ..SwapJobConfig::default()
        };
        let fix = fixture(config);
        materialize(&fix.repos, fix.db.as_ref(), &name("p"), 100, 4096);
        fix.job.check().expect("check");
        assert_eq!(
            fix.db.project_state(&name("p")).expect("state"),
            ProjectState::Present
        );
    }

    #[test]
    fn timer_thread_starts_and_stops() {
        let fix = fixture(SwapJobConfig {
            interval_ms: 10,
            ..SwapJobConfig::default()
        });
        fix.job.start();
        fix.job.start(); // idempotent
        std::thread::sleep(Duration::from_millis(50));
        fix.job.stop();
        fix.job.stop(); // idempotent
    }
}
