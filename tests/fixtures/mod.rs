//! Shared harness for the integration tests: a bridge wired over a real git
//! repository store in a tempdir, with a scripted in-memory remote.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{Sender, unbounded};

use snapbridge::api::{ApiError, SnapshotApi, SubmitOutcome, VersionInfo};
use snapbridge::bridge::Bridge;
use snapbridge::config::BridgeConfig;
use snapbridge::data::{Attachment, CandidateSnapshot, CommitAuthor, RawFile, Snapshot};
use snapbridge::project::ProjectName;
use snapbridge::repo::GitRepoStore;
use snapbridge::resource::UrlFetcher;
use snapbridge::store::MemoryStore;
use snapbridge::swap::InMemorySwapStore;

pub fn project(s: &str) -> ProjectName {
    ProjectName::new(s).expect("valid project name")
}

pub fn file(path: &str, contents: &str) -> RawFile {
    RawFile::new(path, contents.as_bytes().to_vec())
}

pub fn snapshot(version_id: u64, srcs: &[(&str, &str)], atts: &[(&str, &str)]) -> Snapshot {
    Snapshot {
        version_id,
        author: CommitAuthor::new("Test Author", "author@example.com"),
        created_at: 1_700_000_000_000 + version_id as i64,
        comment: format!("version {version_id}"),
        srcs: srcs.iter().map(|(p, c)| file(p, c)).collect(),
        atts: atts
            .iter()
            .map(|(path, url)| Attachment {
                path: (*path).to_string(),
                url: (*url).to_string(),
            })
            .collect(),
    }
}

/// What the remote saw when a candidate snapshot was submitted.
#[derive(Clone, Debug)]
pub struct SubmittedPush {
    pub project: ProjectName,
    pub key: String,
    pub based_on: u64,
    /// Manifest as (path, staged id); unchanged files carry no id.
    pub files: Vec<(String, Option<String>)>,
    pub deleted: Vec<String>,
}

struct RemoteProject {
    latest: u64,
    snapshots: Vec<Snapshot>,
    next_submit: SubmitOutcome,
}

/// Scripted remote: per-project version history plus a record of every
/// submission, optionally forwarded over a channel so a test thread can
/// deliver the postback while the push blocks.
pub struct MockSnapshotApi {
    state: Mutex<HashMap<ProjectName, RemoteProject>>,
    submissions: Mutex<Vec<SubmittedPush>>,
    submit_tx: Mutex<Option<Sender<SubmittedPush>>>,
    snapshot_fetches: AtomicUsize,
}

impl MockSnapshotApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            submit_tx: Mutex::new(None),
            snapshot_fetches: AtomicUsize::new(0),
        }
    }

    pub fn add_project(&self, project: &ProjectName, snapshots: Vec<Snapshot>) {
        let latest = snapshots.iter().map(|s| s.version_id).max().unwrap_or(0);
        self.state.lock().expect("state lock poisoned").insert(
            project.clone(),
            RemoteProject {
                latest,
                snapshots,
                next_submit: SubmitOutcome::Accepted,
            },
        );
    }

    pub fn append_snapshot(&self, project: &ProjectName, snapshot: Snapshot) {
        let mut state = self.state.lock().expect("state lock poisoned");
        let remote = state.get_mut(project).expect("project scripted");
        remote.latest = remote.latest.max(snapshot.version_id);
        remote.snapshots.push(snapshot);
    }

    /// The next submit for the project returns out-of-date instead of
    /// accepting.
    pub fn reject_next_submit(&self, project: &ProjectName) {
        let mut state = self.state.lock().expect("state lock poisoned");
        state.get_mut(project).expect("project scripted").next_submit = SubmitOutcome::OutOfDate;
    }

    pub fn submissions(&self) -> Vec<SubmittedPush> {
        self.submissions
            .lock()
            .expect("submissions lock poisoned")
            .clone()
    }

    pub fn snapshot_fetches(&self) -> usize {
        self.snapshot_fetches.load(Ordering::SeqCst)
    }

    fn forward_submissions(&self, tx: Sender<SubmittedPush>) {
        *self.submit_tx.lock().expect("submit tx lock poisoned") = Some(tx);
    }
}

impl SnapshotApi for MockSnapshotApi {
    fn latest_version(&self, project: &ProjectName) -> Result<u64, ApiError> {
        let state = self.state.lock().expect("state lock poisoned");
        match state.get(project) {
            Some(remote) => Ok(remote.latest),
            None => Err(ApiError::NotFound {
                project: project.clone(),
            }),
        }
    }

    fn saved_versions(&self, project: &ProjectName) -> Result<Vec<VersionInfo>, ApiError> {
        let state = self.state.lock().expect("state lock poisoned");
        let remote = state.get(project).ok_or_else(|| ApiError::NotFound {
            project: project.clone(),
        })?;
        Ok(remote
            .snapshots
            .iter()
            .map(|s| VersionInfo {
                version_id: s.version_id,
                created_at: s.created_at,
                comment: s.comment.clone(),
            })
            .collect())
    }

    fn snapshot(&self, project: &ProjectName, version_id: u64) -> Result<Snapshot, ApiError> {
        self.snapshot_fetches.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().expect("state lock poisoned");
        let remote = state.get(project).ok_or_else(|| ApiError::NotFound {
            project: project.clone(),
        })?;
        remote
            .snapshots
            .iter()
            .find(|s| s.version_id == version_id)
            .cloned()
            .ok_or_else(|| ApiError::Unexpected(format!("no snapshot for version {version_id}")))
    }

    fn submit(
        &self,
        project: &ProjectName,
        candidate: &CandidateSnapshot,
        postback_key: &str,
    ) -> Result<SubmitOutcome, ApiError> {
        let submitted = SubmittedPush {
            project: project.clone(),
            key: postback_key.to_string(),
            based_on: candidate.based_on,
            files: candidate
                .files
                .iter()
                .map(|f| (f.path.clone(), f.staged_id.clone()))
                .collect(),
            deleted: candidate.deleted.clone(),
        };
        self.submissions
            .lock()
            .expect("submissions lock poisoned")
            .push(submitted.clone());

        let outcome = {
            let mut state = self.state.lock().expect("state lock poisoned");
            let remote = state.get_mut(project).ok_or_else(|| ApiError::NotFound {
                project: project.clone(),
            })?;
            std::mem::replace(&mut remote.next_submit, SubmitOutcome::Accepted)
        };

        if let Some(tx) = self
            .submit_tx
            .lock()
            .expect("submit tx lock poisoned")
            .as_ref()
        {
            let _ = tx.send(submitted);
        }
        Ok(outcome)
    }
}

pub struct MockFetcher {
    responses: Mutex<HashMap<String, Bytes>>,
    downloads: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn serve(&self, url: &str, contents: &str) {
        self.responses
            .lock()
            .expect("responses lock poisoned")
            .insert(url.to_string(), Bytes::from(contents.as_bytes().to_vec()));
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

impl UrlFetcher for MockFetcher {
    fn fetch(&self, url: &str) -> Result<Bytes, Box<dyn std::error::Error + Send + Sync>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .expect("responses lock poisoned")
            .get(url)
            .cloned()
            .ok_or_else(|| format!("no scripted response for {url}").into())
    }
}

pub struct Harness {
    _dir: tempfile::TempDir,
    pub bridge: Arc<Bridge>,
    pub api: Arc<MockSnapshotApi>,
    pub fetcher: Arc<MockFetcher>,
    pub db: Arc<MemoryStore>,
    pub repos: Arc<GitRepoStore>,
    pub cold: Arc<InMemorySwapStore>,
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(tweak: impl FnOnce(&mut BridgeConfig)) -> Harness {
    snapbridge::telemetry::init("warn");
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = BridgeConfig {
        root_dir: dir.path().join("repos"),
        // Tests that exercise the timeout path override this; everything
        // else should never get near it.
        postback_timeout_ms: 2_000,
        ..BridgeConfig::default()
    };
    tweak(&mut config);

    let api = Arc::new(MockSnapshotApi::new());
    let fetcher = Arc::new(MockFetcher::new());
    let db = Arc::new(MemoryStore::new());
    let repos = Arc::new(GitRepoStore::new(config.root_dir.clone()).expect("repo store"));
    let cold = Arc::new(InMemorySwapStore::new());

    let bridge = Bridge::new(
        &config,
        Arc::clone(&repos) as _,
        Arc::clone(&db) as _,
        Arc::clone(&cold) as _,
        Arc::clone(&api) as _,
        Arc::clone(&fetcher) as _,
    )
    .expect("build bridge");

    Harness {
        _dir: dir,
        bridge: Arc::new(bridge),
        api,
        fetcher,
        db,
        repos,
        cold,
    }
}

/// Runs `handler` on a helper thread with the next submission, while the
/// main thread blocks inside `push`. Join the handle after the push returns.
pub fn on_next_submit<F>(h: &Harness, handler: F) -> thread::JoinHandle<()>
where
    F: FnOnce(SubmittedPush) + Send + 'static,
{
    let (tx, rx) = unbounded();
    h.api.forward_submissions(tx);
    thread::spawn(move || {
        let submitted = rx.recv().expect("a push was submitted");
        handler(submitted);
    })
}
