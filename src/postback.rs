//! Push-confirmation correlation.
//!
//! A push submits a candidate snapshot and then blocks until the remote
//! confirms it through an independent notification channel. The two sides
//! are correlated by a single-use random key: the pushing thread registers a
//! promise and waits on it with a bounded timeout; the notification handler
//! looks the promise up, checks the key, and delivers either the confirmed
//! version id or a structured rejection. A delivery that matches no promise
//! or carries the wrong key is reported back to the deliverer, never
//! silently applied.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::RngCore;
use thiserror::Error;

use crate::project::ProjectName;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6 * 60);

const KEY_BYTES: usize = 16;

/// A domain-level rejection delivered through a postback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushRejection {
    #[error("project has changed on the remote since the base version")]
    OutOfDate,
    #[error("remote rejected the files in this push")]
    InvalidFiles { problems: Vec<String> },
    #[error("remote rejected the project")]
    InvalidProject { problems: Vec<String> },
    #[error("remote reported an unexpected internal error")]
    Internal,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PostbackError {
    /// No confirmation arrived within the timeout. Severe: likely systemic.
    #[error("timed out waiting for push confirmation")]
    Timeout,
    /// The remote rejected the push via postback.
    #[error(transparent)]
    Rejected(PushRejection),
    /// A delivery arrived for a project with no push in flight.
    #[error("unexpected postback: no push in flight for {project}")]
    NoPushInFlight { project: ProjectName },
    /// A delivery or staged-file read presented the wrong key.
    #[error("postback key mismatch for {project}")]
    KeyMismatch { project: ProjectName },
}

#[derive(Clone, Debug)]
enum Outcome {
    Confirmed(u64),
    Rejected(PushRejection),
}

struct Promise {
    key: String,
    slot: Mutex<Option<Outcome>>,
    delivered: Condvar,
}

/// Correlates at most one in-flight push per project with its confirmation.
pub struct PostbackCorrelator {
    promises: Mutex<HashMap<ProjectName, Arc<Promise>>>,
    timeout: Duration,
}

impl PostbackCorrelator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            promises: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Registers a fresh promise for the project, replacing any stale one,
    /// and returns the key to embed in the outgoing push payload.
    pub fn register(&self, project: &ProjectName) -> String {
        let key = fresh_key();
        let promise = Arc::new(Promise {
            key: key.clone(),
            slot: Mutex::new(None),
            delivered: Condvar::new(),
        });
        let mut promises = self.promises.lock().expect("promise map lock poisoned");
        promises.insert(project.clone(), promise);
        key
    }

    /// Blocks the pushing thread until a delivery arrives or the timeout
    /// elapses. The promise is removed from the map on every exit.
    pub fn wait_for_version(&self, project: &ProjectName) -> Result<u64, PostbackError> {
        let promise = {
            let promises = self.promises.lock().expect("promise map lock poisoned");
            promises.get(project).map(Arc::clone)
        };
        let Some(promise) = promise else {
            return Err(PostbackError::NoPushInFlight {
                project: project.clone(),
            });
        };

        let deadline = Instant::now() + self.timeout;
        let mut slot = promise.slot.lock().expect("promise slot lock poisoned");
        let outcome = loop {
            if let Some(outcome) = slot.take() {
                break Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                break None;
            }
            let (next, _timed_out) = promise
                .delivered
                .wait_timeout(slot, deadline - now)
                .expect("promise slot lock poisoned");
            slot = next;
        };
        drop(slot);

        self.remove(project, &promise);

        match outcome {
            Some(Outcome::Confirmed(version)) => Ok(version),
            Some(Outcome::Rejected(rejection)) => Err(PostbackError::Rejected(rejection)),
            None => Err(PostbackError::Timeout),
        }
    }

    /// Delivery from the inbound notification handler: confirmed version id.
    pub fn deliver_success(
        &self,
        project: &ProjectName,
        key: &str,
        version_id: u64,
    ) -> Result<(), PostbackError> {
        self.deliver(project, key, Outcome::Confirmed(version_id))
    }

    /// Delivery from the inbound notification handler: domain rejection.
    pub fn deliver_failure(
        &self,
        project: &ProjectName,
        key: &str,
        rejection: PushRejection,
    ) -> Result<(), PostbackError> {
        self.deliver(project, key, Outcome::Rejected(rejection))
    }

    /// Drops the promise if `key` still owns it. Called when a push fails
    /// before (or without) a delivery, so the key stops authenticating the
    /// moment the push is over.
    pub fn deregister(&self, project: &ProjectName, key: &str) {
        let mut promises = self.promises.lock().expect("promise map lock poisoned");
        if promises.get(project).is_some_and(|p| p.key == key) {
            promises.remove(project);
        }
    }

    /// Checks the key without consuming the promise, for endpoints that
    /// serve staged files during a push.
    pub fn verify_key(&self, project: &ProjectName, key: &str) -> Result<(), PostbackError> {
        let promises = self.promises.lock().expect("promise map lock poisoned");
        match promises.get(project) {
            None => Err(PostbackError::NoPushInFlight {
                project: project.clone(),
            }),
            Some(promise) if promise.key == key => Ok(()),
            Some(_) => Err(PostbackError::KeyMismatch {
                project: project.clone(),
            }),
        }
    }

    fn deliver(
        &self,
        project: &ProjectName,
        key: &str,
        outcome: Outcome,
    ) -> Result<(), PostbackError> {
        let promise = {
            let promises = self.promises.lock().expect("promise map lock poisoned");
            promises.get(project).map(Arc::clone)
        };
        let Some(promise) = promise else {
            tracing::warn!(project = %project, "postback for project with no push in flight");
            return Err(PostbackError::NoPushInFlight {
                project: project.clone(),
            });
        };
        if promise.key != key {
            tracing::warn!(project = %project, "postback with mismatched key");
            return Err(PostbackError::KeyMismatch {
                project: project.clone(),
            });
        }

        let mut slot = promise.slot.lock().expect("promise slot lock poisoned");
        *slot = Some(outcome);
        drop(slot);
        promise.delivered.notify_one();
        Ok(())
    }

    /// Removes the promise only if it is still the one we waited on; a
    /// replacement registered meanwhile belongs to a newer push.
    fn remove(&self, project: &ProjectName, waited_on: &Arc<Promise>) {
        let mut promises = self.promises.lock().expect("promise map lock poisoned");
        if let Some(current) = promises.get(project) {
            if Arc::ptr_eq(current, waited_on) {
                promises.remove(project);
            }
        }
    }
}

impl Default for PostbackCorrelator {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

fn fresh_key() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
