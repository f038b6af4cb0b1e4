//! Per-project mutual exclusion and the shutdown drain barrier.
//!
//! All core operations on one project (pull, push, evict, restore) serialize
//! on the project's slot; operations on distinct projects never contend.
//! Shutdown calls `lock_all`, which blocks until every held slot has been
//! released. Lock acquisition never fails; blocking is the backpressure.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::project::ProjectName;

/// Called with the remaining holder count on each release while draining.
pub type DrainObserver = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Default)]
struct Slot {
    busy: Mutex<bool>,
    freed: Condvar,
}

#[derive(Default)]
struct DrainState {
    held: usize,
    draining: bool,
}

struct Shared {
    /// Lazily created, monotonically growing slot map.
    slots: Mutex<HashMap<ProjectName, Arc<Slot>>>,
    drain: Mutex<DrainState>,
    drained: Condvar,
    observer: Option<DrainObserver>,
}

pub struct ProjectLock {
    shared: Arc<Shared>,
}

impl ProjectLock {
    pub fn new() -> Self {
        Self::with_observer(None)
    }

    pub fn with_observer(observer: Option<DrainObserver>) -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: Mutex::new(HashMap::new()),
                drain: Mutex::new(DrainState::default()),
                drained: Condvar::new(),
                observer,
            }),
        }
    }

    /// Acquires the named project's slot, blocking until it is free.
    pub fn lock(&self, project: &ProjectName) -> LockGuard {
        let slot = {
            let mut slots = self.shared.slots.lock().expect("slot map lock poisoned");
            Arc::clone(slots.entry(project.clone()).or_default())
        };

        // The drain share is taken before waiting on the slot: a thread
        // blocked here is in-flight work, and `lock_all` must not observe
        // zero holders while it exists.
        let mut drain = self.shared.drain.lock().expect("drain lock poisoned");
        drain.held += 1;
        drop(drain);

        let mut busy = slot.busy.lock().expect("project slot lock poisoned");
        while *busy {
            busy = slot.freed.wait(busy).expect("project slot lock poisoned");
        }
        *busy = true;
        drop(busy);

        LockGuard {
            shared: Arc::clone(&self.shared),
            slot,
            project: project.clone(),
        }
    }

    /// Flips into draining mode and blocks until no project slot is held.
    ///
    /// Nothing here prevents new acquisitions; the caller must have stopped
    /// issuing new work before draining.
    pub fn lock_all(&self) {
        let mut drain = self.shared.drain.lock().expect("drain lock poisoned");
        drain.draining = true;
        while drain.held > 0 {
            drain = self
                .shared
                .drained
                .wait(drain)
                .expect("drain lock poisoned");
        }
    }

    #[cfg(test)]
    fn held_count(&self) -> usize {
        self.shared.drain.lock().expect("drain lock poisoned").held
    }
}

impl Default for ProjectLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the project slot (and its drain barrier share) on drop.
pub struct LockGuard {
    shared: Arc<Shared>,
    slot: Arc<Slot>,
    project: ProjectName,
}

impl LockGuard {
    pub fn project(&self) -> &ProjectName {
        &self.project
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut busy = self.slot.busy.lock().expect("project slot lock poisoned");
        *busy = false;
        drop(busy);
        self.slot.freed.notify_one();

        let mut drain = self.shared.drain.lock().expect("drain lock poisoned");
        drain.held -= 1;
        let remaining = drain.held;
        let draining = drain.draining;
        if draining && remaining == 0 {
            self.shared.drained.notify_all();
        }
        drop(drain);

        if draining {
            tracing::info!(remaining, "waiting for in-flight projects");
            if let Some(observer) = self.shared.observer.as_ref() {
                observer(remaining);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn name(s: &str) -> ProjectName {
        ProjectName::new(s).expect("valid name")
    }

    #[test]
    fn same_project_is_mutually_exclusive() {
        let lock = Arc::new(ProjectLock::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(thread::spawn(move || {
                let _guard = lock.lock(&name("p"));
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.join().expect("worker panicked");
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_projects_do_not_block_each_other() {
        let lock = ProjectLock::new();
        let _a = lock.lock(&name("a"));
        // If "a" blocked "b" this would deadlock the test.
        let _b = lock.lock(&name("b"));
        assert_eq!(lock.held_count(), 2);
    }

    #[test]
    fn relock_after_release() {
        let lock = ProjectLock::new();
        drop(lock.lock(&name("p")));
        drop(lock.lock(&name("p")));
        assert_eq!(lock.held_count(), 0);
    }

    #[test]
    fn blocked_waiter_counts_as_in_flight() {
        let lock = Arc::new(ProjectLock::new());
        let guard = lock.lock(&name("p"));

        // A second locker of the same project blocks on the slot but must
        // already hold its drain share.
        let waiter = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || drop(lock.lock(&name("p"))))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(lock.held_count(), 2);

        let drainer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.lock_all())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!drainer.is_finished(), "drain must wait for the waiter too");

        drop(guard);
        waiter.join().expect("waiter panicked");
        drainer.join().expect("drainer panicked");
        assert_eq!(lock.held_count(), 0);
    }

    #[test]
    fn lock_all_waits_for_holders_and_reports() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);
        let lock = Arc::new(ProjectLock::with_observer(Some(Box::new(move |n| {
            sink.lock().expect("report sink poisoned").push(n);
        }))));

        let guard_a = lock.lock(&name("a"));
        let guard_b = lock.lock(&name("b"));

        let drainer = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || lock.lock_all())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!drainer.is_finished(), "drain must wait for holders");
        drop(guard_a);
        drop(guard_b);
        drainer.join().expect("drainer panicked");

        let reports = reported.lock().expect("report sink poisoned").clone();
        assert_eq!(reports, vec![1, 0]);
    }
}
