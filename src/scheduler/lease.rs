use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// In-process set of task keys currently dispatched.
///
/// Keeps one process from running the same task twice, including across a
/// leadership flap inside one cycle. Cross-process exclusion is the leader
/// lock's job.
#[derive(Debug, Default)]
pub struct LeaseManager {
    held: Mutex<HashSet<String>>,
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the key is already held.
    pub fn acquire(&self, task_key: &str) -> bool {
        self.held.lock().unwrap().insert(task_key.to_string())
    }

    pub fn is_leased(&self, task_key: &str) -> bool {
        self.held.lock().unwrap().contains(task_key)
    }

    /// Returns whether the key was held.
    pub fn release(&self, task_key: &str) -> bool {
        self.held.lock().unwrap().remove(task_key)
    }

    /// Acquire a lease that is released when the guard is dropped.
    pub fn try_lease(self: &Arc<Self>, task_key: &str) -> Option<LeaseGuard> {
        if self.acquire(task_key) {
            Some(LeaseGuard {
                manager: Arc::clone(self),
                task_key: task_key.to_string(),
            })
        } else {
            None
        }
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }
}

/// Holds one task key. Dropping it releases the key exactly once, whichever
/// way the execution ended: completion, failure, cancellation or abort.
#[derive(Debug)]
pub struct LeaseGuard {
    manager: Arc<LeaseManager>,
    task_key: String,
}

impl LeaseGuard {
    pub fn task_key(&self) -> &str {
        &self.task_key
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.manager.release(&self.task_key);
    }
}
