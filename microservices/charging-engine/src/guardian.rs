//! Serialization guardian
//!
//! Process-wide per-key mutual exclusion. Every operation mutating an
//! account passes through `guard` on that account's key; shared-group
//! debits additionally acquire each peer's key. Keys are acquired in sorted
//! order so composite acquisitions cannot deadlock.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct Guardian {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Guardian {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` while exclusively holding every key. Keys are sorted and
    /// deduplicated before acquisition; locks release in reverse order when
    /// the task completes.
    pub async fn guard<F, T>(&self, keys: &[String], task: F) -> T
    where
        F: Future<Output = T>,
    {
        let mut sorted: Vec<String> = keys.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut held: Vec<OwnedMutexGuard<()>> = Vec::with_capacity(sorted.len());
        for key in &sorted {
            let lock = {
                self.locks
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .value()
                    .clone()
            };
            held.push(lock.lock_owned().await);
        }

        let result = task.await;

        while held.pop().is_some() {}
        result
    }
}
