//! Per-name mutual exclusion

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lazily created async mutexes keyed by logical service name.
///
/// Entries are never removed; their number is bounded by the number of
/// services ever seen.
#[derive(Default)]
pub struct NamedLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Holds the locks of a set of names until dropped
pub struct NamedGuard {
    names: Vec<String>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl NamedGuard {
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn lock(&self, name: &str) -> NamedGuard {
        self.lock_all([name]).await
    }

    /// Lock every name, always in sorted order so that overlapping sets
    /// cannot deadlock.
    pub async fn lock_all<I, S>(&self, names: I) -> NamedGuard
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: BTreeSet<String> = names.into_iter().map(|n| n.as_ref().to_string()).collect();
        let mut guards = Vec::with_capacity(names.len());
        for name in &names {
            guards.push(self.handle(name).lock_owned().await);
        }
        NamedGuard {
            names: names.into_iter().collect(),
            _guards: guards,
        }
    }

    /// Number of names seen so far
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
