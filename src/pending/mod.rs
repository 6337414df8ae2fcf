use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Short-lived keyed handshakes. Entries expire after `ttl` and are only
/// ever handed out once.
pub struct TtlStore<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K: Eq + Hash, V> TtlStore<K, V> {
    pub fn new(ttl: Duration) -> Self {
        TtlStore {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<K, (Instant, V)>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    fn insert_at(&self, key: K, value: V, at: Instant) {
        self.entries().insert(key, (at, value));
    }

    /// Removes and returns the entry with its age, or `None` when it is
    /// unknown or expired.
    pub fn take(&self, key: &K) -> Option<(V, Duration)> {
        let (created, value) = self.entries().remove(key)?;
        let age = created.elapsed();
        (age <= self.ttl).then_some((value, age))
    }

    pub fn purge_expired(&self) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, (created, _)| created.elapsed() <= ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An outstanding probe for a site, identified by its token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingProbe {
    pub site_id: String,
}

pub type ProbeStore = TtlStore<String, PendingProbe>;
