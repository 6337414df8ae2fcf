use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// One async mutex per key, created on first use. Holding the guard
/// serializes work on that key only.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_waits_other_keys_do_not() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("site-a").await;

        // A different key is free.
        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock("site-b")).await;
        assert!(other.is_ok());

        // The same key is not, until the guard drops.
        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.lock("site-a")).await;
        assert!(blocked.is_err());
        drop(guard);
        let freed = tokio::time::timeout(Duration::from_millis(50), locks.lock("site-a")).await;
        assert!(freed.is_ok());
    }
}
