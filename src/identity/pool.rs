//! Account pool shared by all workers
//!
//! Holds the queue of idle identities, the bench of challenged ones, and a
//! registry with the last known state of every account (what gets written
//! back to disk on shutdown).

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::Identity;
use crate::types::{Result, ScanError};

pub struct AccountPool {
    ready: Mutex<VecDeque<Identity>>,
    available: Notify,
    benched: Mutex<Vec<Identity>>,
    registry: DashMap<String, Identity>,
}

impl Default for AccountPool {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountPool {
    pub fn new() -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            benched: Mutex::new(Vec::new()),
            registry: DashMap::new(),
        }
    }

    /// Build a pool from known accounts. Banned accounts are only tracked,
    /// challenged ones go straight to the bench.
    pub fn from_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        let pool = Self::new();
        for identity in identities {
            if identity.banned {
                pool.record(&identity);
            } else if identity.captcha {
                pool.put_benched(identity);
            } else {
                pool.put(identity);
            }
        }
        pool
    }

    /// Load accounts from a JSON array
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let identities: Vec<Identity> = serde_json::from_str(&content)
            .map_err(|e| ScanError::Io(format!("invalid accounts file: {}", e)))?;
        let pool = Self::from_identities(identities);
        info!(
            path = %path.display(),
            ready = pool.ready_len(),
            benched = pool.benched_len(),
            "Loaded accounts"
        );
        Ok(pool)
    }

    /// Write every known account back to disk, sorted by username
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut all: Vec<Identity> = self.registry.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.username.cmp(&b.username));
        let json = serde_json::to_string_pretty(&all)
            .map_err(|e| ScanError::Internal(format!("failed to encode accounts: {}", e)))?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), count = all.len(), "Saved accounts");
        Ok(())
    }

    /// Take the next idle identity, suspending while none is available
    pub async fn take(&self) -> Identity {
        loop {
            if let Some(identity) = self.try_take() {
                return identity;
            }
            self.available.notified().await;
        }
    }

    pub fn try_take(&self) -> Option<Identity> {
        let identity = lock(&self.ready).pop_front()?;
        debug!(username = %identity.username, "Identity taken from pool");
        Some(identity)
    }

    /// Return an identity to the idle queue
    pub fn put(&self, identity: Identity) {
        self.record(&identity);
        lock(&self.ready).push_back(identity);
        self.available.notify_one();
    }

    /// Set a challenged identity aside for external resolution
    pub fn put_benched(&self, identity: Identity) {
        self.record(&identity);
        lock(&self.benched).push(identity);
    }

    /// Update the registry with the latest state of an identity
    pub fn record(&self, identity: &Identity) {
        self.registry
            .insert(identity.username.clone(), identity.clone());
    }

    pub fn get(&self, username: &str) -> Option<Identity> {
        self.registry.get(username).map(|e| e.value().clone())
    }

    pub fn ready_len(&self) -> usize {
        lock(&self.ready).len()
    }

    pub fn benched_len(&self) -> usize {
        lock(&self.benched).len()
    }

    /// Drain the bench, e.g. once challenges have been solved elsewhere
    pub fn take_benched(&self) -> Vec<Identity> {
        std::mem::take(&mut *lock(&self.benched))
    }

    pub fn known_len(&self) -> usize {
        self.registry.len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_from_identities_sorts_accounts() {
        let mut banned = Identity::new("banned", "pw");
        banned.banned = true;
        let mut challenged = Identity::new("challenged", "pw");
        challenged.captcha = true;
        let ok = Identity::new("ok", "pw");

        let pool = AccountPool::from_identities(vec![banned, challenged, ok]);
        assert_eq!(pool.ready_len(), 1);
        assert_eq!(pool.benched_len(), 1);
        assert_eq!(pool.known_len(), 3);
        assert_eq!(pool.try_take().unwrap().username, "ok");
        assert!(pool.try_take().is_none());
    }

    #[tokio::test]
    async fn test_take_waits_for_put() {
        let pool = Arc::new(AccountPool::new());

        let taker = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.take().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!taker.is_finished());

        pool.put(Identity::new("late", "pw"));
        let identity = tokio::time::timeout(Duration::from_secs(1), taker)
            .await
            .expect("take should wake")
            .unwrap();
        assert_eq!(identity.username, "late");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");

        let pool = AccountPool::new();
        let mut identity = Identity::new("walker1", "pw");
        identity.items.insert(1, 20);
        pool.put(identity);
        pool.save(&path).unwrap();

        let loaded = AccountPool::load(&path).unwrap();
        let identity = loaded.try_take().unwrap();
        assert_eq!(identity.username, "walker1");
        assert_eq!(identity.item_count(), 20);
    }
}
