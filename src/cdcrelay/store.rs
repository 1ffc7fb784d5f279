use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use dashmap::DashMap;
use log::{debug, info, warn};

use crate::cdcrelay::types::UserId;
use crate::error::{ErrorCode, RelayError, Result};

/// Shared key → set-of-users store.
///
/// Each call is atomic on its own key; nothing spans keys.
pub trait SetStore: Send + Sync {
    /// Adds a member, returns true when the set changed
    fn add_member(&self, key: &str, member: &str) -> Result<bool>;

    /// Removes a member, returns true when the set changed
    fn remove_member(&self, key: &str, member: &str) -> Result<bool>;

    /// Returns all members of a set (empty if the set was never created)
    fn members(&self, key: &str) -> Result<Vec<UserId>>;

    fn contains(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.members(key)?.iter().any(|m| m == member))
    }
}

/// In-process set store backed by a sharded map.
///
/// Sets are created on first add and kept when they become empty.
#[derive(Default)]
pub struct MemorySetStore {
    inner: DashMap<String, HashSet<UserId>>,
}

impl MemorySetStore {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Number of sets ever created
    pub fn set_count(&self) -> usize {
        self.inner.len()
    }

    /// Sorted copy of every set, used for snapshots and debugging
    pub fn snapshot(&self) -> BTreeMap<String, Vec<UserId>> {
        self.inner
            .iter()
            .map(|entry| {
                let mut members: Vec<UserId> = entry.value().iter().cloned().collect();
                members.sort();
                (entry.key().clone(), members)
            })
            .collect()
    }

    /// Load sets from a JSON snapshot, or start empty when the file is absent
    pub fn load_snapshot<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let store = Self::new();
        if !path.exists() {
            info!("No store snapshot at {}, starting empty", path.display());
            return Ok(store);
        }

        let content = fs::read_to_string(path).map_err(|e| {
            RelayError::new(ErrorCode::SnapshotFailed, format!("Failed to read snapshot: {}", e))
        })?;
        let sets: BTreeMap<String, Vec<UserId>> = serde_json::from_str(&content).map_err(|e| {
            RelayError::new(ErrorCode::SnapshotFailed, format!("Failed to parse snapshot: {}", e))
        })?;

        for (key, members) in sets {
            store.inner.insert(key, members.into_iter().collect());
        }
        info!("Loaded {} subscriber sets from {}", store.set_count(), path.display());
        Ok(store)
    }

    /// Write all sets as a JSON snapshot
    pub fn write_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.snapshot())?;
        fs::write(path.as_ref(), content).map_err(|e| {
            RelayError::new(ErrorCode::SnapshotFailed, format!("Failed to write snapshot: {}", e))
        })?;
        info!("Wrote {} subscriber sets to {}", self.set_count(), path.as_ref().display());
        Ok(())
    }
}

impl SetStore for MemorySetStore {
    fn add_member(&self, key: &str, member: &str) -> Result<bool> {
        // entry() holds the shard lock for the whole check-and-insert
        let added = self
            .inner
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        debug!("add_member {} -> {} (changed: {})", member, key, added);
        Ok(added)
    }

    fn remove_member(&self, key: &str, member: &str) -> Result<bool> {
        let removed = match self.inner.get_mut(key) {
            Some(mut set) => set.remove(member),
            None => false,
        };
        debug!("remove_member {} <- {} (changed: {})", member, key, removed);
        Ok(removed)
    }

    fn members(&self, key: &str) -> Result<Vec<UserId>> {
        match self.inner.get(key) {
            Some(set) => Ok(set.iter().cloned().collect()),
            None => {
                debug!("No subscriber set for {}", key);
                Ok(Vec::new())
            }
        }
    }

    fn contains(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.inner.get(key).is_some_and(|set| set.contains(member)))
    }
}

/// Logs and swallows a store error for one key; used where a store miss is
/// a transient delivery gap, not data loss.
pub(crate) fn log_store_error(op: &str, key: &str, err: &RelayError) {
    warn!("Store {} failed for {}: {}", op, key, err);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutations_report_whether_they_changed_anything() {
        let store = MemorySetStore::new();
        assert!(store.add_member("finance:AAPL", "u1").unwrap());
        assert!(!store.add_member("finance:AAPL", "u1").unwrap());
        assert!(store.remove_member("finance:AAPL", "u1").unwrap());
        assert!(!store.remove_member("finance:AAPL", "u1").unwrap());
        assert!(!store.remove_member("finance:MSFT", "u1").unwrap());
    }

    #[test]
    fn emptied_sets_are_kept() {
        let store = MemorySetStore::new();
        store.add_member("rss:feed", "u1").unwrap();
        store.remove_member("rss:feed", "u1").unwrap();
        assert_eq!(store.set_count(), 1);
        assert!(store.members("rss:feed").unwrap().is_empty());
        assert!(store.members("rss:other").unwrap().is_empty());
    }

    #[test]
    fn snapshot_survives_a_restart() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sets.json");

        let store = MemorySetStore::new();
        store.add_member("fantasy:league_users:nfl.l.1", "u1").unwrap();
        store.add_member("fantasy:league_users:nfl.l.1", "u2").unwrap();
        store.write_snapshot(&path).unwrap();

        let restored = MemorySetStore::load_snapshot(&path).unwrap();
        assert_eq!(restored.snapshot(), store.snapshot());
        assert!(restored.contains("fantasy:league_users:nfl.l.1", "u2").unwrap());
    }

    #[test]
    fn missing_snapshot_starts_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = MemorySetStore::load_snapshot(dir.path().join("absent.json")).unwrap();
        assert_eq!(store.set_count(), 0);
    }
}
