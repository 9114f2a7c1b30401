//! Named state snapshots taken before risky operations.
//!
//! One file per name under `snapshots/`; saving under an existing name
//! overwrites it. The store keeps at most `max_snapshots` files and evicts
//! the oldest by timestamp after each save.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub state: Value,
}

pub struct SnapshotStore {
    dir: PathBuf,
    max_snapshots: usize,
}

impl SnapshotStore {
    pub fn new(state_dir: &Path, max_snapshots: usize) -> Self {
        Self {
            dir: state_dir.join("snapshots"),
            max_snapshots: max_snapshots.max(1),
        }
    }

    pub fn save(&self, name: &str, state: Value) -> Result<Snapshot, StoreError> {
        let snapshot = Snapshot {
            name: name.to_string(),
            timestamp: Utc::now(),
            state,
        };
        store::write_json_atomic(&self.path_for(name), &snapshot)?;
        debug!(snapshot = %name, "snapshot saved");
        self.prune();
        Ok(snapshot)
    }

    pub fn load(&self, name: &str) -> Result<Option<Snapshot>, StoreError> {
        store::read_json(&self.path_for(name))
    }

    /// Most recent snapshot by timestamp, across all names.
    pub fn latest(&self) -> Option<Snapshot> {
        self.list().into_iter().max_by_key(|s| s.timestamp)
    }

    /// Every readable snapshot, oldest first. Unreadable files are skipped.
    pub fn list(&self) -> Vec<Snapshot> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut snapshots: Vec<Snapshot> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
            .filter_map(|p| match store::read_json::<Snapshot>(&p) {
                Ok(s) => s,
                Err(e) => {
                    warn!(path = %p.display(), error = %e, "skipping unreadable snapshot");
                    None
                }
            })
            .collect();
        snapshots.sort_by_key(|s| s.timestamp);
        snapshots
    }

    fn prune(&self) {
        let snapshots = self.list();
        if snapshots.len() <= self.max_snapshots {
            return;
        }
        let excess = snapshots.len() - self.max_snapshots;
        for old in snapshots.iter().take(excess) {
            match fs::remove_file(self.path_for(&old.name)) {
                Ok(()) => info!(snapshot = %old.name, "snapshot evicted"),
                Err(e) => warn!(snapshot = %old.name, error = %e, "failed to evict snapshot"),
            }
        }
    }

    /// Names that needed escaping get a hash suffix so that `a/b` and `a_b`
    /// land in different files.
    fn path_for(&self, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        if safe == name {
            self.dir.join(format!("{}.json", safe))
        } else {
            self.dir.join(format!("{}-{:08x}.json", safe, fnv1a(name)))
        }
    }
}

// Stable across builds, unlike std's DefaultHasher.
fn fnv1a(s: &str) -> u32 {
    s.bytes().fold(0x811c_9dc5_u32, |hash, b| {
        (hash ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 10);

        store.save("pricing", serde_json::json!({"price": 100})).unwrap();
        let snap = store.load("pricing").unwrap().unwrap();
        assert_eq!(snap.name, "pricing");
        assert_eq!(snap.state["price"], 100);
    }

    #[test]
    fn test_same_name_overwrites() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 10);

        store.save("stock", serde_json::json!(1)).unwrap();
        store.save("stock", serde_json::json!(2)).unwrap();
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.load("stock").unwrap().unwrap().state, serde_json::json!(2));
    }

    #[test]
    fn test_latest_by_timestamp() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 10);
        assert!(store.latest().is_none());

        store.save("a", serde_json::json!("first")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.save("b", serde_json::json!("second")).unwrap();

        assert_eq!(store.latest().unwrap().name, "b");
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 2);

        for name in ["one", "two", "three"] {
            store.save(name, serde_json::json!(name)).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let names: Vec<String> = store.list().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["two", "three"]);
        assert!(store.load("one").unwrap().is_none());
    }

    #[test]
    fn test_unsafe_names_are_sanitized() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 10);
        store.save("../escape/attempt", serde_json::json!(true)).unwrap();
        let files: Vec<String> = fs::read_dir(dir.path().join("snapshots"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("___escape_attempt-"));
        assert!(!dir.path().join("escape").exists());
        assert_eq!(store.list().len(), 1);
        assert!(store.load("../escape/attempt").unwrap().is_some());
    }

    #[test]
    fn test_names_differing_only_in_unsafe_chars_do_not_collide() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), 10);
        store.save("pricing-a/b", serde_json::json!({"price": 1})).unwrap();
        store.save("pricing-a_b", serde_json::json!({"price": 2})).unwrap();

        assert_eq!(store.list().len(), 2);
        assert_eq!(store.load("pricing-a/b").unwrap().unwrap().state["price"], 1);
        assert_eq!(store.load("pricing-a_b").unwrap().unwrap().state["price"], 2);
        assert_eq!(store.load("pricing-a/b").unwrap().unwrap().name, "pricing-a/b");
    }
}
