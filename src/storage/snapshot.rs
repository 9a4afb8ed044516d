//! Read cache of runtime snapshots
//!
//! The syncer refreshes the cache on an interval. Every sync replaces the
//! whole view: a snapshot missing from the latest listing no longer exists.

use crate::error::{HullError, Result};
use crate::runtime::{RuntimeClient, SnapshotKind, SnapshotUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cached usage of one snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub kind: SnapshotKind,
    pub size: u64,
    pub inodes: u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Default)]
pub struct SnapshotStore {
    snapshots: RwLock<HashMap<String, SnapshotInfo>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache with a fresh listing taken at `now`
    pub fn sync(&self, listing: Vec<SnapshotUsage>, now: DateTime<Utc>) -> Result<()> {
        let fresh: HashMap<String, SnapshotInfo> = listing
            .into_iter()
            .map(|u| {
                (
                    u.key,
                    SnapshotInfo {
                        kind: u.kind,
                        size: u.size,
                        inodes: u.inodes,
                        last_seen: now,
                    },
                )
            })
            .collect();

        let mut snapshots = self
            .snapshots
            .write()
            .map_err(|_| HullError::Lock("Failed to acquire write lock".to_string()))?;
        let evicted = snapshots.keys().filter(|k| !fresh.contains_key(*k)).count();
        *snapshots = fresh;
        if evicted > 0 {
            debug!(evicted, "evicted stale snapshots");
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<SnapshotInfo>> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| HullError::Lock("Failed to acquire read lock".to_string()))?;
        Ok(snapshots.get(key).cloned())
    }

    pub fn list(&self) -> Result<Vec<(String, SnapshotInfo)>> {
        let snapshots = self
            .snapshots
            .read()
            .map_err(|_| HullError::Lock("Failed to acquire read lock".to_string()))?;
        let mut out: Vec<_> = snapshots
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

/// Refresh `store` from the runtime once
pub async fn sync_once(runtime: &dyn RuntimeClient, store: &SnapshotStore) -> Result<()> {
    let listing = runtime.list_snapshots().await?;
    store.sync(listing, Utc::now())
}

/// Periodically refresh the cache until cancelled
pub async fn run_snapshot_syncer(
    runtime: Arc<dyn RuntimeClient>,
    store: Arc<SnapshotStore>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sync_once(runtime.as_ref(), &store).await {
                    warn!("failed to sync snapshots: {}", e);
                }
            }
        }
    }
    debug!("snapshot syncer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(key: &str, size: u64) -> SnapshotUsage {
        SnapshotUsage {
            key: key.to_string(),
            kind: SnapshotKind::Active,
            size,
            inodes: 1,
        }
    }

    #[test]
    fn test_sync_evicts_missing() {
        let store = SnapshotStore::new();
        let t0 = Utc::now();
        store.sync(vec![usage("a", 1), usage("b", 2)], t0).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);

        let t1 = t0 + chrono::Duration::seconds(60);
        store.sync(vec![usage("b", 5)], t1).unwrap();

        assert!(store.get("a").unwrap().is_none());
        let b = store.get("b").unwrap().unwrap();
        assert_eq!(b.size, 5);
        assert_eq!(b.last_seen, t1);
    }
}
