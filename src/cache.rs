//! Expiring key-value stores for serialized DNS messages.
//!
//! Three independent [`TtlCache`] instances back the proxy: resolved
//! responses, pending challenges, and validated clients. Each maps an opaque
//! hex key to serialized message bytes with an optional expiry. Entries
//! expire lazily on access; a periodic snapshot task additionally sweeps and
//! persists each store to disk so state survives restarts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Error;

/// Interval between snapshot sweeps.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// A stored value with its absolute expiry in unix seconds.
///
/// Wall-clock expiries keep snapshots meaningful across restarts; an entry
/// written by a previous process is skipped at load when its deadline has
/// passed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    data: Vec<u8>,
    expires_at: Option<u64>,
}

impl Entry {
    fn expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// An expiring `String → bytes` store.
#[derive(Debug, Default)]
pub struct TtlCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live entry. Expired entries are treated as absent and
    /// evicted on the way out.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = unix_now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.expired(now) => return Some(entry.data.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.entries.write().await.remove(key);
        None
    }

    /// Insert an entry. `ttl` of `None` means the entry never expires.
    pub async fn set(&self, key: impl Into<String>, data: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| unix_now().saturating_add(ttl.as_secs()));
        self.entries
            .write()
            .await
            .insert(key.into(), Entry { data, expires_at });
    }

    /// Drop every entry.
    pub async fn flush(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Remove entries whose deadline has passed.
    pub async fn purge_expired(&self) {
        let now = unix_now();
        self.entries
            .write()
            .await
            .retain(|_, entry| !entry.expired(now));
    }

    /// Save the store as JSON to `path`, or return an Error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidJson`] if an entry can't be serialized, or
    /// [`Error::Io`] if the snapshot can't be written.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let snapshot = self.entries.read().await.clone();
        let data = serde_json::to_vec(&snapshot)?;
        let mut output = File::create(path.as_ref()).await?;
        output.write_all(&data).await?;
        output.flush().await?;
        Ok(())
    }

    /// Load entries from a JSON snapshot at `path`, replacing the current
    /// contents. A missing file leaves the store empty; entries that expired
    /// while the process was down are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidJson`] if the snapshot is unparsable, or
    /// [`Error::Io`] for read failures other than a missing file.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let mut file = match File::open(path.as_ref()).await {
            Ok(f) => f,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(Error::Io(err)),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let mut snapshot: HashMap<String, Entry> = serde_json::from_slice(&buf)?;
        let now = unix_now();
        snapshot.retain(|_, entry| !entry.expired(now));
        *self.entries.write().await = snapshot;
        Ok(())
    }
}

/// The three stores threaded through the request state machine.
#[derive(Clone)]
pub struct Caches {
    /// Resolved upstream answers, keyed by request key.
    pub responses: Arc<TtlCache>,
    /// Challenges issued but not yet verified, keyed by validation key.
    pub pending: Arc<TtlCache>,
    /// Clients that completed a challenge, keyed by validation key.
    pub validated: Arc<TtlCache>,
}

impl Caches {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(TtlCache::new()),
            pending: Arc::new(TtlCache::new()),
            validated: Arc::new(TtlCache::new()),
        }
    }
}

impl Default for Caches {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the periodic sweep-and-snapshot task for one store.
pub fn spawn_snapshot_task(cache: Arc<TtlCache>, path: PathBuf) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            cache.purge_expired().await;
            match cache.save(&path).await {
                Ok(()) => debug!(path = %path.display(), "cache saved"),
                Err(err) => warn!(path = %path.display(), "cache save failed: {err}"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_what_set_stored() {
        let cache = TtlCache::new();

        cache.set("k", vec![1, 2, 3], None).await;

        assert_eq!(cache.get("k").await, Some(vec![1, 2, 3]));
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test]
    async fn expired_entries_are_absent() {
        let cache = TtlCache::new();

        cache.set("k", vec![1], Some(Duration::ZERO)).await;

        assert_eq!(cache.get("k").await, None);
        // Eviction on access removes the entry entirely.
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn unlimited_entries_do_not_expire() {
        let cache = TtlCache::new();

        cache.set("k", vec![1], None).await;
        cache.purge_expired().await;

        assert_eq!(cache.get("k").await, Some(vec![1]));
    }

    #[tokio::test]
    async fn flush_drops_everything() {
        let cache = TtlCache::new();
        cache.set("a", vec![1], None).await;
        cache.set("b", vec![2], None).await;

        cache.flush().await;

        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn purge_removes_only_expired_entries() {
        let cache = TtlCache::new();
        cache.set("dead", vec![1], Some(Duration::ZERO)).await;
        cache.set("live", vec![2], Some(Duration::from_secs(3600))).await;

        cache.purge_expired().await;

        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("live").await, Some(vec![2]));
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let path = std::env::temp_dir().join("palisade_cache_roundtrip_test.dat");
        let cache = TtlCache::new();
        cache.set("k", vec![9, 8, 7], Some(Duration::from_secs(3600))).await;
        cache.set("gone", vec![1], Some(Duration::ZERO)).await;

        cache.save(&path).await.unwrap();

        let restored = TtlCache::new();
        restored.load(&path).await.unwrap();

        assert_eq!(restored.get("k").await, Some(vec![9, 8, 7]));
        // Entries already expired at save time never come back.
        assert_eq!(restored.get("gone").await, None);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn load_tolerates_missing_file() {
        let cache = TtlCache::new();

        let missing = std::env::temp_dir().join("palisade_cache_no_such_file.dat");
        cache.load(&missing).await.unwrap();

        assert!(cache.is_empty().await);
    }
}
