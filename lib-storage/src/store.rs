//! TTL'd key-value store with a byte-size cap.
//!
//! Keys are opaque byte strings (callers hash them before storing). Each
//! entry carries an absolute expiry instant; expired entries stop being
//! visible to `get` immediately and are physically removed by the periodic
//! `cleanup_expired` sweep.
//!
//! # Snapshot format
//!
//! Snapshots are a versioned bincode container with entries sorted by key
//! for deterministic output, written atomically (temp file + rename). The
//! remaining TTL is stored relative to the snapshot time and re-anchored to
//! the clock on load; entries that expired while the node was down are
//! dropped during load.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::StorageError;

/// Current version of the snapshot format.
const SNAPSHOT_VERSION: u32 = 1;

/// Size limits and TTL policy for a store instance.
#[derive(Debug, Clone)]
pub struct StoreLimits {
    /// Total byte cap across keys and values.
    pub max_bytes: u64,
    /// Upper bound any TTL extension can reach (30 days by default).
    pub popular_ttl: Duration,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024 * 1024,
            popular_ttl: Duration::from_secs(30 * 86400),
        }
    }
}

/// A stored value with its expiry instant.
#[derive(Debug, Clone)]
struct StoredEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Point-in-time usage numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub used_bytes: u64,
    pub max_bytes: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<Vec<u8>, StoredEntry>,
    used_bytes: u64,
}

impl Inner {
    fn remove_entry(&mut self, key: &[u8]) -> Option<StoredEntry> {
        let entry = self.entries.remove(key)?;
        self.used_bytes = self
            .used_bytes
            .saturating_sub(entry_size(key, &entry.value));
        Some(entry)
    }

    fn sweep_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<Vec<u8>> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove_entry(key);
        }
        expired.len()
    }
}

fn entry_size(key: &[u8], value: &[u8]) -> u64 {
    (key.len() + value.len()) as u64
}

/// Versioned on-disk container.
#[derive(Serialize, Deserialize)]
struct PersistedStore {
    version: u32,
    /// `(key, value, remaining_ttl_secs)`, sorted by key.
    entries: Vec<(serde_bytes::ByteBuf, serde_bytes::ByteBuf, u64)>,
}

/// The node-local value store.
///
/// All operations are atomic with respect to each other; the internal lock
/// serializes writers while allowing concurrent readers.
#[derive(Debug)]
pub struct Store {
    limits: StoreLimits,
    inner: RwLock<Inner>,
}

impl Store {
    pub fn new(limits: StoreLimits) -> Self {
        Self {
            limits,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Look up a value. Expired entries are treated as absent.
    pub async fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let inner = self.inner.read().await;
        let entry = inner.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Insert or replace a value with the given TTL.
    ///
    /// When the store is over its cap, expired entries are swept first; if
    /// the entry still does not fit the put is rejected with
    /// [`StorageError::CapacityExceeded`].
    pub async fn put(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<(), StorageError> {
        let size = entry_size(key, value);
        let now = Instant::now();
        let mut inner = self.inner.write().await;

        // Replacement reuses the old entry's bytes in the fit check; the
        // old entry stays intact if the new one does not fit.
        let replaced_size = inner
            .entries
            .get(key)
            .map(|e| entry_size(key, &e.value))
            .unwrap_or(0);

        if inner.used_bytes - replaced_size + size > self.limits.max_bytes {
            inner.sweep_expired(now);
        }
        let replaced_size = inner
            .entries
            .get(key)
            .map(|e| entry_size(key, &e.value))
            .unwrap_or(0);
        if inner.used_bytes - replaced_size + size > self.limits.max_bytes {
            return Err(StorageError::CapacityExceeded {
                needed: size,
                available: self.limits.max_bytes + replaced_size - inner.used_bytes,
            });
        }

        inner.remove_entry(key);
        inner.entries.insert(
            key.to_vec(),
            StoredEntry {
                value: value.to_vec(),
                expires_at: now + ttl,
            },
        );
        inner.used_bytes += size;
        Ok(())
    }

    /// Remove a key. Returns whether an entry was present.
    pub async fn delete(&self, key: &[u8]) -> bool {
        let mut inner = self.inner.write().await;
        inner.remove_entry(key).is_some()
    }

    /// Extend the remaining TTL of a live entry.
    ///
    /// The new TTL is `remaining * (1 + extension_fraction)`, capped at the
    /// configured `popular_ttl`. Returns false for missing or expired keys.
    pub async fn extend_ttl(&self, key: &[u8], extension_fraction: f64) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.entries.get_mut(key) else {
            return false;
        };
        if entry.expires_at <= now {
            return false;
        }

        let remaining = entry.expires_at - now;
        let extended = remaining.mul_f64(1.0 + extension_fraction.max(0.0));
        let new_ttl = extended.min(self.limits.popular_ttl);
        entry.expires_at = now + new_ttl;
        debug!(
            key = %hex::encode(&key[..key.len().min(8)]),
            new_ttl_secs = new_ttl.as_secs(),
            "extended TTL"
        );
        true
    }

    /// Physically remove expired entries. Returns the number deleted.
    pub async fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        let removed = inner.sweep_expired(Instant::now());
        if removed > 0 {
            debug!(count = removed, "swept expired entries");
        }
        removed
    }

    pub async fn stats(&self) -> StoreStats {
        let inner = self.inner.read().await;
        StoreStats {
            entries: inner.entries.len(),
            used_bytes: inner.used_bytes,
            max_bytes: self.limits.max_bytes,
        }
    }

    /// Write a snapshot of all live entries to `path`.
    pub async fn save_to_file(&self, path: &Path) -> Result<(), StorageError> {
        let now = Instant::now();
        let mut entries: Vec<(serde_bytes::ByteBuf, serde_bytes::ByteBuf, u64)> = {
            let inner = self.inner.read().await;
            inner
                .entries
                .iter()
                .filter(|(_, e)| e.expires_at > now)
                .map(|(k, e)| {
                    (
                        serde_bytes::ByteBuf::from(k.clone()),
                        serde_bytes::ByteBuf::from(e.value.clone()),
                        (e.expires_at - now).as_secs(),
                    )
                })
                .collect()
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let count = entries.len();
        let persisted = PersistedStore {
            version: SNAPSHOT_VERSION,
            entries,
        };
        let bytes =
            bincode::serialize(&persisted).map_err(|e| StorageError::Snapshot(e.to_string()))?;

        let byte_count = bytes.len();
        let path_owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || atomic_write(&path_owned, &bytes))
            .await
            .map_err(|e| StorageError::Snapshot(format!("snapshot task failed: {e}")))??;

        info!(path = %path.display(), entries = count, bytes = byte_count, "saved store snapshot");
        Ok(())
    }

    /// Load a snapshot, dropping entries that expired while the node was
    /// down. Returns the number of entries restored. Missing file is not an
    /// error; the store simply starts empty.
    pub async fn load_from_file(&self, path: &Path) -> Result<usize, StorageError> {
        let path_owned = path.to_path_buf();
        let bytes: Option<Vec<u8>> = tokio::task::spawn_blocking(move || {
            if !path_owned.exists() {
                return Ok(None);
            }
            std::fs::read(&path_owned).map(Some)
        })
        .await
        .map_err(|e| StorageError::Snapshot(format!("snapshot task failed: {e}")))??;

        let Some(bytes) = bytes else {
            info!(path = %path.display(), "no store snapshot found, starting empty");
            return Ok(0);
        };

        let persisted: PersistedStore =
            bincode::deserialize(&bytes).map_err(|e| StorageError::Snapshot(e.to_string()))?;
        if persisted.version != SNAPSHOT_VERSION {
            return Err(StorageError::Snapshot(format!(
                "unsupported snapshot version {} (expected {})",
                persisted.version, SNAPSHOT_VERSION
            )));
        }

        let now = Instant::now();
        let mut restored = 0usize;
        let mut dropped = 0usize;
        {
            let mut inner = self.inner.write().await;
            for (key, value, ttl_secs) in persisted.entries {
                if ttl_secs == 0 {
                    dropped += 1;
                    continue;
                }
                let size = entry_size(&key, &value);
                if inner.used_bytes + size > self.limits.max_bytes {
                    dropped += 1;
                    continue;
                }
                inner.used_bytes += size;
                inner.entries.insert(
                    key.into_vec(),
                    StoredEntry {
                        value: value.into_vec(),
                        expires_at: now + Duration::from_secs(ttl_secs),
                    },
                );
                restored += 1;
            }
        }

        if dropped > 0 {
            warn!(dropped, "dropped snapshot entries (expired or over capacity)");
        }
        info!(path = %path.display(), entries = restored, "loaded store snapshot");
        Ok(restored)
    }
}

/// Write to a temp file, fsync, then rename into place.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)?;

    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    if let Ok(d) = std::fs::File::open(&dir) {
        let _ = d.sync_all();
    }
    Ok(())
}
